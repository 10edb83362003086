use uuid::Uuid;

const BASE62_CHARS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const ID_LEN: usize = 22;

/// Returns a new job id: a random (v4) UUID rendered as 22 base62 characters.
pub fn new_id() -> String {
    let mut n = Uuid::new_v4().as_u128();
    let mut id = String::with_capacity(ID_LEN);

    for _ in 0..ID_LEN {
        id.push(BASE62_CHARS[(n % 62) as usize] as char);
        n /= 62;
    }

    id.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_length() {
        let id = new_id();
        assert_eq!(id.len(), ID_LEN);
    }

    #[test]
    fn test_new_id_uniqueness() {
        let ids: std::collections::HashSet<String> = (0..1000).map(|_| new_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_new_id_chars() {
        let id = new_id();
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
