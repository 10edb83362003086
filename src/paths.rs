use std::path::PathBuf;
use std::sync::OnceLock;

const APP_DIR: &str = "qbt-rules";

static QBT_RULES_HOME: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Store the home override from the `--home` flag.
/// Falls through to the `QBT_RULES_HOME` env var if `None`.
pub fn init(home: Option<PathBuf>) {
    let _ = QBT_RULES_HOME.set(home);
}

fn home_override() -> Option<PathBuf> {
    QBT_RULES_HOME.get().and_then(|p| p.clone()).or_else(|| {
        std::env::var("QBT_RULES_HOME")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    })
}

fn xdg_dir(var: &str, fallback: &[&str]) -> Result<PathBuf, anyhow::Error> {
    let base = match std::env::var(var) {
        Ok(val) if !val.is_empty() => PathBuf::from(val),
        _ => {
            let home = dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("could not determine home directory"))?;
            fallback.iter().fold(home, |path, part| path.join(part))
        }
    };

    Ok(base.join(APP_DIR))
}

pub fn data_dir() -> Result<PathBuf, anyhow::Error> {
    if let Some(home) = home_override() {
        return Ok(home.join("data"));
    }
    xdg_dir("XDG_DATA_HOME", &[".local", "share"])
}

pub fn config_dir() -> Result<PathBuf, anyhow::Error> {
    if let Some(home) = home_override() {
        return Ok(home.join("config"));
    }
    xdg_dir("XDG_CONFIG_HOME", &[".config"])
}

pub fn config_path() -> Result<PathBuf, anyhow::Error> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn default_sqlite_path() -> Result<PathBuf, anyhow::Error> {
    Ok(data_dir()?.join("qbt-rules.db"))
}

pub fn ensure_dirs() -> Result<(), anyhow::Error> {
    let data = data_dir()?;
    tracing::debug!(path = %data.display(), "ensuring data directory");
    std::fs::create_dir_all(data)?;

    Ok(())
}
