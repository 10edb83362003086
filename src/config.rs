use std::path::PathBuf;
use std::time::Duration;

use crate::paths;
use crate::queue::Backend;

pub const ENV_PREFIX: &str = "QBT_RULES";

#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub executor: Option<ExecutorConfig>,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
            api_key: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Redis,
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(BackendKind::Sqlite),
            "redis" => Ok(BackendKind::Redis),
            other => anyhow::bail!("unknown queue backend {other:?} (expected sqlite or redis)"),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QueueConfig {
    pub backend: BackendKind,
    pub sqlite_path: Option<PathBuf>,
    pub redis_url: String,
    pub cleanup_after: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sqlite,
            sqlite_path: None,
            redis_url: "redis://localhost:6379/0".into(),
            cleanup_after: None,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub stop_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            stop_timeout_secs: 30,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct ExecutorConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClientConfig {
    pub server_url: String,
    pub api_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5000".into(),
            api_key: None,
        }
    }
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub http_access: bool,
}

impl Config {
    pub fn backend(&self) -> anyhow::Result<Backend> {
        Ok(match self.queue.backend {
            BackendKind::Sqlite => Backend::Sqlite {
                path: match &self.queue.sqlite_path {
                    Some(path) => path.clone(),
                    None => paths::default_sqlite_path()?,
                },
            },
            BackendKind::Redis => Backend::Redis {
                url: self.queue.redis_url.clone(),
            },
        })
    }

    pub fn cleanup_after(&self) -> anyhow::Result<Option<Duration>> {
        self.queue
            .cleanup_after
            .as_deref()
            .map(|value| {
                parse_duration(value)
                    .map_err(|e| anyhow::anyhow!("invalid queue.cleanup-after: {e}"))
            })
            .transpose()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.stop_timeout_secs)
    }

    pub fn server_api_key(&self) -> anyhow::Result<&str> {
        self.server
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no API key configured; set server.api-key or {ENV_PREFIX}_SERVER_API_KEY"
                )
            })
    }

    /// The key the client sends: `client.api-key`, falling back to the
    /// server's own key for single-host setups.
    pub fn client_api_key(&self) -> Option<&str> {
        self.client
            .api_key
            .as_deref()
            .or(self.server.api_key.as_deref())
            .filter(|key| !key.is_empty())
    }

    /// Applies `QBT_RULES_*` overrides. Each variable may instead be given as
    /// `<NAME>_FILE`, naming a file whose trimmed contents are the value. The
    /// `_FILE` form wins when both are set.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |suffix: &str| -> anyhow::Result<Option<String>> {
            let name = format!("{ENV_PREFIX}_{suffix}");
            let file_var = format!("{name}_FILE");
            if let Some(path) = lookup(&file_var).filter(|v| !v.is_empty()) {
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("failed to read {file_var} ({path}): {e}"))?;
                return Ok(Some(contents.trim().to_string()));
            }
            Ok(lookup(&name).filter(|v| !v.is_empty()))
        };

        if let Some(host) = var("SERVER_HOST")? {
            self.server.host = host;
        }
        if let Some(port) = var("SERVER_PORT")? {
            self.server.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid {ENV_PREFIX}_SERVER_PORT {port:?}: {e}"))?;
        }
        if let Some(key) = var("SERVER_API_KEY")? {
            self.server.api_key = Some(key);
        }
        if let Some(backend) = var("QUEUE_BACKEND")? {
            self.queue.backend = backend.parse()?;
        }
        if let Some(path) = var("QUEUE_SQLITE_PATH")? {
            self.queue.sqlite_path = Some(PathBuf::from(path));
        }
        if let Some(url) = var("QUEUE_REDIS_URL")? {
            self.queue.redis_url = url;
        }
        if let Some(retention) = var("QUEUE_CLEANUP_AFTER")? {
            self.queue.cleanup_after = Some(retention);
        }
        if let Some(url) = var("CLIENT_SERVER_URL")? {
            self.client.server_url = url;
        }
        if let Some(key) = var("CLIENT_API_KEY")? {
            self.client.api_key = Some(key);
        }
        if let Some(level) = var("LOG_LEVEL")? {
            self.logging.level = Some(level);
        }

        Ok(())
    }
}

/// Parses `"<n> <unit>"` with unit one of second, minute, hour, day, or week
/// (plural allowed), the compact `"<n>s|m|h|d|w"`, or a bare number of
/// seconds.
pub fn parse_duration(value: &str) -> anyhow::Result<Duration> {
    let value = value.trim();
    let (amount, unit) = match value.split_once(char::is_whitespace) {
        Some((amount, unit)) => (amount, unit.trim()),
        None => match value.find(|c: char| !c.is_ascii_digit()) {
            Some(at) if at > 0 => value.split_at(at),
            _ => (value, "seconds"),
        },
    };

    let amount: u64 = amount
        .parse()
        .map_err(|_| anyhow::anyhow!("expected a number, got {amount:?}"))?;
    let unit = unit.to_ascii_lowercase();
    let unit_secs = match unit.as_str() {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "w" => 7 * 24 * 60 * 60,
        unit => match unit.trim_end_matches('s') {
            "second" => 1,
            "minute" => 60,
            "hour" => 60 * 60,
            "day" => 24 * 60 * 60,
            "week" => 7 * 24 * 60 * 60,
            other => anyhow::bail!("unknown duration unit {other:?}"),
        },
    };

    amount
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow::anyhow!("duration {value:?} is too large"))
}

pub fn load() -> anyhow::Result<Config> {
    let path = paths::config_path()?;

    let mut config: Config = match std::fs::read_to_string(&path) {
        Ok(contents) => toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => return Err(e.into()),
    };
    config.apply_env(|name| std::env::var(name).ok())?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_without_file() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.queue.backend, BackendKind::Sqlite);
        assert_eq!(config.queue.redis_url, "redis://localhost:6379/0");
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.client.server_url, "http://localhost:5000");
        assert!(config.server_api_key().is_err());
    }

    #[test]
    fn parses_kebab_case_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 8080
            api-key = "secret"

            [queue]
            backend = "redis"
            redis-url = "redis://cache:6379/1"
            cleanup-after = "7 days"

            [worker]
            poll-interval-ms = 250

            [executor]
            command = "qbt-rules-engine"
            args = ["--rules", "/etc/qbt/rules.yml"]

            [logging]
            http-access = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server_api_key().unwrap(), "secret");
        assert_eq!(
            config.backend().unwrap(),
            Backend::Redis {
                url: "redis://cache:6379/1".into()
            }
        );
        assert_eq!(
            config.cleanup_after().unwrap(),
            Some(Duration::from_secs(7 * 24 * 3600))
        );
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.stop_timeout(), Duration::from_secs(30));
        assert_eq!(config.executor.unwrap().args.len(), 2);
        assert!(config.logging.http_access);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config: Config = toml::from_str("[server]\nport = 8080\n").unwrap();
        config
            .apply_env(env(&[
                ("QBT_RULES_SERVER_PORT", "9090"),
                ("QBT_RULES_QUEUE_BACKEND", "redis"),
                ("QBT_RULES_CLIENT_API_KEY", "client-key"),
            ]))
            .unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.queue.backend, BackendKind::Redis);
        assert_eq!(config.client_api_key(), Some("client-key"));
    }

    #[test]
    fn env_file_variant_reads_trimmed_contents() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("api-key");
        std::fs::write(&secret, "from-file\n").unwrap();

        let mut config = Config::default();
        config
            .apply_env(env(&[(
                "QBT_RULES_SERVER_API_KEY_FILE",
                secret.to_str().unwrap(),
            )]))
            .unwrap();
        assert_eq!(config.server_api_key().unwrap(), "from-file");
        assert_eq!(config.client_api_key(), Some("from-file"));
    }

    #[test]
    fn env_file_variant_wins_over_plain_variable() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("api-key");
        std::fs::write(&secret, "from-file").unwrap();

        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("QBT_RULES_SERVER_API_KEY", "from-env"),
                ("QBT_RULES_SERVER_API_KEY_FILE", secret.to_str().unwrap()),
            ]))
            .unwrap();
        assert_eq!(config.server_api_key().unwrap(), "from-file");
    }

    #[test]
    fn cleanup_after_accepts_compact_durations() {
        let mut config = Config::default();
        config
            .apply_env(env(&[("QBT_RULES_QUEUE_CLEANUP_AFTER", "7d")]))
            .unwrap();
        assert_eq!(
            config.cleanup_after().unwrap(),
            Some(Duration::from_secs(7 * 24 * 3600))
        );
    }

    #[test]
    fn env_file_variant_must_be_readable() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[(
                "QBT_RULES_SERVER_API_KEY_FILE",
                "/nonexistent/qbt-rules/api-key",
            )]))
            .unwrap_err();
        assert!(err.to_string().contains("QBT_RULES_SERVER_API_KEY_FILE"));
    }

    #[test]
    fn invalid_env_values_are_errors() {
        let mut config = Config::default();
        assert!(config.apply_env(env(&[("QBT_RULES_SERVER_PORT", "http")])).is_err());
        assert!(config.apply_env(env(&[("QBT_RULES_QUEUE_BACKEND", "mongo")])).is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1 second").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("5 minutes").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2 Hours").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("7 days").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_duration("1 week").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_duration("2w").unwrap(), Duration::from_secs(1_209_600));
        assert_eq!(parse_duration("12H").unwrap(), Duration::from_secs(43_200));
        assert_eq!(parse_duration("90m").unwrap(), Duration::from_secs(5_400));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("3days").unwrap(), Duration::from_secs(259_200));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("d").is_err());
        assert!(parse_duration("7y").is_err());
        assert!(parse_duration("3 fortnights").is_err());
    }
}
