#![allow(dead_code)]

use std::path::Path;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;

pub const API_KEY: &str = "integration-secret";

/// Reads the job scope from stdin and reports a small summary.
pub const OK_EXECUTOR: &str = r#"cat > /dev/null; echo '{"total_items": 3, "processed": 3, "matched": 1}'"#;

pub fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_qbt-rules")
}

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if std::net::TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

/// Writes `config/config.toml` under `home` for a server on `port` whose jobs
/// run `sh -c <script>`.
pub fn write_config(home: &Path, port: u16, script: &str) {
    let config_dir = home.join("config");
    std::fs::create_dir_all(&config_dir).unwrap();

    let script = toml::Value::String(script.to_string());
    let contents = format!(
        r#"[server]
host = "127.0.0.1"
port = {port}
api-key = "{API_KEY}"

[worker]
poll-interval-ms = 50
stop-timeout-secs = 10

[executor]
command = "sh"
args = ["-c", {script}]

[client]
server-url = "http://127.0.0.1:{port}"
"#
    );
    std::fs::write(config_dir.join("config.toml"), contents).unwrap();
}

fn scrub_env(cmd: &mut std::process::Command, home: &Path) {
    cmd.env("QBT_RULES_HOME", home);
    for (name, _) in std::env::vars() {
        if name.starts_with("QBT_RULES_") && name != "QBT_RULES_HOME" {
            cmd.env_remove(name);
        }
    }
}

/// A running `qbt-rules serve` process backed by a temporary home directory.
/// Sends SIGTERM and waits for exit on drop.
pub struct ServerFixture {
    child: std::process::Child,
    pub home: TempDir,
    pub port: u16,
}

impl ServerFixture {
    pub fn start() -> Self {
        Self::start_with(OK_EXECUTOR)
    }

    pub fn start_with(script: &str) -> Self {
        let home = TempDir::new().unwrap();
        let port = free_port();
        write_config(home.path(), port, script);
        Self::spawn(home, port)
    }

    /// Starts a server on an existing home, e.g. to check persistence.
    pub fn spawn(home: TempDir, port: u16) -> Self {
        let mut cmd = std::process::Command::new(bin());
        scrub_env(&mut cmd, home.path());
        let child = cmd
            .arg("serve")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .expect("failed to spawn server");

        let fixture = Self { child, home, port };
        assert!(
            wait_for_port(port, Duration::from_secs(10)),
            "server did not start listening"
        );
        fixture
    }

    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    pub fn db_path(&self) -> std::path::PathBuf {
        self.home.path().join("data/qbt-rules.db")
    }

    /// Build a CLI command that talks to this server.
    pub fn cmd(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(bin());
        scrub_env(&mut cmd, self.home.path());
        cmd
    }

    /// Build an assert_cmd::Command that talks to this server.
    pub fn assert_cmd(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::Command::new(bin());
        cmd.env("QBT_RULES_HOME", self.home.path());
        for (name, _) in std::env::vars() {
            if name.starts_with("QBT_RULES_") && name != "QBT_RULES_HOME" {
                cmd.env_remove(name);
            }
        }
        cmd
    }

    /// Stops the server and hands back its home directory.
    pub fn shutdown(mut self) -> (TempDir, std::process::ExitStatus) {
        signal::kill(Pid::from_raw(self.pid()), Signal::SIGTERM).unwrap();
        let status = self.child.wait().unwrap();
        let home = std::mem::replace(&mut self.home, TempDir::new().unwrap());
        (home, status)
    }
}

impl Drop for ServerFixture {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = signal::kill(Pid::from_raw(self.pid()), Signal::SIGTERM);
            let _ = self.child.wait();
        }
    }
}
