use std::io::Write;
use std::process::{Command, Stdio};

const STDERR_TAIL_LINES: usize = 20;

/// Counters reported by one rules-engine run. Stored as the job's `result`.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ExecutionSummary {
    pub total_items: u64,
    pub processed: u64,
    pub matched: u64,
    pub actions_executed: u64,
    pub actions_skipped: u64,
    pub errors: u64,
}

/// Runs the rules engine for one job's scope.
pub trait JobExecutor: Send + Sync {
    fn execute(
        &self,
        context: Option<&str>,
        hash_filter: Option<&str>,
    ) -> anyhow::Result<ExecutionSummary>;
}

impl<F> JobExecutor for F
where
    F: Fn(Option<&str>, Option<&str>) -> anyhow::Result<ExecutionSummary> + Send + Sync,
{
    fn execute(
        &self,
        context: Option<&str>,
        hash_filter: Option<&str>,
    ) -> anyhow::Result<ExecutionSummary> {
        self(context, hash_filter)
    }
}

/// Executes an external command per job. The job scope is written to the
/// command's stdin as JSON and exported as `QBT_RULES_JOB_CONTEXT` and
/// `QBT_RULES_JOB_HASH`; stdout must hold an [`ExecutionSummary`] object.
pub struct CommandExecutor {
    pub command: String,
    pub args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl JobExecutor for CommandExecutor {
    fn execute(
        &self,
        context: Option<&str>,
        hash_filter: Option<&str>,
    ) -> anyhow::Result<ExecutionSummary> {
        let input = serde_json::to_vec(&serde_json::json!({
            "context": context,
            "hash": hash_filter,
        }))?;

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_remove("QBT_RULES_JOB_CONTEXT")
            .env_remove("QBT_RULES_JOB_HASH");
        if let Some(context) = context {
            command.env("QBT_RULES_JOB_CONTEXT", context);
        }
        if let Some(hash) = hash_filter {
            command.env("QBT_RULES_JOB_HASH", hash);
        }

        tracing::debug!(command = %self.command, ?context, ?hash_filter, "running executor command");

        let mut child = command
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to run {}: {e}", self.command))?;

        // A command that never reads stdin closes the pipe early.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&input) {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let output = child.wait_with_output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
            anyhow::bail!("{} failed with {}\n{}", self.command, output.status, tail.trim_end());
        }

        let stdout = String::from_utf8(output.stdout)?;
        serde_json::from_str(stdout.trim()).map_err(|e| {
            anyhow::anyhow!("{} printed an invalid execution summary: {e}", self.command)
        })
    }
}

/// Stand-in used when no executor command is configured. Every job fails
/// with an explanation instead of silently succeeding.
pub struct UnconfiguredExecutor;

impl JobExecutor for UnconfiguredExecutor {
    fn execute(&self, _: Option<&str>, _: Option<&str>) -> anyhow::Result<ExecutionSummary> {
        anyhow::bail!("no executor command configured; set executor.command in config.toml")
    }
}
