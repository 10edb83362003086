use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::engine::{ArgValueCompleter, CompletionCandidate};
use qbt_rules::client::ApiClient;
use qbt_rules::queue::{Job, JobStatus};
use qbt_rules::{config, daemon, paths};

const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const VERSION_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(
    name = "qbt-rules",
    about = "Queue and run qBittorrent rule jobs",
    version
)]
struct Cli {
    #[arg(long, global = true, env = "QBT_RULES_DEBUG")]
    debug: bool,

    #[arg(long, global = true, env = "QBT_RULES_HOME")]
    home: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server and the job worker
    Serve {
        /// Address to bind (overrides server.host)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides server.port)
        #[arg(long)]
        port: Option<u16>,

        /// API key clients must present (overrides server.api-key)
        #[arg(long)]
        api_key: Option<String>,
    },

    /// Queue a rules run on the server
    Execute {
        /// Trigger context (e.g. weekly, torrent-imported)
        #[arg(long)]
        context: Option<String>,

        /// Restrict the run to a single torrent info hash
        #[arg(long, value_parser = parse_hash)]
        hash: Option<String>,

        /// Wait for the job to finish and exit non-zero if it fails
        #[arg(short, long)]
        wait: bool,

        /// Output format
        #[arg(long, default_value = "human")]
        format: OutputFormat,
    },

    /// Inspect and cancel jobs
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },

    /// Show queue and worker statistics
    Stats {
        /// Output format
        #[arg(long, default_value = "human")]
        format: OutputFormat,
    },

    /// Check server health
    Health {
        /// Output format
        #[arg(long, default_value = "human")]
        format: OutputFormat,
    },

    /// Print version information
    Version,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::aot::Shell,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Plain,
    Json,
}

#[derive(Subcommand)]
enum JobCommand {
    /// List jobs, newest first
    #[command(alias = "ls")]
    List {
        /// Only jobs in this status
        #[arg(long, value_parser = parse_status)]
        status: Option<JobStatus>,

        /// Only jobs queued with this context
        #[arg(long)]
        context: Option<String>,

        /// Maximum number of jobs to return (server caps this at 100)
        #[arg(long)]
        limit: Option<u32>,

        /// Number of jobs to skip
        #[arg(long)]
        offset: Option<u32>,

        /// Output format
        #[arg(long, default_value = "human")]
        format: OutputFormat,
    },

    /// Show a single job
    Get {
        /// Job ID
        #[arg(add = ArgValueCompleter::new(complete_job_ids))]
        id: String,

        /// Output format
        #[arg(long, default_value = "human")]
        format: OutputFormat,
    },

    /// Cancel a pending job
    Cancel {
        /// Job ID
        #[arg(add = ArgValueCompleter::new(complete_job_ids))]
        id: String,
    },
}

#[tokio::main]
async fn main() {
    clap_complete::env::CompleteEnv::with_factory(Cli::command).complete();

    if let Err(e) = run().await {
        eprintln!("\x1b[1;31merror:\x1b[0m {e}");

        // Print the chain of causes, if any.
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  \x1b[1;31mcaused by:\x1b[0m {cause}");
            source = std::error::Error::source(cause);
        }

        std::process::exit(1);
    }
}

fn parse_hash(value: &str) -> Result<String, String> {
    if value.len() == 40 && value.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(value.to_ascii_lowercase())
    } else {
        Err("expected a 40-character hex info hash".into())
    }
}

fn parse_status(value: &str) -> Result<JobStatus, String> {
    value.parse::<JobStatus>().map_err(|e| e.to_string())
}

fn complete_job_ids(current: &std::ffi::OsStr) -> Vec<CompletionCandidate> {
    let current = current.to_str().unwrap_or_default().to_owned();

    let result = std::thread::spawn(move || -> anyhow::Result<Vec<CompletionCandidate>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            paths::init(None);
            let client = ApiClient::from_config(&config::load()?)?;
            let page = client.list_jobs(None, None, Some(100), None).await?;

            let candidates = page
                .jobs
                .iter()
                .filter(|j| j.id.starts_with(&current))
                .map(|j| {
                    let help = match &j.context {
                        Some(context) => format!("{context} ({})", j.status),
                        None => j.status.to_string(),
                    };
                    CompletionCandidate::new(j.id.clone()).help(Some(help.into()))
                })
                .collect();

            Ok(candidates)
        })
    })
    .join();

    result.ok().and_then(|r| r.ok()).unwrap_or_default()
}

fn status_color(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Completed => "1;32",
        JobStatus::Failed => "1;31",
        JobStatus::Pending | JobStatus::Processing => "1;33",
        JobStatus::Cancelled => "2",
    }
}

fn print_job(job: &Job, format: &OutputFormat) -> anyhow::Result<()> {
    let time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map_or_else(|| "-".to_string(), |t| t.to_rfc3339())
    };

    match format {
        OutputFormat::Human => {
            println!(
                "\x1b[{}m{}\x1b[0m \x1b[2m(id: {})\x1b[0m",
                status_color(job.status),
                job.status,
                job.id
            );
            println!(
                "  \x1b[1mcontext:\x1b[0m     {}",
                job.context.as_deref().unwrap_or("-")
            );
            println!(
                "  \x1b[1mhash:\x1b[0m        {}",
                job.hash_filter.as_deref().unwrap_or("-")
            );
            println!("  \x1b[1mcreated:\x1b[0m     {}", job.created_at.to_rfc3339());
            println!("  \x1b[1mstarted:\x1b[0m     {}", time(job.started_at));
            println!("  \x1b[1mcompleted:\x1b[0m   {}", time(job.completed_at));
            if let Some(result) = &job.result {
                println!("  \x1b[1mresult:\x1b[0m      {result}");
            }
            if let Some(error) = &job.error {
                let summary = error.lines().next().unwrap_or_default();
                println!("  \x1b[1merror:\x1b[0m       {summary}");
            }
        }
        OutputFormat::Plain => {
            println!(
                "{}\t{}\t{}\t{}",
                job.id,
                job.status,
                job.context.as_deref().unwrap_or(""),
                job.created_at.to_rfc3339()
            );
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(job)?);
        }
    }
    Ok(())
}

fn print_stats(stats: &serde_json::Value, format: &OutputFormat) -> anyhow::Result<()> {
    let text = |v: &serde_json::Value| match v {
        serde_json::Value::Null => "-".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    match format {
        OutputFormat::Human => {
            let jobs = &stats["jobs"];
            println!("\x1b[1mJobs\x1b[0m");
            for key in ["total", "pending", "processing", "completed", "failed", "cancelled"] {
                println!("  {:<12} {}", format!("{key}:"), text(&jobs[key]));
            }
            println!("\x1b[1mPerformance\x1b[0m");
            println!(
                "  {:<12} {}",
                "avg time:",
                text(&stats["performance"]["average_execution_time"])
            );
            println!("\x1b[1mQueue\x1b[0m");
            println!("  {:<12} {}", "backend:", text(&stats["queue"]["backend"]));
            println!("  {:<12} {}", "depth:", text(&stats["queue"]["depth"]));
            println!("\x1b[1mWorker\x1b[0m");
            println!("  {:<12} {}", "status:", text(&stats["worker"]["status"]));
            println!(
                "  {:<12} {}",
                "last job:",
                text(&stats["worker"]["last_job_completed"])
            );
        }
        OutputFormat::Plain => {
            for key in ["total", "pending", "processing", "completed", "failed", "cancelled"] {
                println!("{key}\t{}", text(&stats["jobs"][key]));
            }
            println!(
                "average_execution_time\t{}",
                text(&stats["performance"]["average_execution_time"])
            );
            println!("queue_depth\t{}", text(&stats["queue"]["depth"]));
            println!("worker\t{}", text(&stats["worker"]["status"]));
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(stats)?);
        }
    }
    Ok(())
}

async fn wait_for_job(client: &ApiClient, id: &str) -> anyhow::Result<Job> {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let job = client.get_job(id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "timed out after {}s waiting for job {id} (last status: {})",
                WAIT_TIMEOUT.as_secs(),
                job.status
            );
        }
        tracing::debug!(job_id = %id, status = %job.status, "waiting for job");
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let is_serve = matches!(cli.command, Some(Command::Serve { .. }));

    paths::init(cli.home);

    let mut config = config::load()?;

    let level = if cli.debug {
        "debug".to_string()
    } else {
        config
            .logging
            .level
            .clone()
            .unwrap_or_else(|| (if is_serve { "info" } else { "warn" }).to_string())
    };
    let filter = tracing_subscriber::EnvFilter::try_new(&level)
        .map_err(|e| anyhow::anyhow!("invalid log level {level:?}: {e}"))?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match cli.command {
        Some(Command::Serve {
            host,
            port,
            api_key,
        }) => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(api_key) = api_key {
                config.server.api_key = Some(api_key);
            }
            daemon::serve(config).await?;
        }
        Some(Command::Version) => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

            // The server may be down or on another version; report it when reachable.
            let server = match ApiClient::from_config(&config) {
                Ok(client) => tokio::time::timeout(VERSION_TIMEOUT, client.version())
                    .await
                    .ok()
                    .and_then(Result::ok),
                Err(_) => None,
            };
            if let Some(server) = server {
                println!(
                    "server {} (api {})",
                    server["version"].as_str().unwrap_or("unknown"),
                    server["api_version"].as_str().unwrap_or("unknown")
                );
            }
        }
        Some(Command::Completions { shell }) => {
            let status = std::process::Command::new(std::env::current_exe()?)
                .env("COMPLETE", shell.to_string())
                .status()?;
            std::process::exit(status.code().unwrap_or(1));
        }
        Some(cmd) => {
            let client = ApiClient::from_config(&config)?;
            match cmd {
                Command::Execute {
                    context,
                    hash,
                    wait,
                    format,
                } => {
                    let job = client.execute(context.as_deref(), hash.as_deref()).await?;
                    if !wait {
                        print_job(&job, &format)?;
                        return Ok(());
                    }

                    if matches!(format, OutputFormat::Human) {
                        eprintln!("\x1b[2mqueued {}, waiting for it to finish\x1b[0m", job.id);
                    }
                    let job = wait_for_job(&client, &job.id).await?;
                    print_job(&job, &format)?;
                    match job.status {
                        JobStatus::Failed => anyhow::bail!("job {} failed", job.id),
                        JobStatus::Cancelled => anyhow::bail!("job {} was cancelled", job.id),
                        _ => {}
                    }
                }
                Command::Job { command } => match command {
                    JobCommand::List {
                        status,
                        context,
                        limit,
                        offset,
                        format,
                    } => {
                        let page = client
                            .list_jobs(status, context.as_deref(), limit, offset)
                            .await?;
                        match format {
                            OutputFormat::Human => {
                                if page.jobs.is_empty() {
                                    return Ok(());
                                }
                                println!(
                                    "{:<22}  {:<10}  {:<18}  CREATED",
                                    "ID", "STATUS", "CONTEXT"
                                );
                                for j in &page.jobs {
                                    println!(
                                        "{:<22}  {:<10}  {:<18}  {}",
                                        j.id,
                                        j.status,
                                        j.context.as_deref().unwrap_or("-"),
                                        j.created_at.to_rfc3339()
                                    );
                                }
                                if page.total > page.jobs.len() as u64 {
                                    println!(
                                        "\x1b[2m{} of {} jobs (offset {})\x1b[0m",
                                        page.jobs.len(),
                                        page.total,
                                        page.offset
                                    );
                                }
                            }
                            OutputFormat::Plain => {
                                for j in &page.jobs {
                                    println!(
                                        "{}\t{}\t{}\t{}",
                                        j.id,
                                        j.status,
                                        j.context.as_deref().unwrap_or(""),
                                        j.created_at.to_rfc3339()
                                    );
                                }
                            }
                            OutputFormat::Json => {
                                println!("{}", serde_json::to_string(&page)?);
                            }
                        }
                    }
                    JobCommand::Get { id, format } => {
                        let job = client.get_job(&id).await?;
                        print_job(&job, &format)?;
                    }
                    JobCommand::Cancel { id } => {
                        let message = client.cancel_job(&id).await?;
                        println!("{message}");
                    }
                },
                Command::Stats { format } => {
                    let stats = client.stats().await?;
                    print_stats(&stats, &format)?;
                }
                Command::Health { format } => {
                    let (healthy, body) = client.health().await?;
                    match format {
                        OutputFormat::Json => println!("{}", serde_json::to_string(&body)?),
                        OutputFormat::Human | OutputFormat::Plain => {
                            println!("{}", body["status"].as_str().unwrap_or("unknown"));
                            if let Some(errors) = body["errors"].as_array() {
                                for error in errors.iter().filter_map(|e| e.as_str()) {
                                    println!("  {error}");
                                }
                            }
                        }
                    }
                    if !healthy {
                        anyhow::bail!("server is unhealthy");
                    }
                }
                Command::Serve { .. } | Command::Completions { .. } | Command::Version => {
                    unreachable!()
                }
            }
        }
        None => {}
    }

    Ok(())
}
