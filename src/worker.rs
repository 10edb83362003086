//! Background worker that drains the queue one job at a time on a dedicated
//! OS thread.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::executor::JobExecutor;
use crate::queue::{Job, JobStatus, QueueManager, StatusUpdate};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub thread_alive: bool,
    pub last_job_completed: Option<DateTime<Utc>>,
    pub queue_depth: Option<u64>,
}

struct Shared {
    queue: Arc<dyn QueueManager>,
    executor: Arc<dyn JobExecutor>,
    poll_interval: Duration,
    last_job_completed: Mutex<Option<DateTime<Utc>>>,
}

struct WorkerThread {
    handle: JoinHandle<()>,
    run: Arc<AtomicBool>,
    // Disconnects when the thread exits, panicking or not.
    done: mpsc::Receiver<()>,
}

pub struct Worker {
    shared: Arc<Shared>,
    thread: Mutex<Option<WorkerThread>>,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn QueueManager>,
        executor: Arc<dyn JobExecutor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue,
                executor,
                poll_interval,
                last_job_completed: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Spawns the worker thread. Does nothing when a running thread exists.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut slot = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(thread) = slot.as_ref() {
            if thread.run.load(Ordering::SeqCst) && !thread.handle.is_finished() {
                tracing::debug!("worker already running");
                return Ok(());
            }
        }

        let run = Arc::new(AtomicBool::new(true));
        let (done_tx, done) = mpsc::channel::<()>();
        let shared = self.shared.clone();
        let thread_run = run.clone();
        let handle = std::thread::Builder::new()
            .name("worker".into())
            .spawn(move || {
                let _done = done_tx;
                shared.run(&thread_run);
            })?;

        *slot = Some(WorkerThread { handle, run, done });
        Ok(())
    }

    /// Asks the worker to stop and waits up to `timeout` for the thread to
    /// exit. A job in flight always runs to completion. Returns `false` if
    /// the thread was still running when the timeout elapsed.
    pub fn stop(&self, timeout: Duration) -> bool {
        let Some(thread) = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return true;
        };

        thread.run.store(false, Ordering::SeqCst);
        thread.handle.thread().unpark();

        match thread.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    timeout_secs = timeout.as_secs_f64(),
                    "worker did not stop in time; leaving it to finish its current job"
                );
                let mut slot = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.is_none() {
                    *slot = Some(thread);
                }
                false
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if thread.handle.join().is_err() {
                    tracing::error!("worker thread panicked");
                }
                true
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|thread| thread.run.load(Ordering::SeqCst))
    }

    pub fn is_alive(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|thread| !thread.handle.is_finished())
    }

    pub fn last_job_completed(&self) -> Option<DateTime<Utc>> {
        *self
            .shared
            .last_job_completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_status(&self) -> WorkerStatus {
        WorkerStatus {
            running: self.is_running(),
            thread_alive: self.is_alive(),
            last_job_completed: self.last_job_completed(),
            queue_depth: self.shared.queue.get_queue_depth().ok(),
        }
    }
}

impl Shared {
    fn run(&self, run: &AtomicBool) {
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "worker started"
        );

        while run.load(Ordering::SeqCst) {
            match self.queue.dequeue() {
                Ok(Some(job)) => self.process(job),
                Ok(None) => std::thread::park_timeout(self.poll_interval),
                Err(e) => {
                    tracing::error!(error = %e, "failed to dequeue job");
                    std::thread::park_timeout(self.poll_interval);
                }
            }
        }

        tracing::info!("worker stopped");
    }

    fn process(&self, job: Job) {
        let started_at = job.started_at.unwrap_or_else(Utc::now);
        tracing::info!(
            job_id = %job.id,
            context = ?job.context,
            hash = ?job.hash_filter,
            "processing job"
        );

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.executor
                .execute(job.context.as_deref(), job.hash_filter.as_deref())
        }));
        let completed_at = Utc::now();
        let elapsed_secs = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        let update = match outcome {
            Ok(Ok(summary)) => match serde_json::to_value(&summary) {
                Ok(result) => {
                    tracing::info!(job_id = %job.id, elapsed_secs, "job completed");
                    StatusUpdate::completed(started_at, completed_at, result)
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "failed to encode job result");
                    StatusUpdate::failed(started_at, completed_at, e.to_string())
                }
            },
            Ok(Err(err)) => {
                tracing::warn!(job_id = %job.id, error = %format!("{err:#}"), elapsed_secs, "job failed");
                StatusUpdate::failed(started_at, completed_at, describe_failure(&err))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(job_id = %job.id, panic = %message, "executor panicked");
                StatusUpdate::failed(
                    started_at,
                    completed_at,
                    format!("executor panicked: {message}"),
                )
            }
        };

        let succeeded = update.status == JobStatus::Completed;
        match self.queue.update_status(&job.id, &update) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(job_id = %job.id, "job vanished before its status was recorded"),
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "failed to record job status");
            }
        }

        if succeeded {
            *self
                .last_job_completed
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(completed_at);
        }
    }
}

/// Text stored on a failed job: the full context chain, the root error's
/// debug form (which names its type), and a backtrace when one was captured.
pub fn describe_failure(err: &anyhow::Error) -> String {
    let mut text = format!("{err:#}\n\n{:?}", err.root_cause());
    let backtrace = err.backtrace();
    if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        text.push_str(&format!("\n\nBacktrace:\n{backtrace}"));
    }
    text
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
