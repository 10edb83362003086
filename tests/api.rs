use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use qbt_rules::daemon::{AppState, router};
use qbt_rules::executor::ExecutionSummary;
use qbt_rules::queue::{JobStatus, QueueManager, SqliteQueue, StatusUpdate};
use qbt_rules::worker::Worker;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

const KEY: &str = "test-secret";

struct Api {
    _dir: TempDir,
    app: Router,
    queue: Arc<dyn QueueManager>,
    worker: Arc<Worker>,
}

impl Api {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let queue: Arc<dyn QueueManager> =
            Arc::new(SqliteQueue::open(&dir.path().join("queue.db")).unwrap());

        let executor = |_: Option<&str>, _: Option<&str>| -> anyhow::Result<ExecutionSummary> {
            Ok(ExecutionSummary {
                processed: 1,
                ..Default::default()
            })
        };
        let worker = Arc::new(Worker::new(
            queue.clone(),
            Arc::new(executor),
            Duration::from_millis(10),
        ));

        let app = router(AppState {
            queue: queue.clone(),
            worker: worker.clone(),
            api_key: Arc::from(KEY),
        });

        Self {
            _dir: dir,
            app,
            queue,
            worker,
        }
    }

    async fn send(&self, method: &str, uri: &str, key: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        let res = self
            .app
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send("GET", uri, Some(KEY)).await
    }
}

#[tokio::test]
async fn protected_endpoints_require_the_api_key() {
    let api = Api::new();

    for (method, uri) in [
        ("POST", "/api/execute"),
        ("GET", "/api/jobs"),
        ("GET", "/api/jobs/abc"),
        ("DELETE", "/api/jobs/abc"),
        ("GET", "/api/stats"),
    ] {
        let (status, body) = api.send(method, uri, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{method} {uri}");
        assert_eq!(body["error"], "Unauthorized");
        assert_eq!(body["message"], "Invalid or missing API key");

        let (status, _) = api.send(method, uri, Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{method} {uri}");
    }

    assert_eq!(api.queue.count_jobs(None).unwrap(), 0);
}

#[tokio::test]
async fn api_key_is_accepted_as_query_parameter() {
    let api = Api::new();

    let (status, _) = api
        .send("GET", &format!("/api/jobs?key={KEY}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    // The query parameter wins over the header.
    let (status, _) = api.send("GET", "/api/jobs?key=wrong", Some(KEY)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_and_version_are_public() {
    let api = Api::new();

    let (status, body) = api.send("GET", "/api/version", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["api_version"], "1.0");

    let (status, _) = api.send("GET", "/api/health", None).await;
    assert_ne!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn execute_queues_a_pending_job() {
    let api = Api::new();
    let hash = "0123456789abcdef0123456789abcdef01234567";

    let (status, body) = api
        .send(
            "POST",
            &format!("/api/execute?context=weekly-cleanup&hash={hash}"),
            Some(KEY),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["context"], "weekly-cleanup");
    assert_eq!(body["hash"], hash);
    assert!(body["created_at"].is_string());
    assert!(body["started_at"].is_null());

    let id = body["job_id"].as_str().unwrap();
    let job = api.queue.get_job(id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.hash_filter.as_deref(), Some(hash));
}

#[tokio::test]
async fn execute_without_parameters_queues_a_full_run() {
    let api = Api::new();

    let (status, body) = api.send("POST", "/api/execute", Some(KEY)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["context"].is_null());
    assert!(body["hash"].is_null());
}

#[tokio::test]
async fn get_job_returns_404_for_unknown_ids() {
    let api = Api::new();

    let (status, body) = api.get("/api/jobs/does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Job not found: does-not-exist");

    let id = api.queue.enqueue(Some("manual"), None).unwrap();
    let (status, body) = api.get(&format!("/api/jobs/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_id"], id.as_str());
    assert_eq!(body["context"], "manual");
}

#[tokio::test]
async fn list_jobs_filters_and_pages() {
    let api = Api::new();
    for _ in 0..3 {
        api.queue.enqueue(Some("adhoc"), None).unwrap();
    }
    let weekly = api.queue.enqueue(Some("weekly"), None).unwrap();
    let cancelled = api.queue.enqueue(Some("weekly"), None).unwrap();
    api.queue.cancel_job(&cancelled).unwrap();

    let (status, body) = api.get("/api/jobs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 5);
    assert_eq!(body["limit"], 50);
    assert_eq!(body["offset"], 0);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 5);
    assert_eq!(body["jobs"][0]["job_id"], cancelled.as_str());

    let (_, body) = api.get("/api/jobs?status=pending&context=weekly").await;
    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["job_id"], weekly.as_str());
    assert_eq!(body["total"], 4);

    let (_, body) = api.get("/api/jobs?limit=2&offset=1").await;
    assert_eq!(body["limit"], 2);
    assert_eq!(body["offset"], 1);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 2);
    assert_eq!(body["jobs"][0]["job_id"], weekly.as_str());

    let (_, body) = api.get("/api/jobs?limit=1000").await;
    assert_eq!(body["limit"], 100);
}

#[tokio::test]
async fn list_jobs_rejects_bad_parameters() {
    let api = Api::new();

    let (status, body) = api.get("/api/jobs?status=running").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid status: running");

    let (status, _) = api.get("/api/jobs?limit=ten").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = api.get("/api/jobs?offset=-1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_pending_job() {
    let api = Api::new();
    let id = api.queue.enqueue(None, None).unwrap();

    let (status, body) = api
        .send("DELETE", &format!("/api/jobs/{id}"), Some(KEY))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_id"], id.as_str());
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["message"], "Job cancelled successfully");

    let job = api.queue.get_job(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.completed_at.is_none());
    assert_eq!(api.queue.get_queue_depth().unwrap(), 0);
    assert!(api.queue.dequeue().unwrap().is_none());
}

#[tokio::test]
async fn cancel_rejects_non_pending_jobs() {
    let api = Api::new();
    let id = api.queue.enqueue(None, None).unwrap();
    let job = api.queue.dequeue().unwrap().unwrap();
    assert_eq!(job.id, id);

    let (status, body) = api
        .send("DELETE", &format!("/api/jobs/{id}"), Some(KEY))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Cannot cancel job in status: processing");

    let (status, _) = api.send("DELETE", "/api/jobs/missing", Some(KEY)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_reflects_worker_and_stuck_jobs() {
    let api = Api::new();

    let (status, body) = api.send("GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    let errors: Vec<&str> = body["errors"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(errors, ["Worker thread not running"]);

    api.worker.start().unwrap();
    let (status, body) = api.send("GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["queue"]["backend"], "sqlite");
    assert_eq!(body["worker"]["status"], "running");
    assert!(body["timestamp"].is_string());
    api.worker.stop(Duration::from_secs(5));

    // Six jobs stuck in processing means the worker is wedged.
    for _ in 0..6 {
        api.queue.enqueue(None, None).unwrap();
        api.queue.dequeue().unwrap().unwrap();
    }
    api.worker.start().unwrap();
    let (status, body) = api.send("GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["errors"][0], "Too many processing jobs: 6");
    api.worker.stop(Duration::from_secs(5));
}

#[tokio::test]
async fn stats_summarize_the_queue() {
    let api = Api::new();

    let done = api.queue.enqueue(None, None).unwrap();
    let job = api.queue.dequeue().unwrap().unwrap();
    let started = job.started_at.unwrap();
    api.queue
        .update_status(
            &done,
            &StatusUpdate::completed(
                started,
                started + chrono::Duration::milliseconds(1500),
                serde_json::json!({ "processed": 2 }),
            ),
        )
        .unwrap();
    api.queue.enqueue(None, None).unwrap();

    let (status, body) = api.get("/api/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"]["total"], 2);
    assert_eq!(body["jobs"]["pending"], 1);
    assert_eq!(body["jobs"]["completed"], 1);
    assert_eq!(body["jobs"]["failed"], 0);
    assert_eq!(body["performance"]["average_execution_time"], "1.50s");
    assert_eq!(body["queue"]["backend"], "sqlite");
    assert_eq!(body["queue"]["depth"], 1);
    assert_eq!(body["worker"]["status"], "stopped");
}

#[tokio::test]
async fn unknown_endpoints_return_json_404() {
    let api = Api::new();

    for uri in ["/", "/api/nope", "/api/jobs/a/b"] {
        let (status, body) = api.send("GET", uri, Some(KEY)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(body["error"], "Not Found");
        assert_eq!(body["message"], "Endpoint not found");
    }
}
