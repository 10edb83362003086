use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use url::Url;

use crate::queue::{Job, JobStatus};

/// Page of jobs returned by `GET /api/jobs`.
#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct JobList {
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
    pub jobs: Vec<Job>,
}

pub struct ApiClient {
    base: Url,
    api_key: Option<String>,
}

impl ApiClient {
    pub fn new(server_url: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        let base = Url::parse(server_url)
            .map_err(|e| anyhow::anyhow!("invalid server URL {server_url:?}: {e}"))?;
        if base.scheme() != "http" {
            anyhow::bail!("unsupported server URL scheme {:?}; use http://", base.scheme());
        }
        if base.host_str().is_none() {
            anyhow::bail!("server URL {server_url:?} has no host");
        }
        Ok(Self { base, api_key })
    }

    pub fn from_config(config: &crate::config::Config) -> anyhow::Result<Self> {
        Self::new(
            &config.client.server_url,
            config.client_api_key().map(str::to_string),
        )
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        url.set_path(&format!("{}{path}", self.base.path().trim_end_matches('/')));
        url.set_query(None);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        url
    }

    async fn request(
        &self,
        method: hyper::Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> anyhow::Result<(hyper::StatusCode, String)> {
        let url = self.url(path, query);
        let host = url.host_str().unwrap_or("localhost");
        let port = url.port_or_known_default().unwrap_or(80);

        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            anyhow::anyhow!(
                "could not connect to server at {}: {e}\nIs the server running? Start it with: qbt-rules serve",
                self.base,
            )
        })?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(conn);

        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(&url[url::Position::BeforePath..])
            .header("host", format!("{host}:{port}"))
            .header("accept", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header(crate::daemon::HEADER_API_KEY, key);
        }

        let req = builder.body(Full::new(Bytes::new()))?;
        let res = sender.send_request(req).await?;
        let status = res.status();
        let res_bytes = res.into_body().collect().await?.to_bytes();
        let text = String::from_utf8(res_bytes.to_vec())?;

        tracing::debug!(%url, status = status.as_u16(), "api response");
        Ok((status, text))
    }

    async fn call_json<T: serde::de::DeserializeOwned>(
        &self,
        method: hyper::Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> anyhow::Result<T> {
        let (status, body) = self.request(method, path, query).await?;
        if !status.is_success() {
            anyhow::bail!("{}", extract_error(status, &body));
        }
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn execute(&self, context: Option<&str>, hash: Option<&str>) -> anyhow::Result<Job> {
        let mut query = Vec::new();
        if let Some(context) = context {
            query.push(("context", context));
        }
        if let Some(hash) = hash {
            query.push(("hash", hash));
        }
        self.call_json(hyper::Method::POST, "/api/execute", &query)
            .await
    }

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        context: Option<&str>,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> anyhow::Result<JobList> {
        let limit = limit.map(|l| l.to_string());
        let offset = offset.map(|o| o.to_string());

        let mut query = Vec::new();
        if let Some(status) = status {
            query.push(("status", status.as_str()));
        }
        if let Some(context) = context {
            query.push(("context", context));
        }
        if let Some(limit) = &limit {
            query.push(("limit", limit.as_str()));
        }
        if let Some(offset) = &offset {
            query.push(("offset", offset.as_str()));
        }
        self.call_json(hyper::Method::GET, "/api/jobs", &query).await
    }

    pub async fn get_job(&self, id: &str) -> anyhow::Result<Job> {
        self.call_json(hyper::Method::GET, &format!("/api/jobs/{id}"), &[])
            .await
    }

    pub async fn cancel_job(&self, id: &str) -> anyhow::Result<String> {
        let body: serde_json::Value = self
            .call_json(hyper::Method::DELETE, &format!("/api/jobs/{id}"), &[])
            .await?;
        Ok(body["message"]
            .as_str()
            .unwrap_or("Job cancelled")
            .to_string())
    }

    pub async fn stats(&self) -> anyhow::Result<serde_json::Value> {
        self.call_json(hyper::Method::GET, "/api/stats", &[]).await
    }

    /// Returns the health body, which is also meaningful when unhealthy.
    pub async fn health(&self) -> anyhow::Result<(bool, serde_json::Value)> {
        let (status, body) = self
            .request(hyper::Method::GET, "/api/health", &[])
            .await?;
        let value = serde_json::from_str(&body)
            .map_err(|_| anyhow::anyhow!("{}", extract_error(status, &body)))?;
        Ok((status.is_success(), value))
    }

    pub async fn version(&self) -> anyhow::Result<serde_json::Value> {
        self.call_json(hyper::Method::GET, "/api/version", &[]).await
    }
}

fn extract_error(status: hyper::StatusCode, body: &str) -> String {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let field = |name: &str| {
        parsed
            .as_ref()
            .and_then(|v| v.get(name)?.as_str().map(String::from))
    };

    match (field("error"), field("message")) {
        (Some(error), Some(message)) => format!("{error}: {message}"),
        (None, Some(message)) | (Some(message), None) => message,
        (None, None) if body.trim().is_empty() => format!("server returned {status}"),
        (None, None) => body.to_string(),
    }
}
