// crates/core/src/client.rs
//! Status queries against the remote job-tracking endpoint.
//!
//! The service's endpoints disagree on field names (`progress` vs
//! `progress_percentage`, `job_id` vs `id`, bare vs `data`-wrapped bodies).
//! All of that is absorbed here through ordered alias tables so the rest of
//! the crate only ever sees a [`StatusSnapshot`].

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::ClientConfig;
use crate::error::{ConfigError, TransportError};
use crate::types::{clamp_progress, metric_keys, JobHandle, JobStatus, StatusSnapshot};

/// Source of status snapshots for a job.
///
/// Implementations must not retry: retry policy belongs to the poller.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Issue one status query for `job`.
    async fn query(&self, job: &JobHandle) -> Result<StatusSnapshot, TransportError>;
}

// Field aliases, most specific first.
const ENVELOPE_FIELDS: &[&str] = &["data", "job"];
const JOB_ID_FIELDS: &[&str] = &["job_id", "jobId", "id"];
const STATUS_FIELDS: &[&str] = &["status", "state", "job_status"];
const PROGRESS_FIELDS: &[&str] = &["progress", "progress_percentage", "progressPercentage", "percent"];
const STEP_FIELDS: &[&str] = &["current_step", "currentStep", "step", "stage", "message"];
const ERROR_FIELDS: &[&str] = &["error", "error_message", "errorMessage", "error_detail"];
const METRICS_FIELDS: &[&str] = &["metrics", "progress_details", "details", "stats"];

/// HTTP implementation of [`StatusSource`].
#[derive(Debug, Clone)]
pub struct StatusClient {
    http: reqwest::Client,
    base_url: String,
    status_path: String,
    api_key: Option<String>,
}

impl StatusClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ConfigError::invalid("client", e.to_string()))?;

        let status_path = if config.status_path.starts_with('/') {
            config.status_path.clone()
        } else {
            format!("/{}", config.status_path)
        };

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            status_path,
            api_key: config.api_key.clone(),
        })
    }

    /// Full status URL for a job id. The id is percent-encoded.
    pub fn status_url(&self, job_id: &str) -> String {
        let path = self
            .status_path
            .replace("{job_id}", &urlencoding::encode(job_id));
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl StatusSource for StatusClient {
    async fn query(&self, job: &JobHandle) -> Result<StatusSnapshot, TransportError> {
        let url = self.status_url(job.id());
        let mut request = self
            .http
            .get(&url)
            .header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(TransportError::http_status(status.as_u16(), &body));
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| TransportError::malformed(format!("invalid JSON: {e}")))?;

        normalize_status(job.id(), &value)
    }
}

/// Build a snapshot from a raw status body.
///
/// Only the status field is mandatory. Progress defaults to 0 when absent.
pub fn normalize_status(job_id: &str, body: &Value) -> Result<StatusSnapshot, TransportError> {
    let obj = unwrap_envelope(body)
        .ok_or_else(|| TransportError::malformed("status body is not a JSON object"))?;

    if let Some(reported) = first_field(obj, JOB_ID_FIELDS).and_then(value_as_string) {
        if reported != job_id {
            tracing::debug!(job_id, reported_id = %reported, "Status body reports a different job id");
        }
    }

    let raw_status = first_field(obj, STATUS_FIELDS)
        .ok_or_else(|| TransportError::malformed("no status field in body"))?;
    let raw_status = raw_status
        .as_str()
        .ok_or_else(|| TransportError::malformed(format!("status is not a string: {raw_status}")))?;
    let status = JobStatus::normalize(raw_status).unwrap_or_else(|| {
        tracing::debug!(job_id, raw_status, "Unknown remote status, treating as running");
        JobStatus::Running
    });

    let progress = first_field(obj, PROGRESS_FIELDS)
        .and_then(value_as_f64)
        .map(clamp_progress)
        .unwrap_or(0.0);

    let current_step = first_field(obj, STEP_FIELDS).and_then(value_as_string);
    let error = first_field(obj, ERROR_FIELDS).and_then(error_detail);

    let mut snapshot = StatusSnapshot::new(job_id, status, progress);
    snapshot.current_step = current_step;
    snapshot.error = error;

    if let Some(Value::Object(metrics)) = first_field(obj, METRICS_FIELDS) {
        for (key, value) in metrics {
            if let Some(n) = value_as_f64(value) {
                snapshot.metrics.insert(key.clone(), n);
            }
        }
    }
    for key in metric_keys::KNOWN {
        if snapshot.metrics.contains_key(*key) {
            continue;
        }
        if let Some(n) = obj.get(*key).and_then(value_as_f64) {
            snapshot.metrics.insert((*key).to_string(), n);
        }
    }

    Ok(snapshot)
}

/// Descend through `data` / `job` wrappers until an object carrying a
/// status field is found. Falls back to the outermost object.
fn unwrap_envelope(body: &Value) -> Option<&Map<String, Value>> {
    let outer = body.as_object()?;
    let mut current = outer;
    loop {
        if first_field(current, STATUS_FIELDS).is_some() {
            return Some(current);
        }
        let inner = ENVELOPE_FIELDS
            .iter()
            .find_map(|f| current.get(*f).and_then(Value::as_object));
        match inner {
            Some(inner) => current = inner,
            None => return Some(outer),
        }
    }
}

fn first_field<'a>(obj: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .filter_map(|name| obj.get(*name))
        .find(|v| !v.is_null())
}

/// Numbers or numeric strings. `NaN` and infinities are rejected.
fn value_as_f64(value: &Value) -> Option<f64> {
    let n: f64 = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn error_detail(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(value.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn client_for(base_url: &str, api_key: Option<&str>) -> StatusClient {
        let config = ClientConfig {
            base_url: base_url.to_string(),
            api_key: api_key.map(str::to_string),
            ..ClientConfig::default()
        };
        StatusClient::new(&config).unwrap()
    }

    #[test]
    fn test_normalize_progress_alias() {
        let a = normalize_status("j", &json!({"status": "running", "progress": 40})).unwrap();
        let b = normalize_status("j", &json!({"status": "running", "progress_percentage": 40})).unwrap();
        assert_eq!(a.progress, 40.0);
        assert_eq!(b.progress, 40.0);
    }

    #[test]
    fn test_normalize_missing_progress_defaults_to_zero() {
        let snap = normalize_status("j", &json!({"status": "queued"})).unwrap();
        assert_eq!(snap.status, JobStatus::Queued);
        assert_eq!(snap.progress, 0.0);
        assert!(snap.metrics.is_empty());
    }

    #[test]
    fn test_normalize_envelope_and_metrics() {
        let body = json!({
            "success": true,
            "data": {
                "job_id": "j",
                "status": "processing",
                "progress": "55%",
                "current_step": "Generating embeddings",
                "metrics": {"chunks_created": 42, "images_extracted": "7", "note": "n/a"},
                "embeddings_generated": 30
            }
        });
        let snap = normalize_status("j", &body).unwrap();
        assert_eq!(snap.status, JobStatus::Running);
        assert_eq!(snap.progress, 55.0);
        assert_eq!(snap.current_step.as_deref(), Some("Generating embeddings"));
        assert_eq!(snap.metric("chunks_created"), Some(42.0));
        assert_eq!(snap.metric("images_extracted"), Some(7.0));
        assert_eq!(snap.metric("embeddings_generated"), Some(30.0));
        assert_eq!(snap.metric("note"), None);
    }

    #[test]
    fn test_normalize_drops_non_finite_numbers() {
        let body = json!({
            "status": "running",
            "progress": "NaN",
            "metrics": {"chunks_created": "inf", "pages_completed": "-Infinity", "total_pages": "12"}
        });
        let snap = normalize_status("j", &body).unwrap();
        assert_eq!(snap.progress, 0.0);
        assert_eq!(snap.metric("chunks_created"), None);
        assert_eq!(snap.metric("pages_completed"), None);
        assert_eq!(snap.metric("total_pages"), Some(12.0));
    }

    #[test]
    fn test_normalize_error_object() {
        let body = json!({"status": "failed", "error": {"message": "PDF is encrypted", "code": 422}});
        let snap = normalize_status("j", &body).unwrap();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some("PDF is encrypted"));
    }

    #[test]
    fn test_normalize_unknown_status_is_running() {
        let snap = normalize_status("j", &json!({"status": "warming_up"})).unwrap();
        assert_eq!(snap.status, JobStatus::Running);
    }

    #[test]
    fn test_normalize_rejects_missing_status() {
        let err = normalize_status("j", &json!({"progress": 10})).unwrap_err();
        assert!(matches!(err, TransportError::Malformed { .. }));
        let err = normalize_status("j", &json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, TransportError::Malformed { .. }));
    }

    #[test]
    fn test_status_url_encodes_id() {
        let client = client_for("https://api.example.com/", None);
        assert_eq!(
            client.status_url("a b/c"),
            "https://api.example.com/api/jobs/a%20b%2Fc"
        );
    }

    #[tokio::test]
    async fn test_query_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/jobs/job-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"job-1","status":"completed","progress_percentage":100,"metrics":{"chunks_created":42}}"#)
            .create_async()
            .await;

        let client = client_for(&server.url(), None);
        let job = JobHandle::new("job-1").unwrap();
        let snap = client.query(&job).await.unwrap();

        mock.assert_async().await;
        assert_eq!(snap.job_id, "job-1");
        assert_eq!(snap.status, JobStatus::Completed);
        assert_eq!(snap.progress, 100.0);
        assert_eq!(snap.metric("chunks_created"), Some(42.0));
    }

    #[tokio::test]
    async fn test_query_sends_api_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/jobs/job-2")
            .match_header("apikey", "secret")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_body(r#"{"status":"running","progress":10}"#)
            .create_async()
            .await;

        let client = client_for(&server.url(), Some("secret"));
        let job = JobHandle::new("job-2").unwrap();
        client.query(&job).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_query_non_2xx() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/jobs/job-3")
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let client = client_for(&server.url(), None);
        let job = JobHandle::new("job-3").unwrap();
        let err = client.query(&job).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::HttpStatus {
                status: 502,
                body: "bad gateway".into()
            }
        );
    }

    #[tokio::test]
    async fn test_query_unparseable_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/jobs/job-4")
            .with_status(200)
            .with_body("<html>oops</html>")
            .create_async()
            .await;

        let client = client_for(&server.url(), None);
        let job = JobHandle::new("job-4").unwrap();
        let err = client.query(&job).await.unwrap_err();
        assert!(matches!(err, TransportError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_query_connection_refused() {
        // Port 1 on loopback is never listening in test environments.
        let client = client_for("http://127.0.0.1:1", None);
        let job = JobHandle::new("job-5").unwrap();
        let err = client.query(&job).await.unwrap_err();
        assert!(matches!(err, TransportError::Network { .. }));
    }
}
