//! Client for remote asynchronous job APIs (IP builder, object validator).
//!
//! Both downstream services expose the same shape: submit a job and receive a
//! handle, then poll the handle until it reaches a terminal state. The
//! [`ExternalJobClient`] owns one submit-and-poll cycle, bounded by an
//! absolute deadline; transient transport failures are retried through the
//! shared [`RetryPolicy`] before being classified fatal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::retry::{CancelFlag, RetryError, RetryPolicy, Transient};

/// Transport-level failure talking to a remote service.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection-level failure (reset, refused, DNS).
    #[error("network error: {0}")]
    Network(String),

    /// The request did not complete within the per-request timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The service answered with an error status.
    #[error("service returned {0}: {1}")]
    Api(u16, String),

    /// The response body could not be decoded.
    #[error("invalid response: {0}")]
    Parse(String),
}

impl Transient for TransportError {
    fn is_transient(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Timeout(_) => true,
            // Gateway hiccups are worth another attempt; 4xx are not.
            TransportError::Api(status, _) => *status >= 500,
            TransportError::Parse(_) => false,
        }
    }
}

/// Terminal and non-terminal states a remote job can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteJobState {
    Queued,
    Running,
    Completed,
    Failed,
}

/// One poll response from a remote job API.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteJobStatus {
    pub status: RemoteJobState,

    /// Result payload, present once `status` is `completed`.
    #[serde(default)]
    pub result: Option<Value>,

    /// Error detail, present when `status` is `failed`.
    #[serde(default)]
    pub error: Option<String>,
}

/// The submit/poll contract both downstream services satisfy.
#[async_trait]
pub trait RemoteJobApi: Send + Sync {
    /// Submits a job, returning the service-assigned handle.
    async fn submit(&self, body: &Value) -> Result<String, TransportError>;

    /// Polls a previously submitted job.
    async fn poll(&self, handle: &str) -> Result<RemoteJobStatus, TransportError>;
}

/// HTTP implementation of [`RemoteJobApi`].
///
/// `POST {base}{submit_path}` with a JSON body returns `{"token": "<id>"}`;
/// `GET {base}/status?token=<id>` returns a [`RemoteJobStatus`] document.
pub struct HttpJobApi {
    client: reqwest::Client,
    base_url: String,
    submit_path: String,
}

impl HttpJobApi {
    pub fn new(
        base_url: impl Into<String>,
        submit_path: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            submit_path: submit_path.into(),
        })
    }

    fn classify(e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else {
            TransportError::Network(e.to_string())
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Api(status.as_u16(), body));
        }
        Ok(response)
    }
}

#[async_trait]
impl RemoteJobApi for HttpJobApi {
    async fn submit(&self, body: &Value) -> Result<String, TransportError> {
        let url = format!("{}{}", self.base_url, self.submit_path);
        debug!(%url, "Submitting remote job");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(Self::classify)?;
        let response = Self::check(response).await?;

        #[derive(Deserialize)]
        struct Accepted {
            token: String,
        }
        let accepted: Accepted = response
            .json()
            .await
            .map_err(|e| TransportError::Parse(e.to_string()))?;
        Ok(accepted.token)
    }

    async fn poll(&self, handle: &str) -> Result<RemoteJobStatus, TransportError> {
        let url = format!("{}/status", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("token", handle)])
            .send()
            .await
            .map_err(Self::classify)?;
        let response = Self::check(response).await?;
        response
            .json()
            .await
            .map_err(|e| TransportError::Parse(e.to_string()))
    }
}

/// Failure of one complete submit-and-poll cycle.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The deadline (submission time + job timeout) elapsed first.
    #[error("{service} job did not finish within {timeout_secs}s")]
    DownstreamTimeout { service: String, timeout_secs: u64 },

    /// The remote reported a failure terminal state.
    #[error("{service} job failed: {message}")]
    DownstreamJobFailed { service: String, message: String },

    /// The service could not be reached even after retries.
    #[error("{service} unreachable: {source}")]
    Unreachable {
        service: String,
        #[source]
        source: TransportError,
    },

    /// The owning job was cancelled; the remote job is abandoned.
    #[error("{service} call abandoned (job cancelled)")]
    Abandoned { service: String },
}

/// Submits one unit of work and polls it to completion.
#[derive(Clone)]
pub struct ExternalJobClient {
    api: Arc<dyn RemoteJobApi>,
    service: String,
    poll_interval: Duration,
    job_timeout: Duration,
    retry: RetryPolicy,
}

impl ExternalJobClient {
    pub fn new(
        api: Arc<dyn RemoteJobApi>,
        service: impl Into<String>,
        poll_interval: Duration,
        job_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            api,
            service: service.into(),
            poll_interval,
            job_timeout,
            retry,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn network_error(&self, e: RetryError<TransportError>) -> ClientError {
        match e {
            RetryError::Exhausted { source, .. } | RetryError::Fatal(source) => {
                ClientError::Unreachable {
                    service: self.service.clone(),
                    source,
                }
            }
            RetryError::Cancelled => ClientError::Abandoned {
                service: self.service.clone(),
            },
        }
    }

    /// Runs `body` on the remote service to a terminal state.
    ///
    /// Cancellation is checked at every sleep boundary; a cancelled call
    /// abandons the remote job (the remote API offers no cancel operation).
    pub async fn run(&self, body: Value, cancel: &CancelFlag) -> Result<Value, ClientError> {
        let handle = self
            .retry
            .run("submitting job", cancel, || self.api.submit(&body))
            .await
            .map_err(|e| self.network_error(e))?;

        info!(service = %self.service, %handle, "Remote job submitted");
        let deadline = Instant::now() + self.job_timeout;

        loop {
            let status = self
                .retry
                .run("polling job", cancel, || self.api.poll(&handle))
                .await
                .map_err(|e| self.network_error(e))?;

            match status.status {
                RemoteJobState::Completed => {
                    info!(service = %self.service, %handle, "Remote job completed");
                    return Ok(status.result.unwrap_or(Value::Null));
                }
                RemoteJobState::Failed => {
                    warn!(service = %self.service, %handle, "Remote job failed");
                    return Err(ClientError::DownstreamJobFailed {
                        service: self.service.clone(),
                        message: status
                            .error
                            .unwrap_or_else(|| "no error detail provided".to_string()),
                    });
                }
                RemoteJobState::Queued | RemoteJobState::Running => {}
            }

            if Instant::now() >= deadline {
                return Err(ClientError::DownstreamTimeout {
                    service: self.service.clone(),
                    timeout_secs: self.job_timeout.as_secs(),
                });
            }
            if cancel.is_cancelled() {
                return Err(ClientError::Abandoned {
                    service: self.service.clone(),
                });
            }
            sleep(self.poll_interval).await;
            if cancel.is_cancelled() {
                return Err(ClientError::Abandoned {
                    service: self.service.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// In-memory job API scripted with a sequence of poll responses.
    struct FakeJobApi {
        submit_failures: AtomicU32,
        polls: Mutex<Vec<RemoteJobStatus>>,
        poll_count: AtomicU32,
    }

    impl FakeJobApi {
        fn new(polls: Vec<RemoteJobStatus>) -> Self {
            Self {
                submit_failures: AtomicU32::new(0),
                polls: Mutex::new(polls),
                poll_count: AtomicU32::new(0),
            }
        }

        fn failing_submits(self, n: u32) -> Self {
            self.submit_failures.store(n, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl RemoteJobApi for FakeJobApi {
        async fn submit(&self, _body: &Value) -> Result<String, TransportError> {
            if self.submit_failures.load(Ordering::SeqCst) > 0 {
                self.submit_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::Network("connection reset".into()));
            }
            Ok("job-1".to_string())
        }

        async fn poll(&self, handle: &str) -> Result<RemoteJobStatus, TransportError> {
            assert_eq!(handle, "job-1");
            self.poll_count.fetch_add(1, Ordering::SeqCst);
            let mut polls = self.polls.lock().unwrap();
            if polls.len() > 1 {
                Ok(polls.remove(0))
            } else {
                Ok(polls[0].clone())
            }
        }
    }

    fn running() -> RemoteJobStatus {
        RemoteJobStatus {
            status: RemoteJobState::Running,
            result: None,
            error: None,
        }
    }

    fn completed(result: Value) -> RemoteJobStatus {
        RemoteJobStatus {
            status: RemoteJobState::Completed,
            result: Some(result),
            error: None,
        }
    }

    fn failed(message: &str) -> RemoteJobStatus {
        RemoteJobStatus {
            status: RemoteJobState::Failed,
            result: None,
            error: Some(message.to_string()),
        }
    }

    fn client(api: FakeJobApi, job_timeout: Duration) -> ExternalJobClient {
        ExternalJobClient::new(
            Arc::new(api),
            "ip_builder",
            Duration::from_millis(1),
            job_timeout,
            RetryPolicy::new(3, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_polls_until_completed() {
        let api = FakeJobApi::new(vec![
            running(),
            running(),
            completed(serde_json::json!({"path": "/ips/ip0", "valid": true})),
        ]);
        let client = client(api, Duration::from_secs(5));
        let result = client
            .run(serde_json::json!({}), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(result["path"], "/ips/ip0");
    }

    #[tokio::test]
    async fn test_remote_failure_is_fatal() {
        let api = FakeJobApi::new(vec![running(), failed("bag incomplete")]);
        let client = client(api, Duration::from_secs(5));
        let err = client
            .run(serde_json::json!({}), &CancelFlag::new())
            .await
            .unwrap_err();
        match err {
            ClientError::DownstreamJobFailed { message, .. } => {
                assert_eq!(message, "bag incomplete")
            }
            other => panic!("expected DownstreamJobFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_yields_downstream_timeout() {
        let api = FakeJobApi::new(vec![running()]);
        let client = client(api, Duration::from_millis(10));
        let err = client
            .run(serde_json::json!({}), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::DownstreamTimeout { .. }));
    }

    #[tokio::test]
    async fn test_transient_submit_errors_are_retried() {
        let api =
            FakeJobApi::new(vec![completed(Value::Null)]).failing_submits(2);
        let client = client(api, Duration::from_secs(5));
        let result = client.run(serde_json::json!({}), &CancelFlag::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_abandons_remote_job() {
        let api = FakeJobApi::new(vec![running()]);
        let client = client(api, Duration::from_secs(5));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = client
            .run(serde_json::json!({}), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Abandoned { .. }));
    }

    #[test]
    fn test_transport_error_classification() {
        assert!(TransportError::Network("reset".into()).is_transient());
        assert!(TransportError::Timeout("30s".into()).is_transient());
        assert!(TransportError::Api(503, "busy".into()).is_transient());
        assert!(!TransportError::Api(400, "bad body".into()).is_transient());
        assert!(!TransportError::Parse("eof".into()).is_transient());
    }
}
