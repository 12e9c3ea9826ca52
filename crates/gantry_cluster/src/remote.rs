//! Dispatch to remote workers over JSON-RPC.

use async_trait::async_trait;
use gantry_core::{Task, TaskId};
use gantry_queue::Worker;
use serde::Serialize;
use serde_json::{Value, json};
use std::time::Duration;

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Timeout
    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    /// Non-success HTTP status
    #[error("HTTP {0}")]
    Status(u16),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A JSON-RPC 2.0 call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcCall {
    /// Always `"2.0"`
    pub jsonrpc: &'static str,
    /// Request id
    pub id: String,
    /// Method name
    pub method: &'static str,
    /// Named parameters
    pub params: Value,
}

impl RpcCall {
    /// Create a call with a fresh id
    #[must_use]
    pub fn new(method: &'static str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: uuid::Uuid::new_v4().to_string(),
            method,
            params,
        }
    }
}

/// Hands tasks to workers
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Ask `worker` to start `task`
    ///
    /// # Errors
    ///
    /// Returns a transport error if the worker cannot be reached or answers
    /// with a non-success status
    async fn start(&self, worker: &Worker, task: &Task) -> Result<(), TransportError>;

    /// Ask `worker` to stop working on a task
    ///
    /// # Errors
    ///
    /// Returns a transport error if the worker cannot be reached
    async fn cancel(&self, worker: &Worker, task_id: &TaskId) -> Result<(), TransportError>;
}

/// Dispatcher posting JSON-RPC calls to each worker's URL
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDispatcher {
    /// Default request timeout
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a dispatcher whose requests give up after `timeout`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    /// Request timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn call(&self, url: &str, call: RpcCall) -> Result<(), TransportError> {
        let response = self
            .client
            .post(url)
            .json(&call)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(())
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX))
        } else if err.is_builder() {
            TransportError::Serialization(err.to_string())
        } else {
            TransportError::ConnectionFailed(err.to_string())
        }
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn start(&self, worker: &Worker, task: &Task) -> Result<(), TransportError> {
        let params = json!({ "task": task });
        self.call(&worker.url, RpcCall::new("Work.start", params)).await
    }

    async fn cancel(&self, worker: &Worker, task_id: &TaskId) -> Result<(), TransportError> {
        let params = json!({ "taskId": task_id });
        self.call(&worker.url, RpcCall::new("Work.cancel", params)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use gantry_core::{PoolName, WorkerId};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    type Seen = Arc<Mutex<Vec<Value>>>;

    async fn accept(State(seen): State<Seen>, axum::Json(body): axum::Json<Value>) -> axum::Json<Value> {
        let id = body["id"].clone();
        seen.lock().await.push(body);
        axum::Json(json!({"jsonrpc": "2.0", "id": id, "result": {"accepted": true}}))
    }

    async fn refuse() -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }

    async fn stall() -> StatusCode {
        tokio::time::sleep(Duration::from_secs(5)).await;
        StatusCode::OK
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/rpc", addr)
    }

    fn worker(url: String) -> Worker {
        Worker::new(
            WorkerId::parse("w1").unwrap(),
            PoolName::parse("p").unwrap(),
            url,
        )
    }

    fn task() -> Task {
        let Some(payload) = json!({"action": "eval"}).as_object().cloned() else {
            panic!("object")
        };
        Task::new(PoolName::parse("p").unwrap(), payload)
    }

    #[test]
    fn test_rpc_call_shape() {
        let call = RpcCall::new("Work.start", json!({"task": 1}));
        let encoded = serde_json::to_value(&call).unwrap();
        assert_eq!(encoded["jsonrpc"], "2.0");
        assert_eq!(encoded["method"], "Work.start");
        assert!(encoded["id"].is_string());
    }

    #[tokio::test]
    async fn test_start_posts_work_start() {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route("/rpc", post(accept))
            .with_state(Arc::clone(&seen));
        let url = serve(app).await;
        let dispatcher = HttpDispatcher::new(Duration::from_secs(2)).unwrap();
        let task = task();

        dispatcher.start(&worker(url), &task).await.unwrap();

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["method"], "Work.start");
        assert_eq!(seen[0]["params"]["task"]["id"], task.id.as_str());
        assert_eq!(seen[0]["params"]["task"]["payload"]["action"], "eval");
    }

    #[tokio::test]
    async fn test_cancel_posts_work_cancel() {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route("/rpc", post(accept))
            .with_state(Arc::clone(&seen));
        let url = serve(app).await;
        let dispatcher = HttpDispatcher::new(Duration::from_secs(2)).unwrap();
        let id = TaskId::parse("t-1").unwrap();

        dispatcher.cancel(&worker(url), &id).await.unwrap();
        assert_eq!(seen.lock().await[0]["params"]["taskId"], "t-1");
    }

    #[tokio::test]
    async fn test_error_status_is_transport_error() {
        let url = serve(Router::new().route("/rpc", post(refuse))).await;
        let dispatcher = HttpDispatcher::new(Duration::from_secs(2)).unwrap();
        let err = dispatcher.start(&worker(url), &task()).await.unwrap_err();
        assert_eq!(err, TransportError::Status(503));
    }

    #[tokio::test]
    async fn test_unreachable_worker() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let dispatcher = HttpDispatcher::new(Duration::from_secs(2)).unwrap();
        let err = dispatcher
            .start(&worker(format!("http://{}/rpc", addr)), &task())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_slow_worker_times_out() {
        let url = serve(Router::new().route("/rpc", post(stall))).await;
        let dispatcher = HttpDispatcher::new(Duration::from_millis(100)).unwrap();
        let err = dispatcher.start(&worker(url), &task()).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout(100));
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(TransportError::Status(502).to_string(), "HTTP 502");
        assert!(
            TransportError::ConnectionFailed("refused".into())
                .to_string()
                .contains("Connection failed")
        );
    }
}
