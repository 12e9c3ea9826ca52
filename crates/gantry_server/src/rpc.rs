//! JSON-RPC 2.0 over HTTP.
//!
//! `POST /rpc` takes one request object per call. `GET /events` streams
//! task updates as server-sent events. `GET /health` is a liveness check.

use axum::body::Bytes;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use gantry_cluster::{Gateway, GatewayError, GatewayResult, TASK_UPDATE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;

/// Body is not JSON
pub const PARSE_ERROR: i64 = -32700;
/// JSON that is not a request object
pub const INVALID_REQUEST: i64 = -32600;
/// No such method
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Params missing or of the wrong shape
pub const INVALID_PARAMS: i64 = -32602;
/// Reply could not be encoded
pub const INTERNAL_ERROR: i64 = -32603;
/// The gateway rejected the call
pub const GATEWAY_ERROR: i64 = -32001;

/// A JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcError {
    /// Error code
    pub code: i64,
    /// Description
    pub message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<GatewayError> for RpcError {
    fn from(err: GatewayError) -> Self {
        let code = match err {
            GatewayError::InvalidParams(_) => INVALID_PARAMS,
            _ => GATEWAY_ERROR,
        };
        Self::new(code, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct Response {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl Response {
    fn new(id: Value, outcome: Result<Value, RpcError>) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(err) => (None, Some(err)),
        };
        Self {
            jsonrpc: "2.0",
            id,
            result,
            error,
        }
    }
}

fn decode<P: DeserializeOwned>(params: Value) -> Result<P, RpcError> {
    let params = if params.is_null() {
        Value::Object(Map::new())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|err| RpcError::new(INVALID_PARAMS, err.to_string()))
}

fn reply<T: Serialize>(outcome: GatewayResult<T>) -> Result<Value, RpcError> {
    let value = outcome?;
    serde_json::to_value(value).map_err(|err| RpcError::new(INTERNAL_ERROR, err.to_string()))
}

/// Invoke `method` on the gateway
///
/// # Errors
///
/// Returns the JSON-RPC error to send back
pub async fn call(gateway: &Gateway, method: &str, params: Value) -> Result<Value, RpcError> {
    match method {
        "Task.submit" => reply(gateway.task_submit(decode(params)?).await),
        "Task.get" => reply(gateway.task_get(decode(params)?).await),
        "Task.patch" => reply(gateway.task_patch(decode(params)?).await),
        "Task.cancel" | "Work.cancel" => reply(gateway.work_cancel(decode(params)?).await),
        "Worker.register" => reply(gateway.worker_register(decode(params)?).await),
        "Worker.heartbeat" => reply(gateway.worker_heartbeat(decode(params)?).await),
        "Worker.list" => reply(gateway.worker_list(decode(params)?).await),
        "Work.finished" => reply(gateway.work_finished(decode(params)?).await),
        "Pool.create" => reply(gateway.pool_create(decode(params)?).await),
        "Pool.listTasks" => reply(gateway.pool_list_tasks(decode(params)?).await),
        "Label.update" => reply(gateway.label_update(decode(params)?).await),
        "Label.pause" => reply(gateway.label_pause(decode(params)?).await),
        "Label.resume" => reply(gateway.label_resume(decode(params)?).await),
        "Label.cancel" => reply(gateway.label_cancel(decode(params)?).await),
        _ => Err(RpcError::new(
            METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )),
    }
}

async fn rpc(State(gateway): State<Gateway>, body: Bytes) -> Json<Response> {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return Json(Response::new(
                Value::Null,
                Err(RpcError::new(PARSE_ERROR, err.to_string())),
            ));
        }
    };
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let request: Request = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(err) => {
            return Json(Response::new(
                id,
                Err(RpcError::new(INVALID_REQUEST, err.to_string())),
            ));
        }
    };

    let outcome = call(&gateway, &request.method, request.params).await;
    if let Err(err) = &outcome {
        tracing::warn!(method = %request.method, code = err.code, "{}", err.message);
    }
    Json(Response::new(request.id, outcome))
}

async fn events(State(gateway): State<Gateway>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = futures::stream::unfold(gateway.subscribe(), |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(update) => match Event::default().event(TASK_UPDATE).json_data(&update) {
                    Ok(event) => return Some((Ok(event), receiver)),
                    Err(err) => tracing::warn!(error = %err, "Task event not encoded"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// The HTTP surface of a gateway
pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/rpc", post(rpc))
        .route("/events", get(events))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{Backends, Daemon};
    use crate::config::GatewayConfig;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use futures::StreamExt;
    use gantry_core::TaskStatus;
    use tower::ServiceExt;

    async fn gateway() -> Gateway {
        Daemon::start(&GatewayConfig::default(), &Backends::default())
            .await
            .unwrap()
            .gateway
    }

    async fn post_raw(app: &Router, body: impl Into<Body>) -> Value {
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/rpc")
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn post(app: &Router, method: &str, params: Value) -> Value {
        let body = json!({ "jsonrpc": "2.0", "id": 7, "method": method, "params": params });
        post_raw(app, body.to_string()).await
    }

    fn error_code(reply: &Value) -> i64 {
        reply["error"]["code"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(gateway().await);
        let request = HttpRequest::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let app = router(gateway().await);

        let reply = post_raw(&app, "{not json").await;
        assert_eq!(error_code(&reply), PARSE_ERROR);
        assert_eq!(reply["id"], Value::Null);

        let reply = post_raw(&app, json!({ "id": 3 }).to_string()).await;
        assert_eq!(error_code(&reply), INVALID_REQUEST);
        assert_eq!(reply["id"], json!(3));

        let reply = post(&app, "Task.explode", json!({})).await;
        assert_eq!(error_code(&reply), METHOD_NOT_FOUND);
        assert_eq!(reply["id"], json!(7));

        let reply = post(&app, "Task.submit", json!({ "payload": {} })).await;
        assert_eq!(error_code(&reply), INVALID_PARAMS);

        let reply = post(&app, "Task.submit", json!({ "pool": " ", "payload": {} })).await;
        assert_eq!(error_code(&reply), INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_submit_then_get() {
        let app = router(gateway().await);
        let reply = post(
            &app,
            "Task.submit",
            json!({ "pool": "default", "payload": { "action": "eval" }, "taskId": "t-1" }),
        )
        .await;
        assert_eq!(reply["jsonrpc"], "2.0");
        assert_eq!(reply["result"]["taskId"], "t-1");
        assert!(reply.get("error").is_none());

        let reply = post(&app, "Task.get", json!({ "taskId": "t-1" })).await;
        assert_eq!(reply["result"]["taskId"], "t-1");
        assert_eq!(reply["result"]["pool"], "default");
        assert_eq!(
            reply["result"]["status"],
            serde_json::to_value(TaskStatus::Queued).unwrap()
        );

        let reply = post(&app, "Task.get", json!({ "taskId": "missing" })).await;
        assert_eq!(error_code(&reply), GATEWAY_ERROR);
    }

    #[tokio::test]
    async fn test_cancel_alias() {
        let app = router(gateway().await);
        post(
            &app,
            "Task.submit",
            json!({ "pool": "default", "payload": {}, "taskId": "t-2" }),
        )
        .await;

        let reply = post(&app, "Task.cancel", json!({ "taskId": "t-2" })).await;
        assert_eq!(reply["result"], json!({ "ok": true }));
        let reply = post(&app, "Work.cancel", json!({ "taskId": "t-2" })).await;
        assert_eq!(reply["result"], json!({ "ok": false }));
    }

    #[tokio::test]
    async fn test_worker_lifecycle() {
        let app = router(gateway().await);
        let reply = post(
            &app,
            "Worker.register",
            json!({ "workerId": "w1", "pool": "default", "url": "http://127.0.0.1:9/rpc" }),
        )
        .await;
        assert_eq!(reply["result"], json!({ "ok": true }));

        let reply = post(
            &app,
            "Worker.heartbeat",
            json!({ "workerId": "w1", "metrics": { "load": 0.5 } }),
        )
        .await;
        assert_eq!(reply["result"], json!({ "ok": true }));

        let reply = post(&app, "Worker.heartbeat", json!({ "workerId": "ghost" })).await;
        assert_eq!(reply["result"], json!({ "ok": false }));

        let reply = post(&app, "Worker.list", Value::Null).await;
        let workers = reply["result"]["workers"].as_array().unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0]["workerId"], "w1");
    }

    #[tokio::test]
    async fn test_finished_for_unknown_task() {
        let app = router(gateway().await);
        let reply = post(
            &app,
            "Work.finished",
            json!({ "taskId": "nope", "status": "success" }),
        )
        .await;
        assert_eq!(reply["result"], json!({ "ok": false }));

        let reply = post(
            &app,
            "Work.finished",
            json!({ "taskId": "nope", "status": "exploded" }),
        )
        .await;
        assert_eq!(error_code(&reply), INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_patch_and_pool_methods() {
        let app = router(gateway().await);
        post(
            &app,
            "Task.submit",
            json!({ "pool": "default", "payload": { "n": 1 }, "taskId": "t-3", "labels": ["a"] }),
        )
        .await;

        let reply = post(
            &app,
            "Task.patch",
            json!({ "taskId": "t-3", "changes": { "labels": ["b", "c"] } }),
        )
        .await;
        assert_eq!(reply["result"]["labels"], json!(["b", "c"]));

        let reply = post(&app, "Pool.listTasks", json!({ "poolName": "default" })).await;
        let tasks = reply["result"].as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["taskId"], "t-3");

        let reply = post(&app, "Pool.create", json!({ "name": "gpu" })).await;
        assert_eq!(reply["result"], json!({ "name": "gpu" }));

        let reply = post(&app, "Task.patch", json!({ "taskId": "t-404", "changes": {} })).await;
        assert_eq!(error_code(&reply), GATEWAY_ERROR);
    }

    #[tokio::test]
    async fn test_label_methods() {
        let app = router(gateway().await);
        let reply = post(&app, "Label.pause", json!({ "label": "nightly" })).await;
        assert_eq!(reply["result"], json!({ "label": "nightly", "paused": true }));
        let reply = post(&app, "Label.resume", json!({ "label": "nightly" })).await;
        assert_eq!(reply["result"], json!({ "label": "nightly", "paused": false }));

        let reply = post(
            &app,
            "Label.update",
            json!({ "label": "nightly", "meta": { "rate": 2.0 } }),
        )
        .await;
        assert_eq!(reply["result"]["label"], "nightly");
        assert_eq!(reply["result"]["meta"]["rate"], json!(2.0));
        assert_eq!(reply["result"]["meta"]["paused"], json!(false));

        let reply = post(&app, "Label.update", json!({ "label": "", "meta": {} })).await;
        assert_eq!(error_code(&reply), INVALID_PARAMS);

        let reply = post(&app, "Label.cancel", json!({ "label": "nightly" })).await;
        assert_eq!(reply["result"], json!({ "cancelled": 0 }));
    }

    #[tokio::test]
    async fn test_events_stream_task_updates() {
        let app = router(gateway().await);
        let request = HttpRequest::builder()
            .uri("/events")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );

        post(
            &app,
            "Task.submit",
            json!({ "pool": "default", "payload": {}, "taskId": "t-4" }),
        )
        .await;
        let mut body = response.into_body().into_data_stream();
        let frame = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.contains("event: gantry.task.update"));
        assert!(text.contains("\"subject\":\"task/t-4\""));
    }
}
