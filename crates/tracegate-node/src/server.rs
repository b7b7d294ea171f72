use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    serve as axum_serve,
};
use eyre::{Result, WrapErr};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::{
    net::TcpListener,
    sync::{Mutex, oneshot},
    task::JoinHandle,
};
use tracegate_config::ServerConfig;
use tracing::{debug, error, info, warn};

use crate::{
    engine::TraceEngine,
    error::{INVALID_REQUEST, JsonRpcError, PARSE_ERROR, UPSTREAM_FAILED},
    rpc::{JsonRpcRequest, JsonRpcResponse},
    upstream::HttpUpstream,
};

/// Handle to the running JSON-RPC server
pub struct TraceServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    server_task: Mutex<Option<JoinHandle<()>>>,
}

impl TraceServerHandle {
    /// Address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections; in-flight requests are drained.
    pub async fn stop(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
            debug!("Sent shutdown signal to HTTP server");
        }
        Ok(())
    }

    /// Wait for the server task to finish
    pub async fn wait(&self) -> Result<()> {
        if let Some(task) = self.server_task.lock().await.take() {
            task.await.wrap_err("HTTP server task panicked")?;
        }
        Ok(())
    }
}

#[derive(Clone)]
struct ServerState {
    engine: Arc<TraceEngine>,
    upstream: Arc<HttpUpstream>,
    request_timeout: Duration,
}

/// Bind `config.host:config.port` and serve JSON-RPC until stopped.
///
/// Port `0` binds an ephemeral port; see [`TraceServerHandle::local_addr`].
pub async fn launch_server(
    config: &ServerConfig,
    engine: Arc<TraceEngine>,
    upstream: Arc<HttpUpstream>,
) -> Result<TraceServerHandle> {
    let (tx, rx) = oneshot::channel::<()>();
    let listen_addr = config.listen_addr();

    let state = ServerState {
        engine,
        upstream,
        request_timeout: config.request_timeout(),
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/", post(json_rpc))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .with_state(state);

    let listener = TcpListener::bind(&listen_addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {listen_addr}"))?;
    let local_addr = listener.local_addr()?;

    let server_task = tokio::spawn(async move {
        info!("JSON-RPC on http://{local_addr}");
        let shutdown = async move {
            let _ = rx.await;
            info!("Shutdown received; draining HTTP server");
        };
        if let Err(err) = axum_serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(%err, "HTTP server exited with error");
        }
    });

    Ok(TraceServerHandle {
        local_addr,
        shutdown_tx: Mutex::new(Some(tx)),
        server_task: Mutex::new(Some(server_task)),
    })
}

async fn health(State(state): State<ServerState>) -> Response {
    debug!("Health check");
    match state.engine.store().ping().await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(err) => {
            error!(error = %err, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "db_unavailable" })),
            )
                .into_response()
        }
    }
}

/// A reply is either built here or relayed from the upstream as is
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Reply {
    Local(JsonRpcResponse),
    Relayed(Value),
}

fn invalid_request(id: Option<Value>) -> Reply {
    Reply::Local(JsonRpcResponse::failure(
        id,
        JsonRpcError::new(INVALID_REQUEST, "Invalid Request"),
    ))
}

fn boundary_error(code: i64, message: &str) -> Response {
    let body = JsonRpcResponse::failure(None, JsonRpcError::new(code, message));
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

async fn json_rpc(State(state): State<ServerState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            debug!(%err, "Unparsable request body");
            return boundary_error(PARSE_ERROR, "Parse error");
        }
    };

    match payload {
        Value::Array(batch) if batch.is_empty() => {
            boundary_error(INVALID_REQUEST, "Invalid Request")
        }
        Value::Array(batch) => {
            let methods: Vec<&str> = batch
                .iter()
                .filter_map(|entry| entry.get("method").and_then(Value::as_str))
                .collect();
            info!(size = batch.len(), methods = %methods.join(","), "rpc batch");

            let mut replies = Vec::with_capacity(batch.len());
            for entry in batch {
                replies.push(dispatch(&state, entry).await.1);
            }
            Json(replies).into_response()
        }
        Value::Object(_) => {
            if let Some(method) = payload.get("method").and_then(Value::as_str) {
                let params = payload.get("params").cloned().unwrap_or_else(|| json!([]));
                info!(method, %params, "rpc");
            }
            let (status, reply) = dispatch(&state, payload).await;
            (status, Json(reply)).into_response()
        }
        _ => boundary_error(INVALID_REQUEST, "Invalid Request"),
    }
}

/// Answer one request object: trace methods locally, everything else upstream
async fn dispatch(state: &ServerState, entry: Value) -> (StatusCode, Reply) {
    let id = entry.get("id").cloned();
    if entry.get("method").and_then(Value::as_str).is_none() {
        return (StatusCode::BAD_REQUEST, invalid_request(id));
    }
    let request: JsonRpcRequest = match serde_json::from_value(entry.clone()) {
        Ok(request) => request,
        Err(err) => {
            debug!(%err, "Malformed request object");
            return (StatusCode::BAD_REQUEST, invalid_request(id));
        }
    };

    if let Some(response) = state.engine.handle(&request).await {
        return (StatusCode::OK, Reply::Local(response));
    }

    match state.upstream.forward(&entry, state.request_timeout).await {
        Ok(reply) => (StatusCode::OK, Reply::Relayed(reply)),
        Err(err) => {
            warn!(method = %request.method, code = err.code, "Proxy request failed");
            let status = if err.code == UPSTREAM_FAILED {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::OK
            };
            (status, Reply::Local(JsonRpcResponse::failure(id, err)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_serializes_transparently() {
        let relayed = serde_json::to_value(Reply::Relayed(json!({ "jsonrpc": "2.0", "id": 3, "result": "0x1" })))
            .unwrap();
        assert_eq!(relayed["result"], "0x1");

        let local = serde_json::to_value(invalid_request(Some(json!("a")))).unwrap();
        assert_eq!(
            local,
            json!({ "jsonrpc": "2.0", "id": "a", "error": { "code": -32600, "message": "Invalid Request" } })
        );
    }
}
