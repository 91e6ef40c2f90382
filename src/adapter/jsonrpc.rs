//! Minimal JSON-RPC 2.0 client for agents that speak it over stdio.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use super::process::ShellContext;
use crate::{AppError, Result};

/// Error code for an unknown server-to-client method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    /// Numeric code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

/// One inbound line, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Answer to one of our requests.
    Response {
        /// Id we assigned.
        id: u64,
        /// `result` or `error`.
        outcome: std::result::Result<Value, RpcError>,
    },
    /// Request from the agent that must be answered.
    Request {
        /// Agent-assigned id, echoed verbatim.
        id: Value,
        /// Method name.
        method: String,
        /// Parameters.
        params: Value,
    },
    /// Fire-and-forget message from the agent.
    Notification {
        /// Method name.
        method: String,
        /// Parameters.
        params: Value,
    },
}

/// Classify a raw line. `None` for anything that is not a well-formed
/// JSON-RPC message we can route.
#[must_use]
pub fn classify(line: &str) -> Option<Incoming> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let obj = value.as_object()?;
    let id = obj.get("id").filter(|id| !id.is_null());

    if let Some(method) = obj.get("method").and_then(Value::as_str) {
        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        return Some(match id {
            Some(id) => Incoming::Request {
                id: id.clone(),
                method: method.to_owned(),
                params,
            },
            None => Incoming::Notification {
                method: method.to_owned(),
                params,
            },
        });
    }

    let id = id?.as_u64()?;
    if let Some(error) = obj.get("error") {
        return Some(Incoming::Response {
            id,
            outcome: Err(RpcError {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_owned(),
            }),
        });
    }
    obj.get("result").map(|result| Incoming::Response {
        id,
        outcome: Ok(result.clone()),
    })
}

/// Request/response correlation over one process's stdin.
pub struct RpcClient {
    ctx: ShellContext,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<std::result::Result<Value, RpcError>>>>,
}

impl RpcClient {
    /// Create a client writing through `ctx`.
    #[must_use]
    pub fn new(ctx: ShellContext) -> Self {
        Self {
            ctx,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Shell context of the process this client talks to.
    #[must_use]
    pub fn context(&self) -> &ShellContext {
        &self.ctx
    }

    /// Send a request and wait for its response, bounded by `timeout` when
    /// given.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` for an error response or timeout, and
    /// `AppError::Adapter` if the process is gone.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let message = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        if let Err(err) = self.ctx.send(message) {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }
        debug!(session_id = %self.ctx.session_id(), id, method, "rpc request sent");

        let wait = async {
            tokio::select! {
                biased;
                outcome = rx => outcome.ok(),
                () = self.ctx.exited() => None,
            }
        };
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    return Err(AppError::Protocol(format!(
                        "{method} timed out after {limit:?}"
                    )));
                }
            },
            None => wait.await,
        };

        match outcome {
            Some(Ok(result)) => Ok(result),
            Some(Err(err)) => Err(AppError::Protocol(format!(
                "{method} failed ({}): {}",
                err.code, err.message
            ))),
            None => Err(AppError::Adapter(format!(
                "{method} abandoned: agent process exited"
            ))),
        }
    }

    /// Send a notification.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Adapter` if the process is gone.
    pub fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.ctx
            .send(json!({"jsonrpc": "2.0", "method": method, "params": params}))
    }

    /// Answer a server request.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Adapter` if the process is gone.
    pub fn respond(&self, id: Value, result: Value) -> Result<()> {
        self.ctx
            .send(json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }

    /// Reject a server request.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Adapter` if the process is gone.
    pub fn respond_error(&self, id: Value, code: i64, message: &str) -> Result<()> {
        self.ctx.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        }))
    }

    /// Complete the request `id`. Returns `false` if nothing was waiting.
    pub async fn resolve(&self, id: u64, outcome: std::result::Result<Value, RpcError>) -> bool {
        match self.pending.lock().await.remove(&id) {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Number of requests awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
