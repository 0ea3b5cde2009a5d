// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! JSON-RPC error shapes and the four error kinds the pipeline classifies
//! rejections into (see spec §7).

use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;

/// A JSON-RPC 2.0 error response body, per spec §4.1 and §6.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip)]
    pub http_status: u16,
    #[serde(skip)]
    pub id: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>, http_status: u16) -> Self {
        Self {
            code,
            message: message.into(),
            http_status,
            id: None,
        }
    }

    pub fn with_id(mut self, id: Option<Value>) -> Self {
        self.id = id;
        self
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.http_status).unwrap_or(StatusCode::OK)
    }

    /// Renders the `{"jsonrpc":"2.0","error":{...},"id":...}` body from §4.1.
    pub fn to_body(&self) -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "error": {
                "code": self.code,
                "message": self.message,
            },
            "id": self.id.clone().unwrap_or(Value::Null),
        })
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(-32700, message, 200)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(-32600, message, 200)
    }

    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::new(-32601, message, 200)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(-32603, message, 403)
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(-32005, message, 429)
    }
}

/// The four error classifications from spec §7. Every rejection the
/// pipeline produces is one of these; `GatewayError` carries enough to log
/// and to render a `JsonRpcError`.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("input error: {0}")]
    Input(JsonRpcError),
    #[error("access error: {0}")]
    Access(JsonRpcError),
    #[error("quota error: {0}")]
    Quota(JsonRpcError),
    #[error("backend error talking to {backend}: {source}")]
    Backend {
        backend: String,
        #[source]
        source: anyhow::Error,
    },
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl GatewayError {
    /// Resolves a `BackendError` per its caller's fail-open/fail-closed
    /// policy (spec §4.8). Non-backend errors already carry a terminal
    /// `JsonRpcError` and pass straight through as the pipeline decision.
    pub fn into_outcome(self, fail_open: bool, fail_closed_msg: &str) -> StageOutcome {
        match self {
            GatewayError::Input(e) | GatewayError::Access(e) | GatewayError::Quota(e) => {
                StageOutcome::Reject(e)
            }
            GatewayError::Backend { backend, source } => {
                if fail_open {
                    tracing::warn!(%backend, error = %source, "backend call failed, failing open");
                    StageOutcome::Continue
                } else {
                    tracing::warn!(%backend, error = %source, "backend call failed, failing closed");
                    StageOutcome::Reject(JsonRpcError::quota_exceeded(fail_closed_msg))
                }
            }
        }
    }
}

/// What a stage decides after running (spec §2, §9 "Chain of stages").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Continue,
    Reject(JsonRpcError),
}
