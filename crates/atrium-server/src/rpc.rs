use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::response::ApiResponse;

/// Inbound frame on the socket or `POST /rpc`.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: Option<Value>,
    pub id: Option<Value>,
}

/// Outbound frame: the request id plus the operation's result record.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Option<Value>,
    #[serde(flatten)]
    pub body: ApiResponse<Value>,
}

impl RpcResponse {
    pub fn new<T: Serialize>(id: Option<Value>, response: ApiResponse<T>) -> Self {
        Self {
            id,
            body: erase(response),
        }
    }

    pub fn error(id: Option<Value>, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            body: ApiResponse::failure(code, message),
        }
    }

    pub fn parse_error() -> Self {
        Self::error(None, "parse_error", "request is not valid JSON-RPC")
    }

    pub fn method_not_found(id: Option<Value>, method: &str) -> Self {
        Self::error(id, "method_not_found", format!("unknown method: {method}"))
    }

    pub fn invalid_params(id: Option<Value>, message: impl Into<String>) -> Self {
        Self::error(id, "invalid_params", message)
    }
}

fn erase<T: Serialize>(response: ApiResponse<T>) -> ApiResponse<Value> {
    let ApiResponse { ok, data, error } = response;
    match data.map(serde_json::to_value).transpose() {
        Ok(data) => ApiResponse { ok, data, error },
        Err(e) => ApiResponse::failure("internal", format!("result not serializable: {e}")),
    }
}
