//! Structured result records returned by every exposed operation.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::ServerError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ApiError {
                code: code.into(),
                message: message.into(),
                details: None,
            }),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }
}

impl<T> From<ServerError> for ApiResponse<T> {
    fn from(e: ServerError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ApiError {
                code: e.code().to_string(),
                message: e.to_string(),
                details: e.details(),
            }),
        }
    }
}

impl<T> From<Result<T, ServerError>> for ApiResponse<T> {
    fn from(result: Result<T, ServerError>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => e.into(),
        }
    }
}

fn status_for(code: &str) -> StatusCode {
    match code {
        "invalid_params" | "parse_error" => StatusCode::BAD_REQUEST,
        "not_found" | "workflow_not_found" | "method_not_found" => StatusCode::NOT_FOUND,
        "incomplete_checklist" | "invalid_transition" | "workflow_active" => StatusCode::CONFLICT,
        "unavailable" | "store_unavailable" | "completion_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = self.error_code().map_or(StatusCode::OK, status_for);
        (status, Json(self)).into_response()
    }
}

/// Run an operation so that neither an error nor a panic escapes the boundary.
pub async fn guarded<T, F>(operation: &'static str, fut: F) -> ApiResponse<T>
where
    F: Future<Output = Result<T, ServerError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result.into(),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            error!(operation, panic = %msg, "operation panicked");
            ApiResponse::failure("internal", format!("{operation} failed unexpectedly"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panic_becomes_internal_error() {
        let missing: Option<u32> = None;
        let resp = guarded("explode", async move { Ok(missing.expect("boom")) }).await;
        assert!(!resp.ok);
        assert_eq!(resp.error_code(), Some("internal"));
    }

    #[tokio::test]
    async fn error_keeps_code_and_message() {
        let resp: ApiResponse<u32> =
            guarded("init", async { Err(ServerError::Unavailable("context down".into())) }).await;
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], "unavailable");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn success_omits_error() {
        let json = serde_json::to_value(ApiResponse::success(7)).unwrap();
        assert_eq!(json, serde_json::json!({"ok": true, "data": 7}));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(status_for("unavailable"), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for("incomplete_checklist"), StatusCode::CONFLICT);
        assert_eq!(status_for("invalid_params"), StatusCode::BAD_REQUEST);
    }
}
