//! The uniform response envelope every business endpoint uses.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, SERVER_ERROR_MESSAGE};

use super::transport::RawResponse;

/// `{ success, data, error? }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T = serde_json::Value> {
    #[serde(default)]
    pub success: bool,
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Lenient view used when inspecting failures; the body may not be an envelope at all.
#[derive(Debug, Default, Deserialize)]
struct ErrorOnly {
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

/// Extract the envelope's `error` block, if the body has one.
pub fn error_body(body: &str) -> Option<ApiErrorBody> {
    serde_json::from_str::<ErrorOnly>(body)
        .ok()
        .and_then(|body| body.error)
}

/// Human-readable message for a failed response, falling back to a generic one.
pub fn error_message(body: &str) -> String {
    error_body(body)
        .and_then(|e| e.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| SERVER_ERROR_MESSAGE.to_string())
}

/// Decode a successful response and return its `data`.
///
/// A 2xx answer carrying `success: false` is reported as a server error.
pub fn unwrap_data<T: DeserializeOwned>(response: &RawResponse) -> Result<T, ClientError> {
    let envelope: ApiEnvelope<Option<serde_json::Value>> = serde_json::from_str(&response.body)?;

    if !envelope.success {
        let error = envelope.error.unwrap_or(ApiErrorBody {
            code: None,
            message: None,
        });
        return Err(ClientError::Server {
            status: response.status.as_u16(),
            code: error.code,
            message: error
                .message
                .unwrap_or_else(|| SERVER_ERROR_MESSAGE.to_string()),
        });
    }

    let data = envelope.data.unwrap_or(serde_json::Value::Null);
    Ok(serde_json::from_value(data)?)
}
