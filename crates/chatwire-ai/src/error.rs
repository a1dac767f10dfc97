use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceErrorCode {
    ConfigInvalid,
    ProviderHttp,
    ProviderTransport,
    ProviderProtocol,
}

/// Failure surfaced by the completion transport.
///
/// `status` is set whenever the endpoint answered with a non-success HTTP
/// status; `message` is the best human-readable text recovered from the
/// response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceError {
    pub code: InferenceErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl InferenceError {
    pub fn new(code: InferenceErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            status: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            code: InferenceErrorCode::ProviderHttp,
            status: Some(status),
            message: message.into(),
            details: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(InferenceErrorCode::ProviderTransport, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(InferenceErrorCode::ProviderProtocol, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn as_compact_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"code\":\"provider_protocol\",\"message\":\"{}\"}}",
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

impl Display for InferenceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{:?} (HTTP {status}): {}", self.code, self.message),
            None => write!(f, "{:?}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for InferenceError {}
