//! API request and response types

use serde::Deserialize;
use serde_json::Value;

/// Shared response envelope; every route answers with this shape.
#[derive(Debug, serde::Serialize)]
pub struct Envelope {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl Envelope {
    pub fn ok(message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
            error_code: None,
        }
    }

    pub fn err(message: impl Into<String>, error_code: &str, data: Option<Value>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data,
            error_code: Some(error_code.to_string()),
        }
    }
}

/// Admission request. Unknown fields (the upstream producer sends a stray
/// `level`, among others) are accepted and ignored.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub account_id: String,
    pub shop_id: String,
    pub shop_name: String,
    pub task_type: String,
    pub external_task_id: String,
    #[serde(default)]
    pub send_content: String,
    pub platform: String,
    pub max_inactive_minutes: Option<i64>,
}

/// Session completion request.
#[derive(Debug, Deserialize)]
pub struct CompleteSessionRequest {
    pub success: bool,
    pub error_message: Option<String>,
}

/// Explicit transfer request.
#[derive(Debug, Deserialize)]
pub struct TransferSessionRequest {
    pub reason: String,
    #[serde(default = "default_urgency")]
    pub urgency: String,
}

fn default_urgency() -> String {
    "normal".to_string()
}

/// Worker send report.
#[derive(Debug, Deserialize)]
pub struct ReportTaskRequest {
    pub success: bool,
    pub error_message: Option<String>,
}

/// Inbound message batch.
#[derive(Debug, Deserialize)]
pub struct MessageBatchRequest {
    pub shop_name: String,
    pub platform: String,
    pub max_inactive_minutes: Option<i64>,
    /// Batch-level account override for batches with no `t-` nick.
    pub account_id: Option<String>,
    pub messages: Vec<crate::ingest::InboundMessage>,
}
