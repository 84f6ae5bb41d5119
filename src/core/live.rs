//! Live-feed message decoding.
//!
//! Wire format: `{"data": "<JSON string>"}` where the inner string decodes to
//! `{"flow_id": "...", "project_name": "..."}`. Extra keys are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LiveError;
use crate::results::ResultKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEvent {
    pub flow_id: String,
    pub project_name: String,
}

impl LiveEvent {
    /// Composite key of the result this event announces.
    pub fn result_key(&self, user: &str) -> ResultKey {
        ResultKey::new(user, &self.project_name, &self.flow_id)
    }
}

pub fn decode_envelope(envelope: &Value) -> Result<LiveEvent, LiveError> {
    let data = envelope
        .get("data")
        .ok_or_else(|| LiveError::Decode("envelope has no 'data' field".to_string()))?;
    let inner = data
        .as_str()
        .ok_or_else(|| LiveError::Decode("envelope 'data' is not a string".to_string()))?;
    decode_payload(inner)
}

/// Decode a raw envelope line as received from the feed socket.
pub fn decode_envelope_str(raw: &str) -> Result<LiveEvent, LiveError> {
    let envelope: Value = serde_json::from_str(raw)
        .map_err(|e| LiveError::Decode(format!("envelope is not JSON: {e}")))?;
    decode_envelope(&envelope)
}

fn decode_payload(inner: &str) -> Result<LiveEvent, LiveError> {
    let payload: Value = serde_json::from_str(inner)
        .map_err(|e| LiveError::Decode(format!("payload is not JSON: {e}")))?;
    let field = |name: &str| -> Result<String, LiveError> {
        payload
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| LiveError::Decode(format!("payload has no string '{name}'")))
    };
    Ok(LiveEvent {
        flow_id: field("flow_id")?,
        project_name: field("project_name")?,
    })
}

/// Build the envelope the feed would send for `event`.
pub fn encode_envelope(event: &LiveEvent) -> Value {
    let inner = serde_json::json!({
        "flow_id": event.flow_id,
        "project_name": event.project_name,
    });
    serde_json::json!({ "data": inner.to_string() })
}
