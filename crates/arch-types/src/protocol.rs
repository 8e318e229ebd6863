//! Channel wire protocol: textual JSON for control, binary frames for payloads.

use serde::{Deserialize, Serialize};

/// Client -> server request on `/ws/generate-image`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateImageRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, alias = "model_choice")]
    pub image_model: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Name of a configured prompt style template.
    #[serde(default)]
    pub style: Option<String>,
}

/// Server -> client control message. Success payloads are sent as binary frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Progress { progress: u8 },
    Error { message: String },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"Serialization failed"}"#.to_string()
        })
    }
}
