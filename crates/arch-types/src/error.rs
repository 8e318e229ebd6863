//! Error taxonomy shared by every stage.
//!
//! Stage-level failures are caught at the stage boundary and turned into a
//! terminal `{type: "error"}` message on the request's channel. The variants
//! below decide how much of the failure is shown to the client.

use thiserror::Error;

/// Failure reported by a model capability (`load` / `run`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ModelError(pub String);

impl ModelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<std::io::Error> for ModelError {
    fn from(err: std::io::Error) -> Self {
        Self(err.to_string())
    }
}

/// Errors surfaced by the orchestrator to one request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArchError {
    /// Missing/invalid prompt, missing image, unknown model choice or style.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to load model '{model}': {reason}")]
    ModelLoad { model: String, reason: String },

    #[error("Model '{model}' failed: {reason}")]
    ModelRun { model: String, reason: String },

    /// Mesh decoding requested before any reconstruction was cached.
    #[error("No reconstruction available; generate a 3D view first")]
    CacheEmpty,

    /// Fail-fast slot policy only.
    #[error("Model slot busy with '{occupant}', cannot load '{requested}'")]
    SlotBusy { requested: String, occupant: String },

    /// The owning channel went away; the result was discarded.
    #[error("Request abandoned by client")]
    Abandoned,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ArchError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Message written to the client channel.
    ///
    /// Load and run failures are reported generically; their details only go
    /// to the server log.
    pub fn client_message(&self) -> String {
        match self {
            ArchError::InvalidInput(message) => message.clone(),
            ArchError::ModelLoad { model, .. } => {
                format!("Failed to load model '{model}'. Please try again.")
            }
            ArchError::ModelRun { model, .. } => {
                format!("Generation with '{model}' failed. Please try again.")
            }
            ArchError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// True for errors caused by the request itself rather than the models.
    pub fn is_client_error(&self) -> bool {
        matches!(self, ArchError::InvalidInput(_) | ArchError::CacheEmpty)
    }
}
