//! IPC protocol types for server <-> model worker communication.
//!
//! Uses JSON Lines (one JSON object per line) over stdin/stdout pipes.
//! Binary blobs travel base64-encoded.

use arch_types::StructuredLatent;
use serde::{Deserialize, Serialize};

/// Request sent from server to worker via stdin.
#[derive(Serialize, Deserialize, Debug)]
pub struct WorkerRequest {
    /// Monotonic request ID for correlating responses.
    pub id: u64,
    pub command: WorkerCommand,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum WorkerCommand {
    /// Load weights for `model` onto the device.
    Load { model: String },
    Unload,
    /// Text-to-image sampling.
    Generate {
        prompt: String,
        seed: u64,
        steps: u32,
        width: u32,
        height: u32,
        guidance_scale: f32,
    },
    RemoveBackground { image: String },
    /// Image-to-3D reconstruction.
    Reconstruct { image: String },
    /// Mesh decoding; `gaussians` is the packed little-endian f32 buffer.
    Decode {
        latent: StructuredLatent,
        gaussians: String,
        simplify: f32,
        texture_size: u32,
    },
    /// Graceful shutdown.
    Shutdown,
}

/// Response sent from worker to server via stdout.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerResponse {
    /// Matches the request ID. 0 for unsolicited messages.
    pub id: u64,
    pub payload: WorkerPayload,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum WorkerPayload {
    Loaded {
        #[serde(default)]
        total_steps: Option<u32>,
    },
    Unloaded,
    /// One completed inference step.
    Step { step: u32 },
    Image { data: String, mime: String },
    Reconstruction {
        gaussians: String,
        latent: StructuredLatent,
    },
    Asset { glb: String },
    Error { message: String },
}
