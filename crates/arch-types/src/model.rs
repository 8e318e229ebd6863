use serde::{Deserialize, Serialize};
use std::fmt;

/// The four generative model families the pipeline sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    TextToImage,
    BackgroundRemoval,
    Reconstruction,
    MeshDecoding,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::TextToImage => "text_to_image",
            ModelKind::BackgroundRemoval => "background_removal",
            ModelKind::Reconstruction => "reconstruction",
            ModelKind::MeshDecoding => "mesh_decoding",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Load state of one model slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
}

/// Whether a model competes for the single device slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Residency {
    /// Heavy model: must own the device slot while loaded.
    #[default]
    Exclusive,
    /// Lightweight model kept loaded for the process lifetime, outside the slot.
    AlwaysResident,
}
