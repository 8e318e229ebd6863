//! Model slots built from configuration, grouped by capability.

use std::sync::Arc;
use std::time::Duration;

use arch_config::{ArchConfig, ModelBackend, ModelSpec};
use arch_types::{ModelKind, Residency};
use log::info;

use crate::capability::{
    BackgroundRemovalModel, MeshDecoderModel, ReconstructionModel, TextToImageModel,
};
use crate::mock::{MockBackgroundRemoval, MockMeshDecoder, MockReconstruction, MockTextToImage};
use crate::process::ProcessModel;
use crate::slot::{ModelSlot, Resident};

pub type TextToImageSlot = Arc<ModelSlot<dyn TextToImageModel>>;
pub type BackgroundSlot = Arc<ModelSlot<dyn BackgroundRemovalModel>>;
pub type ReconstructionSlot = Arc<ModelSlot<dyn ReconstructionModel>>;
pub type MeshDecoderSlot = Arc<ModelSlot<dyn MeshDecoderModel>>;

/// Every model the process knows about. Slots are created `unloaded` and
/// cycled, never destroyed.
#[derive(Default)]
pub struct ModelRegistry {
    text_to_image: Vec<TextToImageSlot>,
    background: Vec<BackgroundSlot>,
    reconstruction: Vec<ReconstructionSlot>,
    mesh: Vec<MeshDecoderSlot>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ArchConfig) -> Self {
        let mut registry = Self::new();
        for spec in &config.models {
            registry.register_spec(spec, config.sampling_steps);
        }
        info!(
            "[REGISTRY] {} model(s) registered: {}",
            config.models.len(),
            config
                .models
                .iter()
                .map(|m| m.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        registry
    }

    fn register_spec(&mut self, spec: &ModelSpec, sampling_steps: u32) {
        let name = spec.name.as_str();
        let residency = spec.residency;
        match &spec.backend {
            ModelBackend::Mock { step_delay_ms } => {
                let delay = Duration::from_millis(*step_delay_ms);
                match spec.kind {
                    ModelKind::TextToImage => self.add_text_to_image(
                        name,
                        residency,
                        Box::new(MockTextToImage::new(name, sampling_steps, delay)),
                    ),
                    ModelKind::BackgroundRemoval => self.add_background(
                        name,
                        residency,
                        Box::new(MockBackgroundRemoval::new(name, delay)),
                    ),
                    ModelKind::Reconstruction => self.add_reconstruction(
                        name,
                        residency,
                        Box::new(MockReconstruction::new(name, delay)),
                    ),
                    ModelKind::MeshDecoding => self.add_mesh_decoder(
                        name,
                        residency,
                        Box::new(MockMeshDecoder::new(name, delay)),
                    ),
                }
            }
            ModelBackend::Process { command } => {
                let steps = if spec.kind == ModelKind::TextToImage {
                    sampling_steps
                } else {
                    1
                };
                let model = ProcessModel::new(name, command.clone(), steps);
                match spec.kind {
                    ModelKind::TextToImage => self.add_text_to_image(name, residency, Box::new(model)),
                    ModelKind::BackgroundRemoval => self.add_background(name, residency, Box::new(model)),
                    ModelKind::Reconstruction => self.add_reconstruction(name, residency, Box::new(model)),
                    ModelKind::MeshDecoding => self.add_mesh_decoder(name, residency, Box::new(model)),
                }
            }
        }
    }

    pub fn add_text_to_image(&mut self, name: &str, residency: Residency, model: Box<dyn TextToImageModel>) {
        self.text_to_image
            .push(ModelSlot::new(name, ModelKind::TextToImage, residency, model));
    }

    pub fn add_background(&mut self, name: &str, residency: Residency, model: Box<dyn BackgroundRemovalModel>) {
        self.background
            .push(ModelSlot::new(name, ModelKind::BackgroundRemoval, residency, model));
    }

    pub fn add_reconstruction(&mut self, name: &str, residency: Residency, model: Box<dyn ReconstructionModel>) {
        self.reconstruction
            .push(ModelSlot::new(name, ModelKind::Reconstruction, residency, model));
    }

    pub fn add_mesh_decoder(&mut self, name: &str, residency: Residency, model: Box<dyn MeshDecoderModel>) {
        self.mesh
            .push(ModelSlot::new(name, ModelKind::MeshDecoding, residency, model));
    }

    pub fn text_to_image(&self, name: &str) -> Option<TextToImageSlot> {
        self.text_to_image.iter().find(|s| s.name() == name).cloned()
    }

    pub fn text_to_image_names(&self) -> Vec<String> {
        self.text_to_image.iter().map(|s| s.name().to_string()).collect()
    }

    /// The first registered model of each remaining kind serves its stage.
    pub fn background(&self) -> Option<BackgroundSlot> {
        self.background.first().cloned()
    }

    pub fn reconstruction(&self) -> Option<ReconstructionSlot> {
        self.reconstruction.first().cloned()
    }

    pub fn mesh_decoder(&self) -> Option<MeshDecoderSlot> {
        self.mesh.first().cloned()
    }

    /// All slots in registration order, grouped by kind.
    pub fn all(&self) -> Vec<Arc<dyn Resident>> {
        let mut all: Vec<Arc<dyn Resident>> = Vec::new();
        all.extend(self.text_to_image.iter().map(|s| s.clone() as Arc<dyn Resident>));
        all.extend(self.background.iter().map(|s| s.clone() as Arc<dyn Resident>));
        all.extend(self.reconstruction.iter().map(|s| s.clone() as Arc<dyn Resident>));
        all.extend(self.mesh.iter().map(|s| s.clone() as Arc<dyn Resident>));
        all
    }
}
