//! The three operations every generative model exposes: `load`, `unload` and
//! a synchronous `run` that reports steps through a callback.
//!
//! Implementations are called from worker-pool threads, never from the event
//! loop, so they are free to block.

use arch_types::{
    GaussianCloud, MeshTarget, ModelError, Reconstruction, RenderedImage, SamplingRequest,
    StructuredLatent, TexturedAsset,
};

/// Raw per-step callback invoked synchronously inside `run`.
pub type StepCallback<'a> = &'a mut dyn FnMut(u32);

pub trait ModelLifecycle: Send {
    /// Load weights onto the device. Slow and fallible.
    fn load(&mut self) -> Result<(), ModelError>;

    /// Release device memory. Must not fail loudly.
    fn unload(&mut self);

    /// Number of steps `run` reports, used to scale progress.
    fn total_steps(&self) -> u32;
}

pub trait TextToImageModel: ModelLifecycle {
    fn generate(
        &mut self,
        request: &SamplingRequest,
        on_step: StepCallback<'_>,
    ) -> Result<RenderedImage, ModelError>;
}

pub trait BackgroundRemovalModel: ModelLifecycle {
    fn remove_background(
        &mut self,
        image: &[u8],
        on_step: StepCallback<'_>,
    ) -> Result<RenderedImage, ModelError>;
}

pub trait ReconstructionModel: ModelLifecycle {
    fn reconstruct(
        &mut self,
        image: &[u8],
        on_step: StepCallback<'_>,
    ) -> Result<Reconstruction, ModelError>;
}

pub trait MeshDecoderModel: ModelLifecycle {
    fn decode(
        &mut self,
        latent: &StructuredLatent,
        gaussians: &GaussianCloud,
        target: &MeshTarget,
        on_step: StepCallback<'_>,
    ) -> Result<TexturedAsset, ModelError>;
}
