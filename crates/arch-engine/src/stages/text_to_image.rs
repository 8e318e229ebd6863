//! Text-to-image stage: fixed-step seeded sampling from a prompt.

use arch_config::ArchConfig;
use arch_types::{ArchError, GenerateImageRequest, RenderedImage, SamplingRequest};
use minijinja::{context, Environment};

use super::{run_on_slot, StageContext, StageTracker};
use crate::registry::{ModelRegistry, TextToImageSlot};
use crate::relay::ProgressRelay;

pub const STAGE: &str = "text_to_image";

/// A validated request, ready to run.
pub struct ImagePlan {
    pub model: TextToImageSlot,
    pub sampling: SamplingRequest,
}

/// Validate a client request without touching any model.
pub fn plan(
    request: &GenerateImageRequest,
    config: &ArchConfig,
    registry: &ModelRegistry,
) -> Result<ImagePlan, ArchError> {
    let prompt = request
        .prompt
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ArchError::invalid_input("No prompt provided."))?;

    let model_name = request
        .image_model
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(&config.default_image_model);
    let model = registry.text_to_image(model_name).ok_or_else(|| {
        ArchError::invalid_input(format!(
            "Unknown image model '{model_name}'. Available: {}",
            registry.text_to_image_names().join(", ")
        ))
    })?;

    let prompt = match request.style.as_deref() {
        None => prompt.to_string(),
        Some(style) => apply_style(config, style, prompt)?,
    };

    Ok(ImagePlan {
        model,
        sampling: SamplingRequest {
            prompt,
            seed: request.seed.unwrap_or(config.default_seed),
            steps: config.sampling_steps,
            width: config.image_size,
            height: config.image_size,
            guidance_scale: config.guidance_scale,
        },
    })
}

fn apply_style(config: &ArchConfig, style: &str, prompt: &str) -> Result<String, ArchError> {
    let template = config
        .style_templates
        .get(style)
        .ok_or_else(|| ArchError::invalid_input(format!("Unknown style '{style}'")))?;
    Environment::new()
        .render_str(template, context! { prompt => prompt })
        .map_err(|e| ArchError::Internal(format!("style '{style}' failed to render: {e}")))
}

pub async fn run(
    ctx: &StageContext,
    plan: ImagePlan,
    relay: &ProgressRelay,
    tracker: &mut StageTracker,
) -> Result<RenderedImage, ArchError> {
    let ImagePlan { model, sampling } = plan;
    run_on_slot(ctx, &model, relay, tracker, move |m, on_step| {
        m.generate(&sampling, on_step)
    })
    .await
}
