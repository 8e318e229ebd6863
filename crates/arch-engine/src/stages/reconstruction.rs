//! Image-to-3D reconstruction stage. Returns the splats as PLY and leaves
//! both co-produced artifacts in the session's cache slot.

use arch_types::{ArchError, Payload};

use super::{run_on_slot, StageContext, StageTracker};
use crate::cache::SessionKey;
use crate::ply;
use crate::registry::ReconstructionSlot;
use crate::relay::ProgressRelay;

pub const STAGE: &str = "reconstruction";
pub const PLY_CONTENT_TYPE: &str = "application/octet-stream";

pub async fn run(
    ctx: &StageContext,
    model: &ReconstructionSlot,
    image: Vec<u8>,
    session: &SessionKey,
    relay: &ProgressRelay,
    tracker: &mut StageTracker,
) -> Result<Payload, ArchError> {
    super::background::validate(&image)?;
    let reconstruction = run_on_slot(ctx, model, relay, tracker, move |m, on_step| {
        m.reconstruct(&image, on_step)
    })
    .await?;

    let encoded = ply::encode(&reconstruction.gaussians);
    ctx.cache
        .store(session, reconstruction.gaussians, reconstruction.latent);
    Ok(Payload::new(encoded, PLY_CONTENT_TYPE))
}
