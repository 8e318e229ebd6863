//! Mesh-decoding stage: resumes from the session's cached reconstruction.

use arch_types::{ArchError, MeshTarget, Payload};

use super::{run_on_slot, StageContext, StageTracker};
use crate::cache::SessionKey;
use crate::registry::MeshDecoderSlot;
use crate::relay::ProgressRelay;

pub const STAGE: &str = "mesh_decoding";

pub async fn run(
    ctx: &StageContext,
    model: &MeshDecoderSlot,
    session: &SessionKey,
    target: MeshTarget,
    relay: &ProgressRelay,
    tracker: &mut StageTracker,
) -> Result<Payload, ArchError> {
    // Checked before the slot is touched so an empty cache never swaps models.
    let entry = ctx.cache.read(session).ok_or(ArchError::CacheEmpty)?;
    let asset = run_on_slot(ctx, model, relay, tracker, move |m, on_step| {
        m.decode(&entry.latent, &entry.gaussians, &target, on_step)
    })
    .await?;
    Ok(asset.into())
}
