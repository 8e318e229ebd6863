//! The four pipeline stages. Each is a thin adapter over one model slot and
//! walks `idle -> acquiring-model -> running -> releasing-model -> done`,
//! or `failed` from any state.

pub mod background;
pub mod mesh;
pub mod reconstruction;
pub mod text_to_image;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use arch_config::AfterRun;
use arch_types::{ArchError, LoadState, ModelError, Residency};
use log::{debug, error, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::bridge::ExecutionBridge;
use crate::cache::ArtifactCache;
use crate::capability::{ModelLifecycle, StepCallback};
use crate::relay::ProgressRelay;
use crate::slot::{unload_off_loop, ModelSlot, Resident, SlotManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Idle,
    AcquiringModel,
    Running,
    ReleasingModel,
    Done,
    Failed,
}

/// Per-request stage state, logged on every transition.
#[derive(Debug)]
pub struct StageTracker {
    stage: &'static str,
    request_id: Uuid,
    state: StageState,
}

impl StageTracker {
    pub fn new(stage: &'static str, request_id: Uuid) -> Self {
        Self {
            stage,
            request_id,
            state: StageState::Idle,
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn advance(&mut self, next: StageState) {
        if matches!(self.state, StageState::Done | StageState::Failed) {
            warn!(
                "[STAGE] {} {}: ignoring {:?} after {:?}",
                self.stage, self.request_id, next, self.state
            );
            return;
        }
        debug!(
            "[STAGE] {} {}: {:?} -> {:?}",
            self.stage, self.request_id, self.state, next
        );
        self.state = next;
    }

    /// Record the terminal state for `outcome` and pass it through.
    pub fn finish<T>(&mut self, outcome: Result<T, ArchError>) -> Result<T, ArchError> {
        match &outcome {
            Ok(_) => self.advance(StageState::Done),
            Err(ArchError::Abandoned) => {
                debug!("[STAGE] {} {}: abandoned", self.stage, self.request_id);
                self.advance(StageState::Failed);
            }
            Err(e) if e.is_client_error() => {
                debug!("[STAGE] {} {}: {e}", self.stage, self.request_id);
                self.advance(StageState::Failed);
            }
            Err(e) => {
                error!("[STAGE] {} {} failed: {e}", self.stage, self.request_id);
                self.advance(StageState::Failed);
            }
        }
        outcome
    }
}

/// Shared resources every stage runs against.
#[derive(Clone)]
pub struct StageContext {
    pub slots: Arc<SlotManager>,
    pub bridge: Arc<ExecutionBridge>,
    pub cache: Arc<ArtifactCache>,
    pub after_run: AfterRun,
}

/// Load an always-resident model outside the device slot if needed.
pub(crate) async fn ensure_resident(slot: Arc<dyn Resident>) -> Result<(), ArchError> {
    if slot.state() == LoadState::Ready {
        return Ok(());
    }
    let name = slot.name().to_string();
    tokio::task::spawn_blocking(move || slot.load_blocking())
        .await
        .unwrap_or_else(|e| {
            Err(ArchError::ModelLoad {
                model: name,
                reason: format!("load task failed: {e}"),
            })
        })
}

/// Acquire `slot`, run `job` on the execution bridge with a progress
/// reporter scaled to the model's step count, then release or evict.
pub(crate) async fn run_on_slot<M, T, F>(
    ctx: &StageContext,
    slot: &Arc<ModelSlot<M>>,
    relay: &ProgressRelay,
    tracker: &mut StageTracker,
    job: F,
) -> Result<T, ArchError>
where
    M: ModelLifecycle + ?Sized + 'static,
    T: Send + 'static,
    F: FnOnce(&mut M, StepCallback<'_>) -> Result<T, ModelError> + Send + 'static,
{
    tracker.advance(StageState::AcquiringModel);
    if relay.ticket().is_abandoned() {
        return Err(ArchError::Abandoned);
    }
    let resident: Arc<dyn Resident> = slot.clone();
    let lease = match slot.residency() {
        Residency::Exclusive => Some(
            ctx.slots
                .acquire_for(resident.clone(), relay.ticket())
                .await?,
        ),
        Residency::AlwaysResident => {
            ensure_resident(resident.clone()).await?;
            None
        }
    };

    tracker.advance(StageState::Running);
    let model_name = slot.name().to_string();
    let worker_slot = slot.clone();
    let worker_relay = relay.clone();
    let outcome = ctx
        .bridge
        .submit(relay.ticket(), move || {
            let result = worker_slot.with_model(|model| {
                let mut on_step = worker_relay.step_reporter(model.total_steps());
                catch_unwind(AssertUnwindSafe(|| job(model, &mut on_step))).unwrap_or_else(|_| {
                    Err(ModelError::new("model panicked during inference"))
                })
            });
            result.map_err(|e| ArchError::ModelRun {
                model: model_name,
                reason: e.0,
            })
        })
        .await;

    tracker.advance(StageState::ReleasingModel);
    let failed_run = matches!(outcome, Err(ArchError::ModelRun { .. }));
    match lease {
        Some(lease) if failed_run => ctx.slots.evict(lease).await,
        Some(lease) => ctx.slots.release(lease, ctx.after_run).await,
        None if failed_run => {
            warn!("[STAGE] Unloading '{}' after failed run", resident.name());
            unload_off_loop(resident).await;
        }
        None => {}
    }
    outcome
}
