//! Orchestrator entry points: one per channel endpoint.
//!
//! Each entry point validates what it can synchronously, spawns the stage as
//! a detached task and hands back the receiving end of the request's relay.
//! Dropping the receiver never cancels the task, so a held slot lease is
//! always released by the stage itself.

use std::sync::Arc;

use arch_config::{ArchConfig, SlotPolicy};
use arch_types::{ArchError, GenerateImageRequest, Payload, Residency};
use log::{error, info, warn};
use serde::Serialize;

use crate::bridge::{ExecutionBridge, RequestTicket};
use crate::cache::{ArtifactCache, SessionKey};
use crate::registry::ModelRegistry;
use crate::relay::{ProgressRelay, RelayReceiver};
use crate::slot::{Resident, SlotManager, SlotStatus};
use crate::stages::{self, background, mesh, reconstruction, text_to_image, StageContext, StageTracker};

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub occupant: Option<String>,
    pub slot_policy: SlotPolicy,
    pub slots: Vec<SlotStatus>,
    pub cache_sessions: usize,
    pub workers: usize,
    pub in_flight: usize,
}

pub struct Orchestrator {
    config: Arc<ArchConfig>,
    registry: Arc<ModelRegistry>,
    ctx: StageContext,
}

impl Orchestrator {
    pub fn new(config: ArchConfig, registry: ModelRegistry) -> Result<Self, ArchError> {
        let bridge = ExecutionBridge::new(config.worker_threads)
            .map_err(|e| ArchError::Internal(format!("failed to start worker pool: {e}")))?;
        let ctx = StageContext {
            slots: Arc::new(SlotManager::new(config.slot_policy)),
            bridge: Arc::new(bridge),
            cache: Arc::new(ArtifactCache::new()),
            after_run: config.after_run,
        };
        info!(
            "[ORCH] Ready: policy={:?}, after_run={:?}, workers={}",
            config.slot_policy, config.after_run, config.worker_threads
        );
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            ctx,
        })
    }

    /// Convenience constructor using the models named in `config`.
    pub fn from_config(config: ArchConfig) -> Result<Self, ArchError> {
        let registry = ModelRegistry::from_config(&config);
        Self::new(config, registry)
    }

    pub fn config(&self) -> &ArchConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.ctx.cache
    }

    pub fn slots(&self) -> &SlotManager {
        &self.ctx.slots
    }

    /// Text-to-image followed by background removal.
    pub fn generate_image(&self, ticket: RequestTicket, request: GenerateImageRequest) -> RelayReceiver {
        let (relay, rx) = ProgressRelay::channel(ticket);
        let plan = match text_to_image::plan(&request, &self.config, &self.registry) {
            Ok(plan) => plan,
            Err(e) => {
                relay.finish(Err(e));
                return rx;
            }
        };
        let cutter = self.registry.background();
        let fill = self.config.background_fill_rgb();
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            let id = relay.ticket().id();
            let mut tracker = StageTracker::new(text_to_image::STAGE, id);
            let outcome = text_to_image::run(&ctx, plan, &relay, &mut tracker).await;
            let image = match tracker.finish(outcome) {
                Ok(image) => image,
                Err(e) => return relay.finish(Err(e)),
            };

            let outcome = match cutter {
                Some(cutter) => {
                    let mut tracker = StageTracker::new(background::STAGE, id);
                    let outcome =
                        background::run(&ctx, &cutter, image.bytes, fill, &relay, &mut tracker).await;
                    tracker.finish(outcome)
                }
                None => Ok(image),
            };
            relay.finish(outcome.map(Payload::from));
        });
        rx
    }

    pub fn remove_background(&self, ticket: RequestTicket, image: Vec<u8>) -> RelayReceiver {
        let (relay, rx) = ProgressRelay::channel(ticket);
        if let Err(e) = background::validate(&image) {
            relay.finish(Err(e));
            return rx;
        }
        let Some(cutter) = self.registry.background() else {
            relay.finish(Err(missing_model("background removal")));
            return rx;
        };
        let fill = self.config.background_fill_rgb();
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            let mut tracker = StageTracker::new(background::STAGE, relay.ticket().id());
            let outcome = background::run(&ctx, &cutter, image, fill, &relay, &mut tracker).await;
            relay.finish(tracker.finish(outcome).map(Payload::from));
        });
        rx
    }

    pub fn reconstruct(&self, ticket: RequestTicket, image: Vec<u8>, session: SessionKey) -> RelayReceiver {
        let (relay, rx) = ProgressRelay::channel(ticket);
        if let Err(e) = background::validate(&image) {
            relay.finish(Err(e));
            return rx;
        }
        let Some(model) = self.registry.reconstruction() else {
            relay.finish(Err(missing_model("reconstruction")));
            return rx;
        };
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            let mut tracker = StageTracker::new(reconstruction::STAGE, relay.ticket().id());
            let outcome =
                reconstruction::run(&ctx, &model, image, &session, &relay, &mut tracker).await;
            relay.finish(tracker.finish(outcome));
        });
        rx
    }

    pub fn decode_mesh(&self, ticket: RequestTicket, session: SessionKey) -> RelayReceiver {
        let (relay, rx) = ProgressRelay::channel(ticket);
        let Some(model) = self.registry.mesh_decoder() else {
            relay.finish(Err(missing_model("mesh decoding")));
            return rx;
        };
        let target = self.config.mesh_target;
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            let mut tracker = StageTracker::new(mesh::STAGE, relay.ticket().id());
            let outcome = mesh::run(&ctx, &model, &session, target, &relay, &mut tracker).await;
            relay.finish(tracker.finish(outcome));
        });
        rx
    }

    /// Load every always-resident model. Failures are logged and retried
    /// lazily on first use.
    pub async fn warm_up(&self) {
        for slot in self.registry.all() {
            if slot.residency() != Residency::AlwaysResident {
                continue;
            }
            let name = slot.name().to_string();
            match stages::ensure_resident(slot).await {
                Ok(()) => info!("[ORCH] '{name}' resident"),
                Err(e) => warn!("[ORCH] Warm-up of '{name}' failed: {e}"),
            }
        }
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            occupant: self.ctx.slots.occupant_name(),
            slot_policy: self.ctx.slots.policy(),
            slots: self.registry.all().iter().map(|s| s.status()).collect(),
            cache_sessions: self.ctx.cache.session_count(),
            workers: self.ctx.bridge.size(),
            in_flight: self.ctx.bridge.in_flight(),
        }
    }

    /// Unload everything, waiting for the current slot holder to finish.
    pub async fn shutdown(&self) {
        self.ctx.slots.unload_all().await;
        for slot in self.registry.all() {
            if slot.residency() == Residency::AlwaysResident {
                let name = slot.name().to_string();
                if let Err(e) = tokio::task::spawn_blocking(move || slot.unload_blocking()).await {
                    error!("[ORCH] Unload of '{name}' failed: {e}");
                }
            }
        }
        info!("[ORCH] All models unloaded");
    }
}

fn missing_model(stage: &str) -> ArchError {
    ArchError::Internal(format!("no {stage} model registered"))
}
