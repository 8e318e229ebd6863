//! Model Slot Manager: exclusive load/unload of one heavy model at a time.
//!
//! Every exclusive model lives in a [`ModelSlot`]. The [`SlotManager`] owns a
//! single device "gate": a stage must hold a [`SlotLease`] for the whole time
//! it runs inference. Acquiring a slot for a different model unloads the
//! current occupant first, so at most one exclusive model is ever `loading`
//! or `ready`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use arch_config::{AfterRun, SlotPolicy};
use arch_types::{ArchError, LoadState, ModelKind, Residency};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::bridge::RequestTicket;
use crate::capability::ModelLifecycle;

/// Recover the guard from a poisoned mutex instead of propagating the panic.
pub(crate) fn lock_recover<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Mutex was poisoned, recovering...");
        poisoned.into_inner()
    })
}

/// One loadable model and its load state.
pub struct ModelSlot<M: ?Sized> {
    name: String,
    kind: ModelKind,
    residency: Residency,
    state: Mutex<LoadState>,
    model: Mutex<Box<M>>,
}

impl<M: ModelLifecycle + ?Sized> ModelSlot<M> {
    pub fn new(name: impl Into<String>, kind: ModelKind, residency: Residency, model: Box<M>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind,
            residency,
            state: Mutex::new(LoadState::Unloaded),
            model: Mutex::new(model),
        })
    }

    /// Run `f` with exclusive access to the model. Blocks; call from a worker thread.
    pub fn with_model<T>(&self, f: impl FnOnce(&mut M) -> T) -> T {
        let mut guard = lock_recover(&self.model);
        f(&mut **guard)
    }

    fn set_state(&self, state: LoadState) {
        *lock_recover(&self.state) = state;
    }
}

/// Type-erased view of a slot used for swapping models in and out.
pub trait Resident: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ModelKind;
    fn residency(&self) -> Residency;
    fn state(&self) -> LoadState;

    /// Load the model if it is not ready. Leaves the slot `unloaded` on failure.
    fn load_blocking(&self) -> Result<(), ArchError>;

    /// Unload the model and mark the slot `unloaded`.
    fn unload_blocking(&self);

    fn status(&self) -> SlotStatus {
        SlotStatus {
            name: self.name().to_string(),
            kind: self.kind(),
            residency: self.residency(),
            state: self.state(),
        }
    }
}

impl<M: ModelLifecycle + ?Sized + 'static> Resident for ModelSlot<M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ModelKind {
        self.kind
    }

    fn residency(&self) -> Residency {
        self.residency
    }

    fn state(&self) -> LoadState {
        *lock_recover(&self.state)
    }

    fn load_blocking(&self) -> Result<(), ArchError> {
        // Checked under the model lock so concurrent callers load once.
        let mut guard = lock_recover(&self.model);
        if self.state() == LoadState::Ready {
            debug!("[SLOT] '{}' already loaded", self.name);
            return Ok(());
        }
        self.set_state(LoadState::Loading);

        let model: &mut M = &mut **guard;
        let outcome = catch_unwind(AssertUnwindSafe(|| model.load()));
        let reason = match outcome {
            Ok(Ok(())) => {
                self.set_state(LoadState::Ready);
                return Ok(());
            }
            Ok(Err(e)) => e.0,
            Err(_) => "model panicked while loading".to_string(),
        };

        // Whatever was partially allocated goes back to the device.
        let _ = catch_unwind(AssertUnwindSafe(|| model.unload()));
        self.set_state(LoadState::Unloaded);
        Err(ArchError::ModelLoad {
            model: self.name.clone(),
            reason,
        })
    }

    fn unload_blocking(&self) {
        if self.state() == LoadState::Unloaded {
            return;
        }
        if catch_unwind(AssertUnwindSafe(|| self.with_model(|model| model.unload()))).is_err() {
            error!("[SLOT] '{}' panicked while unloading", self.name);
        }
        self.set_state(LoadState::Unloaded);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub name: String,
    pub kind: ModelKind,
    pub residency: Residency,
    pub state: LoadState,
}

/// Proof that the holder owns the device slot. Dropping it releases the slot
/// while leaving the model loaded.
pub struct SlotLease {
    slot: Arc<dyn Resident>,
    _permit: OwnedSemaphorePermit,
}

impl SlotLease {
    pub fn name(&self) -> &str {
        self.slot.name()
    }
}

impl std::fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotLease").field("slot", &self.slot.name()).finish()
    }
}

pub struct SlotManager {
    policy: SlotPolicy,
    gate: Arc<Semaphore>,
    occupant: Mutex<Option<Arc<dyn Resident>>>,
}

impl SlotManager {
    pub fn new(policy: SlotPolicy) -> Self {
        Self {
            policy,
            gate: Arc::new(Semaphore::new(1)),
            occupant: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> SlotPolicy {
        self.policy
    }

    /// Name of the model currently loaded (or loading) in the slot.
    pub fn occupant_name(&self) -> Option<String> {
        lock_recover(&self.occupant)
            .as_ref()
            .map(|slot| slot.name().to_string())
    }

    /// True while some stage holds a lease.
    pub fn is_held(&self) -> bool {
        self.gate.available_permits() == 0
    }

    fn occupant(&self) -> Option<Arc<dyn Resident>> {
        lock_recover(&self.occupant).clone()
    }

    fn set_occupant(&self, slot: Option<Arc<dyn Resident>>) {
        *lock_recover(&self.occupant) = slot;
    }

    /// Take the device slot for `slot`, loading it (and unloading any other
    /// occupant) if needed. Idempotent when `slot` is already ready.
    pub async fn acquire(&self, slot: Arc<dyn Resident>) -> Result<SlotLease, ArchError> {
        self.acquire_for(slot, &RequestTicket::new()).await
    }

    /// Like [`acquire`](Self::acquire), but gives up with `Abandoned` if the
    /// request behind `ticket` went away while it waited. The current occupant
    /// is left untouched in that case.
    pub async fn acquire_for(
        &self,
        slot: Arc<dyn Resident>,
        ticket: &RequestTicket,
    ) -> Result<SlotLease, ArchError> {
        if ticket.is_abandoned() {
            return Err(ArchError::Abandoned);
        }
        let permit = match self.policy {
            SlotPolicy::Serialize => {
                if self.is_held() {
                    debug!(
                        "[SLOT] '{}' waiting for slot held by {:?}",
                        slot.name(),
                        self.occupant_name()
                    );
                }
                self.gate
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| ArchError::Internal("model slot gate closed".to_string()))?
            }
            SlotPolicy::FailFast => self.gate.clone().try_acquire_owned().map_err(|_| {
                ArchError::SlotBusy {
                    requested: slot.name().to_string(),
                    occupant: self
                        .occupant_name()
                        .unwrap_or_else(|| "another request".to_string()),
                }
            })?,
        };

        if ticket.is_abandoned() {
            debug!(
                "[SLOT] Request {} abandoned while waiting for '{}'",
                ticket.id(),
                slot.name()
            );
            return Err(ArchError::Abandoned);
        }

        if let Some(current) = self.occupant() {
            if current.name() == slot.name() && current.state() == LoadState::Ready {
                debug!("[SLOT] '{}' already loaded", slot.name());
                return Ok(SlotLease {
                    slot,
                    _permit: permit,
                });
            }
            info!(
                "[SLOT] Unloading '{}' to make room for '{}'",
                current.name(),
                slot.name()
            );
            unload_off_loop(current).await;
            self.set_occupant(None);
        }

        info!("[SLOT] Loading '{}' ({})", slot.name(), slot.kind());
        self.set_occupant(Some(slot.clone()));
        let started = Instant::now();
        let loading = slot.clone();
        let loaded = tokio::task::spawn_blocking(move || loading.load_blocking())
            .await
            .unwrap_or_else(|e| {
                Err(ArchError::ModelLoad {
                    model: slot.name().to_string(),
                    reason: format!("load task failed: {e}"),
                })
            });

        match loaded {
            Ok(()) => {
                info!(
                    "[SLOT] '{}' ready in {:.2}s",
                    slot.name(),
                    started.elapsed().as_secs_f64()
                );
                Ok(SlotLease {
                    slot,
                    _permit: permit,
                })
            }
            Err(e) => {
                error!("[SLOT] {e}");
                self.set_occupant(None);
                Err(e)
            }
        }
    }

    /// Give the slot back after a successful run.
    pub async fn release(&self, lease: SlotLease, after_run: AfterRun) {
        match after_run {
            AfterRun::KeepLoaded => debug!("[SLOT] Released '{}'", lease.name()),
            AfterRun::Unload => self.evict(lease).await,
        }
    }

    /// Unload the leased model and return the slot to `unloaded`.
    pub async fn evict(&self, lease: SlotLease) {
        info!("[SLOT] Unloading '{}'", lease.name());
        unload_off_loop(lease.slot.clone()).await;
        self.set_occupant(None);
        drop(lease);
    }

    /// Unload whatever occupies the slot, waiting for any holder to finish.
    pub async fn unload_all(&self) {
        let Ok(_permit) = self.gate.acquire().await else {
            return;
        };
        if let Some(current) = self.occupant() {
            info!("[SLOT] Unloading '{}'", current.name());
            unload_off_loop(current).await;
            self.set_occupant(None);
        }
    }
}

pub(crate) async fn unload_off_loop(slot: Arc<dyn Resident>) {
    let name = slot.name().to_string();
    if let Err(e) = tokio::task::spawn_blocking(move || slot.unload_blocking()).await {
        error!("[SLOT] Unload task for '{name}' failed: {e}");
    }
}
