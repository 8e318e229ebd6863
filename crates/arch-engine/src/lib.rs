//! Streaming pipeline orchestrator.
//!
//! Sequences GPU-resident generative models that cannot coexist in device
//! memory, runs their blocking inference on a bounded worker pool, relays
//! step progress to the owning channel in order, and bridges reconstruction
//! results to later mesh-decoding requests through a cross-request cache.

pub mod bridge;
pub mod cache;
pub mod capability;
pub mod glb;
pub mod mock;
pub mod orchestrator;
pub mod ply;
pub mod process;
pub mod registry;
pub mod relay;
pub mod slot;
pub mod stages;

pub use bridge::{ExecutionBridge, RequestTicket};
pub use cache::{ArtifactCache, CacheEntry, SessionKey};
pub use capability::*;
pub use orchestrator::{Orchestrator, OrchestratorStatus};
pub use registry::ModelRegistry;
pub use relay::{ProgressEvent, ProgressRelay, RelayEvent, RelayReceiver};
pub use slot::{ModelSlot, Resident, SlotLease, SlotManager, SlotStatus};
pub use stages::{StageState, StageTracker};
