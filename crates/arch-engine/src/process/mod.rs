//! Out-of-process model backend.
//!
//! Each model runs in its own child process; unloading kills the process so
//! the OS reclaims all of its device memory.

pub mod ipc_types;
mod process_model;

pub use process_model::ProcessModel;
