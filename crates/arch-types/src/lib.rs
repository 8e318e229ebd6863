//! Shared types for the arch pipeline: model identities, generated artifacts,
//! the channel wire protocol and the error taxonomy.

pub mod artifacts;
pub mod error;
pub mod model;
pub mod protocol;

pub use artifacts::*;
pub use error::*;
pub use model::*;
pub use protocol::*;
