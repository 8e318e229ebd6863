//! Asset-import listener: receives finished 3D assets over a local HTTP
//! upload and hands them to the host 3D tool.

pub mod importer;
pub mod instance_guard;
pub mod server;

pub use importer::{AssetImporter, CommandImporter, ImportError};
pub use instance_guard::port_in_use;
pub use server::{bind, handle_request};
