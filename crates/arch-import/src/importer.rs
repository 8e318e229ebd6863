use std::path::Path;
use std::process::Command;

use log::{debug, info};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("import command is empty")]
    EmptyCommand,

    #[error("import command exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("{0}")]
    Rejected(String),
}

/// The host tool's native import call.
pub trait AssetImporter: Send + Sync {
    /// Import the asset at `path`. Blocking.
    fn import(&self, path: &Path) -> Result<(), ImportError>;
}

/// Runs a host-tool command line with the asset path appended as the
/// final argument, e.g. `blender --python import_glb.py -- <path>`.
#[derive(Debug, Clone)]
pub struct CommandImporter {
    command: Vec<String>,
}

impl CommandImporter {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl AssetImporter for CommandImporter {
    fn import(&self, path: &Path) -> Result<(), ImportError> {
        let (program, args) = self.command.split_first().ok_or(ImportError::EmptyCommand)?;
        debug!("[IMPORT] Running {} on {}", self.command.join(" "), path.display());

        let output = Command::new(program).args(args).arg(path).output()?;
        if output.status.success() {
            info!("[IMPORT] Imported {}", path.display());
            return Ok(());
        }
        Err(ImportError::CommandFailed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
