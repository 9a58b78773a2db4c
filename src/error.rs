use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Hard failures of the session itself. Engine-reported errors are a normal
/// per-request outcome and are carried in [`crate::ExecutionResult`] instead;
/// a completion timeout is likewise reported as a degraded result, not here.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No SAS executable was found via the explicit path, the `SAS_PATH`
    /// override, or the conventional install locations.
    #[error("SAS executable not found (set SAS_PATH or pass an explicit engine path)")]
    ExecutableNotFound,

    /// The OS refused to start the engine process.
    #[error("failed to spawn SAS engine at {}: {source}", .path.display())]
    ProcessSpawnFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The engine started but one of its three pipes could not be connected.
    #[error("failed to connect SAS engine pipes: {0}")]
    PipeSetupFailure(String),

    /// I/O failure talking to an already-running engine.
    #[error("i/o error communicating with the SAS engine: {0}")]
    Io(#[from] io::Error),
}
