//! Controller for a long-lived, non-interruptible SAS engine, exposed as a
//! request/response execution service: child-process lifecycle over three
//! pipes, a marker-based completion protocol across two unsynchronized
//! output streams, log classification, and rich-output (HTML) table
//! normalization for naive renderers.

pub mod config;
pub mod error;
pub mod execution;
pub mod html_table;
mod locate;
mod multiplex;
mod process;
mod protocol;
pub mod sas_log;
pub mod session;

pub use config::SessionConfig;
pub use error::SessionError;
pub use execution::{ExecutionResult, InterruptOutcome, STATE_LOSS_WARNING};
pub use process::current_engine_pid;
pub use session::SasSession;
