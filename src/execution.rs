use serde::Serialize;

/// Warning text surfaced to the user whenever an interrupt forces an engine
/// restart. The engine has no cooperative cancel, so interrupting discards
/// all engine-side state.
pub const STATE_LOSS_WARNING: &str = "SAS session restarted: engine-side state \
(WORK datasets, macro variables) has been discarded";

/// Outcome of one `execute()` call. Owned by the caller; no aliasing with
/// session-internal buffers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    /// Diagnostic log captured from the engine's log stream, with the
    /// completion marker scrubbed.
    pub log: String,
    /// Listing / rich markup captured from the primary output stream. When
    /// the engine produced HTML, tables have been normalized (or passed
    /// through untouched if the markup was malformed).
    pub listing: String,
    /// True when the rich-output channel produced a document.
    pub has_rich_output: bool,
    /// True when the log contains an `ERROR` line.
    pub is_error: bool,
    /// Numeric code from the first `ERROR` line; 1 when the line carried
    /// none, 0 when there was no error.
    pub error_code: i32,
    /// Remainder of the first `ERROR` line.
    pub error_message: String,
    /// Graphic artifacts referenced by the log, in order of appearance.
    pub graph_files: Vec<String>,
    /// Every `WARNING` line, in order, duplicates kept. Warnings never block
    /// success status.
    pub warnings: Vec<String>,
    /// True when the stream wait gave up before the completion marker
    /// arrived. The log and listing then hold whatever had accumulated;
    /// this is a degraded result, distinct from both success and an
    /// engine-reported error.
    pub timed_out: bool,
}

/// What an `interrupt()` call actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptOutcome {
    /// The engine was killed and respawned. All engine-side state is gone;
    /// surface [`STATE_LOSS_WARNING`] to the user.
    RestartedStateLost,
    /// No engine process was running; there was nothing to interrupt.
    NotRunning,
}
