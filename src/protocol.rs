use std::sync::atomic::{AtomicU64, Ordering};

/// Prefix of the completion marker written into the log stream. The full
/// token is this prefix plus a monotonically increasing sequence number, so
/// markers are unique for the lifetime of the process and cannot collide
/// with a marker still pending from an earlier request.
pub(crate) const MARKER_PREFIX: &str = "SAS_CONSOLE_END_";

static EXECUTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque completion token, textually embeddable in a `%put` statement and
/// detectable in the captured log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExecutionMarker {
    text: String,
}

impl ExecutionMarker {
    pub(crate) fn as_str(&self) -> &str {
        &self.text
    }
}

pub(crate) fn next_marker() -> ExecutionMarker {
    let seq = EXECUTION_COUNTER.fetch_add(1, Ordering::SeqCst);
    ExecutionMarker {
        text: format!("{MARKER_PREFIX}{seq}"),
    }
}

/// Wraps user code into the full program handed to the engine:
/// listing output off, rich-output (HTML) channel opened onto the primary
/// stream, the code verbatim, a statement-boundary cleanup so a dangling
/// quote or comment in the code cannot swallow what follows, channel close
/// and listing restore, the marker written to the log stream, and a no-op
/// step to flush buffered output.
pub(crate) fn wrap_execution(code: &str, marker: &ExecutionMarker, ods_style: &str) -> String {
    let mut program = String::with_capacity(code.len() + 256);
    program.push_str("ods listing close;\n");
    program.push_str("ods html5 (id=console) file=stdout options(bitmap_mode='inline') style=");
    program.push_str(ods_style);
    program.push_str(";\n");
    program.push_str(code);
    if !code.ends_with('\n') {
        program.push('\n');
    }
    program.push_str(";*');*\");*/;quit;run;\n");
    program.push_str("ods html5 (id=console) close;\n");
    program.push_str("ods listing;\n");
    program.push_str("%put ");
    program.push_str(marker.as_str());
    program.push_str(";\n");
    program.push_str("run;\n");
    program
}

/// Program that echoes a macro variable back through the log as
/// `<name>=<resolved value>`, which the session reads back with a narrow
/// line match.
pub(crate) fn macro_get_program(name: &str) -> String {
    format!("%put {name}=&{name};")
}

pub(crate) fn macro_set_program(name: &str, value: &str) -> String {
    format!("%let {name} = {value};")
}

pub(crate) fn version_program() -> String {
    macro_get_program("SYSVER")
}
