use std::sync::OnceLock;

use regex::Regex;

use crate::execution::ExecutionResult;
use crate::protocol::MARKER_PREFIX;

const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const RESET: &str = "\x1b[0m";

/// Error reported by the engine inside its log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub code: i32,
    pub message: String,
}

fn error_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)ERROR(?:\s+(\d+))?\s*:\s*(.*)").expect("error pattern must compile")
    })
}

fn warning_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"WARNING:\s*(.*)").expect("warning pattern must compile"))
}

fn graph_file_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)NOTE:.*?file:\s*(\S+\.(?:png|svg|jpg|jpeg|gif))")
            .expect("graph pattern must compile")
    })
}

fn marker_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"(?m)^.*{MARKER_PREFIX}\d+.*(?:\r?\n|$)"))
            .expect("marker pattern must compile")
    })
}

fn ansi_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("\x1b\\[[0-9;]*m").expect("ansi pattern must compile"))
}

/// Locates the first `ERROR` line (any case, optional numeric code before
/// the colon). The code defaults to 1 when the line carries none; the
/// message is the remainder of that line.
pub fn contains_error(log: &str) -> Option<EngineError> {
    for line in log.lines() {
        if let Some(captures) = error_line_regex().captures(line) {
            let code = captures
                .get(1)
                .and_then(|digits| digits.as_str().parse().ok())
                .unwrap_or(1);
            let message = captures
                .get(2)
                .map(|text| text.as_str().trim_end().to_string())
                .unwrap_or_default();
            return Some(EngineError { code, message });
        }
    }
    None
}

/// Every `WARNING` line, in order, duplicates kept.
pub fn extract_warnings(log: &str) -> Vec<String> {
    log.lines()
        .filter_map(|line| {
            warning_line_regex()
                .captures(line)
                .map(|captures| captures[1].trim_end().to_string())
        })
        .collect()
}

/// Graphic artifacts referenced by `NOTE ... file:` lines, in order.
pub fn extract_graph_files(log: &str) -> Vec<String> {
    graph_file_regex()
        .captures_iter(log)
        .map(|captures| captures[1].to_string())
        .collect()
}

/// Removes every line that carries a completion marker token, including any
/// echoed `%put` directive, so markers never reach user-visible output.
pub fn scrub_markers(text: &str) -> String {
    marker_line_regex().replace_all(text, "").into_owned()
}

/// Display decision: show the log rather than the listing when the request
/// errored or the listing is blank. Pure function of the result.
pub fn should_show_listing(result: &ExecutionResult) -> bool {
    if result.is_error {
        return false;
    }
    !result.listing.trim().is_empty()
}

/// Wraps `ERROR` / `WARNING` / `NOTE` lines in distinct terminal colors.
/// Total over arbitrary text; line structure is preserved exactly, so
/// [`strip_ansi_codes`] inverts it for text that carried no codes already.
pub fn colorize_log(log: &str) -> String {
    let mut out = String::with_capacity(log.len() + 64);
    for piece in log.split_inclusive('\n') {
        let content_len = piece.trim_end_matches(['\n', '\r']).len();
        let (content, ending) = piece.split_at(content_len);
        let color = if content.contains("ERROR") {
            Some(RED)
        } else if content.contains("WARNING") {
            Some(YELLOW)
        } else if content.contains("NOTE") {
            Some(BLUE)
        } else {
            None
        };
        match color {
            Some(color) => {
                out.push_str(color);
                out.push_str(content);
                out.push_str(RESET);
            }
            None => out.push_str(content),
        }
        out.push_str(ending);
    }
    out
}

/// Removes ANSI color sequences. Total over arbitrary text.
pub fn strip_ansi_codes(text: &str) -> String {
    ansi_code_regex().replace_all(text, "").into_owned()
}

/// Classifies a captured log against an already-normalized listing into the
/// caller-facing result value.
pub(crate) fn classify(
    log: String,
    listing: String,
    has_rich_output: bool,
    timed_out: bool,
) -> ExecutionResult {
    let mut result = ExecutionResult {
        warnings: extract_warnings(&log),
        graph_files: extract_graph_files(&log),
        has_rich_output,
        timed_out,
        ..ExecutionResult::default()
    };
    if let Some(error) = contains_error(&log) {
        result.is_error = true;
        result.error_code = error.code;
        result.error_message = error.message;
    }
    result.log = log;
    result.listing = listing;
    result
}
