//! Reads the engine's two output pipes to a single logical completion
//! condition without ever blocking on one stream while the other has data:
//! each pipe gets its own reader thread appending into a shared accumulator,
//! and the waiter re-checks completion under the same lock whenever either
//! reader makes progress.

use std::io::Read;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use memchr::memmem;

/// Start of an HTML document on the rich-output stream. `</html>` cannot
/// false-positive this: the byte after `<` differs.
const RICH_START_TOKEN: &[u8] = b"<html";
/// End of the document, searched from the end since the token can also
/// appear inside pathological cell content.
const RICH_END_TOKEN: &[u8] = b"</html>";

const READ_CHUNK_BYTES: usize = 8192;

// The streams are unsynchronized: the marker can arrive on the log pipe
// while rich-output bytes are still in flight on the other. Once the
// completion condition holds, wait for both accumulators to go quiet before
// snapshotting.
const SETTLE_POLL: Duration = Duration::from_millis(10);
const SETTLE_STABLE: Duration = Duration::from_millis(30);
const SETTLE_MAX: Duration = Duration::from_millis(150);

/// Bounds for one completion wait.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitBudget {
    pub total: Duration,
    pub poll: Duration,
    pub max_idle_polls: u32,
}

/// Everything captured for one execution.
#[derive(Debug)]
pub(crate) struct Capture {
    /// Secondary (log) stream text with the marker's line stripped.
    pub log: String,
    /// Primary (rich output) stream text.
    pub rich: String,
    pub have_marker: bool,
    pub expect_rich_output: bool,
    /// The wait gave up (total budget or idle budget exhausted) before the
    /// completion condition held; `log`/`rich` hold whatever accumulated.
    pub timed_out: bool,
    /// Both streams reached end-of-file, i.e. the engine went away.
    pub engine_eof: bool,
}

#[derive(Default)]
struct Accumulators {
    rich: Vec<u8>,
    log: Vec<u8>,
    rich_eof: bool,
    log_eof: bool,
}

struct CaptureState {
    inner: Mutex<Accumulators>,
    progress: Condvar,
}

#[derive(Clone, Copy)]
enum Channel {
    Rich,
    Log,
}

pub(crate) struct StreamMultiplexer {
    state: Arc<CaptureState>,
}

impl StreamMultiplexer {
    /// Takes ownership of both pipe read ends and starts one reader thread
    /// per stream. The threads exit when their pipe reaches end-of-file,
    /// which happens when the engine process goes away.
    pub(crate) fn start<R1, R2>(rich: R1, log: R2) -> Self
    where
        R1: Read + Send + 'static,
        R2: Read + Send + 'static,
    {
        let state = Arc::new(CaptureState {
            inner: Mutex::new(Accumulators::default()),
            progress: Condvar::new(),
        });
        spawn_reader(rich, state.clone(), Channel::Rich);
        spawn_reader(log, state.clone(), Channel::Log);
        Self { state }
    }

    /// Discards anything buffered from before the current request (startup
    /// chatter, output produced between requests). Returns the dropped byte
    /// counts per stream.
    pub(crate) fn discard_pending(&self) -> (usize, usize) {
        let mut guard = self.state.inner.lock().expect("capture state poisoned");
        let dropped = (guard.log.len(), guard.rich.len());
        guard.log.clear();
        guard.rich.clear();
        dropped
    }

    /// Blocks until the marker has appeared on the log stream and, if a
    /// rich-output document was started, its end token has arrived too.
    /// Gives up when the total budget or the consecutive-idle budget is
    /// exhausted and returns the partial capture flagged as timed out, or
    /// when both streams hit end-of-file.
    pub(crate) fn wait_for_completion(&self, marker: &str, budget: &WaitBudget) -> Capture {
        let deadline = Instant::now() + budget.total;
        let marker_bytes = marker.as_bytes();
        let mut idle_polls: u32 = 0;
        let mut last_progress = (0usize, 0usize);

        let mut guard = self.state.inner.lock().expect("capture state poisoned");
        'wait: loop {
            let have_marker = memmem::find(&guard.log, marker_bytes).is_some();
            let rich_started = memmem::find(&guard.rich, RICH_START_TOKEN).is_some();
            let rich_finished =
                !rich_started || memmem::rfind(&guard.rich, RICH_END_TOKEN).is_some();

            if have_marker && rich_finished {
                let settle_start = Instant::now();
                let mut stable_for = Duration::ZERO;
                let mut last = (guard.log.len(), guard.rich.len());
                loop {
                    let (next, _) = self
                        .state
                        .progress
                        .wait_timeout(guard, SETTLE_POLL)
                        .expect("capture state poisoned");
                    guard = next;
                    let sizes = (guard.log.len(), guard.rich.len());
                    if sizes == last {
                        stable_for = stable_for.saturating_add(SETTLE_POLL);
                    } else {
                        stable_for = Duration::ZERO;
                        last = sizes;
                    }
                    // Rich output revealing itself only now reinstates the
                    // end-token wait.
                    let started = memmem::find(&guard.rich, RICH_START_TOKEN).is_some();
                    let finished =
                        !started || memmem::rfind(&guard.rich, RICH_END_TOKEN).is_some();
                    if !finished {
                        continue 'wait;
                    }
                    if stable_for >= SETTLE_STABLE || settle_start.elapsed() >= SETTLE_MAX {
                        return take_capture(&mut guard, marker, false);
                    }
                }
            }
            if guard.log_eof && guard.rich_eof {
                tracing::debug!("both engine streams closed before completion");
                return take_capture(&mut guard, marker, false);
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    budget_ms = budget.total.as_millis() as u64,
                    "stream completion wait exhausted its total budget"
                );
                return take_capture(&mut guard, marker, true);
            }
            if idle_polls > budget.max_idle_polls {
                tracing::warn!(
                    idle_polls,
                    "stream completion wait saw no progress for too long"
                );
                return take_capture(&mut guard, marker, true);
            }

            let slice = budget.poll.min(deadline.saturating_duration_since(now));
            let (next, timeout) = self
                .state
                .progress
                .wait_timeout(guard, slice)
                .expect("capture state poisoned");
            guard = next;

            let progress = (guard.log.len(), guard.rich.len());
            if timeout.timed_out() && progress == last_progress {
                idle_polls = idle_polls.saturating_add(1);
            } else {
                idle_polls = 0;
                last_progress = progress;
            }
        }
    }
}

fn take_capture(accumulators: &mut Accumulators, marker: &str, timed_out: bool) -> Capture {
    let log_bytes = std::mem::take(&mut accumulators.log);
    let rich_bytes = std::mem::take(&mut accumulators.rich);
    let raw_log = String::from_utf8_lossy(&log_bytes).into_owned();
    let rich = String::from_utf8_lossy(&rich_bytes).into_owned();

    let have_marker = raw_log.contains(marker);
    let log = if have_marker {
        strip_marker_line(&raw_log, marker)
    } else {
        raw_log
    };
    let expect_rich_output = memmem::find(rich.as_bytes(), RICH_START_TOKEN).is_some();
    let engine_eof = accumulators.log_eof && accumulators.rich_eof;

    Capture {
        log,
        rich,
        have_marker,
        expect_rich_output,
        timed_out,
        engine_eof,
    }
}

/// Removes every line carrying the marker so it never leaks into the
/// returned log.
fn strip_marker_line(log: &str, marker: &str) -> String {
    log.split_inclusive('\n')
        .filter(|line| !line.contains(marker))
        .collect()
}

fn spawn_reader<R>(mut stream: R, state: Arc<CaptureState>, channel: Channel)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = [0u8; READ_CHUNK_BYTES];
        loop {
            match stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    let mut guard = state.inner.lock().expect("capture state poisoned");
                    match channel {
                        Channel::Rich => guard.rich.extend_from_slice(&buffer[..n]),
                        Channel::Log => guard.log.extend_from_slice(&buffer[..n]),
                    }
                    drop(guard);
                    state.progress.notify_all();
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let mut guard = state.inner.lock().expect("capture state poisoned");
        match channel {
            Channel::Rich => guard.rich_eof = true,
            Channel::Log => guard.log_eof = true,
        }
        drop(guard);
        state.progress.notify_all();
    });
}
