//! The persistent engine session: lazy spawn, marker-wrapped execution over
//! the two output streams, destructive-restart interrupt, idempotent
//! shutdown, and macro variable access.
//!
//! Exactly one session exists per kernel instance and callers serialize
//! their own requests; only one execution is ever in flight.

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use crate::config::{self, SessionConfig};
use crate::error::SessionError;
use crate::execution::{ExecutionResult, InterruptOutcome};
use crate::html_table;
use crate::locate::locate_engine;
use crate::multiplex::Capture;
use crate::process::EngineProcess;
use crate::protocol;
use crate::sas_log;

pub struct SasSession {
    config: SessionConfig,
    engine_path: Option<PathBuf>,
    process: Option<EngineProcess>,
}

impl SasSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            engine_path: None,
            process: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.process.is_some()
    }

    /// Pid of the engine child, when one is running.
    pub fn engine_pid(&self) -> Option<u32> {
        self.process.as_ref().map(EngineProcess::pid)
    }

    /// Locates the engine executable and spawns it with its three pipes
    /// connected. A no-op when the engine is already up. Failures here are
    /// fatal to the session: they indicate a misconfigured environment and
    /// are not retried internally.
    pub fn initialize(&mut self) -> Result<(), SessionError> {
        if self.process.is_some() {
            return Ok(());
        }
        let path = match &self.engine_path {
            Some(path) => path.clone(),
            None => {
                let path = locate_engine(self.config.engine_path.as_deref())?;
                self.engine_path = Some(path.clone());
                path
            }
        };
        self.process = Some(EngineProcess::spawn(&path)?);
        Ok(())
    }

    /// Runs one program in the engine and returns its classified output.
    /// Spawns the engine on first use and respawns it if it died since the
    /// previous call. An engine-reported error is a normal outcome (see
    /// [`ExecutionResult::is_error`]); a completion timeout comes back as a
    /// degraded result with [`ExecutionResult::timed_out`] set.
    pub fn execute(&mut self, code: &str) -> Result<ExecutionResult, SessionError> {
        self.ensure_process()?;

        let marker = protocol::next_marker();
        let style = config::resolve_ods_style(self.config.ods_style.as_deref());
        let program = protocol::wrap_execution(code, &marker, &style);

        let write_timeout = self.config.write_timeout;
        let process = self
            .process
            .as_mut()
            .expect("engine process should be available");
        let (stale_log, stale_rich) = process.streams().discard_pending();
        if stale_log + stale_rich > 0 {
            tracing::debug!(stale_log, stale_rich, "discarded inter-request output");
        }
        process.write_input(program.into_bytes(), write_timeout)?;

        let capture = process
            .streams()
            .wait_for_completion(marker.as_str(), &self.config.wait_budget());

        self.build_result(capture)
    }

    fn build_result(&mut self, capture: Capture) -> Result<ExecutionResult, SessionError> {
        let Capture {
            log,
            rich,
            have_marker,
            expect_rich_output,
            timed_out,
            engine_eof,
        } = capture;

        let log = sas_log::scrub_markers(&log);
        let listing = if expect_rich_output {
            html_table::normalize_rich_output(&sas_log::scrub_markers(&rich))
        } else {
            sas_log::scrub_markers(&rich)
        };

        let mut result = sas_log::classify(log, listing, expect_rich_output, timed_out);

        if engine_eof && !have_marker {
            // The engine went away mid-request. Surface it as an engine
            // failure unless the log already explains itself, and make sure
            // the next call respawns.
            let message = self
                .process
                .as_mut()
                .and_then(EngineProcess::exit_status_message)
                .unwrap_or_else(|| "SAS engine exited before completing the request".to_string());
            tracing::warn!(%message, "engine ended during execution");
            if !result.is_error {
                result.is_error = true;
                result.error_code = 1;
                result.error_message = message;
            }
            self.process = None;
        }

        Ok(result)
    }

    /// Destructive interrupt: the engine cannot be cancelled mid-execution
    /// without corrupting its output channel, so the process is killed and
    /// respawned, discarding all engine-side state. Surface
    /// [`crate::STATE_LOSS_WARNING`] to the user when this returns
    /// [`InterruptOutcome::RestartedStateLost`].
    pub fn interrupt(&mut self) -> Result<InterruptOutcome, SessionError> {
        if self.process.is_none() {
            return Ok(InterruptOutcome::NotRunning);
        }
        tracing::warn!("interrupt requested; engine has no cooperative cancel, restarting");
        if let Some(mut process) = self.process.take() {
            process.kill();
        }
        self.initialize()?;
        Ok(InterruptOutcome::RestartedStateLost)
    }

    /// Full restart: graceful shutdown followed by a fresh spawn. Engine
    /// state does not survive.
    pub fn restart(&mut self) -> Result<(), SessionError> {
        self.shutdown();
        self.initialize()
    }

    /// Idempotent: sends the graceful termination directive if the engine is
    /// up, closes the pipes, and waits (bounded) for the process to exit,
    /// escalating to a forced kill on timeout.
    pub fn shutdown(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.shutdown_graceful(self.config.shutdown_timeout);
        }
    }

    /// Reads a macro variable through the engine's substitution mechanism.
    /// Unresolved variables come back as the empty string.
    pub fn get_macro(&mut self, name: &str) -> Result<String, SessionError> {
        let result = self.execute(&protocol::macro_get_program(name))?;
        Ok(extract_macro_value(&result.log, name).unwrap_or_default())
    }

    pub fn set_macro(&mut self, name: &str, value: &str) -> Result<(), SessionError> {
        let result = self.execute(&protocol::macro_set_program(name, value))?;
        if result.is_error {
            tracing::warn!(name, message = %result.error_message, "set_macro reported an error");
        }
        Ok(())
    }

    /// Engine version string, read from the `SYSVER` automatic variable.
    pub fn engine_version(&mut self) -> Result<String, SessionError> {
        let result = self.execute(&protocol::version_program())?;
        Ok(extract_macro_value(&result.log, "SYSVER").unwrap_or_default())
    }

    fn ensure_process(&mut self) -> Result<(), SessionError> {
        let needs_spawn = match self.process.as_mut() {
            Some(process) => !process.is_running()?,
            None => true,
        };
        if needs_spawn {
            self.process = None;
            self.initialize()?;
        }
        Ok(())
    }

    /// Budget for one graceful shutdown, exposed for callers coordinating
    /// their own deadlines.
    pub fn shutdown_timeout(&self) -> Duration {
        self.config.shutdown_timeout
    }
}

impl Drop for SasSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Narrow match for the `name=value` line the macro-readback program writes
/// into the log. Not a general key/value store: the first matching line wins.
fn extract_macro_value(log: &str, name: &str) -> Option<String> {
    let pattern = format!(r"(?m)^{}=(.*)$", regex::escape(name));
    let re = Regex::new(&pattern).ok()?;
    re.captures(log)
        .map(|captures| captures[1].trim_end().to_string())
}
