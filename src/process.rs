//! Exclusive owner of the engine child process: three connected pipes, a
//! dedicated stdin writer thread, process-group signalling, and a graceful
//! shutdown ladder that escalates to a forced kill. The process is reaped on
//! every exit path, including drop.

use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::SessionError;
use crate::multiplex::StreamMultiplexer;

/// Flags selecting non-interactive, pipe-based operation with banners and
/// source echo suppressed.
pub(crate) const ENGINE_ARGS: &[&str] = &["-nodms", "-stdio", "-nonews", "-nosource"];

/// Graceful termination directive understood by the engine.
const TERMINATE_DIRECTIVE: &[u8] = b"endsas;\n";

static CURRENT_ENGINE_PID: AtomicU32 = AtomicU32::new(0);

/// Pid of the currently running engine child, recorded process-wide for
/// diagnostics and external supervision. `None` while no engine is up.
pub fn current_engine_pid() -> Option<u32> {
    match CURRENT_ENGINE_PID.load(Ordering::SeqCst) {
        0 => None,
        pid => Some(pid),
    }
}

enum StdinCommand {
    Write {
        payload: Vec<u8>,
        reply: mpsc::Sender<std::io::Result<()>>,
    },
    Close {
        reply: mpsc::Sender<std::io::Result<()>>,
    },
}

pub(crate) struct EngineProcess {
    child: Child,
    stdin_tx: mpsc::Sender<StdinCommand>,
    streams: StreamMultiplexer,
    reaped: bool,
}

impl EngineProcess {
    pub(crate) fn spawn(engine_path: &Path) -> Result<Self, SessionError> {
        let mut command = Command::new(engine_path);
        command.args(ENGINE_ARGS);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        unsafe {
            use std::os::unix::process::CommandExt;
            // Own process group so signals reach the engine and anything it
            // forks, without touching the host.
            command.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|source| SessionError::ProcessSpawnFailure {
                path: engine_path.to_path_buf(),
                source,
            })?;
        tracing::debug!(pid = child.id(), path = %engine_path.display(), "spawned SAS engine");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::PipeSetupFailure("engine stdin unavailable".to_string()))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SessionError::PipeSetupFailure("engine stdout unavailable".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            SessionError::PipeSetupFailure("engine stderr unavailable".to_string())
        })?;

        CURRENT_ENGINE_PID.store(child.id(), Ordering::SeqCst);

        let stdin_tx = spawn_stdin_writer(stdin);
        let streams = StreamMultiplexer::start(stdout, stderr);

        Ok(Self {
            child,
            stdin_tx,
            streams,
            reaped: false,
        })
    }

    pub(crate) fn pid(&self) -> u32 {
        self.child.id()
    }

    pub(crate) fn streams(&self) -> &StreamMultiplexer {
        &self.streams
    }

    pub(crate) fn write_input(
        &mut self,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        self.send_stdin_command(Some(payload), timeout)
    }

    fn close_stdin(&mut self, timeout: Duration) -> Result<(), SessionError> {
        self.send_stdin_command(None, timeout)
    }

    fn send_stdin_command(
        &mut self,
        payload: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let command = match payload {
            Some(payload) => StdinCommand::Write {
                payload,
                reply: reply_tx,
            },
            None => StdinCommand::Close { reply: reply_tx },
        };
        self.stdin_tx.send(command).map_err(|_| {
            SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "engine stdin writer exited",
            ))
        })?;
        match reply_rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(SessionError::Io(err)),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out writing to the engine input pipe",
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(SessionError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "engine stdin writer exited unexpectedly",
                )))
            }
        }
    }

    pub(crate) fn is_running(&mut self) -> Result<bool, SessionError> {
        if let Some(status) = self.child.try_wait()? {
            if !self.reaped {
                tracing::warn!(%status, "engine exited outside of shutdown");
                self.note_reaped();
            }
            return Ok(false);
        }
        Ok(true)
    }

    pub(crate) fn exit_status_message(&mut self) -> Option<String> {
        let status = self.child.try_wait().ok().flatten()?;
        Some(format_exit_status_message(&status))
    }

    /// Graceful shutdown ladder: termination directive, flush and close the
    /// input pipe, wait most of the budget for a voluntary exit, then TERM,
    /// then KILL. Always reaps.
    pub(crate) fn shutdown_graceful(&mut self, timeout: Duration) {
        let _ = self.write_input(TERMINATE_DIRECTIVE.to_vec(), Duration::from_millis(500));
        let _ = self.close_stdin(Duration::from_millis(200));

        let start = Instant::now();
        let timeout_deadline = start + timeout;
        let term_deadline = start + shutdown_term_delay(timeout);

        if !timeout.is_zero() {
            while self.child.try_wait().ok().flatten().is_none() {
                let now = Instant::now();
                if now >= term_deadline || now >= timeout_deadline {
                    break;
                }
                thread::sleep(Duration::from_millis(20));
            }
        }

        if self.child.try_wait().ok().flatten().is_none() {
            tracing::debug!(pid = self.child.id(), "escalating shutdown to SIGTERM");
            let term_ok = self.send_sigterm().is_ok();
            #[cfg(unix)]
            if !term_ok {
                self.kill_process_tree_scan(libc::SIGTERM);
            }
            #[cfg(not(unix))]
            let _ = term_ok;
            let kill_deadline = std::cmp::min(
                timeout_deadline,
                Instant::now() + Duration::from_secs(2),
            );
            loop {
                if self.child.try_wait().ok().flatten().is_some() {
                    break;
                }
                if Instant::now() >= kill_deadline {
                    tracing::warn!(pid = self.child.id(), "escalating shutdown to SIGKILL");
                    self.force_kill();
                    break;
                }
                thread::sleep(Duration::from_millis(20));
            }
        }

        let _ = self.child.wait();
        self.note_reaped();
    }

    /// Immediate forced termination; used by the destructive interrupt path.
    pub(crate) fn kill(&mut self) {
        self.force_kill();
        let _ = self.child.wait();
        self.note_reaped();
    }

    fn force_kill(&mut self) {
        let kill_ok = self.send_sigkill().is_ok();
        #[cfg(unix)]
        if !kill_ok {
            self.kill_process_tree_scan(libc::SIGKILL);
        }
        #[cfg(not(unix))]
        let _ = kill_ok;
    }

    fn note_reaped(&mut self) {
        self.reaped = true;
        CURRENT_ENGINE_PID.store(0, Ordering::SeqCst);
    }

    #[cfg(unix)]
    fn send_sigterm(&self) -> Result<(), SessionError> {
        self.send_signal(libc::SIGTERM)
    }

    #[cfg(not(unix))]
    fn send_sigterm(&mut self) -> Result<(), SessionError> {
        // No portable soft-termination signal; the KILL escalation follows.
        Ok(())
    }

    #[cfg(unix)]
    fn send_sigkill(&self) -> Result<(), SessionError> {
        self.send_signal(libc::SIGKILL)
    }

    #[cfg(not(unix))]
    fn send_sigkill(&mut self) -> Result<(), SessionError> {
        self.child.kill()?;
        Ok(())
    }

    #[cfg(unix)]
    fn send_signal(&self, signal: i32) -> Result<(), SessionError> {
        let pid = self.child.id() as i32;
        let result = unsafe { libc::kill(-pid, signal) };
        if result == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        // Process group already gone.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(SessionError::Io(err))
    }

    /// Fallback when the process-group signal fails: walk the process table
    /// and signal every descendant individually.
    #[cfg(unix)]
    fn kill_process_tree_scan(&self, signal: i32) {
        use std::collections::{HashMap, HashSet};
        use sysinfo::{Pid, ProcessesToUpdate, System};

        let root = Pid::from_u32(self.child.id());
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (proc_pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*proc_pid);
            }
        }

        let mut stack = vec![root];
        let mut seen: HashSet<Pid> = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(kids) = children.get(&current) {
                for child in kids {
                    if !seen.contains(child) {
                        stack.push(*child);
                    }
                }
            }
        }

        for pid in seen {
            let _ = unsafe { libc::kill(pid.as_u32() as i32, signal) };
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if !self.reaped && self.child.try_wait().ok().flatten().is_none() {
            self.force_kill();
            let _ = self.child.wait();
        }
        CURRENT_ENGINE_PID.store(0, Ordering::SeqCst);
    }
}

fn spawn_stdin_writer<W>(stdin: W) -> mpsc::Sender<StdinCommand>
where
    W: Write + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<StdinCommand>();
    thread::spawn(move || {
        let mut writer = std::io::BufWriter::new(stdin);
        for command in rx {
            match command {
                StdinCommand::Write { payload, reply } => {
                    let result = writer.write_all(&payload).and_then(|_| writer.flush());
                    let _ = reply.send(result);
                }
                StdinCommand::Close { reply } => {
                    let _ = reply.send(writer.flush());
                    break;
                }
            }
        }
    });
    tx
}

fn shutdown_term_delay(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        return Duration::from_secs(0);
    }
    let by_fraction = timeout.mul_f64(0.75);
    let by_remaining = timeout.saturating_sub(Duration::from_secs(10));
    by_fraction.min(by_remaining)
}

fn format_exit_status_message(status: &std::process::ExitStatus) -> String {
    #[cfg(unix)]
    if let Some(signal) = std::os::unix::process::ExitStatusExt::signal(status) {
        return format!("SAS engine exited with signal {signal}");
    }
    match status.code() {
        Some(code) => format!("SAS engine exited with status {code}"),
        None => "SAS engine exited with unknown status".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_delay_leaves_room_for_escalation() {
        assert_eq!(shutdown_term_delay(Duration::ZERO), Duration::ZERO);
        // Short budgets escalate immediately.
        assert_eq!(shutdown_term_delay(Duration::from_secs(1)), Duration::ZERO);
        // Long budgets keep ten seconds of escalation room.
        assert_eq!(
            shutdown_term_delay(Duration::from_secs(15)),
            Duration::from_secs(5)
        );
    }

    #[cfg(unix)]
    #[test]
    fn spawn_failure_maps_to_the_taxonomy() {
        let result = EngineProcess::spawn(Path::new("/nonexistent/sas-engine"));
        assert!(matches!(
            result,
            Err(SessionError::ProcessSpawnFailure { .. })
        ));
    }
}
