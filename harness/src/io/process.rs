//! Isolated worker processes with non-blocking status polling.
//!
//! Each worker is spawned with piped output and watched by a supervisor
//! thread that reports over a one-way channel: a `Started` handshake as
//! soon as the child is up, then exactly one `Completed` message carrying
//! the drained output and exit code. The owning [`ProcessSandbox`] keeps
//! one record per worker and is the only writer of that registry; records
//! leave it only through [`ProcessSandbox::teardown_all`].

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::HarnessError;

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 100_000;

/// Grace given to a supervisor to flush its completion message when the
/// child is already gone.
const COMPLETION_DRAIN_GRACE: Duration = Duration::from_millis(200);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Lifecycle phase of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPhase {
    Starting,
    Running,
    Completed,
    Terminated,
}

#[derive(Debug)]
enum WorkerMessage {
    Started,
    Completed {
        stdout: String,
        stderr: String,
        return_code: Option<i32>,
    },
}

/// Snapshot of one worker's observable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub status: WorkerPhase,
    pub stdout: String,
    pub stderr: String,
    pub return_code: Option<i32>,
}

impl PollReport {
    fn starting() -> Self {
        Self {
            status: WorkerPhase::Starting,
            stdout: String::new(),
            stderr: String::new(),
            return_code: None,
        }
    }

    fn terminated() -> Self {
        Self {
            status: WorkerPhase::Terminated,
            stdout: String::new(),
            stderr: String::new(),
            return_code: None,
        }
    }
}

#[derive(Debug)]
struct WorkerRecord {
    child: Arc<Mutex<Child>>,
    receiver: Receiver<WorkerMessage>,
    report: PollReport,
}

/// Owns every worker spawned for one sandbox and guarantees teardown.
///
/// Deliberately not a global: each sandbox gets its own instance, and a
/// single thread (the engine's) reads and mutates it.
#[derive(Debug)]
pub struct ProcessSandbox {
    workers: Vec<WorkerRecord>,
    startup_timeout: Duration,
    shutdown_grace: Duration,
    output_limit_bytes: usize,
}

impl ProcessSandbox {
    pub fn new(
        startup_timeout: Duration,
        shutdown_grace: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            workers: Vec::new(),
            startup_timeout,
            shutdown_grace,
            output_limit_bytes,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_STARTUP_TIMEOUT,
            DEFAULT_SHUTDOWN_GRACE,
            DEFAULT_OUTPUT_LIMIT_BYTES,
        )
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Spawn `argv` as an isolated worker and wait for its startup
    /// handshake.
    ///
    /// Returns a worker handle usable with [`poll`](Self::poll). On
    /// handshake timeout the child is killed and the registry is left
    /// unmodified; the worker otherwise keeps running independently and the
    /// caller polls rather than blocks for completion.
    #[instrument(skip(self), fields(command = %argv.join(" ")))]
    pub fn launch(&mut self, argv: &[String]) -> Result<usize> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty worker command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("spawning worker");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn worker '{program}'"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let (sender, receiver) = mpsc::channel();
        let child = Arc::new(Mutex::new(child));
        let supervisor_child = Arc::clone(&child);
        let limit = self.output_limit_bytes;
        thread::spawn(move || supervise(supervisor_child, stdout, stderr, sender, limit));

        let mut report = PollReport::starting();
        match await_handshake(&receiver, self.startup_timeout) {
            Ok(None) => report.status = WorkerPhase::Running,
            Ok(Some(completed)) => report = completed,
            Err(err) => {
                kill_and_reap(&child);
                return Err(err.into());
            }
        }

        self.workers.push(WorkerRecord {
            child,
            receiver,
            report,
        });
        let handle = self.workers.len() - 1;
        debug!(worker = handle, "worker started");
        Ok(handle)
    }

    /// Drain the worker's channel without blocking and report its status.
    ///
    /// Completion is sticky: once a `Completed` message was drained, every
    /// later poll returns the same payload even though the channel has gone
    /// quiet. A worker whose handle reports not-alive without ever
    /// completing is classified as terminated with no output.
    pub fn poll(&mut self, worker: usize) -> Result<PollReport> {
        let record = self
            .workers
            .get_mut(worker)
            .ok_or_else(|| anyhow!("unknown worker handle {worker}"))?;
        drain_messages(record);
        if record.report.status == WorkerPhase::Completed {
            return Ok(record.report.clone());
        }
        if child_is_alive(&record.child) {
            record.report.status = WorkerPhase::Running;
            return Ok(record.report.clone());
        }
        // The child is gone but nothing completed was drained. Give the
        // supervisor a short grace to flush before classifying the worker
        // as a detected-but-unreported failure.
        if let Ok(message) = record.receiver.recv_timeout(COMPLETION_DRAIN_GRACE) {
            apply_message(record, message);
            drain_messages(record);
        }
        if record.report.status != WorkerPhase::Completed {
            record.report = PollReport::terminated();
        }
        Ok(record.report.clone())
    }

    /// Aggregate every worker's poll report into a state snapshot.
    pub fn read_state(&mut self) -> Result<Value> {
        let mut processes = Vec::with_capacity(self.workers.len());
        for worker in 0..self.workers.len() {
            let report = self.poll(worker)?;
            processes.push(serde_json::to_value(&report)?);
        }
        Ok(json!({ "status": "success", "processes": processes }))
    }

    /// Stop every worker and clear the registry.
    ///
    /// Live workers get a termination request and up to the shutdown grace
    /// to exit before a forced kill. Channel drains tolerate the race where
    /// an emptiness check and a non-blocking read disagree. Never fails,
    /// and calling it again is a no-op.
    #[instrument(skip(self), fields(workers = self.workers.len()))]
    pub fn teardown_all(&mut self) {
        for record in self.workers.drain(..) {
            let mut child = lock_child(&record.child);
            match child.try_wait() {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if let Err(err) = child.kill() {
                        warn!(err = %err, "termination request failed");
                    }
                    match child.wait_timeout(self.shutdown_grace) {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            warn!(
                                grace_secs = self.shutdown_grace.as_secs(),
                                "worker survived grace period, forcing kill"
                            );
                            let _ = child.kill();
                            let _ = child.wait();
                        }
                        Err(err) => warn!(err = %err, "wait after termination request failed"),
                    }
                }
                Err(err) => warn!(err = %err, "could not query worker liveness"),
            }
            drop(child);
            while record.receiver.try_recv().is_ok() {}
        }
    }
}

/// Block on the startup handshake with a bounded wait.
///
/// `Ok(None)` means the worker signaled readiness; `Ok(Some(report))` means
/// it already ran to completion before the handshake was observed.
fn await_handshake(
    receiver: &Receiver<WorkerMessage>,
    timeout: Duration,
) -> Result<Option<PollReport>, HarnessError> {
    match receiver.recv_timeout(timeout) {
        Ok(WorkerMessage::Started) => Ok(None),
        Ok(WorkerMessage::Completed {
            stdout,
            stderr,
            return_code,
        }) => Ok(Some(PollReport {
            status: WorkerPhase::Completed,
            stdout,
            stderr,
            return_code,
        })),
        Err(_) => Err(HarnessError::StartupTimeout {
            timeout_secs: timeout.as_secs(),
        }),
    }
}

fn drain_messages(record: &mut WorkerRecord) {
    loop {
        match record.receiver.try_recv() {
            Ok(message) => apply_message(record, message),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
        }
    }
}

fn apply_message(record: &mut WorkerRecord, message: WorkerMessage) {
    match message {
        // A re-observed handshake carries no new information.
        WorkerMessage::Started => {}
        WorkerMessage::Completed {
            stdout,
            stderr,
            return_code,
        } => {
            record.report = PollReport {
                status: WorkerPhase::Completed,
                stdout,
                stderr,
                return_code,
            };
        }
    }
}

fn lock_child(child: &Arc<Mutex<Child>>) -> MutexGuard<'_, Child> {
    match child.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn child_is_alive(child: &Arc<Mutex<Child>>) -> bool {
    matches!(lock_child(child).try_wait(), Ok(None))
}

fn kill_and_reap(child: &Arc<Mutex<Child>>) {
    let mut child = lock_child(child);
    if let Err(err) = child.kill() {
        warn!(err = %err, "kill after failed handshake");
    }
    let _ = child.wait();
}

/// Watch one worker: handshake, stream output, report completion.
fn supervise(
    child: Arc<Mutex<Child>>,
    stdout: impl Read + Send + 'static,
    stderr: impl Read + Send + 'static,
    sender: Sender<WorkerMessage>,
    limit: usize,
) {
    // The owner may already be gone; keep going so the child is reaped.
    let _ = sender.send(WorkerMessage::Started);

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let return_code = wait_for_exit(&child);
    let (stdout, stdout_truncated) = join_output(stdout_handle);
    let (stderr, stderr_truncated) = join_output(stderr_handle);
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "worker output truncated");
    }

    let _ = sender.send(WorkerMessage::Completed {
        stdout,
        stderr,
        return_code,
    });
}

/// Wait for the child to exit while keeping lock windows short, so the
/// owner can still kill it mid-wait.
fn wait_for_exit(child: &Arc<Mutex<Child>>) -> Option<i32> {
    loop {
        {
            let mut guard = lock_child(child);
            match guard.try_wait() {
                Ok(Some(status)) => return status.code(),
                Ok(None) => {}
                Err(_) => return None,
            }
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> (String, usize) {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }
    (String::from_utf8_lossy(&buf).into_owned(), truncated)
}

fn join_output(handle: thread::JoinHandle<(String, usize)>) -> (String, usize) {
    match handle.join() {
        Ok(output) => output,
        Err(_) => {
            warn!("output reader thread panicked");
            (String::new(), 0)
        }
    }
}
