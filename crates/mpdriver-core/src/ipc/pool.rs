//! Worker process management on the executor side.
//!
//! Each [`WorkerProcess`] owns one child plus a reader thread. The reader
//! forwards the worker's progress requests to the coordinator through the
//! requester registered for that slot, answers them on the worker's
//! stdin, and turns task outcomes into [`WorkerEvent`]s for the
//! dispatcher.

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use super::protocol::{WorkerCommand, WorkerResponse, read_message, write_message};
use crate::config::{WORKER_ENV, WORKER_PATH_ENV};
use crate::error::{Error, Result};
use crate::execute::CancellationFlag;
use crate::progress::{HostTransport, Transport};

/// What a worker reported for one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// JSON-encoded output.
    Output(Vec<u8>),
    /// The work function returned an error.
    Failed(String),
    /// The work function panicked.
    Panic(String),
}

/// Message from a reader thread to the dispatcher.
#[derive(Debug)]
pub enum WorkerEvent {
    Finished {
        slot: usize,
        index: usize,
        outcome: TaskOutcome,
    },
    /// The worker saw SIGINT.
    Interrupted { slot: usize },
    /// The worker's stream closed, by exit, crash or kill.
    Exited { slot: usize },
}

type SharedStdin = Arc<Mutex<BufWriter<ChildStdin>>>;

/// Everything a worker needs at spawn time.
pub struct SpawnParams<'a> {
    pub program: &'a Path,
    pub work_name: &'a str,
    pub slot: usize,
    pub init_json: Vec<u8>,
    /// Requester the worker's progress requests are sent through.
    pub transport: HostTransport,
    pub flag: CancellationFlag,
    pub events: Sender<WorkerEvent>,
}

/// A running worker process.
pub struct WorkerProcess {
    slot: usize,
    child: Child,
    stdin: SharedStdin,
    kill: WorkerKillHandle,
    reader: Option<JoinHandle<()>>,
}

impl WorkerProcess {
    /// Spawn a worker, check it answers, and construct its work object.
    pub fn spawn(params: SpawnParams<'_>) -> Result<Self> {
        let mut child = Command::new(params.program)
            .env(WORKER_ENV, params.work_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "Failed to spawn worker process '{}': {}",
                    params.program.display(),
                    e
                ))
            })?;

        let kill = WorkerKillHandle::new(child.id());
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdin".to_string()));
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdout".to_string()));
        let (stdin, stdout) = match (stdin, stdout) {
            (Ok(stdin), Ok(stdout)) => (stdin, stdout),
            (Err(e), _) | (_, Err(e)) => {
                reap(&mut child, &kill);
                return Err(e);
            }
        };

        let stdin: SharedStdin = Arc::new(Mutex::new(BufWriter::new(stdin)));
        let mut stdout = BufReader::new(stdout);

        if let Err(e) = handshake(&stdin, &mut stdout, &params) {
            reap(&mut child, &kill);
            return Err(e);
        }

        let reader = {
            let stdin = Arc::clone(&stdin);
            let slot = params.slot;
            let transport = params.transport;
            let flag = params.flag;
            let events = params.events;
            thread::Builder::new()
                .name(format!("mpdriver-worker-{}", slot))
                .spawn(move || reader_loop(slot, stdout, stdin, transport, flag, events))
        };
        let reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                reap(&mut child, &kill);
                return Err(e.into());
            }
        };

        tracing::debug!("Worker {} ready (pid {})", params.slot, child.id());

        Ok(Self {
            slot: params.slot,
            child,
            stdin,
            kill,
            reader: Some(reader),
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn kill_handle(&self) -> WorkerKillHandle {
        self.kill.clone()
    }

    /// Send one task.
    pub fn run(&self, index: usize, args_json: Vec<u8>) -> Result<()> {
        if self.kill.is_killed() {
            return Err(Error::Ipc("Worker has been killed".to_string()));
        }
        write_message(
            &mut *self.stdin.lock(),
            &WorkerCommand::Run { index, args_json },
        )
    }

    /// Check if the worker process is still running.
    pub fn is_alive(&mut self) -> bool {
        if self.kill.is_killed() {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the worker to exit and wait for it.
    pub fn shutdown(mut self) {
        if !self.kill.is_killed() {
            let sent = write_message(&mut *self.stdin.lock(), &WorkerCommand::Shutdown);
            if let Err(e) = sent {
                tracing::debug!("Worker {} did not take shutdown: {}", self.slot, e);
                self.kill.kill();
            }
        }
        self.finish();
    }

    /// Reap the child and join the reader.
    fn finish(&mut self) {
        match self.child.wait() {
            Ok(status) if !status.success() && !self.kill.is_killed() => {
                tracing::warn!("Worker {} exited with status: {}", self.slot, status);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to wait for worker {}: {}", self.slot, e),
        }
        if let Some(reader) = self.reader.take()
            && reader.join().is_err()
        {
            tracing::error!("Reader thread of worker {} panicked", self.slot);
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.reader.is_some() {
            self.kill.kill();
            self.finish();
        }
    }
}

fn handshake(
    stdin: &SharedStdin,
    stdout: &mut BufReader<ChildStdout>,
    params: &SpawnParams<'_>,
) -> Result<()> {
    write_message(&mut *stdin.lock(), &WorkerCommand::Ping)?;
    match read_message(stdout)? {
        WorkerResponse::Pong => {}
        other => {
            return Err(Error::Ipc(format!(
                "Unexpected response from worker: {:?}",
                other
            )));
        }
    }

    write_message(
        &mut *stdin.lock(),
        &WorkerCommand::Init {
            slot: params.slot,
            requester: params.transport.requester(),
            init_json: params.init_json.clone(),
        },
    )?;
    loop {
        match read_message(stdout)? {
            WorkerResponse::Ready => return Ok(()),
            WorkerResponse::Error { message } => return Err(Error::WorkerInit(message)),
            // Work objects may report progress while they initialize.
            WorkerResponse::Progress(request) => {
                let reply = match params.transport.call(request.bar, request.op) {
                    Ok(response) => WorkerCommand::ProgressReply(response),
                    Err(e) => WorkerCommand::ProgressLost(e.to_string()),
                };
                write_message(&mut *stdin.lock(), &reply)?;
            }
            other => {
                return Err(Error::Ipc(format!(
                    "Unexpected response when initializing worker: {:?}",
                    other
                )));
            }
        }
    }
}

fn reader_loop(
    slot: usize,
    mut stdout: BufReader<ChildStdout>,
    stdin: SharedStdin,
    transport: HostTransport,
    flag: CancellationFlag,
    events: Sender<WorkerEvent>,
) {
    loop {
        let response: WorkerResponse = match read_message(&mut stdout) {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Worker {} stream closed: {}", slot, e);
                let _ = events.send(WorkerEvent::Exited { slot });
                return;
            }
        };

        let event = match response {
            WorkerResponse::Progress(request) => {
                let reply = match transport.call(request.bar, request.op) {
                    Ok(response) => WorkerCommand::ProgressReply(response),
                    Err(e) => WorkerCommand::ProgressLost(e.to_string()),
                };
                if let Err(e) = write_message(&mut *stdin.lock(), &reply) {
                    tracing::debug!("Could not answer progress request of worker {}: {}", slot, e);
                }
                continue;
            }
            WorkerResponse::Output { index, json } => WorkerEvent::Finished {
                slot,
                index,
                outcome: TaskOutcome::Output(json),
            },
            WorkerResponse::Failed { index, message } => WorkerEvent::Finished {
                slot,
                index,
                outcome: TaskOutcome::Failed(message),
            },
            WorkerResponse::Panic { index, message } => WorkerEvent::Finished {
                slot,
                index,
                outcome: TaskOutcome::Panic(message),
            },
            WorkerResponse::Interrupted => {
                flag.cancel();
                WorkerEvent::Interrupted { slot }
            }
            WorkerResponse::ShuttingDown => {
                let _ = events.send(WorkerEvent::Exited { slot });
                return;
            }
            other => {
                tracing::warn!("Unexpected message from worker {}: {:?}", slot, other);
                continue;
            }
        };

        if events.send(event).is_err() {
            // Nobody is dispatching any more; keep draining so the worker
            // never blocks on a full pipe.
            tracing::trace!("Dispatcher gone; dropping event from worker {}", slot);
        }
    }
}

fn reap(child: &mut Child, kill: &WorkerKillHandle) {
    kill.kill();
    let _ = child.kill();
    let _ = child.wait();
}

/// Locate the program to spawn as a worker.
///
/// Order: the explicit path (a bare name is looked up on `PATH`), then
/// `MPDRIVER_WORKER_PATH`, then the current executable.
pub fn find_worker_program(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        if path.components().count() == 1
            && let Ok(found) = which::which(path)
        {
            return Ok(found);
        }
        return Err(Error::Ipc(format!(
            "Worker program '{}' not found",
            path.display()
        )));
    }

    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(
            "{} points to missing '{}'; using the current executable",
            WORKER_PATH_ENV,
            path.display()
        );
    }

    std::env::current_exe().map_err(|e| {
        Error::Ipc(format!(
            "Could not locate the worker program. Set {}: {}",
            WORKER_PATH_ENV, e
        ))
    })
}

/// Thread-safe handle for killing a worker from another thread.
#[derive(Debug, Clone)]
pub struct WorkerKillHandle {
    pid: u32,
    killed: Arc<AtomicBool>,
}

impl WorkerKillHandle {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Kill the worker process immediately. Later calls do nothing.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }

        #[cfg(unix)]
        {
            // SAFETY: plain syscall on a pid we spawned and have not reaped.
            unsafe {
                libc::kill(self.pid as i32, libc::SIGKILL);
            }
        }

        #[cfg(not(unix))]
        tracing::warn!("Killing worker {} is not supported on this platform", self.pid);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}
