//! Worker process side of the executor protocol.
//!
//! A worker is the same binary started with `MPDRIVER_WORKER` set. It
//! talks to its parent over stdin/stdout only, so nothing else in the
//! process may write to stdout. Logs go to stderr.

use std::io::{self, BufWriter, Stdin, Stdout};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::WORKER_ENV;
use crate::error::{Error, Result};
use crate::execute::{CancellationFlag, IoLock, TaskContext, Work, panic_message};
use crate::ipc::{
    WorkerCommand, WorkerResponse, decode_payload, encode_payload, read_message, write_message,
};
use crate::progress::{
    BarId, ProgressHandle, ProgressOp, ProgressRequest, ProgressResponse, RequesterId, Transport,
};
use crate::signal::{SigintGuard, SigintWatch};

const SIGINT_POLL: Duration = Duration::from_millis(50);

/// Work name this process was asked to serve, if it is a worker.
pub fn requested() -> Option<String> {
    std::env::var(WORKER_ENV).ok().filter(|name| !name.is_empty())
}

/// The worker's pipe to its parent.
struct WorkerIo {
    /// Held for every outbound message and every progress round trip.
    lock: IoLock,
    writer: Mutex<BufWriter<Stdout>>,
    reader: Mutex<Stdin>,
}

impl WorkerIo {
    fn new() -> Self {
        Self {
            lock: IoLock::new(),
            writer: Mutex::new(BufWriter::new(io::stdout())),
            reader: Mutex::new(io::stdin()),
        }
    }

    fn send(&self, message: &WorkerResponse) -> Result<()> {
        let _io = self.lock.lock();
        write_message(&mut *self.writer.lock(), message)
    }

    fn recv(&self) -> Result<WorkerCommand> {
        read_message(&mut *self.reader.lock())
    }
}

/// Progress transport that tunnels requests through the parent.
struct ClientTransport {
    io: Arc<WorkerIo>,
    requester: RequesterId,
}

impl Transport for ClientTransport {
    fn requester(&self) -> RequesterId {
        self.requester
    }

    fn call(&self, bar: Option<BarId>, op: ProgressOp) -> Result<ProgressResponse> {
        let _io = self.io.lock.lock();
        let lost = |e: Error| Error::CoordinationLost(format!("parent unreachable: {}", e));

        self.io
            .send(&WorkerResponse::Progress(ProgressRequest {
                requester: self.requester,
                bar,
                op,
            }))
            .map_err(lost)?;

        loop {
            match self.io.recv().map_err(lost)? {
                WorkerCommand::ProgressReply(response) => return Ok(response),
                WorkerCommand::ProgressLost(message) => {
                    return Err(Error::CoordinationLost(message));
                }
                other => {
                    tracing::warn!("Ignoring {:?} while waiting for a progress reply", other);
                }
            }
        }
    }
}

/// Reports SIGINT to the parent until stopped.
struct SigintReporter {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SigintReporter {
    fn spawn(io: Arc<WorkerIo>, flag: CancellationFlag) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let watch = SigintWatch::new();
        let thread = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("mpdriver-sigint".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        if watch.fired() {
                            flag.cancel();
                            if let Err(e) = io.send(&WorkerResponse::Interrupted) {
                                tracing::debug!("Could not report interrupt: {}", e);
                            }
                            return;
                        }
                        thread::sleep(SIGINT_POLL);
                    }
                })?
        };
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for SigintReporter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Serve `W` over stdin/stdout until the parent says to stop.
pub fn serve<W: Work>() -> Result<()> {
    let io = Arc::new(WorkerIo::new());
    let _sigint = SigintGuard::install()?;
    let flag = CancellationFlag::new();

    let Some((mut work, ctx)) = handshake::<W>(&io, &flag)? else {
        return Ok(());
    };
    let _reporter = SigintReporter::spawn(Arc::clone(&io), flag)?;

    tracing::debug!("Worker {:?} serving '{}'", ctx.slot(), W::NAME);

    loop {
        let command = match io.recv() {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!("Parent closed the pipe: {}", e);
                return Ok(());
            }
        };

        match command {
            WorkerCommand::Run { index, args_json } => {
                let response = run_task(&mut work, &ctx, index, &args_json);
                io.send(&response)?;
            }
            WorkerCommand::Shutdown => {
                io.send(&WorkerResponse::ShuttingDown)?;
                return Ok(());
            }
            WorkerCommand::Ping => io.send(&WorkerResponse::Pong)?,
            other => tracing::warn!("Unexpected command: {:?}", other),
        }
    }
}

/// Answer pings and construct the work object. `None` if the parent left.
fn handshake<W: Work>(
    io: &Arc<WorkerIo>,
    flag: &CancellationFlag,
) -> Result<Option<(W, TaskContext)>> {
    loop {
        let command = match io.recv() {
            Ok(command) => command,
            Err(_) => return Ok(None),
        };

        match command {
            WorkerCommand::Ping => io.send(&WorkerResponse::Pong)?,
            WorkerCommand::Init {
                slot,
                requester,
                init_json,
            } => {
                let progress = ProgressHandle::new(Arc::new(ClientTransport {
                    io: Arc::clone(io),
                    requester,
                }));
                let ctx = TaskContext::new(progress, flag.clone(), Some(slot), io.lock.clone());

                let init = decode_payload::<W::Init>(&init_json).and_then(|init| {
                    W::init(init).map_err(|e| Error::WorkerInit(format!("{:#}", e)))
                });
                return match init {
                    Ok(work) => {
                        io.send(&WorkerResponse::Ready)?;
                        Ok(Some((work, ctx)))
                    }
                    Err(e) => {
                        let message = match e {
                            Error::WorkerInit(message) => message,
                            other => other.to_string(),
                        };
                        io.send(&WorkerResponse::Error {
                            message: message.clone(),
                        })?;
                        Err(Error::WorkerInit(message))
                    }
                };
            }
            WorkerCommand::Shutdown => {
                io.send(&WorkerResponse::ShuttingDown)?;
                return Ok(None);
            }
            other => tracing::warn!("Unexpected command before init: {:?}", other),
        }
    }
}

fn run_task<W: Work>(
    work: &mut W,
    ctx: &TaskContext,
    index: usize,
    args_json: &[u8],
) -> WorkerResponse {
    let args = match decode_payload::<W::Args>(args_json) {
        Ok(args) => args,
        Err(e) => {
            return WorkerResponse::Failed {
                index,
                message: e.to_string(),
            };
        }
    };

    match catch_unwind(AssertUnwindSafe(|| work.run(args, ctx))) {
        Ok(Ok(output)) => match encode_payload(&output) {
            Ok(json) => WorkerResponse::Output { index, json },
            Err(e) => WorkerResponse::Failed {
                index,
                message: e.to_string(),
            },
        },
        Ok(Err(e)) => WorkerResponse::Failed {
            index,
            message: format!("{:#}", e),
        },
        Err(payload) => WorkerResponse::Panic {
            index,
            message: panic_message(payload),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    impl Work for Doubler {
        const NAME: &'static str = "doubler";
        type Init = ();
        type Args = i64;
        type Output = i64;

        fn init(_: ()) -> anyhow::Result<Self> {
            Ok(Doubler)
        }

        fn run(&mut self, args: i64, _ctx: &TaskContext) -> anyhow::Result<i64> {
            if args < 0 {
                anyhow::bail!("negative input {}", args);
            }
            if args == 13 {
                panic!("unlucky");
            }
            Ok(args * 2)
        }
    }

    fn ctx() -> TaskContext {
        TaskContext::new(
            ProgressHandle::local(&crate::config::ProgressConfig {
                target: crate::progress::RenderTarget::Hidden,
                ..Default::default()
            }),
            CancellationFlag::new(),
            Some(0),
            IoLock::new(),
        )
    }

    #[test]
    fn test_run_task_outcomes() {
        let ctx = ctx();
        let mut work = Doubler;

        let ok = run_task(&mut work, &ctx, 0, &encode_payload(&21i64).unwrap());
        assert_eq!(
            ok,
            WorkerResponse::Output {
                index: 0,
                json: b"42".to_vec()
            }
        );

        let failed = run_task(&mut work, &ctx, 1, &encode_payload(&-1i64).unwrap());
        assert!(
            matches!(failed, WorkerResponse::Failed { index: 1, ref message } if message.contains("negative"))
        );

        let panicked = run_task(&mut work, &ctx, 2, &encode_payload(&13i64).unwrap());
        assert_eq!(
            panicked,
            WorkerResponse::Panic {
                index: 2,
                message: "unlucky".into()
            }
        );

        let garbage = run_task(&mut work, &ctx, 3, b"not json");
        assert!(matches!(garbage, WorkerResponse::Failed { index: 3, .. }));
    }

    #[test]
    fn test_requested_ignores_empty() {
        // The test binary is never started as a worker.
        assert!(requested().is_none());
    }
}
