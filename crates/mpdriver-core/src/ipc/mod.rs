//! Inter-process communication with worker processes.
//!
//! The protocol module defines the framed messages; the pool module
//! spawns workers and pumps their replies on the executor side.

pub mod protocol;
mod pool;

pub use pool::{
    SpawnParams, TaskOutcome, WorkerEvent, WorkerKillHandle, WorkerProcess, find_worker_program,
};
pub use protocol::{
    WorkerCommand, WorkerResponse, decode_payload, encode_payload, read_message, write_message,
};
