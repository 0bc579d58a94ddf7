//! IPC protocol between the executor and its worker processes.
//!
//! Uses length-prefixed rkyv messages over the worker's stdin/stdout.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message. Task
//! arguments, init values and outputs travel as opaque JSON payloads.

use std::io::{Read, Write};

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::progress::{ProgressRequest, ProgressResponse, RequesterId};

/// Largest frame either side accepts.
pub const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

/// Command sent from the executor to a worker.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Liveness check right after spawn.
    Ping,

    /// Construct the work object for this worker slot.
    Init {
        /// Slot index in the pool.
        slot: usize,
        /// Requester id the worker's progress handle reports as.
        requester: RequesterId,
        /// JSON-encoded `Work::Init`.
        init_json: Vec<u8>,
    },

    /// Run one task.
    Run {
        /// Submission index of the task.
        index: usize,
        /// JSON-encoded `Work::Args`.
        args_json: Vec<u8>,
    },

    /// Answer to a `WorkerResponse::Progress` request.
    ProgressReply(ProgressResponse),

    /// The coordinator could not answer a `WorkerResponse::Progress` request.
    ProgressLost(String),

    /// Exit after acknowledging.
    Shutdown,
}

/// Message sent from a worker to the executor.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Response to Ping.
    Pong,

    /// Work object constructed.
    Ready,

    /// Construction failed.
    Error { message: String },

    /// Task finished with a JSON-encoded `Work::Output`.
    Output { index: usize, json: Vec<u8> },

    /// Task returned an error.
    Failed { index: usize, message: String },

    /// Task panicked.
    Panic { index: usize, message: String },

    /// Progress operation to forward to the coordinator.
    Progress(ProgressRequest),

    /// The worker received SIGINT.
    Interrupted,

    /// Acknowledgement of Shutdown.
    ShuttingDown,
}

/// Write a message to a writer using length-prefixed rkyv encoding.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(Error::Ipc(format!(
            "IPC message too large to send: {} bytes",
            bytes.len()
        )));
    }

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read a message from a reader using length-prefixed rkyv encoding.
///
/// # Safety
///
/// Uses unchecked deserialization. Only safe when the other end is one
/// of our own processes.
pub fn read_message<R: Read, T>(reader: &mut R) -> Result<T>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message length: {}", e)))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    let mut bytes = rkyv::util::AlignedVec::<16>::with_capacity(len);
    bytes.resize(len, 0);
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    // SAFETY: frames only ever come from our own executor or workers.
    let message = unsafe { rkyv::from_bytes_unchecked::<T, rkyv::rancor::Error>(&bytes) }
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))?;

    Ok(message)
}

/// Encode a payload as JSON for a `Run`, `Init` or `Output` message.
pub fn encode_payload<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| Error::Serialization(format!("Failed to encode payload: {}", e)))
}

/// Decode a JSON payload.
pub fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Serialization(format!("Failed to decode payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{BarId, BarOptions, ProgressOp};
    use std::io::Cursor;

    #[test]
    fn test_run_command_roundtrip() {
        let cmd = WorkerCommand::Run {
            index: 7,
            args_json: encode_payload(&("clip.mp4", 3)).unwrap(),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &cmd).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: WorkerCommand = read_message(&mut cursor).unwrap();

        match decoded {
            WorkerCommand::Run { index, args_json } => {
                assert_eq!(index, 7);
                let args: (String, u32) = decode_payload(&args_json).unwrap();
                assert_eq!(args, ("clip.mp4".to_string(), 3));
            }
            _ => panic!("Wrong command type"),
        }
    }

    #[test]
    fn test_progress_request_roundtrip() {
        let resp = WorkerResponse::Progress(ProgressRequest {
            requester: RequesterId(4),
            bar: None,
            op: ProgressOp::Create(BarOptions::new("frames").total(120).priority(0.0)),
        });

        let mut buf = Vec::new();
        write_message(&mut buf, &resp).unwrap();
        let decoded: WorkerResponse = read_message(&mut Cursor::new(buf)).unwrap();

        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_consecutive_messages() {
        let mut buf = Vec::new();
        write_message(&mut buf, &WorkerCommand::Ping).unwrap();
        write_message(
            &mut buf,
            &WorkerCommand::ProgressReply(ProgressResponse::Created(BarId(9))),
        )
        .unwrap();
        write_message(&mut buf, &WorkerCommand::Shutdown).unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(
            read_message::<_, WorkerCommand>(&mut cursor).unwrap(),
            WorkerCommand::Ping
        );
        assert_eq!(
            read_message::<_, WorkerCommand>(&mut cursor).unwrap(),
            WorkerCommand::ProgressReply(ProgressResponse::Created(BarId(9)))
        );
        assert_eq!(
            read_message::<_, WorkerCommand>(&mut cursor).unwrap(),
            WorkerCommand::Shutdown
        );
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = ((MAX_MESSAGE_LEN + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0; 8]);

        let result: Result<WorkerResponse> = read_message(&mut Cursor::new(buf));
        assert!(matches!(result, Err(Error::Ipc(_))));
    }

    #[test]
    fn test_truncated_stream_is_ipc_error() {
        let mut buf = Vec::new();
        write_message(&mut buf, &WorkerResponse::Pong).unwrap();
        buf.truncate(buf.len() - 1);

        let result: Result<WorkerResponse> = read_message(&mut Cursor::new(buf));
        assert!(matches!(result, Err(Error::Ipc(_))));
    }
}
