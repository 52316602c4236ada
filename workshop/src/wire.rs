//! Length-delimited bincode framing for process-station connections.
//!
//! The stream is a sequence of `(length, payload)` frames; the length is a
//! big-endian `u64` and the payload a bincode-encoded [`Frame`]. Futures do
//! not cross the boundary: a mail travels with a future *id*, and the side
//! that assigned the id fulfils the original future when the matching
//! [`Frame::Completion`] comes back.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::WorkError;
use crate::instruction::Instruction;
use crate::mail::{Mail, MailMeta};
use crate::value::{Args, Value};
use crate::worker::WorkerSpawnSpec;

/// Hard cap on one frame, to fail fast on a corrupted length prefix.
const MAX_FRAME_BYTES: u64 = 64 << 20;

/// A mail as it travels on the wire: the future handle replaced by its id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMail {
    /// The instruction to run.
    pub instruction: Instruction,
    /// Arguments.
    pub args: Args,
    /// Id of the sender-side future awaiting the result, if submitted.
    pub future: Option<u64>,
    /// Routing metadata.
    pub meta: MailMeta,
}

impl WireMail {
    /// Strips a local mail of its future handle, substituting `future_id`.
    pub fn from_mail(mail: &Mail, future_id: Option<u64>) -> Self {
        WireMail {
            instruction: mail.instruction.clone(),
            args: mail.args.clone(),
            future: future_id,
            meta: mail.meta.clone(),
        }
    }
}

/// Everything that may cross a process-station connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Frame {
    /// Parent → child: build this worker and start the loop.
    Spawn(WorkerSpawnSpec),
    /// Child → parent: the worker is constructed and the loop is live.
    Hello {
        /// Class id of the hosted worker.
        class: String,
    },
    /// A routed mail, in either direction.
    Mail(WireMail),
    /// A mail emitted from inside the child's worker, for the supervisor.
    Emitted(WireMail),
    /// Resolution of the future with the given id.
    Completion {
        /// The id assigned by the side that sent the mail.
        future: u64,
        /// Result or failure of the instruction.
        outcome: Result<Value, WorkError>,
    },
    /// A fatal worker failure on the child side.
    Failure(WorkError),
    /// Shut the connection down after draining.
    Terminate,
}

/// Writes one frame and flushes.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), WorkError> {
    let payload = bincode::serialize(frame).map_err(|error| WorkError::Wire(error.to_string()))?;
    writer
        .write_u64::<BigEndian>(payload.len() as u64)
        .and_then(|()| writer.write_all(&payload))
        .and_then(|()| writer.flush())
        .map_err(|error| WorkError::Wire(error.to_string()))
}

/// Reads one frame, blocking until a whole one is available.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, WorkError> {
    let length = reader
        .read_u64::<BigEndian>()
        .map_err(|error| WorkError::Wire(error.to_string()))?;
    if length > MAX_FRAME_BYTES {
        return Err(WorkError::Wire(format!("oversized frame: {length} bytes")));
    }
    let mut payload = vec![0u8; length as usize];
    reader
        .read_exact(&mut payload)
        .map_err(|error| WorkError::Wire(error.to_string()))?;
    bincode::deserialize(&payload).map_err(|error| WorkError::Wire(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip() {
        let mut buffer = Vec::new();
        let mail = WireMail {
            instruction: Instruction::method("one", "greet"),
            args: Args::positional([Value::from("hi")]).with_kw("n", Value::Int(2)),
            future: Some(7),
            meta: MailMeta::default(),
        };
        write_frame(&mut buffer, &Frame::Mail(mail)).unwrap();
        write_frame(
            &mut buffer,
            &Frame::Completion {
                future: 7,
                outcome: Ok(Value::from("done")),
            },
        )
        .unwrap();

        let mut cursor = std::io::Cursor::new(buffer);
        match read_frame(&mut cursor).unwrap() {
            Frame::Mail(mail) => {
                assert_eq!(mail.future, Some(7));
                assert_eq!(mail.instruction, Instruction::method("one", "greet"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
        match read_frame(&mut cursor).unwrap() {
            Frame::Completion { future, outcome } => {
                assert_eq!(future, 7);
                assert_eq!(outcome, Ok(Value::from("done")));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn corrupted_length_is_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&u64::MAX.to_be_bytes());
        let mut cursor = std::io::Cursor::new(buffer);
        assert!(read_frame(&mut cursor).is_err());
    }
}
