//! The message catalog for the dispatch protocol.
//!
//! Every exchange is one request followed by exactly one reply. A frame
//! carries a kind header that selects the payload shape: bare
//! acknowledgements, JSON-encoded typed commands/queries/replies, or a file
//! chunk with a binary header and a zero-copy byte tail.

use std::{borrow::Cow, fmt, io};

use crate::{Deserialize, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

/// Commands that act on the receiver and are answered with Ack or NotAck.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    IdentifyUser { username: String, password: String },
    SetModel { model: String },
    SetParameter { name: String, value: String },
    Simulate,
    Abort,
    ExecuteInShell { command: String },
    ClientClosing,
    WorkerFinished { worker_id: u32 },
    WorkerAlive { worker_id: u32 },
    ReleaseRelaySlot { full_id: String },
    ServerAvailable { address: String, description: String, num_slots: u32 },
    ServerClosing { address: String },
}

/// Queries, each answered by exactly one `Reply` variant or NotAck.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    WorkerStatus,
    ServerStatus,
    Parameter { name: String },
    Results { filter: String },
    Messages,
    ShellOutput,
    File { path: String, offset: u64 },
    ServerMachines { count: u32, max_benchmark_secs: f64 },
    RelaySlot { base_id: String, port: i32 },
    ServerSlots { threads: u32, userid: String },
}

/// Typed replies. The variant answering each query is fixed by the catalog.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    WorkerStatus(WorkerStatus),
    ServerStatus(ServerStatus),
    Parameter { value: String },
    Results { variables: Vec<ResultVariable> },
    Messages { messages: Vec<LogMessage> },
    ShellOutput { output: String },
    ServerMachines { machines: Vec<MachineInfo> },
    RelaySlot { full_id: String },
    ServerSlots { port_offset: u16 },
}

/// Full snapshot of a worker's externally visible state. Always taken
/// atomically on the worker side, never partially updated.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct WorkerStatus {
    pub model_loaded: bool,
    pub simulation_in_progress: bool,
    pub simulation_success: bool,
    pub simulation_finished: bool,
    pub current_simulation_time: f64,
    pub simulation_progress: f64,
    pub shell_in_progress: bool,
    pub shell_exit_ok: bool,
}

#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct ServerStatus {
    pub total_slots: u32,
    pub free_slots: u32,
    pub ready: bool,
    pub users: Vec<String>,
}

/// One logged variable of a finished simulation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResultVariable {
    pub name: String,
    pub alias: String,
    pub quantity: String,
    pub unit: String,
    pub data: Vec<f64>,
}

/// A diagnostic message queued by the simulation engine.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogMessage {
    pub kind: String,
    pub tag: String,
    pub text: String,
}

/// One machine known to the address directory.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MachineInfo {
    pub address: String,
    pub relay_base_id: String,
    pub description: String,
    pub num_slots: u32,
    pub benchmark_time: f64,
}

/// One piece of a larger file. `path` is relative to the receiver's
/// destination directory and doubles as the transfer identifier. The final
/// chunk carries `is_last = true`; there is no expected-total-size field.
#[derive(Clone, PartialEq)]
pub struct FileChunk<'a> {
    pub path: Cow<'a, str>,
    pub is_last: bool,
    pub data: Cow<'a, [u8]>,
}

impl fmt::Debug for FileChunk<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileChunk")
            .field("path", &self.path)
            .field("is_last", &self.is_last)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Message<'a> {
    Ack,
    NotAck(Cow<'a, str>),
    Command(Command),
    Query(Query),
    Reply(Reply),
    FileChunk(FileChunk<'a>),
}

impl Message<'_> {
    /// Builds a NotAck carrying a human-readable reason.
    pub fn not_ack(reason: impl Into<String>) -> Message<'static> {
        Message::NotAck(Cow::Owned(reason.into()))
    }

    /// Short label used when logging unexpected messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ack => "ack",
            Message::NotAck(_) => "not_ack",
            Message::Command(_) => "command",
            Message::Query(_) => "query",
            Message::Reply(_) => "reply",
            Message::FileChunk(_) => "file_chunk",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {size} bytes is smaller than the {HEADER_SIZE} byte kind header"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("received an invalid message kind {kind}"),
        ))
    }
}

impl<'a> Serialize<'a> for Message<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Message::Ack => {
                buf.extend_from_slice(&(0 as Header).to_be_bytes());
                Ok(None)
            }
            Message::NotAck(reason) => {
                buf.extend_from_slice(&(1 as Header).to_be_bytes());
                Ok(Some(reason.as_bytes()))
            }
            Message::Command(cmd) => {
                buf.extend_from_slice(&(2 as Header).to_be_bytes());
                serde_json::to_writer(buf, cmd)?;
                Ok(None)
            }
            Message::Query(query) => {
                buf.extend_from_slice(&(3 as Header).to_be_bytes());
                serde_json::to_writer(buf, query)?;
                Ok(None)
            }
            Message::Reply(reply) => {
                buf.extend_from_slice(&(4 as Header).to_be_bytes());
                serde_json::to_writer(buf, reply)?;
                Ok(None)
            }
            Message::FileChunk(chunk) => {
                // The path length travels in a u16; anything longer would be
                // silently truncated and corrupt the frame.
                let path_len: u16 = chunk.path.len().try_into().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!(
                            "file path of {} bytes does not fit the chunk header",
                            chunk.path.len()
                        ),
                    )
                })?;
                buf.extend_from_slice(&(5 as Header).to_be_bytes());
                buf.extend_from_slice(&path_len.to_be_bytes());
                buf.extend_from_slice(chunk.path.as_bytes());
                buf.push(chunk.is_last as u8);
                Ok(Some(&chunk.data))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Message<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);

        // split_at guarantees the slice is exactly HEADER_SIZE long.
        let kind = Header::from_be_bytes(kind_buf.try_into().unwrap());

        match kind {
            0 => Ok(Self::Ack),
            1 => {
                let reason = str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                Ok(Self::NotAck(Cow::Borrowed(reason)))
            }
            2 => Ok(Self::Command(serde_json::from_slice(rest)?)),
            3 => Ok(Self::Query(serde_json::from_slice(rest)?)),
            4 => Ok(Self::Reply(serde_json::from_slice(rest)?)),
            5 => {
                if rest.len() < 3 {
                    return Self::buf_is_too_small(buf.len());
                }
                let path_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                if rest.len() < 2 + path_len + 1 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "file chunk header exceeds the frame",
                    ));
                }
                let path = str::from_utf8(&rest[2..2 + path_len])
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                let is_last = rest[2 + path_len] != 0;
                let data = &rest[2 + path_len + 1..];

                Ok(Self::FileChunk(FileChunk {
                    path: Cow::Borrowed(path),
                    is_last,
                    data: Cow::Borrowed(data),
                }))
            }
            kind => Self::invalid_kind(kind),
        }
    }
}
