use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::phase::Phase;

/// Failure to move one message across one connection.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("message stream i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The peer connected and closed without sending anything. Listeners
    /// use such connections to wake a blocked accept, so this is kept
    /// apart from real decode failures.
    #[error("connection closed without a message")]
    Empty,
}

/// Order issued by the master to a worker. The payload of each variant is
/// fixed by the type system; a wrong arity cannot be constructed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Where the worker must report its statuses.
    MasterInfo { address: String, status_port: u16 },
    /// The worker's own identity, shard assignment and domain suffix.
    SelfInfo {
        worker_id: String,
        has_shard: bool,
        domain: String,
    },
    /// Full roster, in the order every node must use for hash routing.
    WorkerList { workers: Vec<String> },
    Interconnect,
    ShuffleOn,
    Map,
    Reduce,
    /// Where the worker must deliver its aggregated counts.
    SendResults { result_port: u16 },
}

/// Phase change notification from a worker. The sender travels beside the
/// phase, never inside it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub sender: String,
    pub phase: Phase,
}

/// One word and its count. Count 1 during shuffle, the aggregated total
/// when delivered to the master as a result.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WordRecord {
    pub word: String,
    pub count: u64,
}

impl WordRecord {
    /// A single occurrence, as routed during shuffle.
    pub fn single(word: impl Into<String>) -> Self {
        WordRecord {
            word: word.into(),
            count: 1,
        }
    }
}

/// Serialize one message. JSON keeps the variant tag first, so a decoder
/// recovers the tag before interpreting the payload.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decode one message from the bytes of a whole connection.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Send exactly one message: connect, write, flush, close. Every exchange
/// in the protocol uses its own connection; cheap for control traffic,
/// wasteful for shuffle volume, but uniform.
pub fn send_message<A: ToSocketAddrs, T: Serialize>(addr: A, msg: &T) -> Result<(), CodecError> {
    let mut stream = TcpStream::connect(addr)?;
    let bytes = encode(msg)?;
    stream.write_all(&bytes)?;
    stream.flush()?;
    stream.shutdown(Shutdown::Write)?;
    Ok(())
}

/// Read exactly one message: consume the connection to EOF, then decode.
pub fn read_message<T: DeserializeOwned>(stream: &mut TcpStream) -> Result<T, CodecError> {
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes)?;
    decode(&bytes)
}
