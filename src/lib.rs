//! Distributed word count over plain TCP sockets.
//!
//! One master drives a fixed roster of workers through a
//! map/shuffle/reduce pipeline: a handshake distributes identities and the
//! roster, then each stage is a command broadcast followed by a barrier on
//! the workers' reported phases. Words are hash-partitioned during shuffle
//! so every occurrence of a word is reduced by exactly one worker.

pub mod deploy;
pub mod listener;
pub mod master;
pub mod message;
pub mod phase;
pub mod results;
pub mod shuffle;
pub mod worker;

/// Default port a worker receives commands on.
pub const WORKER_STATUS_PORT: u16 = 8889;
/// Default port a worker receives shuffle payloads on.
pub const WORKER_SHUFFLE_PORT: u16 = 8888;
/// Default port the master receives status reports on.
pub const MASTER_STATUS_PORT: u16 = 9999;
/// Default port the master receives final counts on.
pub const MASTER_RESULT_PORT: u16 = 8888;
