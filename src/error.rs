//! Error taxonomy for the key derivation pipeline.
//!
//! Each stage has its own enum so callers can tell a flaky cable
//! ([`TransportError`]) from the wrong firmware ([`ProtocolError`]) from a
//! bad command line ([`InputError`]). [`Error`] wraps them all.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tkey_serial::LinkError;

use crate::proto::{Exchange, FrameCapacity};
use crate::session::{SessionState, Step};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid input: {0}")]
    Input(#[from] InputError),

    #[error(transparent)]
    Salt(#[from] SaltError),

    #[error(transparent)]
    Unlock(#[from] UnlockError),

    #[error("failed to write key to {target}: {source}")]
    Output {
        target: String,
        #[source]
        source: io::Error,
    },
}

/// Connection level failures. Always fatal to the session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(#[source] LinkError),

    #[error("failed to load device app: {0}")]
    Load(#[source] LinkError),

    #[error("failed to send frame: {0}")]
    Write(#[source] LinkError),

    #[error("failed to receive frame: {0}")]
    Read(#[source] LinkError),

    #[error("no response from device within {0:?}")]
    Timeout(Duration),

    #[error("connection already closed")]
    Closed,
}

impl TransportError {
    /// Maps a link failure during a request/response exchange.
    pub(crate) fn exchange(err: LinkError) -> Self {
        match err {
            LinkError::Timeout(after) => TransportError::Timeout(after),
            LinkError::Write(_) | LinkError::BodyLength { .. } => TransportError::Write(err),
            other => TransportError::Read(other),
        }
    }
}

/// The device answered, but not the way this client expects.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected device app {name0:?}{name1:?}, is the right app loaded?")]
    UnexpectedIdentity { name0: String, name1: String },

    #[error("device app version {found} is not supported (want {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("device rejected {exchange:?} with status {status}")]
    DeviceRejected { exchange: Exchange, status: u8 },

    #[error("{exchange:?} response too short: {actual} payload bytes, need {expected}")]
    ShortResponse {
        exchange: Exchange,
        expected: usize,
        actual: usize,
    },

    #[error("{exchange:?} response declared a {actual:?} frame, expected {expected:?}")]
    CapacityMismatch {
        exchange: Exchange,
        expected: FrameCapacity,
        actual: FrameCapacity,
    },

    #[error("{exchange:?} response carried code {actual:#04x}, expected {expected:#04x}")]
    UnexpectedResponse {
        exchange: Exchange,
        expected: u8,
        actual: u8,
    },

    #[error("cannot {step:?} while the session is {state:?}")]
    Sequence { step: Step, state: SessionState },
}

/// Rejected before any frame reaches the device.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("challenge must be 1..={max} bytes, got {actual}")]
    ChallengeLength { max: usize, actual: usize },

    #[error("challenge is {actual} bytes but the device was told {announced}")]
    ChallengeSizeMismatch { announced: usize, actual: usize },

    #[error("challenge chunk of {actual} bytes exceeds the {max} byte frame payload")]
    ChunkTooLarge { max: usize, actual: usize },

    #[error("USS password cannot be empty")]
    EmptyPassword,

    #[error("USS salt cannot be empty")]
    EmptySalt,

    #[error("{iterations} PBKDF2 iterations is too low (minimum {minimum})")]
    IterationsTooLow { iterations: u32, minimum: u32 },

    #[error("user supplied secret must be {expected} bytes, got {actual}")]
    UssLength { expected: usize, actual: usize },

    #[error("failed to read {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SaltError {
    #[error("could not determine a system salt, provide one explicitly")]
    NoSaltAvailable,
}

#[derive(Debug, Error)]
pub enum UnlockError {
    #[error("{tool} rejected the derived key for {volume}: {output}")]
    KeyMaterialRejected {
        tool: String,
        volume: String,
        output: String,
    },

    #[error("{tool} failed (exit code {status:?}): {output}")]
    ExternalTool {
        tool: String,
        status: Option<i32>,
        output: String,
    },

    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} timed out after {after:?}")]
    Timeout { tool: String, after: Duration },

    #[error("failed to stage key credential: {0}")]
    Credential(#[source] io::Error),
}
