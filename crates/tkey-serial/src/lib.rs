//! Framed serial transport for the Tillitis TKey.
//!
//! The TKey speaks a fixed-size frame protocol over USB CDC: a single header
//! byte followed by a body of 1, 4, 32 or 128 bytes. [`SerialLink`] owns the
//! port, writes request frames and reads back exactly one response frame per
//! request within a read timeout. It also implements the firmware exchange
//! that uploads a device application before any application command can be
//! sent.

mod firmware;
mod header;
mod link;

pub use firmware::{APP_CHUNK_LEN, MAX_APP_SIZE, uss_digest};
pub use header::{CmdLen, Endpoint, FrameHeader};
pub use link::{FRAME_ID, Port, SerialLink, TKEY_PID, TKEY_VID, detect_port};
pub use serialport::SerialPort;

use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("failed to enumerate serial ports: {0}")]
    Detect(#[source] serialport::Error),

    #[error("no TKey found among the available serial ports")]
    NoDevice,

    #[error("frame body must be {expected} bytes, got {actual}")]
    BodyLength { expected: usize, actual: usize },

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("response frame id {actual} does not match request id {expected}")]
    FrameId { expected: u8, actual: u8 },

    #[error("response came from endpoint {actual:?}, expected {expected:?}")]
    WrongEndpoint { expected: Endpoint, actual: Endpoint },

    #[error("device answered NOK to a frame for {0:?}")]
    NotOk(Endpoint),

    #[error("application image must be 1..={max} bytes, got {actual}")]
    AppSize { max: usize, actual: usize },

    #[error("firmware sent response code {actual:#04x}, expected {expected:#04x}")]
    UnexpectedResponse { expected: u8, actual: u8 },

    #[error("firmware sent a {actual:?} frame, expected {expected:?}")]
    UnexpectedLength { expected: CmdLen, actual: CmdLen },

    #[error("firmware rejected command {code:#04x} with status {status}")]
    Status { code: u8, status: u8 },

    #[error("application digest reported by the device does not match the image")]
    DigestMismatch,
}
