//! The seam between the session logic and the wire.
//!
//! [`DeviceSession`](crate::session::DeviceSession) only talks to a
//! [`Transport`]; the real one is [`SerialTransport`], tests script their
//! own.

use std::time::Duration;

use secrecy::ExposeSecret;
use tkey_serial::{CmdLen, Endpoint, Port, SerialLink, SerialPort};
use tracing::{debug, info, instrument};

use crate::config::{ConnectionConfig, Timeouts};
use crate::error::TransportError;
use crate::proto::{Descriptor, Frame, FrameCapacity};
use crate::secret::Uss;

pub trait Transport {
    /// Loads the device application, optionally bound to a USS. Only
    /// valid while the device is still in firmware mode.
    fn load_application(&mut self, image: &[u8], uss: Option<&Uss>)
    -> Result<(), TransportError>;

    /// Sends one request frame to the device app.
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Waits up to `timeout` for the response described by `expected`.
    /// The returned frame is not validated against `expected`.
    fn receive(&mut self, expected: Descriptor, timeout: Duration)
    -> Result<Frame, TransportError>;

    /// Releases the connection. Must be idempotent.
    fn close(&mut self);
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn load_application(
        &mut self,
        image: &[u8],
        uss: Option<&Uss>,
    ) -> Result<(), TransportError> {
        (**self).load_application(image, uss)
    }

    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        (**self).send(frame)
    }

    fn receive(
        &mut self,
        expected: Descriptor,
        timeout: Duration,
    ) -> Result<Frame, TransportError> {
        (**self).receive(expected, timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

fn cmd_len(capacity: FrameCapacity) -> CmdLen {
    match capacity {
        FrameCapacity::One => CmdLen::Len1,
        FrameCapacity::Four => CmdLen::Len4,
        FrameCapacity::ThirtyTwo => CmdLen::Len32,
        FrameCapacity::OneTwentyEight => CmdLen::Len128,
    }
}

fn capacity(len: CmdLen) -> FrameCapacity {
    match len {
        CmdLen::Len1 => FrameCapacity::One,
        CmdLen::Len4 => FrameCapacity::Four,
        CmdLen::Len32 => FrameCapacity::ThirtyTwo,
        CmdLen::Len128 => FrameCapacity::OneTwentyEight,
    }
}

/// A TKey on a serial port.
pub struct SerialTransport<P: Port = Box<dyn SerialPort>> {
    link: Option<SerialLink<P>>,
}

impl SerialTransport {
    #[instrument(level = "debug", skip(timeouts))]
    pub fn open(config: &ConnectionConfig, timeouts: &Timeouts) -> Result<Self, TransportError> {
        let link = SerialLink::open(config.port.as_deref(), config.speed, timeouts.default_read)
            .map_err(TransportError::Connect)?;
        Ok(Self::from_link(link))
    }
}

impl<P: Port> SerialTransport<P> {
    pub fn from_link(link: SerialLink<P>) -> Self {
        Self { link: Some(link) }
    }

    fn link(&mut self) -> Result<&mut SerialLink<P>, TransportError> {
        self.link.as_mut().ok_or(TransportError::Closed)
    }
}

impl<P: Port> Transport for SerialTransport<P> {
    fn load_application(
        &mut self,
        image: &[u8],
        uss: Option<&Uss>,
    ) -> Result<(), TransportError> {
        info!("Loading device app ({} bytes, uss: {})", image.len(), uss.is_some());
        let uss = uss.map(|uss| uss.expose_secret().as_slice());
        self.link()?
            .load_app(image, uss)
            .map_err(TransportError::Load)
    }

    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.link()?
            .write_frame(Endpoint::App, cmd_len(frame.capacity()), frame.as_bytes())
            .map_err(TransportError::exchange)
    }

    fn receive(
        &mut self,
        expected: Descriptor,
        timeout: Duration,
    ) -> Result<Frame, TransportError> {
        debug!(exchange = ?expected.exchange, ?timeout, "awaiting response");
        let (len, body) = self
            .link()?
            .read_frame(Endpoint::App, timeout)
            .map_err(TransportError::exchange)?;
        Ok(Frame::from_wire(capacity(len), body))
    }

    fn close(&mut self) {
        if self.link.take().is_some() {
            debug!("Closed TKey connection");
        }
    }
}
