use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use serialport::{SerialPort, SerialPortType};
use tracing::{debug, info, trace};
use zeroize::Zeroizing;

use crate::{CmdLen, Endpoint, FrameHeader, LinkError};

/// USB vendor id of the TKey.
pub const TKEY_VID: u16 = 0x1207;
/// USB product id of the TKey.
pub const TKEY_PID: u16 = 0x8887;

/// Frame id used for every request. The device echoes it back.
pub const FRAME_ID: u8 = 2;

/// Byte stream a [`SerialLink`] runs over.
pub trait Port: Read + Write {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

impl Port for Box<dyn SerialPort> {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(timeout).map_err(io::Error::from)
    }
}

/// Returns the name of the first USB serial port that looks like a TKey.
pub fn detect_port() -> Result<String, LinkError> {
    let ports = serialport::available_ports().map_err(LinkError::Detect)?;
    ports
        .into_iter()
        .find(|port| match &port.port_type {
            SerialPortType::UsbPort(usb) => usb.vid == TKEY_VID && usb.pid == TKEY_PID,
            _ => false,
        })
        .map(|port| port.port_name)
        .ok_or(LinkError::NoDevice)
}

pub struct SerialLink<P: Port = Box<dyn SerialPort>> {
    port: P,
    timeout: Duration,
}

impl SerialLink {
    /// Opens `path`, or the auto-detected TKey port when `path` is `None`.
    pub fn open(path: Option<&Path>, speed: u32, timeout: Duration) -> Result<Self, LinkError> {
        let name = match path {
            Some(path) => path.to_string_lossy().into_owned(),
            None => detect_port()?,
        };
        info!("Connecting to TKey on {} ({} baud)", name, speed);
        let port = serialport::new(name.clone(), speed)
            .timeout(timeout)
            .open()
            .map_err(|source| LinkError::Open { port: name, source })?;
        Ok(Self { port, timeout })
    }
}

impl<P: Port> SerialLink<P> {
    /// Wraps an already opened port. `timeout` must be the port's current
    /// read timeout.
    pub fn new(port: P, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    /// Writes one frame. `body` must be exactly `len.bytes()` long and start
    /// with the command code.
    pub fn write_frame(
        &mut self,
        endpoint: Endpoint,
        len: CmdLen,
        body: &[u8],
    ) -> Result<(), LinkError> {
        if body.len() != len.bytes() {
            return Err(LinkError::BodyLength {
                expected: len.bytes(),
                actual: body.len(),
            });
        }
        let header = FrameHeader::new(FRAME_ID, endpoint, len);
        let mut wire = Zeroizing::new(Vec::with_capacity(1 + body.len()));
        wire.push(header.encode());
        wire.extend_from_slice(body);
        trace!(header = wire[0], len = body.len(), "tx frame");
        self.port.write_all(&wire).map_err(LinkError::Write)?;
        self.port.flush().map_err(LinkError::Write)
    }

    /// Reads one frame addressed from `endpoint`, waiting at most `timeout`
    /// for each read. Returns the declared length class and the body.
    ///
    /// The port timeout is set per call and stays in effect until the next
    /// read, so every caller passes the timeout it wants.
    pub fn read_frame(
        &mut self,
        endpoint: Endpoint,
        timeout: Duration,
    ) -> Result<(CmdLen, Zeroizing<Vec<u8>>), LinkError> {
        self.apply_timeout(timeout)?;

        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        let header = FrameHeader::decode(byte[0]);
        trace!(header = byte[0], "rx header");

        let mut body = Zeroizing::new(vec![0u8; header.len.bytes()]);
        self.read_exact(&mut body)?;

        if header.id != FRAME_ID {
            return Err(LinkError::FrameId {
                expected: FRAME_ID,
                actual: header.id,
            });
        }
        if header.endpoint != endpoint {
            return Err(LinkError::WrongEndpoint {
                expected: endpoint,
                actual: header.endpoint,
            });
        }
        if header.not_ok {
            return Err(LinkError::NotOk(endpoint));
        }
        debug!(len = body.len(), "rx frame");
        Ok((header.len, body))
    }

    /// Current read timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn into_inner(self) -> P {
        self.port
    }

    fn apply_timeout(&mut self, timeout: Duration) -> Result<(), LinkError> {
        if timeout != self.timeout {
            self.port
                .set_read_timeout(timeout)
                .map_err(LinkError::Read)?;
            self.timeout = timeout;
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), LinkError> {
        self.port.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => LinkError::Timeout(self.timeout),
            _ => LinkError::Read(e),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory port: reads drain `rx`, writes land in `tx`.
    #[derive(Default)]
    pub(crate) struct MemPort {
        pub rx: VecDeque<u8>,
        pub tx: Vec<u8>,
        pub timeouts: Vec<Duration>,
    }

    impl MemPort {
        pub fn with_rx(bytes: &[u8]) -> Self {
            Self {
                rx: bytes.iter().copied().collect(),
                ..Self::default()
            }
        }
    }

    impl Read for MemPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.rx.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MemPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Port for MemPort {
        fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
            self.timeouts.push(timeout);
            Ok(())
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[test]
    fn test_write_frame_prefixes_header() {
        let mut link = SerialLink::new(MemPort::default(), TIMEOUT);
        link.write_frame(Endpoint::App, CmdLen::Len1, &[0x09]).unwrap();
        assert_eq!(link.into_inner().tx, vec![0x58, 0x09]);
    }

    #[test]
    fn test_write_frame_rejects_wrong_body_length() {
        let mut link = SerialLink::new(MemPort::default(), TIMEOUT);
        let err = link
            .write_frame(Endpoint::App, CmdLen::Len4, &[0x03, 0x00])
            .unwrap_err();
        assert!(matches!(
            err,
            LinkError::BodyLength {
                expected: 4,
                actual: 2
            }
        ));
        assert!(link.into_inner().tx.is_empty());
    }

    #[test]
    fn test_read_frame_returns_body() {
        let mut link = SerialLink::new(MemPort::with_rx(&[0x59, 0x04, 0x00, 0x00, 0x00]), TIMEOUT);
        let (len, body) = link.read_frame(Endpoint::App, TIMEOUT).unwrap();
        assert_eq!(len, CmdLen::Len4);
        assert_eq!(body.as_slice(), &[0x04, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_read_frame_reports_not_ok() {
        let mut link = SerialLink::new(MemPort::with_rx(&[0x5c, 0x00]), TIMEOUT);
        let err = link.read_frame(Endpoint::App, TIMEOUT).unwrap_err();
        assert!(matches!(err, LinkError::NotOk(Endpoint::App)));
    }

    #[test]
    fn test_read_frame_rejects_foreign_frame_id() {
        // id 1 instead of 2
        let mut link = SerialLink::new(MemPort::with_rx(&[0x38, 0x00]), TIMEOUT);
        let err = link.read_frame(Endpoint::App, TIMEOUT).unwrap_err();
        assert!(matches!(
            err,
            LinkError::FrameId {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_short_body_times_out() {
        let mut link = SerialLink::new(MemPort::with_rx(&[0x59, 0x04]), TIMEOUT);
        let err = link.read_frame(Endpoint::App, TIMEOUT).unwrap_err();
        assert!(matches!(err, LinkError::Timeout(t) if t == TIMEOUT));
    }

    #[test]
    fn test_timeout_only_reapplied_when_changed() {
        let long = Duration::from_secs(35);
        let mut port = MemPort::with_rx(&[0x59, 0x04, 0x00, 0x00, 0x00]);
        port.rx.extend([0x59, 0x04, 0x00, 0x00, 0x00]);
        let mut link = SerialLink::new(port, TIMEOUT);
        link.read_frame(Endpoint::App, TIMEOUT).unwrap();
        link.read_frame(Endpoint::App, long).unwrap();
        assert_eq!(link.timeout(), long);
        assert_eq!(link.into_inner().timeouts, vec![long]);
    }

    #[test]
    fn test_next_read_restores_short_timeout() {
        let long = Duration::from_secs(35);
        let mut port = MemPort::with_rx(&[0x59, 0x04, 0x00, 0x00, 0x00]);
        port.rx.extend([0x59, 0x04, 0x00, 0x00, 0x00]);
        let mut link = SerialLink::new(port, TIMEOUT);
        link.read_frame(Endpoint::App, long).unwrap();
        link.read_frame(Endpoint::App, TIMEOUT).unwrap();
        assert_eq!(link.timeout(), TIMEOUT);
        assert_eq!(link.into_inner().timeouts, vec![long, TIMEOUT]);
    }
}
