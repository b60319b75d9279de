//! The TKey-LUKS application protocol.
//!
//! Four request/response exchanges, each with a fixed code and frame
//! capacity per direction. A frame body always starts with its code; the
//! rest is payload. The header in front of the body belongs to the
//! transport and never shows up here.

use std::fmt;

use zeroize::Zeroizing;

use crate::error::{InputError, ProtocolError};
use crate::secret::{DERIVED_KEY_LEN, DerivedKey};

/// First half of the expected application name.
pub const APP_NAME0: &[u8; 4] = b"tk1 ";
/// Second half of the expected application name.
pub const APP_NAME1: &[u8; 4] = b"luks";
/// The only device app version this client understands.
pub const SUPPORTED_VERSION: u32 = 1;

pub const STATUS_OK: u8 = 0;

/// Largest challenge the device app accepts.
pub const MAX_CHALLENGE_LEN: usize = 256;
/// Challenge bytes carried by one load-challenge frame: a 128 byte body
/// minus the command code.
pub const CHUNK_LEN: usize = 127;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameCapacity {
    One,
    Four,
    ThirtyTwo,
    OneTwentyEight,
}

impl FrameCapacity {
    pub const fn bytes(self) -> usize {
        match self {
            FrameCapacity::One => 1,
            FrameCapacity::Four => 4,
            FrameCapacity::ThirtyTwo => 32,
            FrameCapacity::OneTwentyEight => 128,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    ToDevice,
    FromDevice,
}

/// One command/response pair of the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Exchange {
    /// Ask the running app for its name and version.
    NameVersion,
    /// Announce the total challenge length.
    SetChallenge,
    /// Stream one chunk of the challenge.
    LoadChallenge,
    /// Derive the key from the loaded challenge. May wait for a touch.
    DeriveKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub exchange: Exchange,
    pub code: u8,
    pub direction: Direction,
    pub capacity: FrameCapacity,
}

impl Exchange {
    pub const ALL: [Exchange; 4] = [
        Exchange::NameVersion,
        Exchange::SetChallenge,
        Exchange::LoadChallenge,
        Exchange::DeriveKey,
    ];

    pub const fn command(self) -> Descriptor {
        let (code, capacity) = match self {
            Exchange::NameVersion => (0x09, FrameCapacity::One),
            Exchange::SetChallenge => (0x03, FrameCapacity::ThirtyTwo),
            Exchange::LoadChallenge => (0x05, FrameCapacity::OneTwentyEight),
            Exchange::DeriveKey => (0x07, FrameCapacity::One),
        };
        Descriptor {
            exchange: self,
            code,
            direction: Direction::ToDevice,
            capacity,
        }
    }

    pub const fn response(self) -> Descriptor {
        let (code, capacity) = match self {
            Exchange::NameVersion => (0x0a, FrameCapacity::ThirtyTwo),
            Exchange::SetChallenge => (0x04, FrameCapacity::Four),
            Exchange::LoadChallenge => (0x06, FrameCapacity::Four),
            Exchange::DeriveKey => (0x08, FrameCapacity::OneTwentyEight),
        };
        Descriptor {
            exchange: self,
            code,
            direction: Direction::FromDevice,
            capacity,
        }
    }
}

/// Every descriptor of the protocol, commands and responses interleaved.
pub const CATALOGUE: [Descriptor; 8] = [
    Exchange::NameVersion.command(),
    Exchange::NameVersion.response(),
    Exchange::SetChallenge.command(),
    Exchange::SetChallenge.response(),
    Exchange::LoadChallenge.command(),
    Exchange::LoadChallenge.response(),
    Exchange::DeriveKey.command(),
    Exchange::DeriveKey.response(),
];

/// A frame body as handed to or received from the transport.
///
/// The buffer is wiped on drop since derive-key responses carry the key.
pub struct Frame {
    capacity: FrameCapacity,
    bytes: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("capacity", &self.capacity)
            .field("code", &self.code())
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Frame {
    /// A zero-filled request frame with the descriptor's code in place.
    pub fn allocate(descriptor: Descriptor) -> Self {
        let mut bytes = Zeroizing::new(vec![0u8; descriptor.capacity.bytes()]);
        bytes[0] = descriptor.code;
        Self {
            capacity: descriptor.capacity,
            bytes,
        }
    }

    /// A frame as read off the wire. `bytes` may be shorter than the
    /// declared capacity if the transport came up short.
    pub fn from_wire(capacity: FrameCapacity, bytes: Zeroizing<Vec<u8>>) -> Self {
        Self { capacity, bytes }
    }

    pub fn capacity(&self) -> FrameCapacity {
        self.capacity
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn code(&self) -> Option<u8> {
        self.bytes.first().copied()
    }

    /// Everything after the code byte.
    pub fn payload(&self) -> &[u8] {
        self.bytes.get(1..).unwrap_or(&[])
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[1..]
    }
}

/// A request the client can send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request<'a> {
    NameVersion,
    SetChallenge { size: u32 },
    LoadChallenge { chunk: &'a [u8] },
    DeriveKey,
}

impl Request<'_> {
    pub fn exchange(&self) -> Exchange {
        match self {
            Request::NameVersion => Exchange::NameVersion,
            Request::SetChallenge { .. } => Exchange::SetChallenge,
            Request::LoadChallenge { .. } => Exchange::LoadChallenge,
            Request::DeriveKey => Exchange::DeriveKey,
        }
    }

    pub fn encode(&self) -> Result<Frame, InputError> {
        let mut frame = Frame::allocate(self.exchange().command());
        match self {
            Request::NameVersion | Request::DeriveKey => {}
            Request::SetChallenge { size } => {
                frame.payload_mut()[..4].copy_from_slice(&size.to_le_bytes());
            }
            Request::LoadChallenge { chunk } => {
                if chunk.len() > CHUNK_LEN {
                    return Err(InputError::ChunkTooLarge {
                        max: CHUNK_LEN,
                        actual: chunk.len(),
                    });
                }
                frame.payload_mut()[..chunk.len()].copy_from_slice(chunk);
            }
        }
        Ok(frame)
    }
}

/// Splits a challenge into the pieces carried by successive
/// load-challenge frames.
pub fn challenge_chunks(challenge: &[u8]) -> std::slice::Chunks<'_, u8> {
    challenge.chunks(CHUNK_LEN)
}

/// Name and version reported by the device app.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppIdentity {
    pub name0: [u8; 4],
    pub name1: [u8; 4],
    pub version: u32,
}

impl AppIdentity {
    pub fn name(&self) -> String {
        format!(
            "{}{}",
            String::from_utf8_lossy(&self.name0),
            String::from_utf8_lossy(&self.name1)
        )
    }
}

/// Validates capacity and code of a response before any field is read.
fn check_response(exchange: Exchange, frame: &Frame) -> Result<&[u8], ProtocolError> {
    let expected = exchange.response();
    if frame.capacity() != expected.capacity {
        return Err(ProtocolError::CapacityMismatch {
            exchange,
            expected: expected.capacity,
            actual: frame.capacity(),
        });
    }
    let code = frame.code().ok_or(ProtocolError::ShortResponse {
        exchange,
        expected: 1,
        actual: 0,
    })?;
    if code != expected.code {
        return Err(ProtocolError::UnexpectedResponse {
            exchange,
            expected: expected.code,
            actual: code,
        });
    }
    Ok(frame.payload())
}

fn require(exchange: Exchange, payload: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if payload.len() < expected {
        return Err(ProtocolError::ShortResponse {
            exchange,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

/// Decodes a name/version response and checks it against the expected
/// application.
pub fn decode_identity(frame: &Frame) -> Result<AppIdentity, ProtocolError> {
    let exchange = Exchange::NameVersion;
    let payload = check_response(exchange, frame)?;
    require(exchange, payload, 12)?;

    let mut identity = AppIdentity {
        name0: [0; 4],
        name1: [0; 4],
        version: 0,
    };
    identity.name0.copy_from_slice(&payload[0..4]);
    identity.name1.copy_from_slice(&payload[4..8]);
    let mut version = [0u8; 4];
    version.copy_from_slice(&payload[8..12]);
    identity.version = u32::from_le_bytes(version);

    if &identity.name0 != APP_NAME0 || &identity.name1 != APP_NAME1 {
        return Err(ProtocolError::UnexpectedIdentity {
            name0: String::from_utf8_lossy(&identity.name0).into_owned(),
            name1: String::from_utf8_lossy(&identity.name1).into_owned(),
        });
    }
    if identity.version != SUPPORTED_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            found: identity.version,
            supported: SUPPORTED_VERSION,
        });
    }
    Ok(identity)
}

/// Decodes a bare status response (set-challenge, load-challenge).
pub fn decode_status(exchange: Exchange, frame: &Frame) -> Result<(), ProtocolError> {
    let payload = check_response(exchange, frame)?;
    require(exchange, payload, 1)?;
    match payload[0] {
        STATUS_OK => Ok(()),
        status => Err(ProtocolError::DeviceRejected { exchange, status }),
    }
}

/// Decodes a derive-key response: status byte followed by the key.
pub fn decode_derived_key(frame: &Frame) -> Result<DerivedKey, ProtocolError> {
    let exchange = Exchange::DeriveKey;
    let payload = check_response(exchange, frame)?;
    require(exchange, payload, 1)?;
    if payload[0] != STATUS_OK {
        return Err(ProtocolError::DeviceRejected {
            exchange,
            status: payload[0],
        });
    }
    require(exchange, payload, 1 + DERIVED_KEY_LEN)?;
    Ok(DerivedKey::from_slice(&payload[1..1 + DERIVED_KEY_LEN]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use secrecy::ExposeSecret;

    fn response(exchange: Exchange, payload: &[u8]) -> Frame {
        let mut frame = Frame::allocate(exchange.response());
        frame.payload_mut()[..payload.len()].copy_from_slice(payload);
        frame
    }

    fn identity_payload(name0: &[u8; 4], name1: &[u8; 4], version: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(name0);
        payload.extend_from_slice(name1);
        payload.extend_from_slice(&version.to_le_bytes());
        payload
    }

    #[test]
    fn test_catalogue_is_closed_and_consistent() {
        assert_eq!(CATALOGUE.len(), 8);
        for exchange in Exchange::ALL {
            let command = exchange.command();
            let response = exchange.response();
            assert_eq!(command.direction, Direction::ToDevice);
            assert_eq!(response.direction, Direction::FromDevice);
            // responses are always the command code plus one
            assert_eq!(response.code, command.code + 1);
        }
        let mut codes: Vec<u8> = CATALOGUE.iter().map(|d| d.code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), 8);
    }

    #[test]
    fn test_set_challenge_encoding() {
        let frame = Request::SetChallenge { size: 19 }.encode().unwrap();
        assert_eq!(frame.capacity(), FrameCapacity::ThirtyTwo);
        assert_eq!(frame.code(), Some(0x03));
        assert_eq!(&frame.payload()[..4], &[19, 0, 0, 0]);
        assert!(frame.payload()[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_load_challenge_pads_short_chunk() {
        let frame = Request::LoadChallenge { chunk: b"abc" }.encode().unwrap();
        assert_eq!(frame.as_bytes().len(), 128);
        assert_eq!(&frame.payload()[..3], b"abc");
        assert!(frame.payload()[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_load_challenge_rejects_oversized_chunk() {
        let chunk = [0u8; CHUNK_LEN + 1];
        let err = Request::LoadChallenge { chunk: &chunk }.encode().unwrap_err();
        assert!(matches!(
            err,
            InputError::ChunkTooLarge {
                max: CHUNK_LEN,
                actual
            } if actual == CHUNK_LEN + 1
        ));
    }

    #[test]
    fn test_payloadless_requests() {
        for request in [Request::NameVersion, Request::DeriveKey] {
            let frame = request.encode().unwrap();
            assert_eq!(frame.as_bytes(), &[request.exchange().command().code]);
            assert!(frame.payload().is_empty());
        }
    }

    #[test]
    fn test_identity_accepts_expected_app() {
        let frame = response(
            Exchange::NameVersion,
            &identity_payload(APP_NAME0, APP_NAME1, SUPPORTED_VERSION),
        );
        let identity = decode_identity(&frame).unwrap();
        assert_eq!(identity.name(), "tk1 luks");
        assert_eq!(identity.version, 1);
    }

    #[test]
    fn test_identity_rejects_other_app() {
        let frame = response(
            Exchange::NameVersion,
            &identity_payload(b"tk1 ", b"sign", SUPPORTED_VERSION),
        );
        assert!(matches!(
            decode_identity(&frame),
            Err(ProtocolError::UnexpectedIdentity { name1, .. }) if name1 == "sign"
        ));

        let frame = response(
            Exchange::NameVersion,
            &identity_payload(b"tk2 ", APP_NAME1, SUPPORTED_VERSION),
        );
        assert!(matches!(
            decode_identity(&frame),
            Err(ProtocolError::UnexpectedIdentity { .. })
        ));
    }

    #[test]
    fn test_identity_rejects_other_versions() {
        for version in [0, 2, 0x0100, u32::MAX] {
            let frame = response(
                Exchange::NameVersion,
                &identity_payload(APP_NAME0, APP_NAME1, version),
            );
            assert!(matches!(
                decode_identity(&frame),
                Err(ProtocolError::UnsupportedVersion { found, supported: 1 }) if found == version
            ));
        }
    }

    #[test]
    fn test_status_rejected() {
        let frame = response(Exchange::SetChallenge, &[1]);
        assert!(matches!(
            decode_status(Exchange::SetChallenge, &frame),
            Err(ProtocolError::DeviceRejected {
                exchange: Exchange::SetChallenge,
                status: 1
            })
        ));
        let frame = response(Exchange::LoadChallenge, &[0]);
        assert!(decode_status(Exchange::LoadChallenge, &frame).is_ok());
    }

    #[test]
    fn test_capacity_mismatch_is_rejected_before_parsing() {
        // a well-formed OK status, but in a 128 byte frame
        let mut bytes = vec![0u8; 128];
        bytes[0] = Exchange::SetChallenge.response().code;
        let frame = Frame::from_wire(FrameCapacity::OneTwentyEight, Zeroizing::new(bytes));
        assert!(matches!(
            decode_status(Exchange::SetChallenge, &frame),
            Err(ProtocolError::CapacityMismatch {
                expected: FrameCapacity::Four,
                actual: FrameCapacity::OneTwentyEight,
                ..
            })
        ));
    }

    #[test]
    fn test_wrong_response_code() {
        let frame = response(Exchange::LoadChallenge, &[0]);
        // right size class, wrong code for a set-challenge answer
        assert!(matches!(
            decode_status(Exchange::SetChallenge, &frame),
            Err(ProtocolError::UnexpectedResponse {
                expected: 0x04,
                actual: 0x06,
                ..
            })
        ));
    }

    #[test]
    fn test_derived_key_decoding() {
        let mut payload = vec![STATUS_OK];
        payload.extend((0..64u8).collect::<Vec<_>>());
        let key = decode_derived_key(&response(Exchange::DeriveKey, &payload)).unwrap();
        assert_eq!(key.expose_secret().len(), 64);
        assert_eq!(key.expose_secret()[63], 63);
    }

    #[test]
    fn test_derived_key_short_response() {
        let mut bytes = vec![0u8; 40];
        bytes[0] = Exchange::DeriveKey.response().code;
        let frame = Frame::from_wire(FrameCapacity::OneTwentyEight, Zeroizing::new(bytes));
        assert!(matches!(
            decode_derived_key(&frame),
            Err(ProtocolError::ShortResponse {
                expected: 65,
                actual: 39,
                ..
            })
        ));
    }

    #[test]
    fn test_derived_key_device_rejected() {
        let frame = response(Exchange::DeriveKey, &[1]);
        assert!(matches!(
            decode_derived_key(&frame),
            Err(ProtocolError::DeviceRejected { status: 1, .. })
        ));
    }

    #[test]
    fn test_two_hundred_byte_challenge_splits_in_two() {
        let challenge = [0x5au8; 200];
        let sizes: Vec<usize> = challenge_chunks(&challenge).map(<[u8]>::len).collect();
        assert_eq!(sizes, vec![127, 73]);
    }

    proptest! {
        #[test]
        fn chunks_reassemble_to_the_challenge(challenge in prop::collection::vec(any::<u8>(), 1..=MAX_CHALLENGE_LEN)) {
            let chunks: Vec<&[u8]> = challenge_chunks(&challenge).collect();
            prop_assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= CHUNK_LEN));
            prop_assert_eq!(chunks.len(), challenge.len().div_ceil(CHUNK_LEN));
            prop_assert_eq!(chunks.concat(), challenge);
        }
    }
}
