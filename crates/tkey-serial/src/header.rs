//! The one-byte TKey frame header.
//!
//! Layout, most significant bit first:
//!
//! ```text
//!  7   6 5   4 3     2      1 0
//! [ - | id | endpoint | nok | len ]
//! ```

/// Length class of a frame body. The body always starts with the command
/// or response code, so the usable payload is one byte shorter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmdLen {
    Len1,
    Len4,
    Len32,
    Len128,
}

impl CmdLen {
    /// Number of body bytes following the header.
    pub const fn bytes(self) -> usize {
        match self {
            CmdLen::Len1 => 1,
            CmdLen::Len4 => 4,
            CmdLen::Len32 => 32,
            CmdLen::Len128 => 128,
        }
    }

    pub const fn code(self) -> u8 {
        match self {
            CmdLen::Len1 => 0,
            CmdLen::Len4 => 1,
            CmdLen::Len32 => 2,
            CmdLen::Len128 => 3,
        }
    }

    /// Decodes the two low bits of `code`; every value maps to a class.
    pub const fn from_code(code: u8) -> Self {
        match code & 0x3 {
            0 => CmdLen::Len1,
            1 => CmdLen::Len4,
            2 => CmdLen::Len32,
            _ => CmdLen::Len128,
        }
    }
}

/// Destination of a frame on the device side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    HwIfpga,
    HwAfpga,
    /// The boot firmware, which accepts application images.
    Firmware,
    /// The loaded device application.
    App,
}

impl Endpoint {
    pub const fn code(self) -> u8 {
        match self {
            Endpoint::HwIfpga => 0,
            Endpoint::HwAfpga => 1,
            Endpoint::Firmware => 2,
            Endpoint::App => 3,
        }
    }

    pub const fn from_code(code: u8) -> Self {
        match code & 0x3 {
            0 => Endpoint::HwIfpga,
            1 => Endpoint::HwAfpga,
            2 => Endpoint::Firmware,
            _ => Endpoint::App,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub id: u8,
    pub endpoint: Endpoint,
    /// Set by the device when it refuses a frame outright.
    pub not_ok: bool,
    pub len: CmdLen,
}

impl FrameHeader {
    pub fn new(id: u8, endpoint: Endpoint, len: CmdLen) -> Self {
        Self {
            id,
            endpoint,
            not_ok: false,
            len,
        }
    }

    pub fn encode(&self) -> u8 {
        ((self.id & 0x3) << 5)
            | (self.endpoint.code() << 3)
            | (u8::from(self.not_ok) << 2)
            | self.len.code()
    }

    pub fn decode(byte: u8) -> Self {
        Self {
            id: (byte >> 5) & 0x3,
            endpoint: Endpoint::from_code(byte >> 3),
            not_ok: (byte >> 2) & 0x1 == 1,
            len: CmdLen::from_code(byte),
        }
    }
}
