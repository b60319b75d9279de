use blake2::{Blake2s256, Digest};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::{CmdLen, Endpoint, LinkError, Port, SerialLink};

/// Largest application image the firmware accepts.
pub const MAX_APP_SIZE: usize = 100 * 1024;
/// Image bytes carried by one load-data frame.
pub const APP_CHUNK_LEN: usize = 127;

const CMD_LOAD_APP: u8 = 0x03;
const RSP_LOAD_APP: u8 = 0x04;
const CMD_LOAD_APP_DATA: u8 = 0x05;
const RSP_LOAD_APP_DATA: u8 = 0x06;
const RSP_LOAD_APP_DATA_READY: u8 = 0x07;

const STATUS_OK: u8 = 0;

/// The firmware never receives the raw secret, only its BLAKE2s hash.
pub fn uss_digest(uss: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut digest = Zeroizing::new([0u8; 32]);
    digest.copy_from_slice(&Blake2s256::digest(uss));
    digest
}

fn image_digest(image: &[u8]) -> [u8; 32] {
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&Blake2s256::digest(image));
    digest
}

impl<P: Port> SerialLink<P> {
    /// Uploads a device application to the firmware, optionally together
    /// with a user supplied secret, and checks the digest the firmware
    /// computes over the received image.
    pub fn load_app(&mut self, image: &[u8], uss: Option<&[u8]>) -> Result<(), LinkError> {
        if image.is_empty() || image.len() > MAX_APP_SIZE {
            return Err(LinkError::AppSize {
                max: MAX_APP_SIZE,
                actual: image.len(),
            });
        }
        info!("Loading device app ({} bytes)", image.len());

        let mut tx = Zeroizing::new([0u8; 128]);
        tx[0] = CMD_LOAD_APP;
        tx[1..5].copy_from_slice(&(image.len() as u32).to_le_bytes());
        if let Some(uss) = uss {
            tx[5] = 1;
            tx[6..38].copy_from_slice(uss_digest(uss).as_slice());
        }
        self.write_frame(Endpoint::Firmware, CmdLen::Len128, tx.as_slice())?;
        self.expect_status(RSP_LOAD_APP, CmdLen::Len4)?;

        let chunks = image.chunks(APP_CHUNK_LEN).count();
        let mut reported = None;
        for (n, chunk) in image.chunks(APP_CHUNK_LEN).enumerate() {
            let mut tx = [0u8; 128];
            tx[0] = CMD_LOAD_APP_DATA;
            tx[1..1 + chunk.len()].copy_from_slice(chunk);
            self.write_frame(Endpoint::Firmware, CmdLen::Len128, &tx)?;

            if n + 1 < chunks {
                self.expect_status(RSP_LOAD_APP_DATA, CmdLen::Len4)?;
            } else {
                let body = self.expect_status(RSP_LOAD_APP_DATA_READY, CmdLen::Len128)?;
                let mut digest = [0u8; 32];
                digest.copy_from_slice(&body[2..34]);
                reported = Some(digest);
            }
        }

        if reported != Some(image_digest(image)) {
            return Err(LinkError::DigestMismatch);
        }
        debug!("device app digest verified");
        Ok(())
    }

    fn expect_status(&mut self, code: u8, len: CmdLen) -> Result<Zeroizing<Vec<u8>>, LinkError> {
        let timeout = self.timeout();
        let (actual, body) = self.read_frame(Endpoint::Firmware, timeout)?;
        if actual != len {
            return Err(LinkError::UnexpectedLength {
                expected: len,
                actual,
            });
        }
        if body[0] != code {
            return Err(LinkError::UnexpectedResponse {
                expected: code,
                actual: body[0],
            });
        }
        if body[1] != STATUS_OK {
            return Err(LinkError::Status {
                code,
                status: body[1],
            });
        }
        Ok(body)
    }
}
