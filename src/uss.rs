//! Stretching a password into a user supplied secret.

use pbkdf2::pbkdf2_hmac;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tracing::{info, instrument};
use zeroize::Zeroizing;

use crate::error::InputError;
use crate::secret::{USS_LEN, Uss};

/// Iteration count used when the caller does not pick one.
pub const DEFAULT_ITERATIONS: u32 = 100_000;
/// Anything below this is treated as a configuration mistake.
pub const MIN_ITERATIONS: u32 = 10_000;

/// Derives a USS with PBKDF2-HMAC-SHA256.
///
/// Deterministic: the same password, salt and iteration count always give
/// the same secret, which is what lets the device reproduce the same key
/// on every unlock.
#[instrument(level = "debug", skip(password, salt))]
pub fn derive(password: &SecretString, salt: &[u8], iterations: u32) -> Result<Uss, InputError> {
    if password.expose_secret().is_empty() {
        return Err(InputError::EmptyPassword);
    }
    if salt.is_empty() {
        return Err(InputError::EmptySalt);
    }
    if iterations < MIN_ITERATIONS {
        return Err(InputError::IterationsTooLow {
            iterations,
            minimum: MIN_ITERATIONS,
        });
    }

    let mut out = Zeroizing::new([0u8; USS_LEN]);
    pbkdf2_hmac::<Sha256>(
        password.expose_secret().as_bytes(),
        salt,
        iterations,
        out.as_mut_slice(),
    );
    let uss = Uss::from_slice(out.as_slice())?;
    info!("USS derived using PBKDF2 ({} iterations)", iterations);
    Ok(uss)
}
