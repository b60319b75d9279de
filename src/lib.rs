//! LUKS key derivation with a Tillitis TKey.
//!
//! The device app turns a challenge into a 64 byte key that depends on the
//! device, the app binary and an optional User Supplied Secret. This crate
//! drives that exchange and hands the key to `cryptsetup` or a key file.

use std::thread;

use secrecy::SecretString;
use tracing::{info, instrument, warn};

pub mod config;
pub mod error;
pub mod proto;
pub mod salt;
pub mod secret;
pub mod session;
pub mod sink;
pub mod transport;
pub mod unlock;
pub mod uss;

pub use config::{ConnectionConfig, Timeouts, UnlockConfig, UssConfig};
pub use error::{Error, Result};
pub use salt::{ResolvedSalt, SaltQuality};
pub use secret::{Challenge, DerivedKey, Uss};
pub use session::{DeviceSession, SessionState};
pub use sink::KeySink;
pub use transport::{SerialTransport, Transport};

/// Everything one key derivation needs besides the connection.
pub struct SessionRequest<'a> {
    /// Device app to load first. `None` when it is already running.
    pub app_image: Option<&'a [u8]>,
    /// Bound into the app at load time. Ignored without `app_image`.
    pub uss: Option<&'a Uss>,
    pub challenge: &'a Challenge,
    pub timeouts: Timeouts,
    /// Invoked right before the device may ask for a touch.
    pub presence_prompt: Option<fn()>,
}

/// Loads the app if requested, then runs a full session on `transport`.
#[instrument(level = "debug", skip_all)]
pub fn run_session<T: Transport>(
    mut transport: T,
    request: &SessionRequest<'_>,
) -> Result<DerivedKey> {
    match request.app_image {
        Some(image) => {
            transport.load_application(image, request.uss)?;
            info!(
                "Device app loaded, waiting {:?} for it to start",
                request.timeouts.app_init_delay
            );
            thread::sleep(request.timeouts.app_init_delay);
        }
        None if request.uss.is_some() => {
            warn!("USS ignored: it only takes effect when the device app is loaded");
        }
        None => {}
    }

    let mut session = DeviceSession::new(transport, request.timeouts);
    if let Some(prompt) = request.presence_prompt {
        session = session.with_presence_prompt(prompt);
    }
    let key = session.run(request.challenge)?;
    session.close();
    Ok(key)
}

/// [`run_session`] against a TKey on a serial port.
pub fn run_serial_session(
    connection: &ConnectionConfig,
    request: &SessionRequest<'_>,
) -> Result<DerivedKey> {
    let transport = SerialTransport::open(connection, &request.timeouts)?;
    run_session(transport, request)
}

/// The explicit salt if given, otherwise the first usable machine
/// identifier. Check the quality before relying on it.
pub fn resolve_salt(explicit: Option<&[u8]>) -> Result<ResolvedSalt> {
    Ok(salt::resolve(explicit, &salt::SystemSources)?)
}

pub fn derive_uss(password: &SecretString, salt: &[u8], iterations: u32) -> Result<Uss> {
    Ok(uss::derive(password, salt, iterations)?)
}

/// Opens `volume` as `/dev/mapper/<mapper>` with the derived key.
pub fn unlock_volume(
    key: &DerivedKey,
    volume: &str,
    mapper: &str,
    config: &UnlockConfig,
) -> Result<()> {
    unlock::VolumeUnlocker::new(config.clone()).unlock(key, volume, mapper)?;
    Ok(())
}
