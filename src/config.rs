//! Runtime settings. Everything has a default matching the stock TKey
//! setup; the connection can also be picked up from the environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::uss::{DEFAULT_ITERATIONS, MIN_ITERATIONS};

/// Serial speed the TKey firmware expects.
pub const DEFAULT_SPEED: u32 = 62_500;
/// Overrides the auto-detected serial port.
pub const PORT_ENV: &str = "TKEY_LUKS_PORT";
/// Overrides [`DEFAULT_SPEED`].
pub const SPEED_ENV: &str = "TKEY_LUKS_SPEED";

/// File name of the device application image.
pub const APP_IMAGE_NAME: &str = "tkey-luks-device.bin";
/// System-wide install location of the device application.
pub const APP_INSTALL_DIR: &str = "/usr/local/lib/tkey-luks";

pub const DEFAULT_MAPPER_NAME: &str = "tkey-luks";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Serial device; `None` auto-detects the TKey.
    pub port: Option<PathBuf>,
    pub speed: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: None,
            speed: DEFAULT_SPEED,
        }
    }
}

impl ConnectionConfig {
    pub fn from_environment() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable lookup. Unparseable
    /// speeds are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(port) = lookup(PORT_ENV).filter(|p| !p.is_empty()) {
            config.port = Some(PathBuf::from(port));
        }
        if let Some(speed) = lookup(SPEED_ENV) {
            match speed.trim().parse() {
                Ok(speed) => config.speed = speed,
                Err(_) => warn!("Ignoring invalid {}={:?}", SPEED_ENV, speed),
            }
        }
        config
    }

    pub fn with_port(mut self, port: Option<PathBuf>) -> Self {
        if port.is_some() {
            self.port = port;
        }
        self
    }

    pub fn with_speed(mut self, speed: Option<u32>) -> Self {
        if let Some(speed) = speed {
            self.speed = speed;
        }
        self
    }
}

/// Response waits used by a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Every exchange except derive-key.
    pub default_read: Duration,
    /// Derive-key, which may wait for a touch on the device.
    pub derive: Duration,
    /// Pause after loading the app before talking to it. The app derives
    /// its keypair before entering the command loop.
    pub app_init_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            default_read: Duration::from_secs(2),
            derive: Duration::from_secs(35),
            app_init_delay: Duration::from_secs(2),
        }
    }
}

/// PBKDF2 settings for turning a password into a USS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UssConfig {
    /// At least [`MIN_ITERATIONS`].
    pub iterations: u32,
}

impl Default for UssConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

impl UssConfig {
    pub fn with_iterations(mut self, iterations: Option<u32>) -> Self {
        if let Some(iterations) = iterations {
            self.iterations = iterations;
        }
        self
    }
}

/// How the volume unlock utility is invoked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnlockConfig {
    pub binary: PathBuf,
    /// Privilege wrapper such as `sudo`, prepended to the command.
    pub elevate: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for UnlockConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("cryptsetup"),
            elevate: None,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Candidate locations of the device application, most specific first.
pub fn app_image_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
    {
        candidates.push(dir.join(APP_IMAGE_NAME));
    }
    candidates.push(PathBuf::from(APP_INSTALL_DIR).join(APP_IMAGE_NAME));
    candidates.push(PathBuf::from("../device-app").join(APP_IMAGE_NAME));
    candidates.push(PathBuf::from(".").join(APP_IMAGE_NAME));
    candidates
}

/// First existing device application image, if any.
pub fn locate_app_image() -> Option<PathBuf> {
    app_image_candidates().into_iter().find(|path| path.is_file())
}
