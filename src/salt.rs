//! Discovery of a stable per-machine salt for USS derivation.
//!
//! Sources are tried in a fixed order and the first usable value wins:
//! the systemd machine id, the D-Bus machine id, the DMI product UUID and
//! finally the hostname. The hostname is a weak salt (guessable, often
//! shared between machines) and is reported as such.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::SaltError;

pub const MACHINE_ID_PATH: &str = "/etc/machine-id";
pub const DBUS_MACHINE_ID_PATH: &str = "/var/lib/dbus/machine-id";
pub const PRODUCT_UUID_PATH: &str = "/sys/class/dmi/id/product_uuid";

/// What firmware reports when it has no real product UUID.
pub const PLACEHOLDER_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// Where the system salt sources are read from. Swapped out in tests.
pub trait SaltSources {
    fn read(&self, path: &Path) -> io::Result<String>;
    fn hostname(&self) -> io::Result<String>;
}

/// The running system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSources;

impl SaltSources for SystemSources {
    fn read(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn hostname(&self) -> io::Result<String> {
        fs::read_to_string("/proc/sys/kernel/hostname")
            .or_else(|_| fs::read_to_string("/etc/hostname"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SaltOrigin {
    Explicit,
    MachineId,
    DbusMachineId,
    ProductUuid,
    Hostname,
}

/// Coarse strength of a salt source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SaltQuality {
    /// Chosen by the caller, who vouches for it.
    Explicit,
    /// A per-installation or hardware identifier.
    Strong,
    /// The hostname: predictable and frequently reused.
    Weak,
}

impl SaltOrigin {
    pub fn quality(self) -> SaltQuality {
        match self {
            SaltOrigin::Explicit => SaltQuality::Explicit,
            SaltOrigin::MachineId | SaltOrigin::DbusMachineId | SaltOrigin::ProductUuid => {
                SaltQuality::Strong
            }
            SaltOrigin::Hostname => SaltQuality::Weak,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSalt {
    salt: Vec<u8>,
    origin: SaltOrigin,
}

impl ResolvedSalt {
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn origin(&self) -> SaltOrigin {
        self.origin
    }

    pub fn quality(&self) -> SaltQuality {
        self.origin.quality()
    }
}

/// Returns `explicit` if given and non-empty, otherwise the first usable
/// system source.
pub fn resolve(
    explicit: Option<&[u8]>,
    sources: &impl SaltSources,
) -> Result<ResolvedSalt, SaltError> {
    if let Some(salt) = explicit.filter(|salt| !salt.is_empty()) {
        info!("Using provided salt");
        return Ok(ResolvedSalt {
            salt: salt.to_vec(),
            origin: SaltOrigin::Explicit,
        });
    }

    let files = [
        (MACHINE_ID_PATH, SaltOrigin::MachineId, None),
        (DBUS_MACHINE_ID_PATH, SaltOrigin::DbusMachineId, None),
        (PRODUCT_UUID_PATH, SaltOrigin::ProductUuid, Some(PLACEHOLDER_UUID)),
    ];
    for (path, origin, placeholder) in files {
        match sources.read(Path::new(path)) {
            Ok(value) => {
                let value = value.trim();
                if value.is_empty() || Some(value) == placeholder {
                    debug!(path, "salt source holds no usable value");
                    continue;
                }
                info!(?origin, "Using {} for salt", path);
                return Ok(ResolvedSalt {
                    salt: value.as_bytes().to_vec(),
                    origin,
                });
            }
            Err(e) => debug!(path, error = %e, "salt source unavailable"),
        }
    }

    match sources.hostname() {
        Ok(name) => {
            let name = name.trim();
            if !name.is_empty() && name != "localhost" {
                warn!("Using hostname as salt, this is weaker than a machine id");
                return Ok(ResolvedSalt {
                    salt: name.as_bytes().to_vec(),
                    origin: SaltOrigin::Hostname,
                });
            }
            debug!("hostname is not usable as a salt");
        }
        Err(e) => debug!(error = %e, "hostname unavailable"),
    }

    Err(SaltError::NoSaltAvailable)
}
