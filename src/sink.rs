//! Destinations for a derived key besides `cryptsetup`.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;

use secrecy::ExposeSecret;
use tracing::info;

use crate::error::{Error, Result};
use crate::secret::DerivedKey;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeySink {
    /// Raw key bytes on stdout, for piping into `cryptsetup --key-file -`.
    Stdout,
    /// A key file readable by the owner only. Replaced if it exists.
    File(PathBuf),
}

impl KeySink {
    /// `-` means stdout, anything else is a file path.
    pub fn parse(target: &str) -> Self {
        match target {
            "-" => KeySink::Stdout,
            path => KeySink::File(PathBuf::from(path)),
        }
    }

    pub fn write(&self, key: &DerivedKey) -> Result<()> {
        match self {
            KeySink::Stdout => {
                let mut stdout = io::stdout().lock();
                write_key(&mut stdout, key).map_err(|source| Error::Output {
                    target: "stdout".into(),
                    source,
                })
            }
            KeySink::File(path) => {
                let output = |source| Error::Output {
                    target: path.display().to_string(),
                    source,
                };
                let mut options = OpenOptions::new();
                options.write(true).create(true).truncate(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.mode(0o600);
                }
                let mut file = options.open(path).map_err(output)?;
                restrict_existing(&file).map_err(output)?;
                write_key(&mut file, key).map_err(output)?;
                file.sync_all().map_err(output)?;
                info!("Key saved to {}", path.display());
                Ok(())
            }
        }
    }
}

fn write_key(out: &mut impl Write, key: &DerivedKey) -> io::Result<()> {
    out.write_all(key.expose_secret())?;
    out.flush()
}

// `mode` only applies on creation, tighten a pre-existing file too
#[cfg(unix)]
fn restrict_existing(file: &std::fs::File) -> io::Result<()> {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_existing(_file: &std::fs::File) -> io::Result<()> {
    Ok(())
}
