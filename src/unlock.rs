//! Hands a derived key to `cryptsetup`.
//!
//! The key only ever touches disk as an owner-only temporary file that is
//! wiped and removed when the unlock call returns, whatever the outcome.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use secrecy::ExposeSecret;
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use crate::config::UnlockConfig;
use crate::error::UnlockError;
use crate::secret::{DERIVED_KEY_LEN, DerivedKey};

/// Exit code `cryptsetup` uses for "no key available with this passphrase".
const EXIT_WRONG_KEY: i32 = 2;

/// A derived key staged in a private temporary file.
struct KeyCredential {
    file: NamedTempFile,
}

impl KeyCredential {
    fn stage(key: &DerivedKey) -> io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("tkey-luks-")
            .suffix(".key")
            .tempfile()?;
        restrict(file.path())?;
        file.write_all(key.expose_secret())?;
        file.as_file().sync_all()?;
        Ok(Self { file })
    }

    fn path(&self) -> &Path {
        self.file.path()
    }
}

impl Drop for KeyCredential {
    fn drop(&mut self) {
        let file = self.file.as_file_mut();
        let wiped = file
            .seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&[0u8; DERIVED_KEY_LEN]))
            .and_then(|_| file.sync_all());
        if let Err(err) = wiped {
            warn!("Failed to wipe key credential before removal: {}", err);
        }
    }
}

#[cfg(unix)]
fn restrict(path: &Path) -> io::Result<()> {
    use std::fs::{self, Permissions};
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[derive(Debug)]
struct Output {
    stdout: String,
    stderr: String,
    status: Option<i32>,
}

impl Output {
    fn combined(&self) -> String {
        let mut combined = self.stdout.trim().to_string();
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(stderr);
        }
        combined
    }
}

/// Opens LUKS volumes with keys coming from the device.
#[derive(Debug, Clone)]
pub struct VolumeUnlocker {
    config: UnlockConfig,
}

impl VolumeUnlocker {
    pub fn new(config: UnlockConfig) -> Self {
        Self { config }
    }

    /// Runs `cryptsetup luksOpen <volume> <mapper> --key-file <credential>`.
    #[instrument(level = "debug", skip(self, key))]
    pub fn unlock(&self, key: &DerivedKey, volume: &str, mapper: &str) -> Result<(), UnlockError> {
        let credential = KeyCredential::stage(key).map_err(UnlockError::Credential)?;
        debug!(credential = %credential.path().display(), "staged key credential");

        let key_arg = credential.path().to_string_lossy().into_owned();
        let out = self.run(&["luksOpen", volume, mapper, "--key-file", &key_arg])?;
        drop(credential);

        if out.status == Some(0) {
            info!("Unlocked {} as /dev/mapper/{}", volume, mapper);
            return Ok(());
        }

        let output = out.combined();
        if out.status == Some(EXIT_WRONG_KEY)
            || output.to_ascii_lowercase().contains("no key available")
        {
            return Err(UnlockError::KeyMaterialRejected {
                tool: self.tool(),
                volume: volume.to_string(),
                output,
            });
        }
        Err(UnlockError::ExternalTool {
            tool: self.tool(),
            status: out.status,
            output,
        })
    }

    fn tool(&self) -> String {
        self.config.binary.display().to_string()
    }

    fn command(&self) -> Command {
        match &self.config.elevate {
            Some(elevate) => {
                let mut command = Command::new(elevate);
                command.arg(&self.config.binary);
                command
            }
            None => Command::new(&self.config.binary),
        }
    }

    fn run(&self, args: &[&str]) -> Result<Output, UnlockError> {
        let mut command = self.command();
        command.args(args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| UnlockError::Spawn {
            tool: self.tool(),
            source,
        })?;
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> Result<Output, UnlockError> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status: Option<ExitStatus> = None;

        while start.elapsed() <= self.config.timeout {
            match child.try_wait() {
                Ok(Some(status)) => {
                    exit_status = Some(status);
                    break;
                }
                Ok(None) => thread::sleep(Duration::from_millis(25)),
                Err(source) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(UnlockError::Spawn {
                        tool: self.tool(),
                        source,
                    });
                }
            }
        }

        let Some(status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(UnlockError::Timeout {
                tool: self.tool(),
                after: self.config.timeout,
            });
        };

        Ok(Output {
            stdout: join_reader(stdout_handle),
            stderr: join_reader(stderr_handle),
            status: status.code(),
        })
    }
}

fn spawn_output_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> thread::JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf)?;
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}

fn join_reader(handle: thread::JoinHandle<io::Result<String>>) -> String {
    match handle.join() {
        Ok(Ok(text)) => text,
        Ok(Err(err)) => format!("<output unreadable: {err}>"),
        Err(_) => "<output reader panicked>".to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn key() -> DerivedKey {
        let mut bytes = [0u8; DERIVED_KEY_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8 ^ 0x5a;
        }
        DerivedKey::from_bytes(bytes)
    }

    /// A stand-in for `cryptsetup` that records its arguments, copies the
    /// key file it was given and then runs `tail`.
    fn fake_tool(dir: &TempDir, name: &str, tail: &str) -> PathBuf {
        let path = dir.path().join(name);
        let script = format!(
            "#!/bin/sh\necho \"$@\" > \"{root}/args\"\ncat \"$5\" > \"{root}/key\" 2>/dev/null\n{tail}\n",
            root = dir.path().display(),
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn unlocker(binary: PathBuf) -> VolumeUnlocker {
        VolumeUnlocker::new(UnlockConfig {
            binary,
            elevate: None,
            timeout: Duration::from_secs(10),
        })
    }

    fn staged_path(dir: &TempDir) -> PathBuf {
        let args = fs::read_to_string(dir.path().join("args")).unwrap();
        PathBuf::from(args.split_whitespace().last().unwrap())
    }

    #[test]
    #[serial]
    fn test_unlock_passes_key_file() {
        let dir = TempDir::new().unwrap();
        let tool = fake_tool(&dir, "cryptsetup", "exit 0");

        unlocker(tool).unlock(&key(), "/dev/sda2", "root_crypt").unwrap();

        let args = fs::read_to_string(dir.path().join("args")).unwrap();
        let args: Vec<&str> = args.split_whitespace().collect();
        assert_eq!(&args[..4], &["luksOpen", "/dev/sda2", "root_crypt", "--key-file"]);
        let staged = fs::read(dir.path().join("key")).unwrap();
        assert_eq!(&staged[..], &key().expose_secret()[..]);
        assert!(!staged_path(&dir).exists());
    }

    #[test]
    #[serial]
    fn test_wrong_key_is_rejected_and_credential_removed() {
        let dir = TempDir::new().unwrap();
        let tool = fake_tool(
            &dir,
            "cryptsetup",
            "echo 'No key available with this passphrase.' >&2\nexit 2",
        );

        let err = unlocker(tool)
            .unlock(&key(), "disk.img", "tkey-luks")
            .unwrap_err();
        match err {
            UnlockError::KeyMaterialRejected { volume, output, .. } => {
                assert_eq!(volume, "disk.img");
                assert!(output.contains("No key available"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!staged_path(&dir).exists());
    }

    #[test]
    #[serial]
    fn test_other_failure_keeps_tool_output() {
        let dir = TempDir::new().unwrap();
        let tool = fake_tool(
            &dir,
            "cryptsetup",
            "echo 'Device tkey-luks already exists.' >&2\nexit 5",
        );

        let err = unlocker(tool)
            .unlock(&key(), "disk.img", "tkey-luks")
            .unwrap_err();
        assert!(matches!(
            err,
            UnlockError::ExternalTool { status: Some(5), ref output, .. }
                if output == "Device tkey-luks already exists."
        ));
        assert!(!staged_path(&dir).exists());
    }

    #[test]
    #[serial]
    fn test_elevation_prefix() {
        let dir = TempDir::new().unwrap();
        let sudo = dir.path().join("sudo");
        fs::write(
            &sudo,
            format!(
                "#!/bin/sh\necho \"$@\" > \"{}/elevated\"\nexit 0\n",
                dir.path().display()
            ),
        )
        .unwrap();
        fs::set_permissions(&sudo, fs::Permissions::from_mode(0o755)).unwrap();

        let unlocker = VolumeUnlocker::new(UnlockConfig {
            binary: PathBuf::from("cryptsetup"),
            elevate: Some(sudo),
            timeout: Duration::from_secs(10),
        });
        unlocker.unlock(&key(), "disk.img", "vault").unwrap();

        let args = fs::read_to_string(dir.path().join("elevated")).unwrap();
        assert!(args.starts_with("cryptsetup luksOpen disk.img vault --key-file "));
    }

    #[test]
    #[serial]
    fn test_missing_tool() {
        let dir = TempDir::new().unwrap();
        let err = unlocker(dir.path().join("nope"))
            .unlock(&key(), "disk.img", "vault")
            .unwrap_err();
        assert!(matches!(err, UnlockError::Spawn { .. }));
    }

    #[test]
    #[serial]
    fn test_hung_tool_times_out() {
        let dir = TempDir::new().unwrap();
        let tool = fake_tool(&dir, "cryptsetup", "sleep 5");
        let unlocker = VolumeUnlocker::new(UnlockConfig {
            binary: tool,
            elevate: None,
            timeout: Duration::from_millis(200),
        });

        let err = unlocker.unlock(&key(), "disk.img", "vault").unwrap_err();
        assert!(matches!(err, UnlockError::Timeout { .. }));
    }

    #[test]
    fn test_credential_is_owner_only() {
        let credential = KeyCredential::stage(&key()).unwrap();
        let path = credential.path().to_path_buf();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(fs::read(&path).unwrap().len(), DERIVED_KEY_LEN);
        drop(credential);
        assert!(!path.exists());
    }
}
