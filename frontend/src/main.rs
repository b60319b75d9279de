//! `tkey-luks`: derive a LUKS key from a TKey and unlock a volume with it,
//! or write the key out for use elsewhere.

use std::fs;
use std::io::{self, Read};
use std::mem;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use clap::{ArgGroup, Parser};
use rpassword::prompt_password;
use secrecy::{ExposeSecret, SecretString};
use tkey_luks::config::{DEFAULT_MAPPER_NAME, locate_app_image};
use tkey_luks::{
    Challenge, ConnectionConfig, KeySink, SaltQuality, SessionRequest, Timeouts, UnlockConfig,
    Uss, UssConfig, derive_uss, resolve_salt, run_serial_session, unlock_volume,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(
    name = "tkey-luks",
    version,
    about = "Derive a LUKS key from a TKey and optionally unlock a volume with it."
)]
#[command(group(
    ArgGroup::new("challenge_source")
        .required(true)
        .args(["challenge", "challenge_from_stdin"])
))]
#[command(group(
    ArgGroup::new("destination")
        .required(true)
        .multiple(true)
        .args(["luks_image", "save_key", "output"])
))]
struct Cli {
    /// Challenge (usually a password) the key is derived from.
    #[arg(long)]
    challenge: Option<String>,

    /// Read the challenge from stdin, surrounding whitespace removed.
    #[arg(long)]
    challenge_from_stdin: bool,

    /// LUKS volume or image to unlock.
    #[arg(long, value_name = "PATH")]
    luks_image: Option<String>,

    /// Name of the `/dev/mapper` entry to create.
    #[arg(long, default_value = DEFAULT_MAPPER_NAME)]
    mapper_name: String,

    /// Device app binary. Searched for next to the executable and in the
    /// usual install locations when omitted.
    #[arg(long, visible_alias = "device-app", value_name = "PATH")]
    app: Option<PathBuf>,

    /// Serial port of the TKey. Auto-detected when omitted.
    #[arg(long, visible_alias = "device", value_name = "PATH")]
    port: Option<PathBuf>,

    #[arg(long)]
    speed: Option<u32>,

    /// Talk to an app that is already loaded instead of loading one.
    #[arg(long)]
    skip_load_app: bool,

    /// Derive the USS from a password with PBKDF2.
    #[arg(long)]
    derive_uss: bool,

    /// Password for USS derivation. Defaults to the challenge.
    #[arg(long, requires = "derive_uss", conflicts_with_all = ["uss_password_stdin", "prompt_uss_password"])]
    uss_password: Option<String>,

    /// Read the USS password from stdin.
    #[arg(long, requires = "derive_uss", conflicts_with_all = ["challenge_from_stdin", "prompt_uss_password"])]
    uss_password_stdin: bool,

    /// Ask for the USS password on the terminal.
    #[arg(long, requires = "derive_uss")]
    prompt_uss_password: bool,

    /// Salt for USS derivation. Defaults to the machine id.
    #[arg(long, requires = "derive_uss")]
    salt: Option<String>,

    /// PBKDF2 iterations for --derive-uss (default 100000, minimum 10000).
    #[arg(long, requires = "derive_uss")]
    pbkdf2_iterations: Option<u32>,

    /// Raw 32 byte USS file (deprecated, use --derive-uss).
    #[arg(long, value_name = "PATH", conflicts_with = "derive_uss")]
    uss: Option<PathBuf>,

    /// Also save the derived key to this file.
    #[arg(long, value_name = "PATH")]
    save_key: Option<PathBuf>,

    /// Write the derived key to this file, or `-` for stdout.
    #[arg(long, value_name = "PATH")]
    output: Option<String>,

    /// Run cryptsetup through sudo.
    #[arg(long)]
    sudo: bool,

    /// Seconds to wait for the touch confirmation on the device.
    #[arg(long, value_name = "SECONDS")]
    touch_timeout: Option<u64>,

    #[arg(short, long)]
    verbose: bool,

    /// Log secrets (USS, derived key) in hex. Debugging only.
    #[arg(long)]
    debug_secrets: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Drops surrounding ASCII whitespace. Everything else, including bytes
/// that are not UTF-8, is kept as is.
fn trim_input(data: &[u8]) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(data.trim_ascii().to_vec())
}

fn read_trimmed(input: &mut impl Read, what: &str) -> Result<Zeroizing<Vec<u8>>> {
    let mut data = Zeroizing::new(Vec::new());
    input
        .read_to_end(&mut data)
        .with_context(|| format!("failed to read {what} from stdin"))?;
    let trimmed = trim_input(&data);
    ensure!(!trimmed.is_empty(), "empty {what} received from stdin");
    Ok(trimmed)
}

fn read_challenge(cli: &Cli, input: &mut impl Read) -> Result<Challenge> {
    let bytes = match &cli.challenge {
        Some(challenge) => challenge.as_bytes().to_vec(),
        None => mem::take(&mut *read_trimmed(input, "challenge")?),
    };
    Challenge::new(bytes).context("invalid challenge")
}

fn uss_password(cli: &Cli, challenge: &Challenge, input: &mut impl Read) -> Result<SecretString> {
    if let Some(password) = &cli.uss_password {
        return Ok(SecretString::from(password.clone()));
    }
    if cli.uss_password_stdin {
        let mut bytes = read_trimmed(input, "USS password")?;
        let password =
            String::from_utf8(mem::take(&mut *bytes)).context("USS password is not valid UTF-8")?;
        return Ok(SecretString::from(password));
    }
    if cli.prompt_uss_password {
        let password = prompt_password("USS password: ").context("failed to read USS password")?;
        return Ok(SecretString::from(password));
    }
    info!("Using the challenge as USS password");
    let password = String::from_utf8(challenge.as_bytes().to_vec())
        .context("challenge is not valid UTF-8, pass --uss-password")?;
    Ok(SecretString::from(password))
}

fn load_uss(cli: &Cli, challenge: &Challenge, input: &mut impl Read) -> Result<Option<Uss>> {
    if cli.derive_uss {
        let password = uss_password(cli, challenge, input)?;
        let resolved = resolve_salt(cli.salt.as_deref().map(str::as_bytes))
            .context("failed to determine a salt, provide one with --salt")?;
        if resolved.quality() == SaltQuality::Weak {
            warn!("USS salt comes from the hostname, consider passing --salt");
        }
        let config = UssConfig::default().with_iterations(cli.pbkdf2_iterations);
        let uss = derive_uss(&password, resolved.salt(), config.iterations)
            .context("failed to derive USS")?;
        info!("USS derived with {} PBKDF2 iterations", config.iterations);
        if cli.debug_secrets {
            debug!("USS: {}", hex::encode(uss.expose_secret()));
        }
        return Ok(Some(uss));
    }
    if let Some(path) = &cli.uss {
        let uss = Uss::from_file(path)
            .with_context(|| format!("failed to load USS from {}", path.display()))?;
        return Ok(Some(uss));
    }
    if !cli.skip_load_app {
        warn!("No USS given, the key depends only on the device, app and challenge");
    }
    Ok(None)
}

fn load_app_image(path: Option<&Path>) -> Result<Vec<u8>> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => locate_app_image().context(
            "device app not found next to the executable, in /usr/local/lib/tkey-luks/, \
             ../device-app/ or the current directory; pass --app",
        )?,
    };
    debug!("Using device app {}", path.display());
    fs::read(&path).with_context(|| format!("failed to read device app from {}", path.display()))
}

fn presence_prompt() {
    eprintln!("Touch the TKey to confirm...");
}

fn run(cli: Cli) -> Result<()> {
    let mut stdin = io::stdin();
    let challenge = read_challenge(&cli, &mut stdin)?;
    let uss = load_uss(&cli, &challenge, &mut stdin)?;
    let app_image = if cli.skip_load_app {
        info!("Skipping app load, expecting the device app to be running");
        None
    } else {
        Some(load_app_image(cli.app.as_deref())?)
    };

    let mut timeouts = Timeouts::default();
    if let Some(secs) = cli.touch_timeout {
        ensure!(secs > 0, "--touch-timeout must be at least one second");
        timeouts.derive = Duration::from_secs(secs);
    }

    let connection = ConnectionConfig::from_environment()
        .with_port(cli.port.clone())
        .with_speed(cli.speed);
    let request = SessionRequest {
        app_image: app_image.as_deref(),
        uss: uss.as_ref(),
        challenge: &challenge,
        timeouts,
        presence_prompt: Some(presence_prompt),
    };
    let key = run_serial_session(&connection, &request).context("failed to derive key")?;
    drop(uss);
    if cli.debug_secrets {
        debug!("Derived key: {}", hex::encode(key.expose_secret()));
    }

    if let Some(output) = &cli.output {
        KeySink::parse(output).write(&key)?;
    }
    if let Some(path) = &cli.save_key {
        KeySink::File(path.clone()).write(&key)?;
    }
    if let Some(volume) = &cli.luks_image {
        let unlock = UnlockConfig {
            elevate: cli.sudo.then(|| PathBuf::from("sudo")),
            ..UnlockConfig::default()
        };
        info!("Unlocking {}", volume);
        unlock_volume(&key, volume, &cli.mapper_name, &unlock)
            .with_context(|| format!("failed to unlock {volume}"))?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if cli.debug_secrets && !cli.verbose {
        eprintln!("--debug-secrets has no effect without --verbose");
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
