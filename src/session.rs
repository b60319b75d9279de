//! One conversation with the `luks` device app.
//!
//! The order is fixed: verify identity, announce the challenge size, load
//! the challenge, derive the key. [`SessionState::advance`] holds that
//! ordering on its own so it can be checked without a device;
//! [`DeviceSession`] pairs it with the actual exchanges.

use std::mem;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::config::Timeouts;
use crate::error::{InputError, ProtocolError, Result};
use crate::proto::{
    self, AppIdentity, Exchange, Frame, MAX_CHALLENGE_LEN, Request, challenge_chunks,
};
use crate::secret::{Challenge, DerivedKey};
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    IdentityVerified,
    ChallengeSizeSet { size: u32 },
    ChallengeLoaded,
    KeyDerived,
    /// An exchange failed. Terminal: start a new session to retry.
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    VerifyIdentity,
    SetChallengeSize { size: u32 },
    LoadChallenge,
    DeriveKey,
}

impl SessionState {
    /// The state reached by completing `step` from `self`.
    pub fn advance(self, step: Step) -> Result<SessionState, ProtocolError> {
        let next = match (self, step) {
            (SessionState::Connected, Step::VerifyIdentity) => SessionState::IdentityVerified,
            (SessionState::IdentityVerified, Step::SetChallengeSize { size }) => {
                SessionState::ChallengeSizeSet { size }
            }
            (SessionState::ChallengeSizeSet { .. }, Step::LoadChallenge) => {
                SessionState::ChallengeLoaded
            }
            (SessionState::ChallengeLoaded, Step::DeriveKey) => SessionState::KeyDerived,
            (state, step) => return Err(ProtocolError::Sequence { step, state }),
        };
        Ok(next)
    }
}

/// Owns a connection to the device app for the lifetime of one key
/// derivation. Dropping the session closes the connection.
pub struct DeviceSession<T: Transport> {
    transport: T,
    state: SessionState,
    timeouts: Timeouts,
    read_timeout: Duration,
    presence_prompt: Option<Box<dyn FnMut()>>,
    closed: bool,
}

impl<T: Transport> DeviceSession<T> {
    /// Starts a session on a transport whose device app is already running.
    pub fn new(transport: T, timeouts: Timeouts) -> Self {
        Self {
            transport,
            state: SessionState::Connected,
            timeouts,
            read_timeout: timeouts.default_read,
            presence_prompt: None,
            closed: false,
        }
    }

    /// Called right before derive-key is sent, so the user knows to touch
    /// the device.
    pub fn with_presence_prompt(mut self, prompt: impl FnMut() + 'static) -> Self {
        self.presence_prompt = Some(Box::new(prompt));
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Response wait currently applied to exchanges.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    #[instrument(level = "debug", skip(self))]
    pub fn verify_identity(&mut self) -> Result<AppIdentity> {
        self.step(Step::VerifyIdentity, |session| {
            let response = session.exchange(Request::NameVersion)?;
            let identity = proto::decode_identity(&response)?;
            info!("Device app {} version {}", identity.name(), identity.version);
            Ok(identity)
        })
    }

    /// Announces the challenge length. Lengths outside 1..=256 are refused
    /// without touching the device or the session state.
    #[instrument(level = "debug", skip(self))]
    pub fn set_challenge_size(&mut self, len: usize) -> Result<()> {
        if len == 0 || len > MAX_CHALLENGE_LEN {
            return Err(InputError::ChallengeLength {
                max: MAX_CHALLENGE_LEN,
                actual: len,
            }
            .into());
        }
        let size = len as u32;
        self.step(Step::SetChallengeSize { size }, |session| {
            let response = session.exchange(Request::SetChallenge { size })?;
            proto::decode_status(Exchange::SetChallenge, &response)?;
            Ok(())
        })
    }

    /// Streams the challenge in order. The first rejected chunk ends the
    /// session; nothing is resent.
    #[instrument(level = "debug", skip_all, fields(len = challenge.len()))]
    pub fn load_challenge(&mut self, challenge: &Challenge) -> Result<()> {
        if let SessionState::ChallengeSizeSet { size } = self.state {
            if size as usize != challenge.len() {
                return Err(InputError::ChallengeSizeMismatch {
                    announced: size as usize,
                    actual: challenge.len(),
                }
                .into());
            }
        }
        self.step(Step::LoadChallenge, |session| {
            for (index, chunk) in challenge_chunks(challenge.as_bytes()).enumerate() {
                debug!(index, len = chunk.len(), "load challenge chunk");
                let response = session.exchange(Request::LoadChallenge { chunk })?;
                proto::decode_status(Exchange::LoadChallenge, &response)?;
            }
            Ok(())
        })
    }

    /// Asks the device for the key. Waits up to the derive timeout since
    /// the device may want a touch first.
    #[instrument(level = "debug", skip(self))]
    pub fn derive_key(&mut self) -> Result<DerivedKey> {
        self.step(Step::DeriveKey, |session| {
            let timeout = session.timeouts.derive;
            session.with_read_timeout(timeout, |session| {
                if let Some(prompt) = session.presence_prompt.as_mut() {
                    prompt();
                }
                let response = session.exchange(Request::DeriveKey)?;
                Ok(proto::decode_derived_key(&response)?)
            })
        })
    }

    /// Runs every step in order and returns the derived key.
    pub fn run(&mut self, challenge: &Challenge) -> Result<DerivedKey> {
        self.verify_identity()?;
        self.set_challenge_size(challenge.len())?;
        self.load_challenge(challenge)?;
        let key = self.derive_key()?;
        info!("Key derived");
        Ok(key)
    }

    /// Closes the connection. An unfinished session cannot be resumed.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        if self.state != SessionState::KeyDerived {
            debug!(state = ?self.state, "closing unfinished session");
        }
        self.transport.close();
        self.closed = true;
    }

    /// Runs one transition. Out of order calls leave the state alone, a
    /// failed exchange leaves the session in [`SessionState::Failed`].
    fn step<R>(&mut self, step: Step, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let next = self.state.advance(step)?;
        match f(self) {
            Ok(value) => {
                self.state = next;
                Ok(value)
            }
            Err(err) => {
                warn!(?step, "Session step failed: {}", err);
                self.state = SessionState::Failed;
                Err(err)
            }
        }
    }

    fn with_read_timeout<R>(&mut self, timeout: Duration, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = mem::replace(&mut self.read_timeout, timeout);
        let result = f(self);
        self.read_timeout = previous;
        result
    }

    fn exchange(&mut self, request: Request<'_>) -> Result<Frame> {
        let frame = request.encode()?;
        self.transport.send(&frame)?;
        drop(frame);
        let response = self
            .transport
            .receive(request.exchange().response(), self.read_timeout)?;
        Ok(response)
    }
}

impl<T: Transport> Drop for DeviceSession<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
