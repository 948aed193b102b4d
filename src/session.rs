//! Elevated ("installer") session for privileged writes.
//!
//! The inverter only accepts writes to its configuration registers after a
//! challenge/response login over the vendor function 0x41:
//!
//! 1. sub-command `0x24` returns a 16-byte device challenge;
//! 2. sub-command `0x25` carries our own 16-byte challenge, the user name and
//!    `HMAC-SHA256(SHA-256(password), device_challenge)`;
//! 3. the device answers with a status byte and
//!    `HMAC-SHA256(SHA-256(password), client_challenge)`, proving it knows
//!    the password too.
//!
//! A session is bound to the connection generation it was established on,
//! so any reconnect silently invalidates it. Each unit behind the link keeps
//! its own login, so there is one session per slave id.

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use strum::Display;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::modbus::pdu::MAX_VENDOR_PAYLOAD;
use crate::modbus::{Request, Response, Transport};
use crate::registers::HEARTBEAT_REGISTER;

type HmacSha256 = Hmac<Sha256>;

const CHALLENGE_LEN: usize = 16;
const HASH_LEN: usize = 32;
const SUB_CHALLENGE: u8 = 0x24;
const SUB_LOGIN: u8 = 0x25;

#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    LoggedOut,
    LoggingIn,
    LoggedIn,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How long a login stays good without privileged traffic.
    pub expiry: Duration,
    /// Idle time after which the worker writes the heartbeat register.
    pub heartbeat_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(10 * 60),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// `HMAC-SHA256(SHA-256(password), challenge)`.
pub fn challenge_response(password: &str, challenge: &[u8]) -> Result<Vec<u8>> {
    let key = Sha256::digest(password.as_bytes());
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| Error::AuthenticationFailed(format!("hmac key: {e}")))?;
    mac.update(challenge);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub struct Session {
    slave: u8,
    credentials: Option<Credentials>,
    options: SessionOptions,
    state: SessionState,
    last_activity: Option<Instant>,
    generation: u64,
}

impl Session {
    pub fn new(slave: u8, credentials: Option<Credentials>, options: SessionOptions) -> Self {
        Self {
            slave,
            credentials,
            options,
            state: SessionState::LoggedOut,
            last_activity: None,
            generation: 0,
        }
    }

    pub fn slave(&self) -> u8 {
        self.slave
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.options.heartbeat_interval
    }

    /// Logged in on the current link and not yet expired.
    pub fn is_valid(&self, generation: u64) -> bool {
        self.state == SessionState::LoggedIn
            && self.generation == generation
            && self
                .last_activity
                .is_some_and(|at| at.elapsed() < self.options.expiry)
    }

    /// Record successful privileged traffic.
    pub fn touch(&mut self) {
        if self.state == SessionState::LoggedIn {
            self.last_activity = Some(Instant::now());
        }
    }

    pub fn mark_logged_out(&mut self) {
        if self.state != SessionState::LoggedOut {
            debug!(slave = self.slave, from = %self.state, "session logged out");
        }
        self.state = SessionState::LoggedOut;
        self.last_activity = None;
    }

    /// Log in unless the current session is still good.
    pub async fn ensure_logged_in(&mut self, transport: &mut dyn Transport) -> Result<()> {
        if self.is_valid(transport.generation()) {
            return Ok(());
        }
        let Some(credentials) = self.credentials.clone() else {
            self.mark_logged_out();
            return Err(Error::AuthenticationFailed(
                "no credentials configured for privileged access".into(),
            ));
        };

        self.state = SessionState::LoggingIn;
        match login(transport, self.slave, &credentials).await {
            Ok(()) => {
                self.state = SessionState::LoggedIn;
                self.last_activity = Some(Instant::now());
                self.generation = transport.generation();
                info!(
                    slave = self.slave,
                    username = %credentials.username,
                    generation = self.generation,
                    "logged in"
                );
                Ok(())
            }
            Err(error) => {
                self.mark_logged_out();
                warn!(
                    slave = self.slave,
                    username = %credentials.username,
                    %error,
                    "login failed"
                );
                Err(error)
            }
        }
    }

    pub fn heartbeat_due(&self, generation: u64) -> bool {
        self.is_valid(generation)
            && self
                .last_activity
                .is_some_and(|at| at.elapsed() >= self.options.heartbeat_interval)
    }

    /// Keep the device-side session alive. Any failure ends the session.
    pub async fn heartbeat(&mut self, transport: &mut dyn Transport) -> Result<()> {
        let request = Request::WriteMultipleRegisters {
            address: HEARTBEAT_REGISTER,
            words: vec![1],
        };
        match transport
            .exchange(self.slave, &request)
            .await
            .and_then(Response::into_result)
        {
            Ok(_) => {
                debug!(slave = self.slave, "heartbeat sent");
                self.touch();
                Ok(())
            }
            Err(error) => {
                warn!(slave = self.slave, %error, "heartbeat failed");
                self.mark_logged_out();
                Err(error)
            }
        }
    }
}

/// One [`Session`] per slave id, created on first use with shared
/// credentials and options.
pub struct Sessions {
    credentials: Option<Credentials>,
    options: SessionOptions,
    by_slave: HashMap<u8, Session>,
}

impl Sessions {
    pub fn new(credentials: Option<Credentials>, options: SessionOptions) -> Self {
        Self {
            credentials,
            options,
            by_slave: HashMap::new(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.options.heartbeat_interval
    }

    pub fn get(&mut self, slave: u8) -> &mut Session {
        let Self {
            credentials,
            options,
            by_slave,
        } = self;
        by_slave
            .entry(slave)
            .or_insert_with(|| Session::new(slave, credentials.clone(), options.clone()))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.by_slave.values_mut()
    }
}

/// Map device-level rejections to `AuthenticationFailed`, keep transport
/// errors as they are so the scheduler can retry them.
fn rejected(step: &str, error: Error) -> Error {
    match error {
        Error::DeviceException(_) | Error::AccessDenied | Error::Protocol(_) => {
            Error::AuthenticationFailed(format!("{step}: {error}"))
        }
        other => other,
    }
}

async fn vendor(
    transport: &mut dyn Transport,
    slave: u8,
    sub_function: u8,
    payload: Vec<u8>,
) -> Result<Vec<u8>> {
    let request = Request::Vendor {
        sub_function,
        payload,
    };
    match transport.exchange(slave, &request).await?.into_result()? {
        Response::Vendor { payload, .. } => Ok(payload),
        other => Err(Error::Protocol(format!("unexpected login response {other:?}"))),
    }
}

/// Size of the 0x25 payload for `username`: client challenge, name length,
/// name, hash length, hash.
fn login_payload_len(username: &[u8]) -> Result<usize> {
    let len = CHALLENGE_LEN + 1 + username.len() + 1 + HASH_LEN;
    if len > MAX_VENDOR_PAYLOAD {
        return Err(Error::invalid(format!(
            "user name of {} bytes makes a {len}-byte login, at most {MAX_VENDOR_PAYLOAD} fit",
            username.len()
        )));
    }
    Ok(len)
}

async fn login(transport: &mut dyn Transport, slave: u8, credentials: &Credentials) -> Result<()> {
    let username = credentials.username.as_bytes();
    let payload_len = login_payload_len(username)?;

    let device_challenge = vendor(transport, slave, SUB_CHALLENGE, vec![0x00])
        .await
        .map_err(|e| rejected("challenge", e))?;
    if device_challenge.len() < CHALLENGE_LEN {
        return Err(Error::AuthenticationFailed(format!(
            "device challenge is {} bytes",
            device_challenge.len()
        )));
    }
    let device_challenge = &device_challenge[..CHALLENGE_LEN];

    let mut client_challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut client_challenge);

    let hash = challenge_response(&credentials.password, device_challenge)?;

    let mut payload = Vec::with_capacity(payload_len);
    payload.extend_from_slice(&client_challenge);
    payload.push(username.len() as u8);
    payload.extend_from_slice(username);
    payload.push(hash.len() as u8);
    payload.extend_from_slice(&hash);

    let reply = vendor(transport, slave, SUB_LOGIN, payload)
        .await
        .map_err(|e| rejected("login", e))?;

    match reply.as_slice() {
        [0, len, rest @ ..] if rest.len() >= *len as usize => {
            let key = Sha256::digest(credentials.password.as_bytes());
            let mut mac = HmacSha256::new_from_slice(&key)
                .map_err(|e| Error::AuthenticationFailed(format!("hmac key: {e}")))?;
            mac.update(&client_challenge);
            mac.verify_slice(&rest[..*len as usize])
                .map_err(|_| Error::AuthenticationFailed("device proof does not match".into()))
        }
        [0, ..] => Err(Error::AuthenticationFailed("truncated login reply".into())),
        [status, ..] => Err(Error::AuthenticationFailed(format!(
            "device rejected credentials (status {status})"
        ))),
        [] => Err(Error::AuthenticationFailed("empty login reply".into())),
    }
}
