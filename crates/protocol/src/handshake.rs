//! Connection handshake and RSA challenge/response authentication.
//!
//! ```text
//! host                              device
//!  | -- CNXN(version, maxdata, "host::banner") -->
//!  | <-- AUTH(TOKEN, token) -----------------------   (optional)
//!  | -- AUTH(SIGNATURE, sign(token)) ------------->   once per signer
//!  | <-- AUTH(TOKEN, token) -----------------------   signature refused
//!  | -- AUTH(RSAPUBLICKEY, key) ------------------>   user must accept
//!  | <-- CNXN(version, maxdata, "device::props") --
//! ```

use std::time::{Duration, Instant};

use crate::auth::AuthSigner;
use crate::error::{AdbError, Phase, Result};
use crate::message::{
    AdbMessage, Command, Framer, AUTH_RSAPUBLICKEY, AUTH_SIGNATURE, AUTH_TOKEN,
    DEFAULT_MAX_PAYLOAD, MAX_PAYLOAD_LIMIT, PROTOCOL_VERSION,
};
use crate::transport::Transport;

/// Default overall handshake timeout, covering the wait for the user to
/// accept a newly offered key.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for connecting to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Host identity sent in CNXN as `host::<banner>`.
    pub banner: String,
    /// Overall deadline for the whole handshake.
    pub auth_timeout: Duration,
    /// Largest payload this side accepts.
    pub max_payload: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            banner: String::new(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl ConnectOptions {
    /// Options with the given banner and default limits.
    pub fn with_banner(banner: impl Into<String>) -> Self {
        Self {
            banner: banner.into(),
            ..Self::default()
        }
    }
}

/// State of the connection handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent yet.
    Unconnected,
    /// CNXN sent, waiting for the device.
    AwaitingResponse,
    /// The device challenged us with AUTH.
    Authenticating,
    /// The device answered with CNXN.
    Connected,
    /// Every signer and the public key were refused. Terminal.
    AuthFailed,
}

/// Identity string the device returns in its CNXN payload.
///
/// Shaped `<state>::<prop>;<prop>;...`, for example
/// `device::ro.product.name=sailfish;ro.product.model=Pixel;features=shell_v2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBanner {
    raw: String,
    state: String,
    properties: Vec<String>,
}

impl DeviceBanner {
    /// Parses a CNXN payload. A trailing NUL is ignored.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let raw = String::from_utf8_lossy(payload)
            .trim_end_matches('\0')
            .to_string();

        let (state, props) = raw
            .split_once("::")
            .ok_or_else(|| AdbError::MalformedBanner(raw.clone()))?;

        let properties = props
            .split(';')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            state: state.to_string(),
            properties,
            raw,
        })
    }

    /// The complete banner text.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Readiness state, e.g. `device`, `recovery`, `sideload`.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Build properties, in order, uninterpreted.
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    /// Looks up a `key=value` property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.iter().find_map(|p| {
            p.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// Entries of the comma-separated `features` property.
    pub fn features(&self) -> Vec<&str> {
        self.property("features")
            .map(|f| f.split(',').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

/// What a successful handshake produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Parsed device banner.
    pub banner: DeviceBanner,
    /// Protocol version the device reported.
    pub device_version: u32,
    /// Payload limit both sides honor.
    pub max_payload: usize,
    /// Whether an AUTH exchange took place.
    pub authenticated: bool,
}

/// Drives one connection attempt from first contact to `Connected`.
pub struct Handshake<'a, S> {
    signers: &'a [S],
    options: &'a ConnectOptions,
    state: HandshakeState,
    signatures_sent: usize,
    public_key_offered: bool,
}

impl<'a, S: AuthSigner> Handshake<'a, S> {
    /// Prepares a handshake that will try `signers` in order.
    pub fn new(signers: &'a [S], options: &'a ConnectOptions) -> Self {
        Self {
            signers,
            options,
            state: HandshakeState::Unconnected,
            signatures_sent: 0,
            public_key_offered: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Number of AUTH SIGNATURE messages sent.
    pub fn signatures_sent(&self) -> usize {
        self.signatures_sent
    }

    /// Whether AUTH RSAPUBLICKEY was sent.
    pub fn public_key_offered(&self) -> bool {
        self.public_key_offered
    }

    /// Runs the handshake over `framer` until the device sends CNXN.
    ///
    /// On success the framer's payload limit is set to the negotiated value.
    pub fn run<T: Transport>(&mut self, framer: &mut Framer<T>) -> Result<HandshakeOutcome> {
        if self.state == HandshakeState::AuthFailed {
            return Err(AdbError::Authentication(
                "connection attempt already failed authentication".to_string(),
            ));
        }

        let deadline = Instant::now() + self.options.auth_timeout;
        let local_max = self.options.max_payload.clamp(1, MAX_PAYLOAD_LIMIT);
        // Handshake frames are not bound by the limit being advertised.
        framer.set_max_payload(MAX_PAYLOAD_LIMIT);

        let identity = format!("host::{}\0", self.options.banner);
        let cnxn = AdbMessage::new(
            Command::Cnxn,
            PROTOCOL_VERSION,
            local_max as u32,
            identity.into_bytes(),
        );
        framer
            .send(&cnxn, self.remaining(deadline)?)
            .map_err(|e| e.during(Phase::Handshake))?;
        self.state = HandshakeState::AwaitingResponse;
        tracing::debug!(max_payload = local_max, "Sent CNXN");

        loop {
            let message = framer
                .receive(self.remaining(deadline)?)
                .map_err(|e| e.during(Phase::Handshake))?;

            match message.command {
                Command::Cnxn => {
                    let banner = DeviceBanner::parse(&message.payload)?;
                    let max_payload = match message.arg1 as usize {
                        0 => local_max,
                        device_max => device_max.min(local_max),
                    };
                    framer.set_max_payload(max_payload);
                    self.state = HandshakeState::Connected;

                    tracing::info!(
                        state = banner.state(),
                        version = format_args!("0x{:08x}", message.arg0),
                        max_payload,
                        "Connected"
                    );

                    return Ok(HandshakeOutcome {
                        banner,
                        device_version: message.arg0,
                        max_payload,
                        authenticated: self.signatures_sent > 0 || self.public_key_offered,
                    });
                }
                Command::Auth if message.arg0 == AUTH_TOKEN => {
                    self.state = HandshakeState::Authenticating;
                    self.answer_challenge(framer, &message.payload, deadline)?;
                }
                Command::Auth => {
                    return Err(AdbError::Protocol(format!(
                        "unexpected AUTH subtype {} from device",
                        message.arg0
                    )));
                }
                other => {
                    return Err(AdbError::Protocol(format!(
                        "unexpected {} during handshake",
                        other
                    )));
                }
            }
        }
    }

    fn answer_challenge<T: Transport>(
        &mut self,
        framer: &mut Framer<T>,
        token: &[u8],
        deadline: Instant,
    ) -> Result<()> {
        if let Some(signer) = self.signers.get(self.signatures_sent) {
            let signature = signer.sign(token)?;
            let reply = AdbMessage::new(Command::Auth, AUTH_SIGNATURE, 0, signature);
            framer
                .send(&reply, self.remaining(deadline)?)
                .map_err(|e| e.during(Phase::Handshake))?;
            self.signatures_sent += 1;
            tracing::debug!(signer = self.signatures_sent, "Sent AUTH signature");
            return Ok(());
        }

        if !self.public_key_offered {
            if let Some(signer) = self.signers.first() {
                let mut key = signer.public_key();
                key.push(0);
                let reply = AdbMessage::new(Command::Auth, AUTH_RSAPUBLICKEY, 0, key);
                framer
                    .send(&reply, self.remaining(deadline)?)
                    .map_err(|e| e.during(Phase::Handshake))?;
                self.public_key_offered = true;
                tracing::info!("Offered public key, waiting for the device to accept it");
                return Ok(());
            }
        }

        self.state = HandshakeState::AuthFailed;
        let reason = if self.signers.is_empty() {
            "device requires authentication and no signer is configured".to_string()
        } else {
            format!(
                "device refused {} signature(s) and the offered public key",
                self.signatures_sent
            )
        };
        Err(AdbError::Authentication(reason))
    }

    fn remaining(&self, deadline: Instant) -> Result<Duration> {
        let now = Instant::now();
        if now >= deadline {
            return Err(AdbError::Timeout {
                phase: Phase::Handshake,
                detail: format!(
                    "no CNXN within {}ms (state {:?})",
                    self.options.auth_timeout.as_millis(),
                    self.state
                ),
            });
        }
        Ok(deadline - now)
    }
}
