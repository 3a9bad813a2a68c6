//! Authenticated encryption for the main endpoint.
//!
//! A worker holds a long-term X25519 keypair and an allowlist of client
//! public keys. Each connection runs the handshake in [`handshake`] and then
//! exchanges frames sealed by [`channel`].

pub mod channel;
pub mod handshake;

use std::collections::HashSet;
use std::fmt;
use std::io;

use rand::rngs::OsRng;
use x25519_dalek::StaticSecret;

use crate::config::AuthConfig;
use crate::wire::codec::CodecError;

pub const KEY_SIZE_BYTES: usize = 32;

#[derive(Debug)]
pub enum AuthError {
    MissingSecretKey,
    InvalidKeyHex {
        field: &'static str,
        source: hex::FromHexError,
    },
    InvalidKeyLength {
        field: &'static str,
        length: usize,
    },
    Unauthorized {
        public_key: String,
    },
    MalformedHandshake {
        expected: usize,
        actual: usize,
    },
    Handshake(CodecError),
    SealFailed,
    OpenFailed,
    NonceExhausted,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSecretKey => {
                write!(f, "authentication is enabled but auth.secret_key is empty")
            }
            Self::InvalidKeyHex { field, source } => {
                write!(f, "{field} is not valid hex: {source}")
            }
            Self::InvalidKeyLength { field, length } => write!(
                f,
                "{field} must be {KEY_SIZE_BYTES} bytes, got {length}"
            ),
            Self::Unauthorized { public_key } => {
                write!(f, "client key {public_key} is not authorized")
            }
            Self::MalformedHandshake { expected, actual } => write!(
                f,
                "malformed handshake frame: expected {expected} bytes, got {actual}"
            ),
            Self::Handshake(source) => write!(f, "handshake transport error: {source}"),
            Self::SealFailed => write!(f, "failed to seal frame"),
            Self::OpenFailed => write!(f, "frame failed authentication"),
            Self::NonceExhausted => write!(f, "channel nonce space exhausted"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<CodecError> for AuthError {
    fn from(value: CodecError) -> Self {
        Self::Handshake(value)
    }
}

impl From<io::Error> for AuthError {
    fn from(value: io::Error) -> Self {
        Self::Handshake(CodecError::Io(value))
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PublicKey([u8; KEY_SIZE_BYTES]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(field: &'static str, value: &str) -> Result<Self, AuthError> {
        decode_key(field, value).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub(crate) fn to_dalek(self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.0)
    }
}

impl From<&StaticSecret> for PublicKey {
    fn from(secret: &StaticSecret) -> Self {
        Self(x25519_dalek::PublicKey::from(secret).to_bytes())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Clone)]
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_secret_hex(value: &str) -> Result<Self, AuthError> {
        if value.trim().is_empty() {
            return Err(AuthError::MissingSecretKey);
        }
        let bytes = decode_key("auth.secret_key", value)?;
        Ok(Self::from_secret(StaticSecret::from(bytes)))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Allowlist of client keys. An empty list accepts any client that completes the handshake.
#[derive(Clone, Debug, Default)]
pub struct Authenticator {
    authorized: HashSet<PublicKey>,
}

impl Authenticator {
    pub fn new(authorized: impl IntoIterator<Item = PublicKey>) -> Self {
        Self {
            authorized: authorized.into_iter().collect(),
        }
    }

    pub fn allows_any(&self) -> bool {
        self.authorized.is_empty()
    }

    pub fn is_authorized(&self, key: &PublicKey) -> bool {
        self.allows_any() || self.authorized.contains(key)
    }

    pub fn authorized_count(&self) -> usize {
        self.authorized.len()
    }
}

#[derive(Clone, Debug)]
pub struct AuthIdentity {
    keypair: Keypair,
    authenticator: Authenticator,
}

impl AuthIdentity {
    pub fn new(keypair: Keypair, authenticator: Authenticator) -> Self {
        Self {
            keypair,
            authenticator,
        }
    }

    /// `Ok(None)` when authentication is disabled.
    pub fn from_config(config: &AuthConfig) -> Result<Option<Self>, AuthError> {
        if !config.enabled {
            return Ok(None);
        }

        let keypair = Keypair::from_secret_hex(&config.secret_key)?;
        let authorized = config
            .authorized_keys
            .iter()
            .map(|key| PublicKey::from_hex("auth.authorized_keys", key))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Self::new(keypair, Authenticator::new(authorized))))
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }
}

fn decode_key(field: &'static str, value: &str) -> Result<[u8; KEY_SIZE_BYTES], AuthError> {
    let bytes = hex::decode(value.trim()).map_err(|source| AuthError::InvalidKeyHex { field, source })?;
    <[u8; KEY_SIZE_BYTES]>::try_from(bytes.as_slice()).map_err(|_| AuthError::InvalidKeyLength {
        field,
        length: bytes.len(),
    })
}
