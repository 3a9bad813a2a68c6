//! Two-message key agreement run before any request frame.
//!
//! ```text
//! client -> server   client static public (32) | client ephemeral public (32)
//! server -> client   server ephemeral public (32)
//! ```
//!
//! Both sides mix three X25519 results (ephemeral/ephemeral,
//! server-ephemeral/client-static, server-static/client-ephemeral) with a
//! transcript hash into one key per direction. Only a client holding the
//! secret for an authorized static key, talking to the holder of the
//! expected server key, ends up with matching keys.

use std::io::{Read, Write};

use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::StaticSecret;

use crate::wire::codec::WireCodec;

use super::channel::{Opener, Sealer};
use super::{AuthError, AuthIdentity, Keypair, PublicKey, KEY_SIZE_BYTES};

const HELLO_SIZE_BYTES: usize = KEY_SIZE_BYTES * 2;
const CLIENT_TO_SERVER_LABEL: &[u8] = b"obelisk c2s";
const SERVER_TO_CLIENT_LABEL: &[u8] = b"obelisk s2c";

struct SharedSecrets {
    ee: [u8; 32],
    es: [u8; 32],
    se: [u8; 32],
    transcript: [u8; 32],
}

impl SharedSecrets {
    fn key(&self, label: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(label);
        hasher.update(self.ee);
        hasher.update(self.es);
        hasher.update(self.se);
        hasher.update(self.transcript);
        hasher.finalize().into()
    }
}

fn transcript(
    client_static: &PublicKey,
    client_ephemeral: &PublicKey,
    server_ephemeral: &PublicKey,
    server_static: &PublicKey,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(client_static.as_bytes());
    hasher.update(client_ephemeral.as_bytes());
    hasher.update(server_ephemeral.as_bytes());
    hasher.update(server_static.as_bytes());
    hasher.finalize().into()
}

fn split_key(bytes: &[u8]) -> PublicKey {
    let mut key = [0_u8; KEY_SIZE_BYTES];
    key.copy_from_slice(bytes);
    PublicKey::from_bytes(key)
}

/// Server side. Returns the authenticated client key and the channel halves.
pub fn accept<S: Read + Write>(
    stream: &mut S,
    codec: &WireCodec,
    identity: &AuthIdentity,
) -> Result<(PublicKey, Sealer, Opener), AuthError> {
    let hello = codec.read_frame(stream)?;
    if hello.len() != HELLO_SIZE_BYTES {
        return Err(AuthError::MalformedHandshake {
            expected: HELLO_SIZE_BYTES,
            actual: hello.len(),
        });
    }

    let client_static = split_key(&hello[..KEY_SIZE_BYTES]);
    let client_ephemeral = split_key(&hello[KEY_SIZE_BYTES..]);
    if !identity.authenticator().is_authorized(&client_static) {
        return Err(AuthError::Unauthorized {
            public_key: client_static.to_hex(),
        });
    }

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let server_ephemeral = PublicKey::from(&ephemeral);
    codec.write_frame(stream, server_ephemeral.as_bytes())?;

    let secrets = SharedSecrets {
        ee: ephemeral.diffie_hellman(&client_ephemeral.to_dalek()).to_bytes(),
        es: ephemeral.diffie_hellman(&client_static.to_dalek()).to_bytes(),
        se: identity
            .keypair()
            .secret()
            .diffie_hellman(&client_ephemeral.to_dalek())
            .to_bytes(),
        transcript: transcript(
            &client_static,
            &client_ephemeral,
            &server_ephemeral,
            &identity.public_key(),
        ),
    };

    Ok((
        client_static,
        Sealer::new(&secrets.key(SERVER_TO_CLIENT_LABEL)),
        Opener::new(&secrets.key(CLIENT_TO_SERVER_LABEL)),
    ))
}

/// Client side, given the worker's published public key.
pub fn connect<S: Read + Write>(
    stream: &mut S,
    codec: &WireCodec,
    keypair: &Keypair,
    server_public: &PublicKey,
) -> Result<(Sealer, Opener), AuthError> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let client_ephemeral = PublicKey::from(&ephemeral);

    let mut hello = Vec::with_capacity(HELLO_SIZE_BYTES);
    hello.extend_from_slice(keypair.public().as_bytes());
    hello.extend_from_slice(client_ephemeral.as_bytes());
    codec.write_frame(stream, &hello)?;

    let reply = codec.read_frame(stream)?;
    if reply.len() != KEY_SIZE_BYTES {
        return Err(AuthError::MalformedHandshake {
            expected: KEY_SIZE_BYTES,
            actual: reply.len(),
        });
    }
    let server_ephemeral = split_key(&reply);

    let secrets = SharedSecrets {
        ee: ephemeral.diffie_hellman(&server_ephemeral.to_dalek()).to_bytes(),
        es: keypair
            .secret()
            .diffie_hellman(&server_ephemeral.to_dalek())
            .to_bytes(),
        se: ephemeral.diffie_hellman(&server_public.to_dalek()).to_bytes(),
        transcript: transcript(
            &keypair.public(),
            &client_ephemeral,
            &server_ephemeral,
            server_public,
        ),
    };

    Ok((
        Sealer::new(&secrets.key(CLIENT_TO_SERVER_LABEL)),
        Opener::new(&secrets.key(SERVER_TO_CLIENT_LABEL)),
    ))
}
