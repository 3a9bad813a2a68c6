use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use super::AuthError;

const NONCE_SIZE_BYTES: usize = 12;

fn nonce_for(counter: u64) -> [u8; NONCE_SIZE_BYTES] {
    let mut nonce = [0_u8; NONCE_SIZE_BYTES];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Outbound half of a sealed connection. Nonces are a per-direction counter.
pub struct Sealer {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl Sealer {
    pub(crate) fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, AuthError> {
        let nonce = nonce_for(self.counter);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| AuthError::SealFailed)?;
        self.counter = self.counter.checked_add(1).ok_or(AuthError::NonceExhausted)?;
        Ok(sealed)
    }
}

/// Inbound half; frames must arrive in the order they were sealed.
pub struct Opener {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl Opener {
    pub(crate) fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, AuthError> {
        let nonce = nonce_for(self.counter);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed)
            .map_err(|_| AuthError::OpenFailed)?;
        self.counter = self.counter.checked_add(1).ok_or(AuthError::NonceExhausted)?;
        Ok(plaintext)
    }
}
