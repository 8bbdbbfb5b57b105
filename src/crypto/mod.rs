//! Symmetric channel installed once the handshake completes.
//!
//! Each frame is sealed independently with ChaCha20-Poly1305 under a random
//! 96-bit nonce prepended to the ciphertext; the AEAD tag rejects tampering,
//! replayed-then-spliced content, and truncation at frame granularity.

pub mod exchange;

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Session key derived by the handshake; wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("frame too short to carry nonce and tag")]
    Truncated,
    #[error("frame failed authentication")]
    Authentication,
}

/// Bidirectional per-frame authenticated cipher. Immutable once built, so a
/// single instance is shared between the wire loop (encrypt) and the
/// dispatch loop (decrypt).
pub struct FrameCipher {
    cipher: ChaCha20Poly1305,
}

impl FrameCipher {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
        }
    }

    /// Seals one frame; output is nonce ‖ ciphertext ‖ tag.
    pub fn encrypt(&self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), frame)
            .map_err(|_| CryptoError::Authentication)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Opens one frame produced by [`FrameCipher::encrypt`] on the peer.
    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if frame.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce, sealed) = frame.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Authentication)
    }
}

impl fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FrameCipher")
    }
}
