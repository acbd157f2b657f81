//! Session key material and end-to-end encryption.
//!
//! A session is one local X25519 key pair. Its hex-encoded public key is
//! the `session_id` the relay routes by. Peers exchange NaCl authenticated
//! boxes (TweetNaCl-compatible); the ciphertext framing is the 24-byte
//! nonce followed by the box output.
//!
//! The relay may also attach a `request_source` blob sealed with an
//! anonymous box (libsodium sealed-box layout: ephemeral public key
//! followed by the box, nonce derived via blake2b). Only the receiver's
//! key pair is needed to open it.

use crypto_box::{
    aead::{Aead, OsRng},
    Nonce, PublicKey, SalsaBox, SecretKey,
};

use crate::error::BridgeError;

/// NaCl box nonce length in bytes.
const NONCE_LEN: usize = 24;

/// X25519 key length in bytes.
const KEY_LEN: usize = 32;

/// A local session key pair.
///
/// Generated fresh per pairing, or restored from persisted secret bytes by
/// the host on restart.
#[derive(Clone)]
pub struct SessionKeypair {
    secret: SecretKey,
    public: PublicKey,
}

impl std::fmt::Debug for SessionKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeypair")
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

impl SessionKeypair {
    /// Generate a fresh random key pair.
    #[must_use]
    pub fn generate() -> Self {
        let secret = SecretKey::generate(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Restore a key pair from persisted secret bytes.
    #[must_use]
    pub fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = SecretKey::from(bytes);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Secret bytes for host-side persistence.
    #[must_use]
    pub fn secret_bytes(&self) -> [u8; KEY_LEN] {
        self.secret.to_bytes()
    }

    /// This session's public key.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Hex-encoded public key, used as the relay routing id.
    #[must_use]
    pub fn session_id(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    /// Encrypt plaintext for `receiver` with an authenticated box.
    ///
    /// Output framing is `nonce || box(plaintext)`.
    pub fn encrypt(&self, plaintext: &[u8], receiver: &PublicKey) -> Result<Vec<u8>, BridgeError> {
        let shared_box = SalsaBox::new(receiver, &self.secret);
        let nonce = Nonce::from(rand::random::<[u8; NONCE_LEN]>());

        let ciphertext = shared_box
            .encrypt(&nonce, plaintext)
            .map_err(|e| BridgeError::Crypto(format!("encryption failed: {e}")))?;

        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(nonce.as_slice());
        framed.extend_from_slice(&ciphertext);
        Ok(framed)
    }

    /// Decrypt a `nonce || box` payload from `sender`.
    pub fn decrypt(&self, payload: &[u8], sender: &PublicKey) -> Result<Vec<u8>, BridgeError> {
        if payload.len() <= NONCE_LEN {
            return Err(BridgeError::Crypto(format!(
                "ciphertext too short: {} bytes",
                payload.len()
            )));
        }
        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let shared_box = SalsaBox::new(sender, &self.secret);
        shared_box
            .decrypt(nonce, ciphertext)
            .map_err(|e| BridgeError::Crypto(format!("decryption failed: {e}")))
    }

    /// Open an anonymous sealed box addressed to this session.
    ///
    /// The sender used an ephemeral key pair, so nothing about its identity
    /// is needed here.
    pub fn open_sealed(&self, sealed: &[u8]) -> Result<Vec<u8>, BridgeError> {
        if sealed.len() <= KEY_LEN {
            return Err(BridgeError::Crypto(format!(
                "sealed box too short: {} bytes",
                sealed.len()
            )));
        }
        self.secret
            .unseal(sealed)
            .map_err(|e| BridgeError::Crypto(format!("sealed box open failed: {e}")))
    }
}

/// Parse a hex-encoded peer public key (a `session_id` or `client_id`).
pub fn public_key_from_hex(id: &str) -> Result<PublicKey, BridgeError> {
    let bytes = hex::decode(id)
        .map_err(|e| BridgeError::Crypto(format!("invalid hex public key: {e}")))?;
    let arr: [u8; KEY_LEN] = bytes
        .try_into()
        .map_err(|_| BridgeError::Crypto(format!("public key must be {KEY_LEN} bytes")))?;
    Ok(PublicKey::from(arr))
}
