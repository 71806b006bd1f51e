//! Keyed hashing and sealing primitives shared by the macaroon code.
//!
//! - [`keyed_hash`]: `HMAC-SHA256(key, data)`
//! - [`seal`]/[`open`]: XChaCha20-Poly1305 under a random 24-byte nonce that
//!   is prefixed to the ciphertext.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of the random nonce prefixed to every sealed payload.
pub(crate) const NONCE_LEN: usize = 24;

/// Length of the Poly1305 tag appended to every sealed payload.
pub(crate) const TAG_LEN: usize = 16;

/// Computes `HMAC-SHA256(key, data)`.
pub(crate) fn keyed_hash(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Computes `HMAC(key, HMAC(key, a) || HMAC(key, b))`.
pub(crate) fn keyed_hash2(key: &[u8], a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut joined = [0u8; 64];
    joined[..32].copy_from_slice(&keyed_hash(key, a));
    joined[32..].copy_from_slice(&keyed_hash(key, b));
    keyed_hash(key, &joined)
}

/// Seals `plaintext` under `key`.
///
/// Output layout: `nonce (24) || ciphertext || tag (16)`. Returns `None`
/// only if the AEAD refuses the plaintext length.
pub(crate) fn seal(key: &[u8; 32], plaintext: &[u8]) -> Option<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .ok()?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Some(out)
}

/// Opens a payload produced by [`seal`].
///
/// Returns `None` if the payload is truncated or does not authenticate.
pub(crate) fn open(key: &[u8; 32], sealed: &[u8]) -> Option<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return None;
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher.decrypt(XNonce::from_slice(nonce), ciphertext).ok()
}
