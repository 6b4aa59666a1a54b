//! Credential handling
//!
//! SIP credentials are stored as digest HA1 (RFC 2617 style,
//! `MD5(user:realm:password)`), which lets the registrar verify a
//! digest response without ever holding the plaintext password.
//! Voicemail PINs, which arrive as plain DTMF digits, use a salted
//! SHA-256 instead.

use md5::{Digest as _, Md5};
use rand::RngCore;
use sha2::Sha256;

/// Compute the stored HA1 credential for an extension's password.
pub fn ha1(extension: &str, realm: &str, password: &str) -> String {
    md5_hex(&format!("{extension}:{realm}:{password}"))
}

/// Verify a digest response for a request.
///
/// `response` must equal `MD5(HA1:nonce:MD5(method:uri))` per RFC 2617
/// (no qop, as deployed desk phones overwhelmingly use the compatibility
/// form).
pub fn verify_digest(
    stored_ha1: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    response: &str,
) -> bool {
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    let expected = md5_hex(&format!("{stored_ha1}:{nonce}:{ha2}"));
    expected.eq_ignore_ascii_case(response)
}

/// A fresh random nonce for a WWW-Authenticate challenge.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash a voicemail PIN with a fresh random salt. Returns (hash, salt),
/// both hex.
pub fn hash_pin(pin: &str) -> (String, String) {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt_hex = hex::encode(salt);
    (hash_pin_with_salt(pin, &salt_hex), salt_hex)
}

/// Recompute a PIN hash under a known salt.
pub fn hash_pin_with_salt(pin: &str, salt_hex: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt_hex.as_bytes());
    hasher.update(pin.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify a voicemail PIN against its stored hash and salt.
pub fn verify_pin(pin: &str, stored_hash: &str, salt_hex: &str) -> bool {
    hash_pin_with_salt(pin, salt_hex) == stored_hash
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Pull a quoted parameter out of a Digest Authorization header value.
pub fn digest_param<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{name}=");
    let mut rest = header;
    loop {
        let idx = rest.find(&needle)?;
        // Must be at a parameter boundary, not inside another token
        let at_boundary = idx == 0
            || matches!(rest.as_bytes()[idx - 1], b' ' | b',' | b'\t');
        let after = &rest[idx + needle.len()..];
        if !at_boundary {
            rest = after;
            continue;
        }
        return if let Some(quoted) = after.strip_prefix('"') {
            quoted.split('"').next()
        } else {
            after.split([',', ' ']).next()
        };
    }
}
