//! Token and credential helpers for DuoCall Server
//!
//! Server-side crypto is minimal:
//! - Guest identity and session token generation
//! - Token hashing for storage
//! - Time-limited TURN credentials

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use ring::{
    digest, hmac,
    rand::{SecureRandom, SystemRandom},
};

const GUEST_ID_LENGTH: usize = 10;
const SESSION_TOKEN_LENGTH: usize = 32;

const GUEST_ID_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

fn random_bytes<const N: usize>() -> anyhow::Result<[u8; N]> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; N];
    rng.fill(&mut bytes)
        .map_err(|_| anyhow::anyhow!("system random source unavailable"))?;
    Ok(bytes)
}

/// Generate a random guest user ID (alphanumeric)
pub fn generate_guest_id() -> anyhow::Result<String> {
    let bytes = random_bytes::<GUEST_ID_LENGTH>()?;
    Ok(bytes
        .iter()
        .map(|b| GUEST_ID_ALPHABET[(*b as usize) % GUEST_ID_ALPHABET.len()] as char)
        .collect())
}

/// Generate a guest session token (base64url, 32 bytes)
pub fn generate_session_token() -> anyhow::Result<String> {
    let bytes = random_bytes::<SESSION_TOKEN_LENGTH>()?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a token for storage (SHA-256)
pub fn hash_token(token: &str) -> String {
    let hash = digest::digest(&digest::SHA256, token.as_bytes());
    hex::encode(hash.as_ref())
}

/// Generate TURN credentials valid for `ttl_seconds` (TURN REST convention)
pub fn generate_turn_credentials(username: &str, secret: &str, ttl_seconds: u64) -> (String, String) {
    let expiry = Utc::now().timestamp().max(0) as u64 + ttl_seconds;
    let turn_username = format!("{}:{}", expiry, username);

    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret.as_bytes());
    let signature = hmac::sign(&key, turn_username.as_bytes());
    let turn_credential = base64::engine::general_purpose::STANDARD.encode(signature.as_ref());

    (turn_username, turn_credential)
}
