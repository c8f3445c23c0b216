//! Step-bound authentication tokens.

use hmac::Mac;

use crate::crypto::{HmacSha256, SecureRandom, SharedSecret, NONCE_SIZE, TOKEN_SIZE};

fn keyed_mac(secret: &SharedSecret, step: i64, nonce: &[u8], identity: &str) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(&(step as u64).to_be_bytes());
    mac.update(nonce);
    mac.update(identity.as_bytes());
    mac
}

/// Compute `HMAC-SHA256(secret, be64(step) ‖ nonce ‖ identity)`.
pub fn compute_token(
    secret: &SharedSecret,
    step: i64,
    nonce: &[u8],
    identity: &str,
) -> [u8; TOKEN_SIZE] {
    let digest = keyed_mac(secret, step, nonce, identity).finalize().into_bytes();

    let mut token = [0u8; TOKEN_SIZE];
    token.copy_from_slice(&digest);
    token
}

/// Draw a fresh nonce and compute the token for it.
pub fn issue(
    secret: &SharedSecret,
    step: i64,
    identity: &str,
) -> ([u8; NONCE_SIZE], [u8; TOKEN_SIZE]) {
    let nonce = SecureRandom::nonce();
    let token = compute_token(secret, step, &nonce, identity);
    (nonce, token)
}

/// Recompute the token and compare in constant time.
pub fn verify(
    secret: &SharedSecret,
    step: i64,
    nonce: &[u8],
    token: &[u8],
    identity: &str,
) -> bool {
    keyed_mac(secret, step, nonce, identity)
        .verify_slice(token)
        .is_ok()
}
