//! HMAC-SHA256 request signing.
//!
//! Every webhook body is signed with the delivery's secret token. The
//! signature header value is `sha256=` followed by the lowercase hex digest
//! of `HMAC-SHA256(secret_token, body)`, computed over the exact bytes sent.
//! Receivers recompute it to verify authenticity.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "X-Courier-Signature";

/// Prefix of the signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Signature verification errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// Missing or empty signature header.
    #[error("signature header missing")]
    MissingSignature,
    /// Header value is not `sha256=<hex>`.
    #[error("invalid signature format: {0}")]
    InvalidFormat(String),
    /// Signature does not match the body.
    #[error("signature verification failed")]
    VerificationFailed,
    /// Secret key was rejected by the MAC.
    #[error("invalid secret key")]
    InvalidSecret,
}

fn mac(secret: &str, body: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(body);
    Ok(mac)
}

/// Computes the signature header value for `body`.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the key is rejected.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, SignatureError> {
    let digest = mac(secret, body)?.finalize().into_bytes();
    Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(digest)))
}

/// Verifies a received signature header value against `body`.
///
/// Comparison runs in constant time.
///
/// # Errors
///
/// Returns `MissingSignature` for an empty header, `InvalidFormat` when the
/// value is not `sha256=<hex>`, and `VerificationFailed` on mismatch.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::MissingSignature);
    }

    let hex_digest = signature.strip_prefix(SIGNATURE_PREFIX).ok_or_else(|| {
        SignatureError::InvalidFormat(format!("expected '{SIGNATURE_PREFIX}<hex>'"))
    })?;
    let expected = hex::decode(hex_digest)
        .map_err(|e| SignatureError::InvalidFormat(format!("digest is not hex: {e}")))?;

    mac(secret, body)?.verify_slice(&expected).map_err(|_| SignatureError::VerificationFailed)
}
