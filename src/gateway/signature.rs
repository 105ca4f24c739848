//! Webhook authenticity check.
//!
//! The provider signs the raw request body with a shared secret
//! (HMAC-SHA512, hex encoded) and sends the result in a vendor header.
//! Verification goes through `Mac::verify_slice`, which compares in constant
//! time, so the check leaks nothing about the secret.

use hmac::{Hmac, Mac};
use sha2::Sha512;

use crate::error::GatewayError;

type HmacSha512 = Hmac<Sha512>;

pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

/// Verify a hex-encoded HMAC-SHA512 signature over the raw body.
pub fn verify_signature(
    secret: &[u8],
    body: &[u8],
    signature_hex: &str,
) -> Result<(), GatewayError> {
    let expected = hex::decode(signature_hex).map_err(|_| GatewayError::InvalidSignature)?;

    let mut mac =
        HmacSha512::new_from_slice(secret).map_err(|_| GatewayError::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| GatewayError::InvalidSignature)
}

/// Sign a body the way the provider does. Used by tests.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha512::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_signature_accepted() {
        let secret = b"whsec_test";
        let body = br#"{"event":"charge.success","data":{"reference":"abc"}}"#;
        let sig = sign(secret, body);
        assert!(verify_signature(secret, body, &sig).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let secret = b"whsec_test";
        let sig = sign(secret, b"original body");
        assert!(matches!(
            verify_signature(secret, b"tampered body", &sig),
            Err(GatewayError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = b"payload";
        let sig = sign(b"secret_a", body);
        assert!(verify_signature(b"secret_b", body, &sig).is_err());
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        assert!(verify_signature(b"secret", b"payload", "not-hex!").is_err());
    }
}
