//! HMAC-SHA256 signature verification for Binance-style signed endpoints.
//!
//! Grounded on the teacher's Polymarket signer in `vault::execution`
//! (`hmac::{Hmac, Mac}` + `sha2::Sha256`), extended from their fixed-field
//! request signer to Binance's raw-query-string signing scheme: the
//! signature covers the exact query string (minus `signature` itself) and
//! is hex-encoded rather than base64, matching what Binance clients send.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::ExchangeError;
use crate::exchange::account::AccountManager;
use crate::exchange::types::UserId;

type HmacSha256 = Hmac<Sha256>;

/// Verifies `signature` is the HMAC-SHA256 of `query_without_signature`
/// keyed by the user's secret, and that `timestamp` is within `recv_window_ms`
/// of `now_ms`. Returns the resolved user id on success.
pub fn verify_signed_request(
    accounts: &AccountManager,
    api_key: &str,
    api_secret: &str,
    query_without_signature: &str,
    signature_hex: &str,
    timestamp_ms: i64,
    now_ms: i64,
    recv_window_ms: i64,
) -> Result<UserId, ExchangeError> {
    let user_id = accounts
        .resolve_api_key(api_key)
        .ok_or(ExchangeError::InvalidSignature)?;

    if (now_ms - timestamp_ms).abs() > recv_window_ms {
        return Err(ExchangeError::StaleRequest);
    }

    let mut mac = HmacSha256::new_from_slice(api_secret.as_bytes()).map_err(|_| ExchangeError::Internal)?;
    mac.update(query_without_signature.as_bytes());
    let expected = mac.finalize().into_bytes();
    let expected_hex = hex::encode(expected);

    if !constant_time_eq(expected_hex.as_bytes(), signature_hex.as_bytes()) {
        return Err(ExchangeError::InvalidSignature);
    }

    Ok(user_id)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_length_signatures() {
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn accepts_identical_bytes() {
        assert!(constant_time_eq(b"abcdef", b"abcdef"));
    }

    #[test]
    fn detects_single_byte_difference() {
        assert!(!constant_time_eq(b"abcdef", b"abcdeg"));
    }
}
