// ===============================
// src/signing.rs
// ===============================
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

pub fn timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Hex HMAC-SHA256 over `timestamp.body`, as the relay verifies it.
pub fn sign_request(secret: &str, timestamp: i64, body: &str) -> Result<String, hmac::digest::InvalidLength> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

// ---- Relay response models ----
#[derive(Debug, Deserialize)]
pub struct RelayAccepted {
    pub signature: String,
    #[serde(default)]
    pub slot: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RelayFailure {
    #[serde(default)]
    pub error: String,
    // set when the transaction was broadcast before failing
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_and_keyed() {
        let a = sign_request("secret", 1_700_000_000_000, r#"{"ix":"buy"}"#).unwrap();
        let b = sign_request("secret", 1_700_000_000_000, r#"{"ix":"buy"}"#).unwrap();
        let c = sign_request("other", 1_700_000_000_000, r#"{"ix":"buy"}"#).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn failure_body_tolerates_missing_fields() {
        let f: RelayFailure = serde_json::from_str(r#"{"error":"insufficient funds"}"#).unwrap();
        assert_eq!(f.error, "insufficient funds");
        assert!(f.signature.is_none());
    }
}
