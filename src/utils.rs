use crate::error::{CallError, Result};
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Milliseconds since the unix epoch, the unit of `expiration_time`.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Adds the `stun:` scheme to a bare `host:port`. Relay servers are not
/// supported, so `turn:`/`turns:` URLs are rejected.
pub fn normalize_stun_url(url: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(CallError::Negotiation("STUN server URL cannot be empty".into()));
    }
    if url.starts_with("turn:") || url.starts_with("turns:") {
        return Err(CallError::Negotiation(format!(
            "TURN relay servers are not supported: {url}"
        )));
    }
    if url.starts_with("stun:") || url.starts_with("stuns:") {
        Ok(url.to_string())
    } else {
        Ok(format!("stun:{url}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_hex_and_distinct() {
        let a = random_id();
        let b = random_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn stun_scheme_added_once() {
        assert_eq!(
            normalize_stun_url("stun.l.google.com:19302").unwrap(),
            "stun:stun.l.google.com:19302"
        );
        assert_eq!(
            normalize_stun_url("stun:stun.l.google.com:19302").unwrap(),
            "stun:stun.l.google.com:19302"
        );
    }

    #[test]
    fn turn_urls_rejected() {
        assert!(normalize_stun_url("turn:relay.example.org").is_err());
        assert!(normalize_stun_url("turns:relay.example.org").is_err());
        assert!(normalize_stun_url("  ").is_err());
    }
}
