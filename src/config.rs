use crate::error::{CallError, Result};
use crate::utils::normalize_stun_url;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Room used when the caller does not pick one.
pub const DEFAULT_ROOM_ID: &str = "public";

/// Lifetime of an unanswered offer record.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_millis(15_000);

pub const DEFAULT_STUN_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

// Debug builds log negotiation details, release builds only problems.
#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "peercall=debug,webrtc=warn";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "peercall=warn,webrtc=error";

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub room_id: String,
    pub stun_servers: Vec<String>,
    pub record_ttl: Duration,
    pub identity_path: PathBuf,
    pub log_filter: String,
}

impl CallConfig {
    /// Reads `PEERCALL_*` variables, falling back to defaults for anything
    /// unset or unparsable. STUN URLs are normalized and TURN URLs rejected.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let room_id = env::var("PEERCALL_ROOM")
            .ok()
            .filter(|room| !room.trim().is_empty())
            .unwrap_or(defaults.room_id);
        let stun_servers = match env::var("PEERCALL_STUN_SERVERS") {
            Ok(list) => parse_stun_list(&list)?,
            Err(_) => defaults.stun_servers,
        };
        let record_ttl = env::var("PEERCALL_RECORD_TTL_MS")
            .ok()
            .and_then(|val| val.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.record_ttl);
        let identity_path = env::var("PEERCALL_IDENTITY_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.identity_path);
        let log_filter = env::var("PEERCALL_LOG").unwrap_or(defaults.log_filter);

        Ok(Self {
            room_id,
            stun_servers,
            record_ttl,
            identity_path,
            log_filter,
        })
    }

    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = room_id.into();
        self
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            room_id: DEFAULT_ROOM_ID.to_string(),
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            record_ttl: DEFAULT_RECORD_TTL,
            identity_path: env::temp_dir().join("peercall-initiator"),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// Comma separated list of STUN servers.
pub fn parse_stun_list(list: &str) -> Result<Vec<String>> {
    let servers = list
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(normalize_stun_url)
        .collect::<Result<Vec<_>>>()?;
    if servers.is_empty() {
        return Err(CallError::Negotiation(
            "at least one STUN server is required".to_string(),
        ));
    }
    Ok(servers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_public_room() {
        let config = CallConfig::default();
        assert_eq!(config.room_id, "public");
        assert_eq!(config.record_ttl, Duration::from_secs(15));
        assert_eq!(config.stun_servers.len(), 5);
        assert!(config.stun_servers.iter().all(|s| s.starts_with("stun:")));
    }

    #[test]
    fn stun_list_is_normalized() {
        let servers = parse_stun_list("stun.example.org:3478, stun:other.example.org:19302,").unwrap();
        assert_eq!(
            servers,
            vec![
                "stun:stun.example.org:3478".to_string(),
                "stun:other.example.org:19302".to_string(),
            ]
        );
    }

    #[test]
    fn stun_list_rejects_turn_and_empty() {
        assert!(parse_stun_list("turn:relay.example.org:3478").is_err());
        assert!(parse_stun_list(" , ").is_err());
    }
}
