use crate::peer::types::CandidateDescriptor;
use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber. `RUST_LOG` overrides `default_filter`.
/// Calling it twice is harmless; the second install is ignored.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Trickle-ICE trace for a candidate crossing the signaling boundary.
pub fn dump_candidate(label: &str, cand: &CandidateDescriptor) {
    tracing::debug!(
        direction = label,
        candidate = %cand.candidate,
        sdp_mid = ?cand.sdp_mid,
        sdp_mline_index = ?cand.sdp_mline_index,
        "trickle candidate"
    );
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateCounts {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

/// Counts candidates by type. Without a server-reflexive candidate the peers
/// can only meet on a shared network.
pub fn analyze_candidates<'a>(
    candidates: impl IntoIterator<Item = &'a CandidateDescriptor>,
) -> CandidateCounts {
    let mut counts = CandidateCounts::default();
    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            counts.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            counts.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            counts.relay += 1;
        }
    }

    tracing::info!(
        host = counts.host,
        srflx = counts.srflx,
        relay = counts.relay,
        "candidate analysis"
    );
    if counts.srflx == 0 {
        tracing::warn!("no server-reflexive candidates gathered, NAT traversal may fail");
    }
    counts
}
