use crate::error::{CallError, Result};
use crate::logger::dump_candidate;
use crate::peer::transport::{PeerTransport, TransportEvent, WebRtcTransport};
use crate::peer::types::CandidateDescriptor;
use crate::utils::normalize_stun_url;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Applies queued remote candidates in order. A candidate the endpoint
/// rejects is logged and skipped; the shared log can still carry paths from a
/// superseded negotiation. Returns how many were accepted.
pub async fn apply_batch(
    transport: &dyn PeerTransport,
    batch: Vec<CandidateDescriptor>,
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut applied = 0;
    for candidate in batch {
        dump_candidate("REMOTE-QUEUED", &candidate);
        let key = candidate.key().to_string();
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(CallError::Cancelled),
            res = transport.add_ice_candidate(candidate) => res,
        };
        match result {
            Ok(()) => applied += 1,
            Err(e) => tracing::warn!(candidate = %key, error = %e, "failed to apply pending candidate"),
        }
    }
    Ok(applied)
}

pub fn is_server_reflexive(candidate: &CandidateDescriptor) -> bool {
    candidate.candidate.contains("typ srflx")
}

/// Checks that a STUN server answers binding requests by gathering against
/// it alone and waiting for a server-reflexive candidate.
pub async fn probe_stun_server(url: &str, wait: Duration) -> Result<bool> {
    let url = normalize_stun_url(url)?;
    tracing::debug!(%url, "probing STUN server");

    let transport = WebRtcTransport::new(std::slice::from_ref(&url)).await?;
    let mut events = transport.subscribe();

    // Gathering only starts once there is something to negotiate.
    transport
        .peer_connection()
        .create_data_channel("probe", None)
        .await?;
    let offer = transport.create_offer().await?;
    transport.set_local_description(offer).await?;

    let found = timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(TransportEvent::LocalCandidate(c)) if is_server_reflexive(&c) => return true,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    if !found {
        tracing::warn!(%url, "no server-reflexive candidate from STUN server");
    }
    let _ = transport.close().await;
    Ok(found)
}
