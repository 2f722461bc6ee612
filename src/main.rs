//! Loopback call: two sessions negotiate through one in-process record store.

use peercall_lib::config::CallConfig;
use peercall_lib::identity::MemoryIdentityStore;
use peercall_lib::logger;
use peercall_lib::media::{MediaConstraints, SampleTrackSource};
use peercall_lib::peer::WebRtcTransportFactory;
use peercall_lib::session::{CallSession, FEEDBACK_ESTABLISHED, FEEDBACK_FAILED};
use peercall_lib::{MemoryStore, RecordStore};
use std::sync::Arc;
use std::time::Duration;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

fn session(config: &CallConfig, store: Arc<dyn RecordStore>) -> Arc<CallSession> {
    CallSession::new(
        config.clone(),
        store,
        Arc::new(MemoryIdentityStore::new()),
        Arc::new(SampleTrackSource::new()),
        Arc::new(WebRtcTransportFactory),
    )
}

async fn wait_settled(name: &str, session: &CallSession) -> Option<String> {
    let mut feedback = session.watch_feedback();
    let settled = feedback
        .wait_for(|msg| {
            matches!(msg.as_deref(), Some(FEEDBACK_ESTABLISHED) | Some(FEEDBACK_FAILED))
        })
        .await
        .ok()
        .and_then(|msg| (*msg).clone());
    tracing::info!(peer = name, feedback = ?settled, "settled");
    settled
}

#[tokio::main]
async fn main() -> peercall_lib::Result<()> {
    let config = CallConfig::from_env()?;
    logger::init(&config.log_filter);
    tracing::info!(room = %config.room_id, stun = ?config.stun_servers, "starting loopback call");

    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let caller = session(&config, store.clone());
    let callee = session(&config, store);

    let listener = {
        let callee = callee.clone();
        tokio::spawn(async move { callee.listen_connection().await })
    };
    // Let the listener clear the room before the caller writes to it.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let role = caller.run_camera(MediaConstraints::default()).await?;
    tracing::info!(?role, "caller negotiated");

    let outcome = tokio::time::timeout(CALL_TIMEOUT, async {
        tokio::join!(wait_settled("caller", &caller), wait_settled("callee", &callee))
    })
    .await;
    match outcome {
        Ok((caller_state, callee_state)) => {
            println!("caller: {}", caller_state.unwrap_or_default());
            println!("callee: {}", callee_state.unwrap_or_default());
        }
        Err(_) => tracing::warn!("call did not settle within {CALL_TIMEOUT:?}"),
    }

    match listener.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "listener ended with error"),
        Err(e) => tracing::warn!(error = %e, "listener task panicked"),
        Ok(Ok(())) => {}
    }
    if let Some(remote) = callee.remote_media_stream() {
        tracing::info!(tracks = remote.tracks.len(), "callee received remote media");
    }

    caller.hang_up().await?;
    callee.hang_up().await?;
    Ok(())
}
