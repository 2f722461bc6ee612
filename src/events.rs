use crate::media::RemoteMediaStream;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Observable call lifecycle.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Transport reports an active session. Terminal.
    Connected,
    /// Negotiation or transport failed. Terminal.
    Failed { reason: String },
    /// The remote stream gained a track.
    RemoteStream(RemoteMediaStream),
}

/// Fan-out of [`CallEvent`]s to any number of observers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CallEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: CallEvent) {
        tracing::trace!(?event, "emit");
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    /// Runs `handler` for every event matched by `select` until the bus is
    /// dropped.
    pub fn observe<T, S, H>(&self, select: S, mut handler: H) -> tokio::task::JoinHandle<()>
    where
        T: Send + 'static,
        S: Fn(CallEvent) -> Option<T> + Send + 'static,
        H: FnMut(T) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(value) = select(event) {
                            handler(value);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event observer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(CallEvent::Connected);
        assert!(matches!(rx.recv().await.unwrap(), CallEvent::Connected));
    }

    #[tokio::test]
    async fn observe_filters_by_selector() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.observe(
            |event| match event {
                CallEvent::Failed { reason } => Some(reason),
                _ => None,
            },
            move |reason| {
                let _ = tx.send(reason);
            },
        );
        tokio::task::yield_now().await;
        bus.emit(CallEvent::Connected);
        bus.emit(CallEvent::Failed {
            reason: "ice".into(),
        });
        assert_eq!(rx.recv().await.unwrap(), "ice");
    }
}
