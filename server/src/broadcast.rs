//! Fan-out of outbound messages to connected participants.
//!
//! Producers push [`Envelope`]s into a bounded queue; one background task
//! drains it in FIFO order and hands each envelope to every connected
//! participant its audience filter accepts. The single consumer keeps
//! per-recipient ordering intact across envelopes. A full queue makes
//! producers wait instead of dropping messages.

use crate::error::SessionError;
use crate::registry::{ParticipantView, Registry};
use log::{debug, error, warn};
use mosaic_shared::protocol::OutboundKind;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type AudienceFilter = Arc<dyn Fn(&ParticipantView) -> bool + Send + Sync>;

/// A message plus an optional restriction on who receives it.
#[derive(Clone)]
pub struct Envelope {
    pub kind: OutboundKind,
    pub payload: Value,
    audience: Option<AudienceFilter>,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("kind", &self.kind)
            .field("filtered", &self.audience.is_some())
            .finish()
    }
}

impl Envelope {
    /// An envelope for every connected participant.
    pub fn new(kind: OutboundKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            audience: None,
        }
    }

    pub fn filtered(
        kind: OutboundKind,
        payload: Value,
        filter: impl Fn(&ParticipantView) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            payload,
            audience: Some(Arc::new(filter)),
        }
    }

    pub fn to_participant(kind: OutboundKind, payload: Value, id: &str) -> Self {
        let id = id.to_string();
        Self::filtered(kind, payload, move |view| view.id == id)
    }

    pub fn to_host(kind: OutboundKind, payload: Value) -> Self {
        Self::filtered(kind, payload, |view| view.is_host)
    }

    pub fn to_players(kind: OutboundKind, payload: Value) -> Self {
        Self::filtered(kind, payload, |view| !view.is_host)
    }

    pub fn error(id: &str, err: &SessionError) -> Self {
        let payload = serde_json::to_value(err.to_payload()).unwrap_or_default();
        Self::to_participant(OutboundKind::Error, payload, id)
    }

    pub fn accepts(&self, view: &ParticipantView) -> bool {
        self.audience.as_ref().map_or(true, |filter| filter(view))
    }

    /// Wire form: `{"type": ..., "payload": ...}`.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(&json!({
            "type": self.kind.as_str(),
            "payload": self.payload,
        }))
    }
}

enum Command {
    Deliver(Envelope),
    Flush(oneshot::Sender<()>),
}

/// Outcome of delivering one envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub recipients: usize,
    pub failures: usize,
}

/// Producer handle for the broadcast queue. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    queue: mpsc::Sender<Command>,
}

impl Dispatcher {
    /// Starts the consumer task and returns the producer handle.
    ///
    /// The task exits once every `Dispatcher` clone has been dropped.
    pub fn spawn(registry: Arc<Registry>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (queue, commands) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_dispatcher(registry, commands));
        (Self { queue }, handle)
    }

    /// Queues an envelope, waiting while the queue is full.
    pub async fn enqueue(&self, envelope: Envelope) {
        let kind = envelope.kind;
        if self.queue.send(Command::Deliver(envelope)).await.is_err() {
            error!("Broadcast queue closed, dropping {}", kind.as_str());
        }
    }

    pub async fn broadcast(&self, kind: OutboundKind, payload: Value) {
        self.enqueue(Envelope::new(kind, payload)).await;
    }

    pub async fn send_to(&self, id: &str, kind: OutboundKind, payload: Value) {
        self.enqueue(Envelope::to_participant(kind, payload, id)).await;
    }

    pub async fn send_error(&self, id: &str, err: &SessionError) {
        self.enqueue(Envelope::error(id, err)).await;
    }

    /// Resolves once everything queued before this call has been handed to
    /// the recipients' connections.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.queue.send(Command::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

async fn run_dispatcher(registry: Arc<Registry>, mut commands: mpsc::Receiver<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Deliver(envelope) => {
                deliver(&registry, &envelope);
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Broadcast dispatcher stopped");
}

/// Serializes once and hands the frame to each accepted, connected participant.
pub fn deliver(registry: &Registry, envelope: &Envelope) -> DeliveryReport {
    let frame = match envelope.encode() {
        Ok(json) => Arc::new(json),
        Err(e) => {
            error!("Failed to serialize {}: {}", envelope.kind.as_str(), e);
            return DeliveryReport::default();
        }
    };

    let mut report = DeliveryReport::default();
    for participant in registry.connected() {
        if !envelope.accepts(&participant.view()) {
            continue;
        }
        report.recipients += 1;
        if let Err(e) = participant.send(Arc::clone(&frame)) {
            report.failures += 1;
            warn!(
                "Failed to deliver {} to {}: {}",
                envelope.kind.as_str(),
                participant.id,
                e
            );
        }
    }

    debug!(
        "Delivered {} to {} recipients ({} failed)",
        envelope.kind.as_str(),
        report.recipients,
        report.failures
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Transport;
    use mosaic_shared::protocol::Envelope as WireEnvelope;

    fn connect(
        registry: &Registry,
        is_host: bool,
        id: u64,
    ) -> (String, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(16);
        let participant = registry.register(is_host, Transport::new(id, tx)).unwrap();
        (participant.id.clone(), rx)
    }

    fn kind_of(frame: &str) -> String {
        serde_json::from_str::<WireEnvelope>(frame).unwrap().kind
    }

    #[test]
    fn test_deliver_to_all_connected() {
        let registry = Registry::new(8);
        let (_, mut rx1) = connect(&registry, false, 1);
        let (_, mut rx2) = connect(&registry, false, 2);

        let report = deliver(&registry, &Envelope::new(OutboundKind::LobbyStatus, json!({})));
        assert_eq!(report.recipients, 2);
        assert_eq!(report.failures, 0);
        assert_eq!(kind_of(&rx1.try_recv().unwrap()), "game_lobby_status");
        assert_eq!(kind_of(&rx2.try_recv().unwrap()), "game_lobby_status");
    }

    #[test]
    fn test_audience_filters() {
        let registry = Registry::new(8);
        let (_, mut host_rx) = connect(&registry, true, 1);
        let (player_id, mut player_rx) = connect(&registry, false, 2);
        let (_, mut other_rx) = connect(&registry, false, 3);

        deliver(&registry, &Envelope::to_host(OutboundKind::HostUpdate, json!({})));
        deliver(
            &registry,
            &Envelope::to_participant(OutboundKind::TriviaQuestion, json!({}), &player_id),
        );
        deliver(&registry, &Envelope::to_players(OutboundKind::TeamProgress, json!({})));

        assert_eq!(kind_of(&host_rx.try_recv().unwrap()), "host_update");
        assert!(host_rx.try_recv().is_err());

        assert_eq!(kind_of(&player_rx.try_recv().unwrap()), "trivia_question");
        assert_eq!(kind_of(&player_rx.try_recv().unwrap()), "team_progress_update");

        assert_eq!(kind_of(&other_rx.try_recv().unwrap()), "team_progress_update");
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_failed_recipient_does_not_block_others() {
        let registry = Registry::new(8);
        let (_, dead_rx) = connect(&registry, false, 1);
        let (_, mut live_rx) = connect(&registry, false, 2);
        drop(dead_rx);

        let report = deliver(&registry, &Envelope::new(OutboundKind::GameReset, json!({})));
        assert_eq!(report.recipients, 2);
        assert_eq!(report.failures, 1);
        assert_eq!(kind_of(&live_rx.try_recv().unwrap()), "game_reset");
    }

    #[test]
    fn test_disconnected_participants_are_skipped() {
        let registry = Registry::new(8);
        let (id, mut rx) = connect(&registry, false, 7);
        registry.suspend(&id, 7).unwrap();

        let report = deliver(&registry, &Envelope::new(OutboundKind::LobbyStatus, json!({})));
        assert_eq!(report.recipients, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_error_envelope_shape() {
        let err = SessionError::validation("bad role");
        let envelope = Envelope::error("p1", &err);
        let wire: WireEnvelope = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(wire.kind, "error");
        assert_eq!(wire.payload["kind"], "validation");
        assert_eq!(wire.payload["message"], "invalid payload: bad role");
    }

    #[tokio::test]
    async fn test_dispatcher_preserves_order() {
        let registry = Arc::new(Registry::new(8));
        let (_, mut rx) = connect(&registry, false, 1);
        let (dispatcher, _handle) = Dispatcher::spawn(Arc::clone(&registry), 4);

        dispatcher.broadcast(OutboundKind::ResourcePhaseStart, json!({"seq": "A"})).await;
        dispatcher.broadcast(OutboundKind::TeamProgress, json!({"seq": "B"})).await;
        dispatcher.flush().await;

        let first: WireEnvelope = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let second: WireEnvelope = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.payload["seq"], "A");
        assert_eq!(second.payload["seq"], "B");
    }

    #[tokio::test]
    async fn test_single_slot_queue_delivers_in_order() {
        let registry = Arc::new(Registry::new(8));
        let (_, mut rx) = connect(&registry, false, 1);
        let (dispatcher, _handle) = Dispatcher::spawn(Arc::clone(&registry), 1);

        for i in 0..10 {
            dispatcher.broadcast(OutboundKind::TeamProgress, json!({ "n": i })).await;
            // Drain as we go so the per-connection queue never overflows
            dispatcher.flush().await;
            let frame = rx.recv().await.unwrap();
            let wire: WireEnvelope = serde_json::from_str(&frame).unwrap();
            assert_eq!(wire.payload["n"], i);
        }
    }

    #[tokio::test]
    async fn test_full_queue_blocks_producer() {
        use std::time::Duration;
        use tokio::time::timeout;

        let registry = Arc::new(Registry::new(8));
        let (_, mut rx) = connect(&registry, false, 1);
        // Consumer not running yet, so the single slot stays occupied
        let (queue, mut commands) = mpsc::channel(1);
        let dispatcher = Dispatcher { queue };

        dispatcher.broadcast(OutboundKind::TeamProgress, json!({ "n": 0 })).await;

        let pending = dispatcher.broadcast(OutboundKind::TeamProgress, json!({ "n": 1 }));
        tokio::pin!(pending);
        assert!(timeout(Duration::from_millis(50), &mut pending).await.is_err());

        // Freeing the slot lets the waiting producer through
        let first = commands.recv().await.unwrap();
        assert!(timeout(Duration::from_secs(1), &mut pending).await.is_ok());

        if let Command::Deliver(envelope) = first {
            deliver(&registry, &envelope);
        }
        tokio::spawn(run_dispatcher(Arc::clone(&registry), commands));
        dispatcher.flush().await;

        for expected in 0..2 {
            let frame = rx.recv().await.unwrap();
            let wire: WireEnvelope = serde_json::from_str(&frame).unwrap();
            assert_eq!(wire.payload["n"], expected);
        }
    }
}
