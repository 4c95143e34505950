use crate::{
    config::HubConfig,
    conversation::ConversationCache,
    correlator::{Correlator, Originator, PendingRequest},
    dedup::DedupGate,
    registry::{ClientRecord, ClientRegistry, Connection},
    tts::{SpeechSynthesizer, TtsBridge},
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tether_core::{encode_envelope, failure_reply, Envelope};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Process-wide hub state: the directory, the pending-request table, the
/// dedup gate and the optional synthesis bridge.
pub struct Hub {
    config: HubConfig,
    registry: ClientRegistry,
    correlator: Correlator,
    dedup: DedupGate,
    tts: Option<TtsBridge>,
    conversations: ConversationCache,
    conn_counter: AtomicU64,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(config: HubConfig, synth: Option<Arc<dyn SpeechSynthesizer>>) -> Arc<Self> {
        let tts = synth
            .map(|synth| TtsBridge::new(synth, config.workers, config.synthesis_timeout));
        Arc::new(Self {
            registry: ClientRegistry::new(),
            correlator: Correlator::new(config.request_timeout),
            dedup: DedupGate::new(config.dedup_window),
            conversations: ConversationCache::new(config.conversation_ttl),
            tts,
            conn_counter: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub(crate) fn dedup(&self) -> &DedupGate {
        &self.dedup
    }

    pub(crate) fn tts(&self) -> Option<&TtsBridge> {
        self.tts.as_ref()
    }

    pub(crate) fn conversations(&self) -> &ConversationCache {
        &self.conversations
    }

    pub(crate) fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops accepting synthesis work and ends every session.
    pub fn shutdown(&self) {
        if let Some(tts) = &self.tts {
            tts.close();
        }
        self.shutdown.cancel();
    }

    pub(crate) fn encode(&self, envelope: &Envelope) -> Option<Arc<str>> {
        match encode_envelope(envelope, self.config.max_envelope_bytes) {
            Ok(text) => Some(Arc::from(text)),
            Err(err) => {
                warn!(event = "encode_failed", r#type = %envelope.kind, error = %err);
                None
            }
        }
    }

    pub(crate) fn send_to(&self, connection: &Connection, envelope: &Envelope) -> bool {
        match self.encode(envelope) {
            Some(text) => connection.send_text(text).is_ok(),
            None => false,
        }
    }

    pub(crate) async fn deliver(&self, client_id: &str, envelope: &Envelope) -> bool {
        match self.registry.lookup_by_id(client_id).await {
            Some(record) => self.send_to(&record.connection, envelope),
            None => false,
        }
    }

    /// Serializes once and queues the same bytes for every recipient. A
    /// recipient whose queue refuses the frame is closed; the others still
    /// receive it.
    pub(crate) fn fan_out(&self, envelope: &Envelope, recipients: &[ClientRecord]) -> usize {
        let Some(text) = self.encode(envelope) else {
            return 0;
        };
        let mut delivered = 0;
        for record in recipients {
            match record.connection.send_text(text.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        event = "send_error",
                        client_id = %record.id,
                        conn_id = %record.connection.conn_id(),
                        error = ?err
                    );
                    record.connection.close();
                }
            }
        }
        debug!(
            event = "fan_out",
            r#type = %envelope.kind,
            from = %envelope.from,
            recipients = recipients.len(),
            delivered = delivered
        );
        delivered
    }

    /// Session teardown. Requests waiting on the departed client fail, and
    /// requests it originated are forgotten.
    pub(crate) async fn evict_client(&self, id: &str, conn_id: &str) {
        let Some(record) = self.registry.evict(id, conn_id).await else {
            return;
        };
        let (failed, forgotten) = self.release_requests(id).await;
        info!(
            event = "client_disconnected",
            client_id = %record.id,
            conn_id = conn_id,
            roles = ?record.roles,
            failed_requests = failed,
            forgotten_requests = forgotten
        );
    }

    /// A newer connection registered `id` while `previous` still held it.
    /// The old socket is closed and everything it had in flight under `id`
    /// is settled, so replies never cross over to the new connection.
    pub(crate) async fn take_over(&self, id: &str, previous: &Connection) {
        previous.close();
        let (failed, forgotten) = self.release_requests(id).await;
        warn!(
            event = "client_taken_over",
            client_id = id,
            conn_id = %previous.conn_id(),
            failed_requests = failed,
            forgotten_requests = forgotten
        );
    }

    async fn release_requests(&self, id: &str) -> (usize, usize) {
        self.conversations.forget_client(id).await;
        let forgotten = self.correlator.drop_originator(id).await;
        let failed = self.correlator.fail_target(id).await;
        let count = failed.len();
        for pending in failed {
            self.resolve_failed(pending, "peer disconnected").await;
        }
        (count, forgotten)
    }

    pub(crate) async fn resolve_failed(&self, pending: PendingRequest, error: &str) {
        match pending.originator {
            Originator::Client(origin) => {
                let reply = failure_reply(pending.reply_type, &origin, &pending.request_id, error);
                if !self.deliver(&origin, &reply).await {
                    debug!(
                        event = "originator_gone",
                        request_id = %pending.request_id,
                        originator = %origin
                    );
                }
            }
            Originator::Internal(_) => {}
        }
    }

    pub(crate) async fn expire_request(&self, request_id: &str) {
        if let Some(pending) = self.correlator.expire(request_id).await {
            warn!(
                event = "request_timeout",
                request_id = request_id,
                target = %pending.target,
                waited_ms = pending.created_at.elapsed().as_millis() as u64
            );
            self.resolve_failed(pending, "timeout").await;
        }
    }

    pub(crate) fn spawn_deadline(self: &Arc<Self>, request_id: &str, deadline: Instant) {
        let hub = Arc::clone(self);
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = hub.shutdown.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => hub.expire_request(&request_id).await,
            }
        });
    }

    pub fn start_stale_reaper(self: &Arc<Self>) {
        if self.config.stale_after.is_zero() {
            return;
        }
        let stale_after = self.config.stale_after;
        let interval = (stale_after / 2).max(Duration::from_millis(100));
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = hub.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for record in hub.registry.stale(stale_after).await {
                    warn!(
                        event = "stale_close",
                        client_id = %record.id,
                        conn_id = %record.connection.conn_id()
                    );
                    record.connection.close();
                }
            }
        });
    }
}
