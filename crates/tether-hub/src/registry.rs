use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tether_core::Role;
use tokio::{
    sync::{mpsc, RwLock},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A frame queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(Arc<str>),
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    Closed,
    Backpressure,
}

/// Write side of one socket. Cancelling the token ends the session, which then
/// evicts every record bound to this connection.
#[derive(Debug)]
pub struct Connection {
    conn_id: String,
    sender: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(conn_id: String, sender: mpsc::Sender<Outbound>, cancel: CancellationToken) -> Self {
        Self {
            conn_id,
            sender,
            cancel,
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.sender.is_closed()
    }

    /// Queues a frame without waiting. A full queue means the peer is not
    /// draining within budget, so the connection is closed.
    pub fn send(&self, frame: Outbound) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "outbound_queue_full", conn_id = %self.conn_id);
                self.cancel.cancel();
                Err(SendError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.cancel.cancel();
                Err(SendError::Closed)
            }
        }
    }

    pub fn send_text(&self, text: Arc<str>) -> Result<(), SendError> {
        self.send(Outbound::Text(text))
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: String,
    pub roles: BTreeSet<Role>,
    pub connection: Arc<Connection>,
    pub platform: Option<String>,
    pub pid: Option<u64>,
    pub version: Option<String>,
    pub last_heartbeat: Instant,
    pub registered_at: u64,
    pub aux: HashMap<String, String>,
}

impl ClientRecord {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn aux(&self, key: &str) -> Option<&str> {
        self.aux.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub id: String,
    pub roles: BTreeSet<Role>,
    pub platform: Option<String>,
    pub pid: Option<u64>,
    pub version: Option<String>,
    pub aux: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    /// Same live id registered again; roles were unioned.
    Merged,
    /// The previous holder's connection was dead.
    Replaced,
}

#[derive(Debug, Clone)]
pub struct Registered {
    pub id: String,
    pub roles: BTreeSet<Role>,
    pub outcome: RegisterOutcome,
    /// Live connection that held the id before this registration took it.
    pub displaced: Option<Arc<Connection>>,
}

pub struct ClientRegistry {
    clients: RwLock<HashMap<String, ClientRecord>>,
    seq: AtomicU64,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn register(&self, reg: Registration, connection: Arc<Connection>) -> Registered {
        let id = if reg.id.trim().is_empty() {
            format!("client-{}", uuid::Uuid::new_v4())
        } else {
            reg.id
        };
        let now = Instant::now();
        let mut clients = self.clients.write().await;

        if let Some(existing) = clients.get_mut(&id) {
            if existing.connection.is_live() {
                existing.roles.extend(reg.roles.iter().copied());
                existing.aux.extend(reg.aux);
                existing.platform = reg.platform.or(existing.platform.take());
                existing.pid = reg.pid.or(existing.pid);
                existing.version = reg.version.or(existing.version.take());
                existing.last_heartbeat = now;
                let mut displaced = None;
                if existing.connection.conn_id() != connection.conn_id() {
                    info!(
                        event = "client_rebound",
                        client_id = %id,
                        from_conn = %existing.connection.conn_id(),
                        to_conn = %connection.conn_id()
                    );
                    displaced = Some(std::mem::replace(&mut existing.connection, connection));
                    existing.registered_at = self.next_seq();
                }
                return Registered {
                    id,
                    roles: existing.roles.clone(),
                    outcome: RegisterOutcome::Merged,
                    displaced,
                };
            }
        }

        let outcome = if clients.contains_key(&id) {
            RegisterOutcome::Replaced
        } else {
            RegisterOutcome::Created
        };
        let record = ClientRecord {
            id: id.clone(),
            roles: reg.roles,
            connection,
            platform: reg.platform,
            pid: reg.pid,
            version: reg.version,
            last_heartbeat: now,
            registered_at: self.next_seq(),
            aux: reg.aux,
        };
        let roles = record.roles.clone();
        clients.insert(id.clone(), record);
        Registered {
            id,
            roles,
            outcome,
            displaced: None,
        }
    }

    pub async fn lookup_by_id(&self, id: &str) -> Option<ClientRecord> {
        self.clients.read().await.get(id).cloned()
    }

    /// Holders of `role`, oldest registration first.
    pub async fn lookup_by_role(&self, role: Role) -> Vec<ClientRecord> {
        let mut holders: Vec<ClientRecord> = self
            .clients
            .read()
            .await
            .values()
            .filter(|record| record.has_role(role))
            .cloned()
            .collect();
        holders.sort_by_key(|record| record.registered_at);
        holders
    }

    pub async fn lookup_by_aux(&self, key: &str, value: &str, role: Role) -> Vec<ClientRecord> {
        let mut matches: Vec<ClientRecord> = self
            .clients
            .read()
            .await
            .values()
            .filter(|record| record.has_role(role) && record.aux(key) == Some(value))
            .cloned()
            .collect();
        matches.sort_by_key(|record| record.registered_at);
        matches
    }

    /// Removes `id` only while it is still bound to `conn_id`; a record that
    /// was rebound to a newer connection survives the old session's teardown.
    pub async fn evict(&self, id: &str, conn_id: &str) -> Option<ClientRecord> {
        let mut clients = self.clients.write().await;
        match clients.get(id) {
            Some(record) if record.connection.conn_id() == conn_id => clients.remove(id),
            Some(_) => {
                debug!(event = "evict_skipped", client_id = id, conn_id = conn_id);
                None
            }
            None => None,
        }
    }

    pub async fn heartbeat(&self, id: &str) -> bool {
        match self.clients.write().await.get_mut(id) {
            Some(record) => {
                record.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    pub async fn stale(&self, threshold: Duration) -> Vec<ClientRecord> {
        let now = Instant::now();
        self.clients
            .read()
            .await
            .values()
            .filter(|record| now.duration_since(record.last_heartbeat) > threshold)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(conn_id: &str) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        let conn = Connection::new(conn_id.to_string(), tx, CancellationToken::new());
        (Arc::new(conn), rx)
    }

    fn registration(id: &str, roles: &[Role]) -> Registration {
        Registration {
            id: id.to_string(),
            roles: roles.iter().copied().collect(),
            ..Registration::default()
        }
    }

    #[tokio::test]
    async fn second_register_unions_roles() {
        let registry = ClientRegistry::new();
        let (conn, _rx) = connection("conn-1");

        let first = registry
            .register(registration("m-1", &[Role::AituberClient]), conn.clone())
            .await;
        assert_eq!(first.outcome, RegisterOutcome::Created);

        let second = registry
            .register(registration("m-1", &[Role::CommandClient]), conn.clone())
            .await;
        assert_eq!(second.outcome, RegisterOutcome::Merged);
        assert!(second.displaced.is_none());
        assert_eq!(
            second.roles,
            BTreeSet::from([Role::AituberClient, Role::CommandClient])
        );

        for role in [Role::AituberClient, Role::CommandClient] {
            let holders = registry.lookup_by_role(role).await;
            assert_eq!(holders.len(), 1);
            assert_eq!(holders[0].id, "m-1");
        }
    }

    #[tokio::test]
    async fn dead_connection_is_replaced_not_merged() {
        let registry = ClientRegistry::new();
        let (old, _old_rx) = connection("conn-1");
        registry
            .register(registration("inject-1", &[Role::EditorClient]), old.clone())
            .await;
        old.close();

        let (fresh, _fresh_rx) = connection("conn-2");
        let result = registry
            .register(registration("inject-1", &[Role::AgentHook]), fresh)
            .await;
        assert_eq!(result.outcome, RegisterOutcome::Replaced);
        assert_eq!(result.roles, BTreeSet::from([Role::AgentHook]));
        assert!(registry.lookup_by_role(Role::EditorClient).await.is_empty());
    }

    #[tokio::test]
    async fn empty_id_gets_generated() {
        let registry = ClientRegistry::new();
        let (conn, _rx) = connection("conn-1");
        let result = registry
            .register(registration("", &[Role::CommandClient]), conn)
            .await;
        assert!(result.id.starts_with("client-"));
        assert!(registry.lookup_by_id(&result.id).await.is_some());
    }

    #[tokio::test]
    async fn evict_ignores_records_rebound_to_another_connection() {
        let registry = ClientRegistry::new();
        let (first, _rx1) = connection("conn-1");
        let (second, _rx2) = connection("conn-2");
        let created = registry
            .register(registration("cc-1", &[Role::CommandClient]), first.clone())
            .await;
        assert!(created.displaced.is_none());
        let rebound = registry
            .register(registration("cc-1", &[Role::CommandClient]), second)
            .await;
        let displaced = rebound.displaced.expect("previous connection");
        assert_eq!(displaced.conn_id(), "conn-1");
        assert!(Arc::ptr_eq(&displaced, &first));

        assert!(registry.evict("cc-1", "conn-1").await.is_none());
        assert!(registry.lookup_by_id("cc-1").await.is_some());
        assert!(registry.evict("cc-1", "conn-2").await.is_some());
        assert!(registry.lookup_by_id("cc-1").await.is_none());
    }

    #[tokio::test]
    async fn aux_lookup_filters_by_role_and_value() {
        let registry = ClientRegistry::new();
        let (a, _ra) = connection("conn-a");
        let (b, _rb) = connection("conn-b");
        let mut editor = registration("inject-a", &[Role::EditorClient]);
        editor
            .aux
            .insert("conversation_id".to_string(), "conv-1".to_string());
        registry.register(editor, a).await;
        let mut hook = registration("hook-conv-1", &[Role::AgentHook]);
        hook.aux
            .insert("conversation_id".to_string(), "conv-1".to_string());
        registry.register(hook, b).await;

        let found = registry
            .lookup_by_aux("conversation_id", "conv-1", Role::EditorClient)
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "inject-a");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_reports_clients_past_threshold() {
        let registry = ClientRegistry::new();
        let (a, _ra) = connection("conn-a");
        let (b, _rb) = connection("conn-b");
        registry
            .register(registration("quiet", &[Role::AituberClient]), a)
            .await;
        registry
            .register(registration("chatty", &[Role::AituberClient]), b)
            .await;

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(registry.heartbeat("chatty").await);
        tokio::time::advance(Duration::from_secs(15)).await;

        let stale = registry.stale(Duration::from_secs(30)).await;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "quiet");
    }

    #[tokio::test]
    async fn full_queue_closes_connection() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new("conn-1".to_string(), tx, CancellationToken::new());
        assert!(conn.send(Outbound::Ping).is_ok());
        assert_eq!(conn.send(Outbound::Ping), Err(SendError::Backpressure));
        assert!(!conn.is_live());
        assert_eq!(conn.send(Outbound::Ping), Err(SendError::Closed));
    }
}
