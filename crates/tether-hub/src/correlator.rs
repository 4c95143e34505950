use std::{collections::HashMap, time::Duration};
use tether_core::{Envelope, MessageType};
use thiserror::Error;
use tokio::{
    sync::{oneshot, Mutex},
    time::Instant,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("request_id already pending: {0}")]
    Duplicate(String),
}

/// Who receives the reply for a pending request.
#[derive(Debug)]
pub enum Originator {
    Client(String),
    /// A probe issued by the hub itself.
    Internal(oneshot::Sender<Envelope>),
}

impl Originator {
    pub fn client_id(&self) -> Option<&str> {
        match self {
            Originator::Client(id) => Some(id.as_str()),
            Originator::Internal(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct PendingRequest {
    pub request_id: String,
    pub originator: Originator,
    pub target: String,
    pub reply_type: MessageType,
    pub deadline: Instant,
    pub created_at: Instant,
}

/// Outcome of offering a reply to the pending table.
#[derive(Debug)]
pub enum ReplyMatch {
    Matched(PendingRequest),
    /// Nothing is waiting on this request id.
    Unknown,
    /// The request is pending on another client; the entry stays.
    WrongResponder { target: String },
}

/// Pending-request table. Every exit path removes the entry under the lock,
/// so each request resolves at most once.
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingRequest>>,
    default_timeout: Duration,
}

impl Correlator {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn begin(
        &self,
        request_id: &str,
        originator: Originator,
        target: &str,
        reply_type: MessageType,
        timeout: Option<Duration>,
    ) -> Result<Instant, CorrelationError> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(request_id) {
            return Err(CorrelationError::Duplicate(request_id.to_string()));
        }
        let created_at = Instant::now();
        let deadline = created_at + timeout.unwrap_or(self.default_timeout);
        pending.insert(
            request_id.to_string(),
            PendingRequest {
                request_id: request_id.to_string(),
                originator,
                target: target.to_string(),
                reply_type,
                deadline,
                created_at,
            },
        );
        Ok(deadline)
    }

    /// Takes the entry for a response.
    pub async fn complete(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending.lock().await.remove(request_id)
    }

    /// Takes the entry only when `accepts` confirms the responder is the
    /// client the request was forwarded to.
    pub async fn complete_from(
        &self,
        request_id: &str,
        accepts: impl FnOnce(&str) -> bool,
    ) -> ReplyMatch {
        let mut pending = self.pending.lock().await;
        let target = match pending.get(request_id) {
            Some(entry) => entry.target.clone(),
            None => return ReplyMatch::Unknown,
        };
        if !accepts(&target) {
            return ReplyMatch::WrongResponder { target };
        }
        match pending.remove(request_id) {
            Some(entry) => ReplyMatch::Matched(entry),
            None => ReplyMatch::Unknown,
        }
    }

    /// Takes the entry only when its deadline has passed.
    pub async fn expire(&self, request_id: &str) -> Option<PendingRequest> {
        let mut pending = self.pending.lock().await;
        match pending.get(request_id) {
            Some(entry) if entry.deadline <= Instant::now() => pending.remove(request_id),
            _ => None,
        }
    }

    /// Takes every entry waiting on `target`.
    pub async fn fail_target(&self, target: &str) -> Vec<PendingRequest> {
        let mut pending = self.pending.lock().await;
        let ids: Vec<String> = pending
            .values()
            .filter(|entry| entry.target == target)
            .map(|entry| entry.request_id.clone())
            .collect();
        ids.iter().filter_map(|id| pending.remove(id)).collect()
    }

    /// Forgets requests whose originator left; their late replies are dropped.
    pub async fn drop_originator(&self, client_id: &str) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, entry| entry.originator.client_id() != Some(client_id));
        before - pending.len()
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn request_resolves_once() {
        let correlator = Correlator::new(Duration::from_secs(5));
        correlator
            .begin(
                "R-1",
                Originator::Client("cc-2".to_string()),
                "inject-7",
                MessageType::ExecuteJsResult,
                None,
            )
            .await
            .expect("begin");

        let entry = correlator.complete("R-1").await.expect("pending");
        assert_eq!(entry.originator.client_id(), Some("cc-2"));
        assert_eq!(entry.target, "inject-7");
        assert!(correlator.complete("R-1").await.is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(correlator.expire("R-1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expire_waits_for_deadline() {
        let correlator = Correlator::new(Duration::from_secs(5));
        correlator
            .begin(
                "R-2",
                Originator::Client("cc-3".to_string()),
                "inject-9",
                MessageType::ExecuteJsResult,
                Some(Duration::from_millis(300)),
            )
            .await
            .expect("begin");

        assert!(correlator.expire("R-2").await.is_none());
        tokio::time::advance(Duration::from_millis(301)).await;
        let entry = correlator.expire("R-2").await.expect("expired");
        assert_eq!(entry.request_id, "R-2");
        assert!(correlator.complete("R-2").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_request_id_is_rejected() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let origin = || Originator::Client("cc".to_string());
        correlator
            .begin("R-3", origin(), "a", MessageType::ExecuteJsResult, None)
            .await
            .expect("first");
        let err = correlator
            .begin("R-3", origin(), "b", MessageType::ExecuteJsResult, None)
            .await
            .expect_err("duplicate");
        assert_eq!(err, CorrelationError::Duplicate("R-3".to_string()));
    }

    #[tokio::test]
    async fn reply_from_other_client_leaves_request_pending() {
        let correlator = Correlator::new(Duration::from_secs(5));
        correlator
            .begin(
                "R-4",
                Originator::Client("cc-1".to_string()),
                "inject-1",
                MessageType::ExecuteJsResult,
                None,
            )
            .await
            .expect("begin");

        let outcome = correlator.complete_from("R-4", |target| target == "intruder").await;
        assert!(matches!(outcome, ReplyMatch::WrongResponder { target } if target == "inject-1"));
        assert_eq!(correlator.len().await, 1);

        let outcome = correlator.complete_from("R-4", |target| target == "inject-1").await;
        assert!(matches!(outcome, ReplyMatch::Matched(entry) if entry.request_id == "R-4"));
        assert!(matches!(
            correlator.complete_from("R-4", |_| true).await,
            ReplyMatch::Unknown
        ));
    }

    #[tokio::test]
    async fn disconnect_fails_targets_and_drops_originators() {
        let correlator = Correlator::new(Duration::from_secs(5));
        for (id, origin, target) in [
            ("R-a", "cc-1", "inject-1"),
            ("R-b", "cc-2", "inject-1"),
            ("R-c", "inject-1", "inject-2"),
            ("R-d", "cc-1", "inject-2"),
        ] {
            correlator
                .begin(
                    id,
                    Originator::Client(origin.to_string()),
                    target,
                    MessageType::ExecuteJsResult,
                    None,
                )
                .await
                .expect("begin");
        }

        let mut failed: Vec<String> = correlator
            .fail_target("inject-1")
            .await
            .into_iter()
            .map(|entry| entry.request_id)
            .collect();
        failed.sort();
        assert_eq!(failed, vec!["R-a".to_string(), "R-b".to_string()]);

        assert_eq!(correlator.drop_originator("inject-1").await, 1);
        assert_eq!(correlator.len().await, 1);
        assert!(correlator.complete("R-d").await.is_some());
    }
}
