use crate::{correlator::Originator, hub::Hub, registry::ClientRecord};
use futures_util::future::join_all;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tether_core::{
    execute_js, MessageType, Role, AUX_CONVERSATION_ID, GET_CONVERSATION_ID, SERVER_ID,
};
use tokio::{
    sync::{oneshot, Mutex},
    time::Instant,
};
use tracing::debug;

/// Remembers which editor client answered for a conversation.
pub(crate) struct ConversationCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl ConversationCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn get(&self, conversation_id: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        match entries.get(conversation_id) {
            Some((client_id, cached_at)) if cached_at.elapsed() < self.ttl => {
                Some(client_id.clone())
            }
            Some(_) => {
                entries.remove(conversation_id);
                None
            }
            None => None,
        }
    }

    pub(crate) async fn insert(&self, conversation_id: &str, client_id: &str) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.lock().await.insert(
            conversation_id.to_string(),
            (client_id.to_string(), Instant::now()),
        );
    }

    pub(crate) async fn forget_client(&self, client_id: &str) {
        self.entries
            .lock()
            .await
            .retain(|_, (owner, _)| owner != client_id);
    }
}

impl Hub {
    /// Finds the editor client bound to `conversation_id`, skipping every id
    /// for which `excluded` holds.
    ///
    /// Order: an editor registered with that conversation id, a recent probe
    /// answer, the only connected editor, then a fresh probe of every editor.
    pub(crate) async fn lookup_by_conversation(
        self: &Arc<Self>,
        conversation_id: &str,
        excluded: impl Fn(&str) -> bool,
    ) -> Option<ClientRecord> {
        let declared = self
            .registry()
            .lookup_by_aux(AUX_CONVERSATION_ID, conversation_id, Role::EditorClient)
            .await;
        if let Some(record) = declared.into_iter().rev().find(|record| !excluded(&record.id)) {
            return Some(record);
        }

        if let Some(client_id) = self.conversations().get(conversation_id).await {
            if !excluded(&client_id) {
                match self.registry().lookup_by_id(&client_id).await {
                    Some(record) if record.has_role(Role::EditorClient) => return Some(record),
                    _ => self.conversations().forget_client(&client_id).await,
                }
            }
        }

        let editors: Vec<ClientRecord> = self
            .registry()
            .lookup_by_role(Role::EditorClient)
            .await
            .into_iter()
            .filter(|record| !excluded(&record.id))
            .collect();
        if editors.len() <= 1 {
            return editors.into_iter().next();
        }

        let answers = join_all(editors.iter().map(|editor| self.probe_conversation(editor))).await;
        let mut found = None;
        for (editor, answer) in editors.iter().zip(answers) {
            let Some(answer) = answer else { continue };
            self.conversations().insert(&answer, &editor.id).await;
            if answer == conversation_id {
                found = Some(editor.clone());
            }
        }
        if found.is_none() {
            debug!(
                event = "conversation_unresolved",
                conversation_id = conversation_id,
                candidates = editors.len()
            );
        }
        found
    }

    /// Asks one editor for its current conversation id through the normal
    /// execute_js path, with the hub as originator.
    async fn probe_conversation(self: &Arc<Self>, editor: &ClientRecord) -> Option<String> {
        let request_id = format!("probe-{}", uuid::Uuid::new_v4());
        let timeout = self.config().probe_timeout;
        let (tx, rx) = oneshot::channel();
        let deadline = self
            .correlator()
            .begin(
                &request_id,
                Originator::Internal(tx),
                &editor.id,
                MessageType::ExecuteJsResult,
                Some(timeout),
            )
            .await
            .ok()?;

        let probe = execute_js(SERVER_ID, &editor.id, GET_CONVERSATION_ID, &request_id);
        if !self.send_to(&editor.connection, &probe) {
            self.correlator().complete(&request_id).await;
            return None;
        }
        self.spawn_deadline(&request_id, deadline);

        let reply = match tokio::time::timeout(timeout + Duration::from_millis(50), rx).await {
            Ok(Ok(reply)) => reply,
            _ => {
                self.correlator().complete(&request_id).await;
                debug!(event = "probe_unanswered", client_id = %editor.id);
                return None;
            }
        };
        conversation_from_result(&reply.payload)
    }
}

/// Accepts either a bare string result or an object carrying the id.
fn conversation_from_result(payload: &Value) -> Option<String> {
    if payload.get("success").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    let result = payload.get("result")?;
    let id = match result {
        Value::String(id) => Some(id.as_str()),
        Value::Object(map) => map
            .get("conversation_id")
            .or_else(|| map.get("conversationId"))
            .and_then(Value::as_str),
        _ => None,
    }?;
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conversation_id_is_read_from_string_or_object_results() {
        assert_eq!(
            conversation_from_result(&json!({"success": true, "result": "conv-9"})),
            Some("conv-9".to_string())
        );
        assert_eq!(
            conversation_from_result(
                &json!({"success": true, "result": {"conversation_id": "conv-3"}})
            ),
            Some("conv-3".to_string())
        );
        assert_eq!(
            conversation_from_result(&json!({"success": false, "error": "nope"})),
            None
        );
        assert_eq!(
            conversation_from_result(&json!({"success": true, "result": ""})),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire_and_follow_client() {
        let cache = ConversationCache::new(Duration::from_secs(30));
        cache.insert("conv-1", "inject-a").await;
        cache.insert("conv-2", "inject-b").await;
        assert_eq!(cache.get("conv-1").await.as_deref(), Some("inject-a"));

        cache.forget_client("inject-b").await;
        assert_eq!(cache.get("conv-2").await, None);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get("conv-1").await, None);
    }
}
