use sha2::{Digest, Sha256};
use std::{collections::HashMap, time::Duration};
use tokio::{sync::Mutex, time::Instant};

pub type Fingerprint = [u8; 32];

/// Suppresses identical hook notifications seen within `window`.
///
/// The editor can fire the same hook several times for one user-visible
/// event. A notification is identified by conversation, hook name and text;
/// the first sighting opens a window and repeats inside it are dropped.
/// Expired fingerprints are swept lazily on the next admission.
pub struct DedupGate {
    window: Duration,
    seen: Mutex<HashMap<Fingerprint, Instant>>,
}

impl DedupGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` when the notification should be delivered.
    pub async fn admit(&self, conversation_id: &str, hook_name: &str, text: &str) -> bool {
        if self.window.is_zero() {
            return true;
        }
        let key = fingerprint(conversation_id, hook_name, text);
        let now = Instant::now();
        let mut seen = self.seen.lock().await;
        seen.retain(|_, expires_at| *expires_at > now);
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now + self.window);
        true
    }

    pub async fn tracked(&self) -> usize {
        self.seen.lock().await.len()
    }
}

/// Each field is length-prefixed, so no choice of field contents can shift a
/// boundary and collide with another triple.
pub fn fingerprint(conversation_id: &str, hook_name: &str, text: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    for field in [conversation_id, hook_name, text] {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.finalize().into()
}
