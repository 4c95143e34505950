//! Async client for the tether hub, used by hook scripts, command tools and
//! avatar front ends.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::{collections::BTreeSet, time::Duration};
use tether_core::{
    decode_envelope, encode_envelope, heartbeat, register, Envelope, MessageType, ProtocolError,
    Role, DEFAULT_MAX_ENVELOPE_BYTES,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:8765/ws";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid hub url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("websocket error: {0}")]
    Ws(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("registration rejected: {0}")]
    Rejected(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("hub closed the connection")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: Url,
    pub client_id: String,
    pub roles: Vec<Role>,
    pub conversation_id: Option<String>,
    /// Bounds connect, register and request round trips.
    pub timeout: Duration,
}

impl ClientOptions {
    pub fn new(url: Url, client_id: impl Into<String>, roles: Vec<Role>) -> Self {
        Self {
            url,
            client_id: client_id.into(),
            roles,
            conversation_id: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Flag, then `TETHER_HUB_URL`, then `TETHER_HUB_ADDR`, then the default.
pub fn resolve_hub_url(flag: &str) -> Result<Url, ClientError> {
    let raw = if !flag.trim().is_empty() {
        flag.to_string()
    } else if let Some(value) = env_value("TETHER_HUB_URL") {
        value
    } else if let Some(addr) = env_value("TETHER_HUB_ADDR") {
        format!("ws://{addr}/ws")
    } else {
        DEFAULT_HUB_URL.to_string()
    };
    Url::parse(&raw).map_err(|source| ClientError::InvalidUrl { url: raw, source })
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > Duration::from_secs(10) {
        Duration::from_secs(10)
    } else {
        next
    }
}

/// A registered connection to the hub.
pub struct HubClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    id: String,
    roles: BTreeSet<String>,
    timeout: Duration,
}

impl HubClient {
    /// Connects and registers; returns once the hub acknowledged.
    pub async fn connect(options: ClientOptions) -> Result<Self, ClientError> {
        let (ws, _) = tokio::time::timeout(options.timeout, connect_async(options.url.as_str()))
            .await
            .map_err(|_| ClientError::Timeout("connect"))??;
        let mut client = Self {
            ws,
            id: options.client_id.clone(),
            roles: BTreeSet::new(),
            timeout: options.timeout,
        };
        client
            .send(&register(
                &options.client_id,
                &options.roles,
                options.conversation_id.as_deref(),
            ))
            .await?;

        let ack = tokio::time::timeout(options.timeout, client.recv_kind(MessageType::RegisterAck))
            .await
            .map_err(|_| ClientError::Timeout("register_ack"))??;
        if ack.payload.get("success").and_then(Value::as_bool) != Some(true) {
            let reason = ack
                .payload_str("error")
                .unwrap_or("unknown error")
                .to_string();
            return Err(ClientError::Rejected(reason));
        }
        if let Some(assigned) = ack.payload_str("assigned_id") {
            client.id = assigned.to_string();
        }
        client.roles = ack
            .payload
            .get("roles")
            .and_then(Value::as_array)
            .map(|roles| {
                roles
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        info!(event = "registered", client_id = %client.id, roles = ?client.roles);
        Ok(client)
    }

    /// Retries [`HubClient::connect`] with doubling backoff. `attempts` of zero
    /// retries forever.
    pub async fn connect_with_retry(
        options: ClientOptions,
        attempts: usize,
    ) -> Result<Self, ClientError> {
        let mut backoff = Duration::from_secs(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::connect(options.clone()).await {
                Ok(client) => return Ok(client),
                Err(ClientError::Rejected(reason)) => return Err(ClientError::Rejected(reason)),
                Err(err) if attempts != 0 && attempt >= attempts => return Err(err),
                Err(err) => {
                    warn!(event = "hub_connect_error", attempt = attempt, error = %err);
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), ClientError> {
        let text = encode_envelope(envelope, DEFAULT_MAX_ENVELOPE_BYTES)?;
        self.ws.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Next envelope from the hub. Frames that do not decode are skipped.
    pub async fn recv(&mut self) -> Result<Envelope, ClientError> {
        loop {
            let frame = match self.ws.next().await {
                Some(frame) => frame?,
                None => return Err(ClientError::Closed),
            };
            let text = match frame {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Close(_) => return Err(ClientError::Closed),
                _ => continue,
            };
            match decode_envelope(&text, DEFAULT_MAX_ENVELOPE_BYTES) {
                Ok(envelope) => return Ok(envelope),
                Err(err) => warn!(event = "frame_invalid", error = %err),
            }
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Envelope>, ClientError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn recv_kind(&mut self, kind: MessageType) -> Result<Envelope, ClientError> {
        loop {
            let envelope = self.recv().await?;
            if envelope.kind == kind {
                return Ok(envelope);
            }
            debug!(event = "frame_skipped", r#type = %envelope.kind, waiting_for = %kind);
        }
    }

    /// Sends a request carrying `request_id` and waits for the reply, or an
    /// error envelope, with the same id. Unrelated traffic is discarded.
    pub async fn request(&mut self, envelope: &Envelope) -> Result<Envelope, ClientError> {
        let request_id = envelope
            .request_id()
            .ok_or_else(|| ProtocolError::InvalidPayload {
                kind: envelope.kind.to_string(),
                reason: "missing request_id".to_string(),
            })?
            .to_string();
        self.send(envelope).await?;
        let timeout = self.timeout;
        let wait = async {
            loop {
                let reply = self.recv().await?;
                if reply.request_id() == Some(request_id.as_str()) {
                    return Ok::<_, ClientError>(reply);
                }
                debug!(event = "frame_skipped", r#type = %reply.kind, request_id = %request_id);
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout("reply"))?
    }

    pub async fn heartbeat(&mut self) -> Result<(), ClientError> {
        let beat = heartbeat(&self.id);
        self.send(&beat).await
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
