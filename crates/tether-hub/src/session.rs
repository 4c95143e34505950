use crate::{
    hub::Hub,
    registry::{Connection, Outbound},
    router,
};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ids a single connection has registered, in registration order.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    ids: Vec<String>,
}

impl SessionState {
    pub(crate) fn bind(&mut self, id: &str) {
        if !self.owns(id) {
            self.ids.push(id.to_string());
        }
    }

    pub(crate) fn owns(&self, id: &str) -> bool {
        self.ids.iter().any(|owned| owned == id)
    }

    pub(crate) fn primary_id(&self) -> Option<&str> {
        self.ids.first().map(String::as_str)
    }

    /// Address for hub replies: the session's own id once registered,
    /// otherwise whatever the peer called itself.
    pub(crate) fn reply_to<'a>(&'a self, from: &'a str) -> &'a str {
        if self.owns(from) {
            return from;
        }
        self.primary_id().unwrap_or(from)
    }
}

pub(crate) async fn run(hub: Arc<Hub>, socket: WebSocket, remote: SocketAddr) {
    let conn_id = hub.next_conn_id();
    let cancel = hub.shutdown_token().child_token();
    let (tx, rx) = mpsc::channel::<Outbound>(hub.config().queue_capacity.max(1));
    let connection = Arc::new(Connection::new(conn_id.clone(), tx, cancel.clone()));
    let (sink, mut stream) = socket.split();
    info!(event = "connection_open", conn_id = %conn_id, remote = %remote);

    let writer = tokio::spawn(write_loop(
        sink,
        rx,
        cancel.clone(),
        hub.config().write_timeout,
        conn_id.clone(),
    ));
    start_ping(connection.clone(), hub.config().ping_interval);

    let mut session = SessionState::default();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                debug!(event = "read_error", conn_id = %conn_id, error = %err);
                break;
            }
            None => break,
        };
        touch(&hub, &session).await;
        match frame {
            Message::Text(text) => {
                router::handle_frame(&hub, &connection, &mut session, &text).await;
            }
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => router::handle_frame(&hub, &connection, &mut session, &text).await,
                Err(_) => warn!(event = "binary_not_utf8", conn_id = %conn_id),
            },
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }

    cancel.cancel();
    for id in &session.ids {
        hub.evict_client(id, &conn_id).await;
    }
    drop(connection);
    let _ = writer.await;
    info!(event = "connection_closed", conn_id = %conn_id, clients = session.ids.len());
}

/// Any inbound frame counts as liveness for the ids on this connection.
async fn touch(hub: &Hub, session: &SessionState) {
    for id in &session.ids {
        hub.registry().heartbeat(id).await;
    }
}

fn start_ping(connection: Arc<Connection>, interval: Duration) {
    if interval.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = connection.token().cancelled() => break,
                _ = ticker.tick() => {}
            }
            if connection.send(Outbound::Ping).is_err() {
                break;
            }
        }
    });
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    write_timeout: Duration,
    conn_id: String,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(Outbound::Text(text)) => Message::Text(text.to_string()),
                Some(Outbound::Ping) => Message::Ping(Vec::new()),
                None => break,
            },
        };
        match tokio::time::timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(event = "write_error", conn_id = %conn_id, error = %err);
                cancel.cancel();
                break;
            }
            Err(_) => {
                warn!(event = "write_timeout", conn_id = %conn_id, timeout_ms = write_timeout.as_millis() as u64);
                cancel.cancel();
                break;
            }
        }
    }
    let _ = tokio::time::timeout(write_timeout, sink.send(Message::Close(None))).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_address_prefers_registered_ids() {
        let mut session = SessionState::default();
        assert_eq!(session.reply_to("stranger"), "stranger");

        session.bind("m-1");
        session.bind("m-1-hook");
        session.bind("m-1");
        assert_eq!(session.ids.len(), 2);
        assert_eq!(session.reply_to("m-1-hook"), "m-1-hook");
        assert_eq!(session.reply_to("someone-else"), "m-1");
        assert_eq!(session.primary_id(), Some("m-1"));
    }
}
