use crate::{
    correlator::{CorrelationError, Originator, ReplyMatch},
    hub::Hub,
    registry::{ClientRecord, Connection, Registration},
    session::SessionState,
};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tether_core::{
    decode_envelope, error_envelope, failure_reply, heartbeat_ack, register_ack,
    register_rejected, AituberTextPayload, Envelope, LifecyclePayload, Message, MessageType,
    ProtocolError, RegisterPayload, Role, AUX_CONVERSATION_ID, SERVER_ID,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors returned to the sender as an `error` envelope.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("register before sending {0}")]
    NotRegistered(MessageType),
    #[error("sender {0} is not registered on this connection")]
    SenderMismatch(String),
    #[error("message has no recipient")]
    MissingRecipient,
    #[error("target not found: {0}")]
    TargetNotFound(String),
    #[error("no connected {0}")]
    NoHolders(Role),
    #[error("peer disconnected")]
    PeerDisconnected,
    #[error("request {0} was not sent to this client")]
    NotRequestTarget(String),
    #[error("server does not handle {0}")]
    Unsupported(MessageType),
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl RouteError {
    pub fn code(&self) -> &'static str {
        match self {
            RouteError::NotRegistered(_) => "not_registered",
            RouteError::SenderMismatch(_) => "sender_mismatch",
            RouteError::MissingRecipient => "missing_recipient",
            RouteError::TargetNotFound(_) | RouteError::NoHolders(_) => "target_not_found",
            RouteError::PeerDisconnected => "peer_disconnected",
            RouteError::NotRequestTarget(_) => "not_request_target",
            RouteError::Unsupported(_) => "unsupported_type",
            RouteError::Correlation(CorrelationError::Duplicate(_)) => "duplicate_request_id",
            RouteError::Protocol(err) => err.code(),
        }
    }
}

/// Where a `to` selector points before per-role narrowing.
enum Target {
    Client(ClientRecord),
    Role(Role),
}

/// Handles one inbound text frame. Nothing here ends the session; invalid
/// input is answered with an error envelope.
pub(crate) async fn handle_frame(
    hub: &Arc<Hub>,
    conn: &Arc<Connection>,
    session: &mut SessionState,
    raw: &str,
) {
    let envelope = match decode_envelope(raw, hub.config().max_envelope_bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(event = "message_invalid", conn_id = %conn.conn_id(), error = %err);
            reply_error(hub, conn, session.reply_to(""), &err.into(), None);
            return;
        }
    };
    let message = match Message::decode(&envelope) {
        Ok(message) => message,
        Err(err) => {
            warn!(
                event = "payload_invalid",
                conn_id = %conn.conn_id(),
                r#type = %envelope.kind,
                error = %err
            );
            let to = session.reply_to(&envelope.from).to_string();
            reply_error(hub, conn, &to, &err.into(), envelope.request_id());
            return;
        }
    };
    if hub.config().debug {
        debug!(
            event = "message_received",
            conn_id = %conn.conn_id(),
            r#type = %envelope.kind,
            from = %envelope.from,
            to = envelope.recipient().unwrap_or("")
        );
    }

    match message {
        Message::Register(payload) => handle_register(hub, conn, session, &envelope, payload).await,
        Message::Heartbeat => handle_heartbeat(hub, conn, session, &envelope).await,
        message => {
            let envelope = match authorize(session, envelope) {
                Ok(envelope) => envelope,
                Err((err, envelope)) => {
                    warn!(
                        event = "message_rejected",
                        conn_id = %conn.conn_id(),
                        r#type = %envelope.kind,
                        from = %envelope.from,
                        code = err.code()
                    );
                    let to = session.reply_to(&envelope.from).to_string();
                    reply_error(hub, conn, &to, &err, envelope.request_id());
                    return;
                }
            };
            let from = envelope.from.clone();
            let request_id = envelope.request_id().map(str::to_string);
            if let Err(err) = dispatch(hub, conn, session, envelope, message).await {
                debug!(event = "route_failed", from = %from, code = err.code(), error = %err);
                reply_error(hub, conn, &from, &err, request_id.as_deref());
            }
        }
    }
}

async fn handle_register(
    hub: &Arc<Hub>,
    conn: &Arc<Connection>,
    session: &mut SessionState,
    envelope: &Envelope,
    payload: RegisterPayload,
) {
    let roles = match payload.roles() {
        Ok(roles) => roles,
        Err(err) => {
            warn!(event = "register_rejected", conn_id = %conn.conn_id(), error = %err);
            let to = session.reply_to(&envelope.from).to_string();
            hub.send_to(conn, &register_rejected(&to, &err.to_string()));
            return;
        }
    };

    // A repeat register without an id extends the id this connection already holds.
    let id = [Some(envelope.from.as_str()), payload.client_id.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|id| !id.is_empty() && *id != SERVER_ID)
        .or_else(|| session.primary_id())
        .unwrap_or_default()
        .to_string();
    let mut aux = HashMap::new();
    if let Some(conversation_id) = payload
        .conversation_id
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| hook_conversation(&id))
    {
        aux.insert(AUX_CONVERSATION_ID.to_string(), conversation_id.to_string());
    }

    let mut registered = hub
        .registry()
        .register(
            Registration {
                id,
                roles,
                platform: payload.platform,
                pid: payload.pid,
                version: payload.version,
                aux,
            },
            conn.clone(),
        )
        .await;
    if let Some(previous) = registered.displaced.take() {
        hub.take_over(&registered.id, &previous).await;
    }
    session.bind(&registered.id);
    info!(
        event = "client_registered",
        client_id = %registered.id,
        conn_id = %conn.conn_id(),
        roles = ?registered.roles,
        outcome = ?registered.outcome
    );
    hub.send_to(conn, &register_ack(&registered.id, &registered.roles));
}

/// Hook processes spawned per conversation register as `hook-<conversation>`.
fn hook_conversation(id: &str) -> Option<&str> {
    id.strip_prefix("hook-").filter(|rest| !rest.is_empty())
}

async fn handle_heartbeat(
    hub: &Arc<Hub>,
    conn: &Arc<Connection>,
    session: &SessionState,
    envelope: &Envelope,
) {
    let to = session.reply_to(&envelope.from).to_string();
    if session.owns(&to) {
        hub.registry().heartbeat(&to).await;
    }
    hub.send_to(conn, &heartbeat_ack(&to));
}

/// Every non-register message must come from an id this session registered.
fn authorize(
    session: &SessionState,
    mut envelope: Envelope,
) -> Result<Envelope, (RouteError, Envelope)> {
    let Some(primary) = session.primary_id() else {
        return Err((RouteError::NotRegistered(envelope.kind.clone()), envelope));
    };
    if envelope.from.trim().is_empty() {
        envelope.from = primary.to_string();
    }
    if !session.owns(&envelope.from) {
        return Err((RouteError::SenderMismatch(envelope.from.clone()), envelope));
    }
    Ok(envelope)
}

async fn dispatch(
    hub: &Arc<Hub>,
    conn: &Arc<Connection>,
    session: &SessionState,
    envelope: Envelope,
    message: Message,
) -> Result<(), RouteError> {
    let sender = hub.registry().lookup_by_id(&envelope.from).await;
    let sender = sender.as_ref();
    match message {
        Message::AituberReceiveText(payload) => {
            route_avatar_text(hub, session, envelope, payload, sender).await
        }
        Message::ExecuteJs(payload) => {
            let timeout = payload.timeout_ms.map(Duration::from_millis);
            route_request(hub, conn, session, envelope, &payload.request_id, timeout, sender).await
        }
        Message::AgentExecutePrompt(payload) => {
            route_command(hub, conn, session, envelope, payload.request_id, sender).await
        }
        Message::AgentStopExecution(payload) => {
            route_command(hub, conn, session, envelope, payload.request_id, sender).await
        }
        Message::ComposerSendPrompt(payload) | Message::ComposerQueryStatus(payload) => {
            route_command(hub, conn, session, envelope, payload.request_id, sender).await
        }
        Message::ExecuteJsResult(payload) => {
            route_reply(hub, session, envelope, Some(payload.request_id)).await
        }
        Message::Reply(payload) => route_reply(hub, session, envelope, payload.request_id).await,
        Message::Lifecycle(payload) => route_lifecycle(hub, session, envelope, payload, sender).await,
        Message::Error(_) => {
            if envelope.recipient().is_none() {
                debug!(event = "client_error_dropped", from = %envelope.from);
                return Ok(());
            }
            if let Err(err) = route_by_to(hub, session, envelope).await {
                debug!(event = "client_error_undeliverable", error = %err);
            }
            Ok(())
        }
        Message::Register(_) | Message::Heartbeat | Message::Other => {
            route_by_to(hub, session, envelope).await
        }
    }
}

/// Speech for the avatar. Hook notifications pass the dedup gate first, then
/// the text is synthesized when the sender did not attach audio. A failed
/// synthesis still delivers the text.
async fn route_avatar_text(
    hub: &Arc<Hub>,
    session: &SessionState,
    mut envelope: Envelope,
    payload: AituberTextPayload,
    sender: Option<&ClientRecord>,
) -> Result<(), RouteError> {
    if let Some(hook) = sender.filter(|record| record.has_role(Role::AgentHook)) {
        let conversation = payload
            .conversation_id
            .as_deref()
            .or_else(|| hook.aux(AUX_CONVERSATION_ID))
            .unwrap_or_default();
        let hook_name = payload
            .event_type
            .as_deref()
            .unwrap_or(envelope.kind.as_str());
        if !hub.dedup().admit(conversation, hook_name, &payload.text).await {
            debug!(
                event = "hook_duplicate_dropped",
                from = %envelope.from,
                conversation_id = conversation,
                hook = hook_name
            );
            return Ok(());
        }
    }

    if payload.audio_file.is_none() && !payload.text.trim().is_empty() {
        if let Some(tts) = hub.tts() {
            match tts.synthesize(&payload.text, payload.emotion.as_deref()).await {
                Ok(path) => envelope.set_payload_field(
                    "audio_file",
                    Value::String(path.to_string_lossy().into_owned()),
                ),
                Err(err) => warn!(
                    event = "tts_failed",
                    engine = tts.engine(),
                    from = %envelope.from,
                    error = %err
                ),
            }
        }
    }

    let recipients = holders(hub, session, Role::AituberClient).await;
    if recipients.is_empty() {
        debug!(event = "no_avatar_clients", from = %envelope.from);
        return Ok(());
    }
    hub.fan_out(&envelope, &recipients);
    Ok(())
}

async fn route_lifecycle(
    hub: &Arc<Hub>,
    session: &SessionState,
    envelope: Envelope,
    payload: LifecyclePayload,
    sender: Option<&ClientRecord>,
) -> Result<(), RouteError> {
    if let Some(hook) = sender.filter(|record| record.has_role(Role::AgentHook)) {
        let conversation = payload
            .conversation_id
            .as_deref()
            .or_else(|| hook.aux(AUX_CONVERSATION_ID))
            .unwrap_or_default();
        let hook_name = payload.hook_label().unwrap_or(envelope.kind.as_str());
        if !hub.dedup().admit(conversation, hook_name, payload.body()).await {
            debug!(event = "hook_duplicate_dropped", from = %envelope.from, hook = hook_name);
            return Ok(());
        }
    }
    if envelope.recipient().is_some_and(|to| to != SERVER_ID) {
        return route_by_to(hub, session, envelope).await;
    }
    let recipients = holders(hub, session, Role::CommandClient).await;
    if !recipients.is_empty() {
        hub.fan_out(&envelope, &recipients);
    }
    Ok(())
}

/// Commands for the editor. With a request id the reply is correlated back
/// to the sender; without one the command is fire-and-forget.
async fn route_command(
    hub: &Arc<Hub>,
    conn: &Arc<Connection>,
    session: &SessionState,
    envelope: Envelope,
    request_id: Option<String>,
    sender: Option<&ClientRecord>,
) -> Result<(), RouteError> {
    match request_id.filter(|id| !id.trim().is_empty()) {
        Some(request_id) => {
            route_request(hub, conn, session, envelope, &request_id, None, sender).await
        }
        None => {
            let recipients = match select_target(hub, &envelope, Some(Role::EditorClient)).await? {
                Target::Client(record) => vec![record],
                Target::Role(role) => {
                    match conversation_target(hub, session, role, &envelope, sender).await {
                        Some(record) => vec![record],
                        None => {
                            let found = holders(hub, session, role).await;
                            if found.is_empty() {
                                return Err(RouteError::NoHolders(role));
                            }
                            found
                        }
                    }
                }
            };
            hub.fan_out(&envelope, &recipients);
            Ok(())
        }
    }
}

/// Forwards a correlated request to a single target. Failures that happen
/// before the target has the request are answered with a synthetic result so
/// the originator always hears back exactly once.
async fn route_request(
    hub: &Arc<Hub>,
    conn: &Arc<Connection>,
    session: &SessionState,
    mut envelope: Envelope,
    request_id: &str,
    timeout: Option<Duration>,
    sender: Option<&ClientRecord>,
) -> Result<(), RouteError> {
    let reply_type = envelope
        .kind
        .reply_type()
        .unwrap_or_else(|| MessageType::from(format!("{}_result", envelope.kind).as_str()));
    let target = match resolve_single(hub, session, &envelope, Role::EditorClient, sender).await {
        Ok(target) => target,
        Err(err) => {
            warn!(
                event = "request_unroutable",
                request_id = request_id,
                from = %envelope.from,
                error = %err
            );
            hub.send_to(
                conn,
                &failure_reply(reply_type, &envelope.from, request_id, &err.to_string()),
            );
            return Ok(());
        }
    };

    let deadline = hub
        .correlator()
        .begin(
            request_id,
            Originator::Client(envelope.from.clone()),
            &target.id,
            reply_type.clone(),
            timeout,
        )
        .await?;
    envelope.to = Some(target.id.clone());
    if !hub.send_to(&target.connection, &envelope) {
        if hub.correlator().complete(request_id).await.is_some() {
            hub.send_to(
                conn,
                &failure_reply(reply_type, &envelope.from, request_id, "peer disconnected"),
            );
        }
        return Ok(());
    }
    hub.spawn_deadline(request_id, deadline);
    debug!(
        event = "request_forwarded",
        request_id = request_id,
        from = %envelope.from,
        target = %target.id
    );
    Ok(())
}

/// Replies go to whoever is waiting on their request id. A reply whose
/// request already resolved is dropped.
async fn route_reply(
    hub: &Arc<Hub>,
    session: &SessionState,
    mut envelope: Envelope,
    request_id: Option<String>,
) -> Result<(), RouteError> {
    let Some(request_id) = request_id.filter(|id| !id.trim().is_empty()) else {
        return route_by_to(hub, session, envelope).await;
    };
    let pending = match hub
        .correlator()
        .complete_from(&request_id, |target| session.owns(target))
        .await
    {
        ReplyMatch::Matched(pending) => pending,
        ReplyMatch::Unknown => {
            debug!(
                event = "late_reply_dropped",
                request_id = %request_id,
                from = %envelope.from,
                r#type = %envelope.kind
            );
            return Ok(());
        }
        ReplyMatch::WrongResponder { target } => {
            warn!(
                event = "reply_from_other_peer",
                request_id = %request_id,
                expected = %target,
                from = %envelope.from
            );
            return Err(RouteError::NotRequestTarget(request_id));
        }
    };
    match pending.originator {
        Originator::Client(origin) => {
            envelope.to = Some(origin.clone());
            if !hub.deliver(&origin, &envelope).await {
                debug!(event = "originator_gone", request_id = %request_id, originator = %origin);
            }
        }
        Originator::Internal(reply) => {
            let _ = reply.send(envelope);
        }
    }
    Ok(())
}

/// Generic forwarding by `to`: a client id, or every holder of a role.
async fn route_by_to(
    hub: &Arc<Hub>,
    session: &SessionState,
    envelope: Envelope,
) -> Result<(), RouteError> {
    match select_target(hub, &envelope, None).await? {
        Target::Client(record) => {
            if hub.send_to(&record.connection, &envelope) {
                Ok(())
            } else {
                Err(RouteError::PeerDisconnected)
            }
        }
        Target::Role(role) => {
            let recipients = holders(hub, session, role).await;
            if recipients.is_empty() {
                return Err(RouteError::NoHolders(role));
            }
            hub.fan_out(&envelope, &recipients);
            Ok(())
        }
    }
}

/// Interprets `to`. A missing selector, or one naming the hub, falls back to
/// `default_role` when the message type has a natural destination.
async fn select_target(
    hub: &Arc<Hub>,
    envelope: &Envelope,
    default_role: Option<Role>,
) -> Result<Target, RouteError> {
    match envelope.recipient() {
        Some(to) if to != SERVER_ID => {
            if let Some(record) = hub.registry().lookup_by_id(to).await {
                return Ok(Target::Client(record));
            }
            Role::from_recipient(to)
                .map(Target::Role)
                .ok_or_else(|| RouteError::TargetNotFound(to.to_string()))
        }
        Some(_) => default_role
            .map(Target::Role)
            .ok_or_else(|| RouteError::Unsupported(envelope.kind.clone())),
        None => default_role
            .map(Target::Role)
            .ok_or(RouteError::MissingRecipient),
    }
}

/// Narrows a role selector to exactly one client. Several candidates means
/// the selector was ambiguous; the most recent registration wins.
async fn resolve_single(
    hub: &Arc<Hub>,
    session: &SessionState,
    envelope: &Envelope,
    default_role: Role,
    sender: Option<&ClientRecord>,
) -> Result<ClientRecord, RouteError> {
    let role = match select_target(hub, envelope, Some(default_role)).await? {
        Target::Client(record) => return Ok(record),
        Target::Role(role) => role,
    };
    if let Some(record) = conversation_target(hub, session, role, envelope, sender).await {
        return Ok(record);
    }
    let mut candidates = holders(hub, session, role).await;
    if candidates.len() > 1 {
        warn!(
            event = "ambiguous_target",
            role = %role,
            candidates = candidates.len(),
            chosen = candidates.last().map(|record| record.id.as_str()).unwrap_or("")
        );
    }
    candidates.pop().ok_or(RouteError::NoHolders(role))
}

/// Editor-bound traffic is steered to the editor of the conversation it
/// concerns, named in the payload or implied by the sending hook. The
/// sending connection is never its own target.
async fn conversation_target(
    hub: &Arc<Hub>,
    session: &SessionState,
    role: Role,
    envelope: &Envelope,
    sender: Option<&ClientRecord>,
) -> Option<ClientRecord> {
    if role != Role::EditorClient {
        return None;
    }
    let conversation_id = envelope
        .payload_str(AUX_CONVERSATION_ID)
        .or_else(|| {
            sender
                .filter(|record| record.has_role(Role::AgentHook))
                .and_then(|record| record.aux(AUX_CONVERSATION_ID))
        })?
        .to_string();
    hub.lookup_by_conversation(&conversation_id, |id| session.owns(id))
        .await
}

/// Holders of `role`, excluding every id bound to the sending connection.
async fn holders(hub: &Arc<Hub>, session: &SessionState, role: Role) -> Vec<ClientRecord> {
    hub.registry()
        .lookup_by_role(role)
        .await
        .into_iter()
        .filter(|record| !session.owns(&record.id))
        .collect()
}

fn reply_error(
    hub: &Hub,
    conn: &Connection,
    to: &str,
    err: &RouteError,
    request_id: Option<&str>,
) {
    hub.send_to(
        conn,
        &error_envelope(to, err.code(), &err.to_string(), request_id),
    );
}
