use crate::config::TransportSettings;
use crate::connection::{ConnectionHandle, Outbound, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};
use crate::coordinator::{Coordinator, Submission};
use crate::http::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bridge_core::protocol::{
    decode_message, encode_message, AcceptedPayload, AuthenticationSuccessPayload, PingPayload,
};
use bridge_core::{ClientType, WireMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

enum Role {
    Worker { worker_id: String },
    Cli { client_id: String },
}

impl Role {
    fn id(&self) -> &str {
        match self {
            Role::Worker { worker_id } => worker_id,
            Role::Cli { client_id } => client_id,
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    if !state.settings.allow_remote && !remote.ip().is_loopback() {
        warn!(event = "remote_refused", remote = %remote);
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(state.coordinator, state.settings, socket, remote))
}

pub async fn handle_socket(
    coordinator: Arc<Coordinator>,
    settings: TransportSettings,
    socket: WebSocket,
    remote: SocketAddr,
) {
    let conn_id = coordinator.next_conn_id();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
    let handle = ConnectionHandle::new(conn_id.clone(), tx);
    let writer = tokio::spawn(writer_loop(
        ws_sender,
        rx,
        settings.write_timeout,
        settings.max_message_bytes,
        conn_id.clone(),
    ));

    let Some(role) = authenticate(&coordinator, &settings, &mut ws_receiver, &handle, remote).await
    else {
        handle.close(CLOSE_POLICY_VIOLATION, "authentication_required");
        finish_writer(writer, settings.write_timeout).await;
        return;
    };

    let ping_task = spawn_ping(handle.clone(), settings.ping_interval);
    let mut shutdown = coordinator.shutdown_signal();
    let mut malformed = 0u32;

    loop {
        let next = tokio::select! {
            next = ws_receiver.next() => next,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = handle.closed() => {
                info!(event = "hub_closed_connection", conn_id = %conn_id, id = %role.id());
                break;
            }
        };
        let Some(result) = next else {
            break;
        };
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "read_error", conn_id = %conn_id, error = %err);
                break;
            }
        };
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                info!(event = "client_close", conn_id = %conn_id, id = %role.id());
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                touch(&coordinator, &role).await;
                continue;
            }
        };
        touch(&coordinator, &role).await;
        match decode_message(&data, settings.max_message_bytes) {
            Ok(message) => {
                malformed = 0;
                handle_message(&coordinator, &role, &handle, message).await;
            }
            Err(err) => {
                malformed += 1;
                warn!(
                    event = "message_invalid",
                    conn_id = %conn_id,
                    code = err.code(),
                    error = %err,
                    streak = malformed
                );
                handle.send(WireMessage::error(None, err.code(), err.to_string()));
                if malformed >= settings.max_malformed {
                    warn!(event = "protocol_abuse", conn_id = %conn_id, id = %role.id());
                    handle.close(CLOSE_POLICY_VIOLATION, "protocol_abuse");
                    break;
                }
            }
        }
    }

    ping_task.abort();
    match &role {
        Role::Worker { worker_id } => {
            coordinator
                .disconnect_worker(worker_id, &conn_id, "socket_closed")
                .await;
        }
        Role::Cli { client_id } => {
            coordinator.remove_client(&conn_id);
            info!(event = "client_removed", conn_id = %conn_id, client_id = %client_id);
        }
    }
    handle.close(CLOSE_NORMAL, "bye");
    finish_writer(writer, settings.write_timeout).await;
}

async fn authenticate(
    coordinator: &Arc<Coordinator>,
    settings: &TransportSettings,
    ws_receiver: &mut SplitStream<WebSocket>,
    handle: &ConnectionHandle,
    remote: SocketAddr,
) -> Option<Role> {
    let first = match tokio::time::timeout(AUTH_TIMEOUT, ws_receiver.next()).await {
        Ok(Some(Ok(msg))) => msg,
        Ok(_) => return None,
        Err(_) => {
            warn!(event = "auth_timeout", remote = %remote);
            return None;
        }
    };
    let data = match first {
        Message::Text(text) => text.into_bytes(),
        Message::Binary(bytes) => bytes,
        _ => return None,
    };
    let payload = match decode_message(&data, settings.max_message_bytes) {
        Ok(WireMessage::Authenticate(payload)) => payload,
        Ok(other) => {
            warn!(event = "expected_authenticate", remote = %remote, got = other.kind());
            handle.send(WireMessage::error(
                None,
                "authentication_required",
                "first message must be authenticate",
            ));
            return None;
        }
        Err(err) => {
            warn!(event = "auth_parse", remote = %remote, error = %err);
            handle.send(WireMessage::error(None, err.code(), err.to_string()));
            return None;
        }
    };

    let role = match payload.client_type {
        ClientType::Extension => {
            if payload.id.trim().is_empty() {
                handle.send(WireMessage::error(
                    None,
                    "invalid_request",
                    "extension id is required",
                ));
                return None;
            }
            if let Err(err) = coordinator
                .connect_worker(&payload.id, payload.metadata, handle.clone())
                .await
            {
                warn!(
                    event = "worker_rejected",
                    remote = %remote,
                    worker_id = %payload.id,
                    code = err.code()
                );
                handle.send(WireMessage::error(None, err.code(), err.to_string()));
                return None;
            }
            Role::Worker {
                worker_id: payload.id,
            }
        }
        ClientType::Cli => {
            if !coordinator.is_accepting() {
                handle.send(WireMessage::error(
                    None,
                    "shutting_down",
                    "coordinator is shutting down",
                ));
                return None;
            }
            coordinator.register_client(handle.clone());
            let client_id = if payload.id.trim().is_empty() {
                handle.conn_id().to_string()
            } else {
                payload.id
            };
            Role::Cli { client_id }
        }
    };

    info!(
        event = "handshake_ok",
        conn_id = %handle.conn_id(),
        remote = %remote,
        client_type = %payload.client_type,
        id = %role.id()
    );
    handle.send(WireMessage::AuthenticationSuccess(
        AuthenticationSuccessPayload {
            client_id: role.id().to_string(),
            message: format!("{} authenticated", payload.client_type),
        },
    ));
    Some(role)
}

async fn touch(coordinator: &Coordinator, role: &Role) {
    if let Role::Worker { worker_id } = role {
        let _ = coordinator.heartbeat(worker_id).await;
    }
}

async fn handle_message(
    coordinator: &Arc<Coordinator>,
    role: &Role,
    handle: &ConnectionHandle,
    message: WireMessage,
) {
    match (role, message) {
        (_, WireMessage::Ping(PingPayload { timestamp })) => {
            handle.send(WireMessage::Pong(PingPayload { timestamp }));
        }
        (_, WireMessage::Pong(_)) => {}
        (Role::Worker { worker_id }, WireMessage::ImageGenerated(payload)) => {
            if let Err(err) = coordinator.complete(worker_id, payload) {
                debug!(event = "completion_discarded", worker_id = %worker_id, code = err.code());
            }
        }
        (Role::Worker { worker_id }, WireMessage::RequestFailed(payload)) => {
            if let Err(err) = coordinator.fail_from_worker(worker_id, payload) {
                debug!(event = "failure_discarded", worker_id = %worker_id, code = err.code());
            }
        }
        (Role::Worker { worker_id }, WireMessage::Error(payload)) => {
            warn!(
                event = "worker_error",
                worker_id = %worker_id,
                request_id = payload.request_id.as_deref().unwrap_or("-"),
                message = %payload.message
            );
        }
        (Role::Cli { client_id }, WireMessage::GenerateImage(payload)) => {
            let fallback_id = payload.request_id.clone();
            let submission = Submission::from_payload(payload).with_origin(handle.clone());
            match coordinator.submit(submission).await {
                Ok(receipt) => {
                    handle.send(WireMessage::RequestAccepted(AcceptedPayload {
                        request_id: receipt.request_id,
                        correlation_id: receipt.correlation_id,
                        status: "accepted".to_string(),
                    }));
                }
                Err(err) => {
                    debug!(event = "submit_rejected", client_id = %client_id, code = err.code());
                    let request_id = err.request_id().map(str::to_string).or(fallback_id);
                    handle.send(WireMessage::error(
                        request_id.as_deref(),
                        err.code(),
                        err.to_string(),
                    ));
                }
            }
        }
        (_, WireMessage::Authenticate(_)) => {
            handle.send(WireMessage::error(
                None,
                "already_authenticated",
                "connection is already authenticated",
            ));
        }
        (_, other) => {
            handle.send(WireMessage::error(
                other.request_id(),
                "unexpected_message",
                format!("{} is not accepted on this connection", other.kind()),
            ));
        }
    }
}

fn spawn_ping(handle: ConnectionHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        if interval.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            if !handle.ping() {
                debug!(event = "ping_stopped", conn_id = %handle.conn_id());
                return;
            }
        }
    })
}

async fn writer_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
    max_message_bytes: usize,
    conn_id: String,
) {
    while let Some(frame) = rx.recv().await {
        let (message, closing) = match frame {
            Outbound::Message(message) => match encode_message(&message, max_message_bytes) {
                Ok(text) => (Message::Text(text), false),
                Err(err) => {
                    warn!(
                        event = "encode_failed",
                        conn_id = %conn_id,
                        kind = message.kind(),
                        error = %err
                    );
                    continue;
                }
            },
            Outbound::Ping => (Message::Ping(Vec::new()), false),
            Outbound::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: Cow::Owned(reason),
                })),
                true,
            ),
        };
        match tokio::time::timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(event = "write_error", conn_id = %conn_id, error = %err);
                return;
            }
            Err(_) => {
                warn!(event = "write_timeout", conn_id = %conn_id);
                return;
            }
        }
        if closing {
            return;
        }
    }
}

async fn finish_writer(writer: JoinHandle<()>, write_timeout: Duration) {
    let abort = writer.abort_handle();
    if tokio::time::timeout(write_timeout, writer).await.is_err() {
        abort.abort();
    }
}
