//! Per-socket agent session.
//!
//! Drives one connection through its lifecycle: authenticate the bearer
//! token, await the hello inside the handshake deadline, register with the
//! hub, then pump frames to the router until the socket goes away. Frames
//! from one socket are processed in arrival order.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use shipway_protocol::{
    close::{CLOSE_AUTH_FAILED, CLOSE_HANDSHAKE_FAILED, CLOSE_MALFORMED_HELLO},
    decode, AgentConfig, AgentEvent, Dialect, Hello, PendingDeployment, ProtocolError,
    ServerMessage,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::router::AgentContext;
use crate::state::AppState;
use crate::store::{AgentRegistration, Server, ServerStatus, Store};
use crate::tokens;

use super::Outbound;

/// How long a freshly authenticated socket has to present its hello.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs one agent session to completion.
pub async fn run(socket: WebSocket, token: Option<String>, state: AppState) {
    let Some(token) = token else {
        close_with(socket, CLOSE_AUTH_FAILED, "missing token").await;
        return;
    };

    let token_hash = tokens::hash_token(&token);
    let server = match state.store().server_by_token_hash(&token_hash).await {
        Ok(Some(server)) => server,
        Ok(None) => {
            close_with(socket, CLOSE_AUTH_FAILED, "unknown token").await;
            return;
        }
        Err(e) => {
            warn!(error = %e, "Token lookup failed");
            close_with(socket, 1011, "internal error").await;
            return;
        }
    };

    let mut socket = socket;
    let hello = match tokio::time::timeout(HELLO_TIMEOUT, read_hello(&mut socket)).await {
        Ok(HelloOutcome::Hello(hello)) => hello,
        Ok(HelloOutcome::WrongType) => {
            close_with(socket, CLOSE_HANDSHAKE_FAILED, "expected hello").await;
            return;
        }
        Ok(HelloOutcome::Malformed) => {
            close_with(socket, CLOSE_MALFORMED_HELLO, "malformed hello").await;
            return;
        }
        Ok(HelloOutcome::Disconnected) => return,
        Err(_) => {
            close_with(socket, CLOSE_HANDSHAKE_FAILED, "hello deadline expired").await;
            return;
        }
    };

    registered(socket, server, hello, state).await;
}

enum HelloOutcome {
    Hello(Hello),
    WrongType,
    Malformed,
    Disconnected,
}

async fn read_hello(socket: &mut WebSocket) -> HelloOutcome {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                return match decode(text.as_str()).and_then(|f| f.into_event()) {
                    Ok(AgentEvent::Hello(hello)) => HelloOutcome::Hello(hello),
                    Ok(_) | Err(ProtocolError::UnknownType(_)) => HelloOutcome::WrongType,
                    Err(_) => HelloOutcome::Malformed,
                };
            }
            Some(Ok(Message::Close(_))) | None => return HelloOutcome::Disconnected,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return HelloOutcome::Disconnected,
        }
    }
}

async fn registered(socket: WebSocket, server: Server, hello: Hello, state: AppState) {
    let server_id = server.id;
    let dialect = hello.dialect;

    // Persist what the agent reported about itself; a write failure here is
    // recoverable (the next heartbeat or health pass converges it).
    let registration = AgentRegistration {
        agent_id: hello.agent_id.clone(),
        agent_version: hello.agent_version.clone(),
        runtime_version: hello.runtime_version.clone(),
        hostname: hello.hostname.clone(),
        os: hello.os.clone(),
        arch: hello.arch.clone(),
        public_ip: hello.public_ip.clone(),
        resources: hello.resources.clone(),
    };
    if let Err(e) = state
        .store()
        .update_server_agent_info(server_id, &registration)
        .await
    {
        warn!(server_id = %server_id, error = %e, "Failed to persist agent info");
    }
    if let Err(e) = state
        .store()
        .update_server_status(server_id, ServerStatus::Online)
        .await
    {
        warn!(server_id = %server_id, error = %e, "Failed to mark server online");
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let session = state.hub().register(
        server_id,
        server.org_id,
        hello.agent_id.clone(),
        server.name.clone(),
        dialect,
        outbound_tx,
    );

    info!(
        server_id = %server_id,
        agent_id = %hello.agent_id,
        dialect = ?dialect,
        "Agent registered"
    );

    let ack = match dialect {
        Dialect::Legacy => ServerMessage::HelloAck(hello_ack_config(&state, &server).await),
        Dialect::Compact => ServerMessage::Welcome {
            session_id: session.to_string(),
        },
    };

    let ctx = AgentContext {
        server_id,
        org_id: server.org_id,
        server_name: server.name.clone(),
        dialect,
    };

    let (mut sender, mut receiver) = socket.split();

    if sender
        .send(Message::Text(ack.to_text(dialect).into()))
        .await
        .is_err()
    {
        finish(&state, &ctx, session).await;
        return;
    }

    loop {
        tokio::select! {
            out = outbound_rx.recv() => match out {
                Some(Outbound::Text(text)) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.to_string().into(),
                        })))
                        .await;
                    break;
                }
                // Hub entry gone; tear down.
                None => break,
            },
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&state, &ctx, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(server_id = %server_id, error = %e, "Socket error");
                    break;
                }
            }
        }
    }

    finish(&state, &ctx, session).await;
}

/// Decodes one registered-phase frame and hands it to the router.
///
/// Decode failures are logged and the frame dropped: an established agent
/// is not disconnected over one unparseable message (forward compatibility
/// with newer agent vocabularies).
async fn handle_frame(state: &AppState, ctx: &AgentContext, text: &str) {
    let event = match decode(text).and_then(|f| f.into_event()) {
        Ok(AgentEvent::Hello(_)) => {
            debug!(server_id = %ctx.server_id, "Duplicate hello ignored");
            return;
        }
        Ok(event) => event,
        Err(e) => {
            warn!(server_id = %ctx.server_id, error = %e, "Undecodable frame dropped");
            return;
        }
    };

    state.router().handle_event(ctx, event).await;
}

/// Tears down after the socket is gone: evict from the hub (if this session
/// still owns the entry) and mark the server offline.
async fn finish(state: &AppState, ctx: &AgentContext, session: uuid::Uuid) {
    if !state.hub().deregister(ctx.server_id, session) {
        // Replaced by a newer connection; the registry entry is not ours.
        return;
    }

    info!(server_id = %ctx.server_id, "Agent disconnected");

    if let Err(e) = state
        .store()
        .update_server_status(ctx.server_id, ServerStatus::Offline)
        .await
    {
        warn!(server_id = %ctx.server_id, error = %e, "Failed to mark server offline");
    }
}

async fn hello_ack_config(state: &AppState, server: &Server) -> AgentConfig {
    let pending_deployments = match state.store().pending_deployments(server.id).await {
        Ok(deployments) => deployments
            .into_iter()
            .map(|d| PendingDeployment {
                deployment_id: d.id,
                service_id: d.service_id,
            })
            .collect(),
        Err(e) => {
            warn!(server_id = %server.id, error = %e, "Failed to load pending deployments");
            Vec::new()
        }
    };

    AgentConfig {
        pending_deployments,
        ..AgentConfig::default()
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}
