//! `WebSocket` handler for viewer connections.
//!
//! Each connection gets its own task running a single select loop over:
//!
//! - the session's outbound queue (frames from the fan-out), written to
//!   the socket in order
//! - inbound messages, decoded as control commands and applied to the
//!   run controller
//! - a keep-alive timer that pings the viewer and drops it after
//!   `idle_timeout` without inbound traffic
//! - eviction by the fan-out when the viewer falls behind
//!
//! The connection acknowledgment is queued before the session is
//! registered, so it always precedes the first broadcast frame.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use relay_core::controller::{RunController, StartOutcome};
use relay_types::{ControlCommand, ServerMessage, SessionId, decode_command};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::ConnectionError;
use crate::session::{Delivery, Session};
use crate::state::{AppState, CONNECTED_MESSAGE};

/// Upgrade an HTTP request to a viewer `WebSocket` connection.
///
/// # Route
///
/// `GET /` and `GET /ws`
pub async fn ws_viewer(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, remote, state))
}

/// Why a connection loop ended.
#[derive(Debug)]
enum Disconnect {
    /// The viewer closed the socket.
    Closed,
    /// A socket read or write failed.
    Transport(String),
    /// The viewer sent nothing for longer than the idle timeout.
    IdleTimeout,
    /// The fan-out dropped the viewer for falling behind.
    Evicted,
}

/// Handle one viewer from acknowledgment to unregistration.
async fn handle_ws(mut socket: WebSocket, remote: SocketAddr, state: Arc<AppState>) {
    let (session, mut outbound) = Session::new(remote, state.connection.outbound_queue);
    let id = session.id();

    let ack = match ServerMessage::connected(CONNECTED_MESSAGE).encode() {
        Ok(json) => Utf8Bytes::from(json),
        Err(e) => {
            warn!(session = %id, error = %e, "Failed to serialize acknowledgment");
            return;
        }
    };
    if session.try_deliver(ack) != Delivery::Queued {
        warn!(session = %id, "Could not queue acknowledgment");
        return;
    }

    let _ = state.registry.register(Arc::clone(&session)).await;
    info!(session = %id, %remote, "Viewer connected");

    let reason = serve(&mut socket, &session, &mut outbound, &state).await;

    let _ = state.registry.unregister(id).await;
    match reason {
        Disconnect::Closed => info!(session = %id, %remote, "Viewer disconnected"),
        Disconnect::Transport(detail) => {
            info!(session = %id, %remote, error = %detail, "Viewer connection failed");
        }
        dropped @ (Disconnect::IdleTimeout | Disconnect::Evicted) => {
            let _ = socket.send(Message::Close(None)).await;
            info!(session = %id, %remote, reason = ?dropped, "Viewer dropped");
        }
    }
}

/// Run the connection's select loop until it ends.
async fn serve(
    socket: &mut WebSocket,
    session: &Session,
    outbound: &mut mpsc::Receiver<Utf8Bytes>,
    state: &AppState,
) -> Disconnect {
    let settings = state.connection;
    let mut keepalive = tokio::time::interval(settings.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First ping one full interval after connect.
    keepalive.reset();
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            // Frames from the fan-out (and this connection's own ack).
            payload = outbound.recv() => {
                let Some(text) = payload else {
                    return Disconnect::Closed;
                };
                if let Err(e) = socket.send(Message::Text(text)).await {
                    return Disconnect::Transport(e.to_string());
                }
            }
            // Inbound control messages and close frames.
            inbound = socket.recv() => {
                last_seen = Instant::now();
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = dispatch(text.as_str(), &state.controller, session.id()).await {
                            debug!(session = %session.id(), error = %e, "Rejected viewer message");
                            if let Some(reply) = e.reply() {
                                if let Err(e) = send_message(socket, &reply).await {
                                    return Disconnect::Transport(e.to_string());
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = socket.send(Message::Pong(data)).await {
                            return Disconnect::Transport(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Disconnect::Closed,
                    Some(Err(e)) => return Disconnect::Transport(e.to_string()),
                    Some(Ok(Message::Binary(_) | Message::Pong(_))) => {}
                }
            }
            // Keep-alive: drop silent viewers, ping the rest.
            _ = keepalive.tick() => {
                if last_seen.elapsed() > settings.idle_timeout {
                    return Disconnect::IdleTimeout;
                }
                if let Err(e) = socket.send(Message::Ping(Bytes::new())).await {
                    return Disconnect::Transport(e.to_string());
                }
            }
            () = session.evicted() => return Disconnect::Evicted,
        }
    }
}

/// Decode one text message and apply it to the controller.
async fn dispatch(
    text: &str,
    controller: &RunController,
    session: SessionId,
) -> Result<(), ConnectionError> {
    let Some(command) = decode_command(text)? else {
        debug!(%session, "Ignoring unrecognized message");
        return Ok(());
    };

    match command {
        ControlCommand::Start => match controller.start().await {
            StartOutcome::Launched { generation } => {
                info!(%session, generation, "Run started by viewer");
            }
            StartOutcome::AlreadyRunning => {
                debug!(%session, "Start ignored, already running");
            }
        },
        ControlCommand::Stop => {
            if controller.stop().await {
                info!(%session, "Run stopped by viewer");
            }
        }
        ControlCommand::SetSpeed(requested) => {
            let previous = controller.set_speed(requested).await?;
            debug!(%session, previous, requested, "Speed set by viewer");
        }
    }
    Ok(())
}

/// Serialize and send a message directly on this connection.
async fn send_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), ConnectionError> {
    let json = message.encode().map_err(|e| ConnectionError::ProcessingError {
        detail: e.to_string(),
    })?;
    socket
        .send(Message::Text(Utf8Bytes::from(json)))
        .await
        .map_err(|e| {
            debug!(error = %e, "Send failed");
            ConnectionError::ConnectionClosed
        })
}
