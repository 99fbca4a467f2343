//! One WebSocket client attachment: the auth handshake, frame routing into
//! the registry or the owning session actor, the keepalive, and the bounded
//! outbound queue the actor writes into.

use crate::registry::{AppState, SessionHandle};
use crate::session::{ConnectionHandle, Outbound, SessionMsg};
use crate::time::now_ms;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientFrame, Envelope, ErrorCode, ServerFrame, UserView};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Upgrades the request and hands the socket to the connection lifecycle.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| websocket(socket, state))
}

/// Does the whole handling from start to finish: auth handshake -> frame
/// routing loop -> detach notification.
async fn websocket(stream: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = stream.split();
    let mut out_seq: u64 = 0;

    let Some((user, last_seq)) =
        authenticate(&mut sender, &mut receiver, &state, &mut out_seq).await
    else {
        return;
    };

    let connection = Connection {
        conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
        user,
        state,
        last_seq,
        out_seq,
        attachment: None,
    };
    connection.run(sender, receiver).await;
}

/// Reads the first frame, which must be a valid `auth` within the handshake
/// budget, resolves the identity and greets the client.
async fn authenticate(
    sender: &mut WsSink,
    receiver: &mut WsStream,
    state: &Arc<AppState>,
    out_seq: &mut u64,
) -> Option<(UserView, u64)> {
    let budget = Duration::from_secs(state.config.auth_handshake_seconds);
    let first = match tokio::time::timeout(budget, first_text_frame(receiver)).await {
        Err(_) => {
            close_with(
                sender,
                out_seq,
                ErrorCode::AuthTimeout,
                "no auth frame within the handshake window",
            )
            .await;
            return None;
        }
        Ok(None) => return None,
        Ok(Some(text)) => text,
    };

    let envelope: Envelope<ClientFrame> = match protocol::decode(&first) {
        Ok(envelope) => envelope,
        Err(error) => {
            tracing::debug!(?error, "malformed auth frame");
            close_with(sender, out_seq, ErrorCode::AuthFailed, "malformed auth frame").await;
            return None;
        }
    };
    let ClientFrame::Auth { token } = envelope.body else {
        close_with(
            sender,
            out_seq,
            ErrorCode::AuthFailed,
            "first frame must be auth",
        )
        .await;
        return None;
    };

    let identity = match state.verifier.verify(&token) {
        Ok(identity) => identity,
        Err(error) => {
            tracing::debug!(%error, "token verification failed");
            close_with(sender, out_seq, ErrorCode::AuthFailed, "invalid identity token").await;
            return None;
        }
    };
    let row = match state
        .store
        .ensure_user(&identity.user_id, &identity.display_name)
    {
        Ok(row) => row,
        Err(error) => {
            tracing::error!(%error, "user row write failed");
            close_with(sender, out_seq, ErrorCode::AuthFailed, "identity unavailable").await;
            return None;
        }
    };
    let user = UserView {
        user_id: row.user_id,
        display_name: row.display_name,
    };
    tracing::info!(user_id = user.user_id, "client authenticated");

    let hello = ServerFrame::Hello {
        user: user.clone(),
        capabilities: vec!["chat".into(), "dm".into(), "resume".into()],
    };
    if !send_raw(sender, out_seq, &hello).await {
        return None;
    }
    Some((user, envelope.seq))
}

/// Waits for the first text frame, skipping transport-level noise.
async fn first_text_frame(receiver: &mut WsStream) -> Option<String> {
    loop {
        match receiver.next().await? {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Where the authenticated connection is attached, if anywhere.
struct Attachment {
    session_id: String,
    inbox: mpsc::Sender<SessionMsg>,
}

struct Connection {
    conn_id: u64,
    user: UserView,
    state: Arc<AppState>,
    /// Highest client seq seen; frames must strictly increase past it.
    last_seq: u64,
    /// Server-side envelope counter for this connection.
    out_seq: u64,
    attachment: Option<Attachment>,
}

impl Connection {
    /// The routing loop: inbound frames, actor-emitted outbound traffic and
    /// the keepalive, multiplexed over one task.
    async fn run(mut self, mut sender: WsSink, mut receiver: WsStream) {
        let (out_tx, mut out_rx) =
            mpsc::channel::<Outbound>(self.state.config.connection_queue_capacity);
        let mut ping = tokio::time::interval(Duration::from_secs(
            self.state.config.ping_interval_seconds,
        ));
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick fires immediately; swallow it so the ping
        // cadence starts one interval after connect.
        ping.tick().await;
        let mut pong_deadline: Option<Instant> = None;

        let close_reason = loop {
            tokio::select! {
                inbound = receiver.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match self
                            .on_text(&mut sender, &out_tx, text.as_str(), &mut pong_deadline)
                            .await
                        {
                            ControlFlow::Continue(()) => {}
                            ControlFlow::Break(reason) => break reason,
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Ok(_)) => {} // transport-level frames are not ours
                    Some(Err(_)) => break None,
                },
                outbound = out_rx.recv() => match outbound {
                    Some(Outbound::Frame(frame)) => {
                        if !send_raw(&mut sender, &mut self.out_seq, &frame).await {
                            break None;
                        }
                    }
                    Some(Outbound::Close(code)) => {
                        break Some((code, "disconnected by session".to_string()));
                    }
                    Some(Outbound::Shutdown) => {
                        let _ = sender.send(Message::Close(None)).await;
                        break None;
                    }
                    None => break Some((
                        ErrorCode::SlowConsumer,
                        "outbound queue overflowed".to_string(),
                    )),
                },
                _ = ping.tick() => {
                    if !send_raw(&mut sender, &mut self.out_seq, &ServerFrame::Ping {}).await {
                        break None;
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(
                            Instant::now()
                                + Duration::from_secs(self.state.config.pong_timeout_seconds),
                        );
                    }
                },
                _ = async {
                    match pong_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    break Some((
                        ErrorCode::IdleTimeout,
                        "no pong within the keepalive window".to_string(),
                    ));
                },
            }
        };

        if let Some((code, message)) = close_reason {
            close_with(&mut sender, &mut self.out_seq, code, &message).await;
        }

        // The actor learns about the loss through a detach, never through an
        // error.
        if let Some(attachment) = self.attachment.take() {
            let conn_id = self.conn_id;
            let user_id = self.user.user_id.clone();
            tokio::spawn(async move {
                let _ = attachment
                    .inbox
                    .send(SessionMsg::Detach { conn_id, user_id })
                    .await;
            });
        }
        tracing::debug!(conn_id = self.conn_id, user_id = self.user.user_id, "connection closed");
    }

    async fn on_text(
        &mut self,
        sender: &mut WsSink,
        out_tx: &mpsc::Sender<Outbound>,
        text: &str,
        pong_deadline: &mut Option<Instant>,
    ) -> ControlFlow<Option<(ErrorCode, String)>> {
        let envelope: Envelope<ClientFrame> = match protocol::decode(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::debug!(conn_id = self.conn_id, ?error, "malformed frame");
                return ControlFlow::Break(Some((
                    ErrorCode::Protocol,
                    "malformed frame".to_string(),
                )));
            }
        };
        if envelope.seq <= self.last_seq {
            return ControlFlow::Break(Some((
                ErrorCode::Protocol,
                format!(
                    "seq {} does not increase past {}",
                    envelope.seq, self.last_seq
                ),
            )));
        }
        self.last_seq = envelope.seq;
        let seq = envelope.seq;

        match envelope.body {
            ClientFrame::Auth { .. } => ControlFlow::Break(Some((
                ErrorCode::Protocol,
                "duplicate auth frame".to_string(),
            ))),
            ClientFrame::Ping {} => {
                if send_raw(sender, &mut self.out_seq, &ServerFrame::Pong {}).await {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(None)
                }
            }
            ClientFrame::Pong {} => {
                *pong_deadline = None;
                ControlFlow::Continue(())
            }
            ClientFrame::CreateSession { config } => {
                if self.attachment.is_some() {
                    return self
                        .reply_error(sender, ErrorCode::AlreadyInSession, "leave first", seq)
                        .await;
                }
                match self.state.registry.create(&self.user, config) {
                    Ok(handle) => self.attach(sender, out_tx, handle, None, true, seq).await,
                    Err(code) => {
                        self.reply_error(sender, code, "session creation rejected", seq)
                            .await
                    }
                }
            }
            ClientFrame::JoinSession {
                invite_code,
                character_id,
            } => {
                if self.attachment.is_some() {
                    return self
                        .reply_error(sender, ErrorCode::AlreadyInSession, "leave first", seq)
                        .await;
                }
                match self.state.registry.join(&invite_code) {
                    Ok(handle) => {
                        self.attach(sender, out_tx, handle, character_id, false, seq)
                            .await
                    }
                    Err(code) => self.reply_error(sender, code, "unknown invite code", seq).await,
                }
            }
            ClientFrame::LeaveSession {} => match self.attachment.take() {
                Some(attachment) => {
                    let message = SessionMsg::Leave {
                        conn_id: self.conn_id,
                        user_id: self.user.user_id.clone(),
                    };
                    if attachment.inbox.try_send(message).is_err() {
                        let inbox = attachment.inbox.clone();
                        let conn_id = self.conn_id;
                        let user_id = self.user.user_id.clone();
                        tokio::spawn(async move {
                            let _ = inbox.send(SessionMsg::Leave { conn_id, user_id }).await;
                        });
                    }
                    ControlFlow::Continue(())
                }
                None => {
                    self.reply_error(sender, ErrorCode::NotInSession, "not in a session", seq)
                        .await
                }
            },
            ClientFrame::Ready { ready } => {
                let message = SessionMsg::Ready {
                    user_id: self.user.user_id.clone(),
                    ready,
                    seq,
                };
                self.forward(sender, message, seq).await
            }
            ClientFrame::Intent { action } => {
                let message = SessionMsg::Intent {
                    user_id: self.user.user_id.clone(),
                    action,
                    seq,
                };
                self.forward(sender, message, seq).await
            }
            ClientFrame::DmCommand(command) => {
                let message = SessionMsg::Dm {
                    user_id: self.user.user_id.clone(),
                    command,
                    seq,
                };
                self.forward(sender, message, seq).await
            }
            ClientFrame::Chat {
                kind,
                recipient,
                text,
            } => {
                let message = SessionMsg::Chat {
                    user_id: self.user.user_id.clone(),
                    kind,
                    recipient,
                    text,
                    seq,
                };
                self.forward(sender, message, seq).await
            }
            ClientFrame::ResumeSync { last_seen_version } => {
                let message = SessionMsg::ResumeSync {
                    user_id: self.user.user_id.clone(),
                    conn_id: self.conn_id,
                    last_seen_version,
                    seq,
                };
                self.forward(sender, message, seq).await
            }
        }
    }

    /// Runs the attach round-trip against the session actor and reports the
    /// outcome to the client.
    async fn attach(
        &mut self,
        sender: &mut WsSink,
        out_tx: &mpsc::Sender<Outbound>,
        handle: SessionHandle,
        character_id: Option<String>,
        created: bool,
        seq: u64,
    ) -> ControlFlow<Option<(ErrorCode, String)>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let message = SessionMsg::Attach {
            user: self.user.clone(),
            character_id,
            handle: ConnectionHandle::new(
                self.conn_id,
                self.user.user_id.clone(),
                out_tx.clone(),
            ),
            reply: reply_tx,
        };
        if let Err(error) = handle.inbox.try_send(message) {
            return match error {
                mpsc::error::TrySendError::Full(_) => ControlFlow::Break(Some((
                    ErrorCode::ServerBusy,
                    "session inbox is full".to_string(),
                ))),
                // The actor is gone; drop the stale registry entry instead
                // of waiting for the watchdog sweep.
                mpsc::error::TrySendError::Closed(_) => {
                    self.state.registry.dispose(&handle.session_id);
                    self.reply_error(sender, ErrorCode::SessionNotFound, "session closed", seq)
                        .await
                }
            };
        }
        match reply_rx.await {
            Err(_) => {
                self.state.registry.dispose(&handle.session_id);
                self.reply_error(sender, ErrorCode::SessionNotFound, "session closed", seq)
                    .await
            }
            Ok(Err(code)) => self.reply_error(sender, code, "join rejected", seq).await,
            Ok(Ok(info)) => {
                self.attachment = Some(Attachment {
                    session_id: info.session_id.clone(),
                    inbox: handle.inbox.clone(),
                });
                tracing::info!(
                    conn_id = self.conn_id,
                    user_id = self.user.user_id,
                    session_id = info.session_id,
                    "attached to session"
                );
                let frame = if created {
                    ServerFrame::SessionCreated {
                        invite_code: info.invite_code.clone(),
                        session: info,
                    }
                } else {
                    ServerFrame::SessionJoined { session: info }
                };
                if send_raw(sender, &mut self.out_seq, &frame).await {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(None)
                }
            }
        }
    }

    /// Routes a message into the owning actor's inbox without blocking; a
    /// full inbox closes the connection rather than stalling the actor.
    async fn forward(
        &mut self,
        sender: &mut WsSink,
        message: SessionMsg,
        seq: u64,
    ) -> ControlFlow<Option<(ErrorCode, String)>> {
        let Some(attachment) = self.attachment.as_ref() else {
            return self
                .reply_error(sender, ErrorCode::NotInSession, "not in a session", seq)
                .await;
        };
        match attachment.inbox.try_send(message) {
            Ok(()) => ControlFlow::Continue(()),
            Err(mpsc::error::TrySendError::Full(_)) => ControlFlow::Break(Some((
                ErrorCode::ServerBusy,
                "session inbox is full".to_string(),
            ))),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let session_id = attachment.session_id.clone();
                self.attachment = None;
                self.state.registry.dispose(&session_id);
                self.reply_error(sender, ErrorCode::SessionNotFound, "session closed", seq)
                    .await
            }
        }
    }

    async fn reply_error(
        &mut self,
        sender: &mut WsSink,
        code: ErrorCode,
        message: &str,
        seq: u64,
    ) -> ControlFlow<Option<(ErrorCode, String)>> {
        let frame = ServerFrame::Error {
            code,
            message: message.to_string(),
            retry_after_ms: None,
            correlation_seq: Some(seq),
        };
        if send_raw(sender, &mut self.out_seq, &frame).await {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(None)
        }
    }
}

/// Writes one enveloped frame; false means the socket is gone.
async fn send_raw(sender: &mut WsSink, out_seq: &mut u64, frame: &ServerFrame) -> bool {
    *out_seq += 1;
    let envelope = Envelope::new(*out_seq, now_ms(), frame);
    let text = match protocol::encode(&envelope) {
        Ok(text) => text,
        Err(error) => {
            tracing::error!(?error, "outbound frame encoding failed");
            return false;
        }
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}

/// Sends a final error frame and closes the socket with the code as reason.
async fn close_with(sender: &mut WsSink, out_seq: &mut u64, code: ErrorCode, message: &str) {
    let frame = ServerFrame::Error {
        code,
        message: message.to_string(),
        retry_after_ms: None,
        correlation_seq: None,
    };
    let _ = send_raw(sender, out_seq, &frame).await;
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            // 1008: policy violation, the protocol-level close code.
            code: 1008,
            reason: code.as_str().into(),
        })))
        .await;
}
