//! Fan-out from the actor to its attached connections. Enqueueing is always
//! non-blocking; a connection that cannot keep up gets disconnected instead
//! of stalling the actor.

use super::SessionActor;
use protocol::{ErrorCode, ServerFrame};
use tokio::sync::mpsc;

/// What the actor pushes into a connection's outbound queue.
#[derive(Debug)]
pub enum Outbound {
    /// A frame to deliver in emission order.
    Frame(ServerFrame),
    /// Deliver an error with this code, then close the socket with the code
    /// as close reason.
    Close(ErrorCode),
    /// Close the socket without an error (session over, client left).
    Shutdown,
}

/// The actor-side reference to one attached connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: u64,
    pub user_id: String,
    sender: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(conn_id: u64, user_id: String, sender: mpsc::Sender<Outbound>) -> Self {
        ConnectionHandle {
            conn_id,
            user_id,
            sender,
        }
    }

    /// Non-blocking enqueue. Returns false when the queue is full, which is
    /// the slow-consumer signal for the caller.
    pub fn enqueue(&self, frame: ServerFrame) -> bool {
        self.sender.try_send(Outbound::Frame(frame)).is_ok()
    }

    /// Requests an error close. Delivered after the already queued frames;
    /// waits for queue space in a detached task so the actor never blocks.
    pub fn close(&self, code: ErrorCode) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let _ = sender.send(Outbound::Close(code)).await;
        });
    }

    /// Requests a plain close after the queued frames have drained.
    pub fn shutdown(&self) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let _ = sender.send(Outbound::Shutdown).await;
        });
    }
}

impl SessionActor {
    /// Enqueues a frame to every attached connection.
    pub(super) fn broadcast(&mut self, frame: ServerFrame) {
        self.broadcast_filtered(frame, |_| true);
    }

    /// Enqueues a frame to the connections the filter admits. Connections
    /// with a full queue are dropped as slow consumers.
    pub(super) fn broadcast_filtered(
        &mut self,
        frame: ServerFrame,
        filter: impl Fn(&ConnectionHandle) -> bool,
    ) {
        let mut slow = Vec::new();
        for (conn_id, handle) in &self.connections {
            if !filter(handle) {
                continue;
            }
            if !handle.enqueue(frame.clone()) {
                slow.push(*conn_id);
            }
        }
        for conn_id in slow {
            if let Some(handle) = self.connections.remove(&conn_id) {
                tracing::warn!(
                    session_id = self.session_id,
                    conn_id,
                    user_id = handle.user_id,
                    "outbound queue overflow, dropping slow consumer"
                );
                handle.close(ErrorCode::SlowConsumer);
                self.note_connection_gone(&handle.user_id);
            }
        }
    }

    /// Enqueues a frame to every connection of one user.
    pub(super) fn send_to_user(&mut self, user_id: &str, frame: ServerFrame) {
        self.broadcast_filtered(frame, |handle| handle.user_id == user_id);
    }

    /// Error reply to the originator only, correlated with the triggering
    /// sequence number.
    pub(super) fn send_error(
        &mut self,
        user_id: &str,
        code: ErrorCode,
        message: impl Into<String>,
        retry_after_ms: Option<u64>,
        correlation_seq: Option<u64>,
    ) {
        let frame = ServerFrame::Error {
            code,
            message: message.into(),
            retry_after_ms,
            correlation_seq,
        };
        self.send_to_user(user_id, frame);
    }

    /// Records a broadcast frame in the bounded replay log under the current
    /// state version, for reconnect catch-up.
    pub(super) fn log_event(&mut self, frame: ServerFrame) {
        self.event_log.push_back((self.state_version, frame));
        while self.event_log.len() > super::EVENT_LOG_LEN {
            self.event_log.pop_front();
        }
    }
}
