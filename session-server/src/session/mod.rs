//! The session actor: the single writer for one session's canonical state.
//! Connections, the registry and timers only ever talk to it through its
//! bounded inbox; the actor dequeues one message, fully processes it
//! (mutation, events, timer rescheduling, broadcast) and only then takes the
//! next one.

mod broadcast;
mod dm;
mod intents;
mod snapshot;
mod turns;

pub use broadcast::{ConnectionHandle, Outbound};
pub use snapshot::SnapshotRecord;

use crate::config::ServerConfig;
use crate::rate_limit::{Bucket, RateLimiter};
use crate::store::{SessionRow, Store};
use crate::time::now_ms;
use protocol::{
    ChatEntry, ChatKind, DmCommand, ErrorCode, ParticipantInfo, ParticipantRole, PauseReason,
    ServerFrame, SessionConfig, SessionEndReason, SessionInfo, SessionPhase, UserView,
};
use simulation::{Action, GameState, UnitId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Bounded per-session chat history.
const CHAT_RING_LEN: usize = 100;

/// Bounded per-session replay log for reconnect catch-up.
const EVENT_LOG_LEN: usize = 200;

/// Everything a connection can ask a session actor to do.
pub enum SessionMsg {
    /// Participant join or rejoin over a fresh connection.
    Attach {
        user: UserView,
        character_id: Option<String>,
        handle: ConnectionHandle,
        reply: oneshot::Sender<Result<SessionInfo, ErrorCode>>,
    },
    /// Connection loss without an explicit leave.
    Detach { conn_id: u64, user_id: String },
    /// Explicit departure from the session.
    Leave { conn_id: u64, user_id: String },
    /// A gameplay action.
    Intent {
        user_id: String,
        action: Action,
        seq: u64,
    },
    /// Lobby readiness toggle.
    Ready {
        user_id: String,
        ready: bool,
        seq: u64,
    },
    /// A privileged host command.
    Dm {
        user_id: String,
        command: DmCommand,
        seq: u64,
    },
    /// A chat message.
    Chat {
        user_id: String,
        kind: ChatKind,
        recipient: Option<String>,
        text: String,
        seq: u64,
    },
    /// Reconnect catch-up: replay events after the given version to the
    /// requesting connection.
    ResumeSync {
        user_id: String,
        conn_id: u64,
        last_seen_version: u64,
        seq: u64,
    },
    /// Force a snapshot write.
    SnapshotRequest,
}

/// The live turn machine state, reset on every turn transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnState {
    pub current_unit_id: UnitId,
    pub movement_remaining: i32,
    pub has_acted: bool,
}

/// One session member as tracked by the actor.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    pub role: ParticipantRole,
    pub character_id: Option<String>,
    pub ready: bool,
    pub connected: bool,
    pub kicked: bool,
    pub joined_ms: u64,
    pub disconnected_at: Option<Instant>,
}

/// Membership changes held back until the running turn completes, so the
/// participant set and the initiative order stay stable within a turn.
enum BoundaryOp {
    RemoveParticipant { user_id: String, kicked: bool },
}

/// What a fired actor deadline means.
enum WakeKind {
    /// Turn deadline or disconnect grace expired: auto-end the turn.
    Turn,
    /// Nobody attached for the idle window: dispose the session.
    Idle,
}

pub struct SessionActor {
    session_id: String,
    invite_code: String,
    host_user_id: String,
    config: SessionConfig,
    server_config: Arc<ServerConfig>,
    store: Arc<dyn Store>,
    limiter: Arc<RateLimiter>,
    inbox: mpsc::Receiver<SessionMsg>,

    phase: SessionPhase,
    state_version: u64,
    game: Option<GameState>,
    turn: Option<TurnState>,
    participants: Vec<Participant>,
    pending_boundary: Vec<BoundaryOp>,
    /// Set when units were added or removed; initiative is recomputed at the
    /// next turn boundary.
    initiative_dirty: bool,

    chat_ring: VecDeque<ChatEntry>,
    event_log: VecDeque<(u64, ServerFrame)>,
    connections: HashMap<u64, ConnectionHandle>,

    turn_deadline: Option<Instant>,
    /// Wallclock mirror of the deadline for the wire.
    turn_deadline_ms: u64,
    /// Remaining turn time captured while paused.
    pause_remaining: Option<Duration>,
    grace_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,

    mutations_since_snapshot: u32,
    snapshot_failures: u32,
    monster_counter: u32,
    weapon_counter: u32,
    disposed: bool,
}

impl SessionActor {
    pub fn new(
        row: &SessionRow,
        server_config: Arc<ServerConfig>,
        store: Arc<dyn Store>,
        limiter: Arc<RateLimiter>,
        inbox: mpsc::Receiver<SessionMsg>,
    ) -> Self {
        let idle = Duration::from_secs(server_config.idle_session_seconds);
        SessionActor {
            session_id: row.session_id.clone(),
            invite_code: row.invite_code.clone(),
            host_user_id: row.host_user_id.clone(),
            config: row.config.clone(),
            server_config,
            store,
            limiter,
            inbox,
            phase: SessionPhase::Lobby,
            state_version: 0,
            game: None,
            turn: None,
            participants: Vec::new(),
            pending_boundary: Vec::new(),
            initiative_dirty: false,
            chat_ring: VecDeque::new(),
            event_log: VecDeque::new(),
            connections: HashMap::new(),
            turn_deadline: None,
            turn_deadline_ms: 0,
            pause_remaining: None,
            grace_deadline: None,
            idle_deadline: Some(Instant::now() + idle),
            mutations_since_snapshot: 0,
            snapshot_failures: 0,
            monster_counter: 0,
            weapon_counter: 0,
            disposed: false,
        }
    }

    /// Re-materializes an actor from its latest snapshot. Game sessions come
    /// back paused; a DM has to resume explicitly.
    pub fn restore(
        row: &SessionRow,
        record: SnapshotRecord,
        server_config: Arc<ServerConfig>,
        store: Arc<dyn Store>,
        limiter: Arc<RateLimiter>,
        inbox: mpsc::Receiver<SessionMsg>,
    ) -> Self {
        let mut actor = SessionActor::new(row, server_config, store, limiter, inbox);
        actor.apply_snapshot(record);
        actor
    }

    /// The actor loop. Strictly sequential: one message or one fired
    /// deadline at a time, processed to completion.
    pub async fn run(mut self) {
        tracing::info!(
            session_id = self.session_id,
            invite_code = self.invite_code,
            phase = ?self.phase,
            "session actor started"
        );
        if self.state_version == 0 {
            self.write_snapshot();
        }
        loop {
            let wake = self.next_wake();
            let wake_at = wake.as_ref().map(|(instant, _)| *instant);
            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
                _ = async {
                    match wake_at {
                        Some(instant) => tokio::time::sleep_until(instant).await,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Some((_, kind)) = wake {
                        self.handle_wake(kind);
                    }
                }
            }
            if self.disposed {
                break;
            }
        }
        tracing::info!(session_id = self.session_id, "session actor stopped");
    }

    /// The earliest armed deadline and what it means.
    fn next_wake(&self) -> Option<(Instant, WakeKind)> {
        let mut best: Option<(Instant, WakeKind)> = None;
        let mut consider = |instant: Option<Instant>, kind: WakeKind| {
            if let Some(instant) = instant
                && best.as_ref().is_none_or(|(current, _)| instant < *current)
            {
                best = Some((instant, kind));
            }
        };
        if self.phase == SessionPhase::Playing {
            consider(self.turn_deadline, WakeKind::Turn);
            consider(self.grace_deadline, WakeKind::Turn);
        }
        if self.connections.is_empty() {
            consider(self.idle_deadline, WakeKind::Idle);
        }
        best
    }

    fn handle_wake(&mut self, kind: WakeKind) {
        match kind {
            WakeKind::Turn => self.on_turn_deadline(),
            WakeKind::Idle => {
                tracing::info!(session_id = self.session_id, "idle window expired");
                self.end_session(SessionEndReason::Idle);
            }
        }
    }

    fn handle_message(&mut self, message: SessionMsg) {
        match message {
            SessionMsg::Attach {
                user,
                character_id,
                handle,
                reply,
            } => self.handle_attach(user, character_id, handle, reply),
            SessionMsg::Detach { conn_id, user_id } => self.handle_detach(conn_id, &user_id),
            SessionMsg::Leave { conn_id, user_id } => self.handle_leave(conn_id, &user_id),
            SessionMsg::Intent {
                user_id,
                action,
                seq,
            } => self.handle_intent(&user_id, action, seq),
            SessionMsg::Ready {
                user_id,
                ready,
                seq,
            } => self.handle_ready(&user_id, ready, seq),
            SessionMsg::Dm {
                user_id,
                command,
                seq,
            } => self.handle_dm_command(&user_id, command, seq),
            SessionMsg::Chat {
                user_id,
                kind,
                recipient,
                text,
                seq,
            } => self.handle_chat(&user_id, kind, recipient, text, seq),
            SessionMsg::ResumeSync {
                user_id,
                conn_id,
                last_seen_version,
                seq,
            } => self.handle_resume_sync(&user_id, conn_id, last_seen_version, seq),
            SessionMsg::SnapshotRequest => self.write_snapshot(),
        }
    }

    fn handle_attach(
        &mut self,
        user: UserView,
        character_id: Option<String>,
        handle: ConnectionHandle,
        reply: oneshot::Sender<Result<SessionInfo, ErrorCode>>,
    ) {
        if self.phase == SessionPhase::Ended {
            let _ = reply.send(Err(ErrorCode::AlreadyEnded));
            return;
        }

        let conn_id = handle.conn_id;
        let rejoining = self
            .participants
            .iter()
            .any(|p| p.user_id == user.user_id);
        if rejoining {
            let participant = self
                .participants
                .iter_mut()
                .find(|p| p.user_id == user.user_id)
                .expect("participant present");
            if participant.kicked {
                let _ = reply.send(Err(ErrorCode::Kicked));
                return;
            }
            if let Some(at) = participant.disconnected_at {
                let window = Duration::from_secs(self.server_config.reconnect_window_seconds);
                tracing::info!(
                    session_id = self.session_id,
                    user_id = user.user_id,
                    within_window = at.elapsed() <= window,
                    "participant rejoined"
                );
            }
            participant.connected = true;
            participant.disconnected_at = None;
            // The owner is back; their turn keeps its original deadline.
            if self.current_turn_user().as_deref() == Some(user.user_id.as_str()) {
                self.grace_deadline = None;
            }
        } else {
            let active = self.participants.iter().filter(|p| !p.kicked).count();
            if active >= self.config.max_players as usize {
                let _ = reply.send(Err(ErrorCode::SessionFull));
                return;
            }
            let role = if user.user_id == self.host_user_id {
                ParticipantRole::Dm
            } else {
                ParticipantRole::Player
            };
            let character_id = match self.resolve_character(&user, role, character_id) {
                Ok(id) => id,
                Err(code) => {
                    let _ = reply.send(Err(code));
                    return;
                }
            };
            let joined_ms = now_ms();
            if let Err(error) = self.store.put_participant(crate::store::ParticipantRow {
                session_id: self.session_id.clone(),
                user_id: user.user_id.clone(),
                is_dm: role == ParticipantRole::Dm,
                character_id: character_id.clone(),
                joined_ms,
            }) {
                tracing::error!(session_id = self.session_id, %error, "participant write failed");
            }
            self.participants.push(Participant {
                user_id: user.user_id.clone(),
                display_name: user.display_name.clone(),
                role,
                character_id,
                ready: false,
                connected: true,
                kicked: false,
                joined_ms,
                disconnected_at: None,
            });
        }

        self.idle_deadline = None;
        self.connections.insert(conn_id, handle);
        let _ = reply.send(Ok(self.session_info()));

        if let Some(game) = self.game.clone() {
            self.send_to_conn(
                conn_id,
                ServerFrame::FullStateSync {
                    state: game,
                    state_version: self.state_version,
                },
            );
            if self.phase == SessionPhase::Playing
                && let Some(frame) = self.turn_change_frame()
            {
                self.send_to_conn(conn_id, frame);
            }
        }
        let frame = self.participant_update_frame();
        self.broadcast(frame);
        self.maybe_snapshot();
    }

    /// Maps a join request onto a character id: the DM attaches without one,
    /// players get their named character validated or a fresh default one
    /// provisioned.
    fn resolve_character(
        &mut self,
        user: &UserView,
        role: ParticipantRole,
        character_id: Option<String>,
    ) -> Result<Option<String>, ErrorCode> {
        if role == ParticipantRole::Dm {
            return Ok(None);
        }
        match character_id {
            Some(id) => match self.store.get_character(&id) {
                Ok(row) if row.owner_user_id == user.user_id => Ok(Some(id)),
                Ok(_) | Err(_) => Err(ErrorCode::CharacterNotFound),
            },
            None => {
                let row = self
                    .store
                    .create_character(
                        &user.user_id,
                        "adventurer",
                        "",
                        crate::store::CharacterStats::default(),
                    )
                    .map_err(|error| {
                        tracing::error!(session_id = self.session_id, %error, "character provisioning failed");
                        ErrorCode::CharacterNotFound
                    })?;
                Ok(Some(row.character_id))
            }
        }
    }

    fn handle_detach(&mut self, conn_id: u64, user_id: &str) {
        if self.connections.remove(&conn_id).is_none() {
            return;
        }
        self.note_connection_gone(user_id);
    }

    /// Shared bookkeeping after a connection disappeared, whether through a
    /// detach message or a slow-consumer drop.
    fn note_connection_gone(&mut self, user_id: &str) {
        let has_other = self
            .connections
            .values()
            .any(|handle| handle.user_id == user_id);
        if !has_other
            && let Some(participant) = self
                .participants
                .iter_mut()
                .find(|p| p.user_id == user_id && p.connected)
        {
            participant.connected = false;
            participant.disconnected_at = Some(Instant::now());
            tracing::info!(
                session_id = self.session_id,
                user_id,
                "participant disconnected"
            );
            // Losing the acting player arms the grace timer; the turn is
            // only skipped once it expires.
            if self.phase == SessionPhase::Playing
                && self.current_turn_user().as_deref() == Some(user_id)
            {
                let grace = Duration::from_secs(self.server_config.disconnect_grace_seconds);
                self.grace_deadline = Some(Instant::now() + grace);
            }
            let frame = self.participant_update_frame();
            self.broadcast(frame);
        }
        if self.connections.is_empty() {
            if self.phase == SessionPhase::Ended {
                self.dispose();
            } else {
                let idle = Duration::from_secs(self.server_config.idle_session_seconds);
                self.idle_deadline = Some(Instant::now() + idle);
            }
        }
    }

    fn handle_leave(&mut self, conn_id: u64, user_id: &str) {
        self.connections.remove(&conn_id);
        let Some(index) = self.participants.iter().position(|p| p.user_id == user_id) else {
            return;
        };
        if self.phase == SessionPhase::Playing {
            // Membership is frozen while a turn runs; queue for the boundary.
            self.participants[index].connected = false;
            self.pending_boundary.push(BoundaryOp::RemoveParticipant {
                user_id: user_id.to_string(),
                kicked: false,
            });
            if self.current_turn_user().as_deref() == Some(user_id) {
                let grace = Duration::from_secs(self.server_config.disconnect_grace_seconds);
                self.grace_deadline = Some(Instant::now() + grace);
            }
        } else {
            self.remove_participant_now(user_id);
        }
        let frame = self.participant_update_frame();
        self.broadcast(frame);
        self.note_connection_gone(user_id);
    }

    /// Immediate removal of a participant and their units. Outside `playing`
    /// this is safe to do inline; during a game it only runs at boundaries.
    fn remove_participant_now(&mut self, user_id: &str) {
        self.participants.retain(|p| p.user_id != user_id);
        if let Err(error) = self.store.remove_participant(&self.session_id, user_id) {
            tracing::error!(session_id = self.session_id, %error, "participant removal failed");
        }
        if let Some(game) = self.game.as_mut() {
            let owned: Vec<UnitId> = game
                .units
                .iter()
                .filter(|u| u.owner_user_id.as_deref() == Some(user_id))
                .map(|u| u.id.clone())
                .collect();
            for unit_id in owned {
                game.remove_unit(&unit_id);
                self.initiative_dirty = true;
            }
        }
    }

    fn handle_ready(&mut self, user_id: &str, ready: bool, seq: u64) {
        if self.phase != SessionPhase::Lobby {
            self.send_error(
                user_id,
                ErrorCode::InvalidAction,
                "readiness only applies in the lobby",
                None,
                Some(seq),
            );
            return;
        }
        let Some(participant) = self
            .participants
            .iter_mut()
            .find(|p| p.user_id == user_id)
        else {
            self.send_error(
                user_id,
                ErrorCode::NotInSession,
                "not a session participant",
                None,
                Some(seq),
            );
            return;
        };
        participant.ready = ready;
        let frame = self.participant_update_frame();
        self.broadcast(frame);
    }

    fn handle_chat(
        &mut self,
        user_id: &str,
        kind: ChatKind,
        recipient: Option<String>,
        text: String,
        seq: u64,
    ) {
        if self.phase == SessionPhase::Ended {
            self.send_error(
                user_id,
                ErrorCode::AlreadyEnded,
                "session has ended",
                None,
                Some(seq),
            );
            return;
        }
        let decision = self.limiter.check(user_id, Bucket::Chat);
        if !decision.allowed {
            self.send_error(
                user_id,
                ErrorCode::RateLimited,
                "chat rate limit exceeded",
                Some(decision.retry_after_ms),
                Some(seq),
            );
            return;
        }
        if !self.participants.iter().any(|p| p.user_id == user_id) {
            self.send_error(
                user_id,
                ErrorCode::NotInSession,
                "not a session participant",
                None,
                Some(seq),
            );
            return;
        }
        // Clients only originate broadcasts and whispers; the other kinds
        // are server-generated.
        let valid = match kind {
            ChatKind::Broadcast => recipient.is_none(),
            ChatKind::Whisper => {
                recipient
                    .as_deref()
                    .is_some_and(|r| self.participants.iter().any(|p| p.user_id == r))
            }
            ChatKind::DmAnnounce | ChatKind::System => false,
        };
        if !valid {
            self.send_error(
                user_id,
                ErrorCode::InvalidAction,
                "invalid chat kind or recipient",
                None,
                Some(seq),
            );
            return;
        }
        let text = protocol::sanitize_text(&text);
        if text.is_empty() {
            self.send_error(
                user_id,
                ErrorCode::InvalidAction,
                "empty chat message",
                None,
                Some(seq),
            );
            return;
        }
        let entry = ChatEntry {
            author: Some(user_id.to_string()),
            kind,
            recipient: recipient.clone(),
            text,
            ts: now_ms(),
        };
        self.push_chat(entry.clone());
        let frame = ServerFrame::Chat { entry };
        match kind {
            ChatKind::Whisper => {
                let author = user_id.to_string();
                let target = recipient.unwrap_or_default();
                self.broadcast_filtered(frame, |handle| {
                    handle.user_id == author || handle.user_id == target
                });
            }
            _ => self.broadcast(frame),
        }
    }

    pub(super) fn push_chat(&mut self, entry: ChatEntry) {
        self.chat_ring.push_back(entry);
        while self.chat_ring.len() > CHAT_RING_LEN {
            self.chat_ring.pop_front();
        }
    }

    fn handle_resume_sync(
        &mut self,
        user_id: &str,
        conn_id: u64,
        last_seen_version: u64,
        seq: u64,
    ) {
        if !self.participants.iter().any(|p| p.user_id == user_id) {
            self.send_error(
                user_id,
                ErrorCode::NotInSession,
                "not a session participant",
                None,
                Some(seq),
            );
            return;
        }
        let replay: Vec<ServerFrame> = self
            .event_log
            .iter()
            .filter(|(version, _)| *version > last_seen_version)
            .map(|(_, frame)| frame.clone())
            .collect();
        tracing::debug!(
            session_id = self.session_id,
            user_id,
            last_seen_version,
            replayed = replay.len(),
            "resume sync"
        );
        for frame in replay {
            self.send_to_conn(conn_id, frame);
        }
        if self.phase == SessionPhase::Playing
            && let Some(frame) = self.turn_change_frame()
        {
            self.send_to_conn(conn_id, frame);
        }
    }

    /// Enqueues a frame to one specific connection.
    fn send_to_conn(&mut self, conn_id: u64, frame: ServerFrame) {
        let Some(handle) = self.connections.get(&conn_id) else {
            return;
        };
        if !handle.enqueue(frame) {
            let handle = self
                .connections
                .remove(&conn_id)
                .expect("connection present");
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

    /// Accepted mutation: the version strictly increases, and the snapshot
    /// cadence counter follows.
    pub(super) fn bump_version(&mut self) {
        self.state_version += 1;
        self.mutations_since_snapshot += 1;
    }

    pub(super) fn session_info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            invite_code: self.invite_code.clone(),
            host_user_id: self.host_user_id.clone(),
            config: self.config.clone(),
            phase: self.phase,
            state_version: self.state_version,
        }
    }

    pub(super) fn participant_update_frame(&self) -> ServerFrame {
        ServerFrame::ParticipantUpdate {
            participants: self
                .participants
                .iter()
                .filter(|p| !p.kicked)
                .map(|p| ParticipantInfo {
                    user_id: p.user_id.clone(),
                    display_name: p.display_name.clone(),
                    role: p.role,
                    character_id: p.character_id.clone(),
                    ready: p.ready,
                    connected: p.connected,
                })
                .collect(),
        }
    }

    /// The user commanding the current-turn unit: the owner for player
    /// units, the host for monsters.
    pub(super) fn current_turn_user(&self) -> Option<String> {
        let turn = self.turn.as_ref()?;
        let game = self.game.as_ref()?;
        let unit = game.unit(&turn.current_unit_id)?;
        match unit.owner_kind {
            simulation::OwnerKind::Player => unit.owner_user_id.clone(),
            simulation::OwnerKind::Monster => Some(self.host_user_id.clone()),
        }
    }

    pub(super) fn turn_change_frame(&self) -> Option<ServerFrame> {
        let turn = self.turn.as_ref()?;
        Some(ServerFrame::TurnChange {
            current_unit: turn.current_unit_id.clone(),
            user_id: self.current_turn_user(),
            deadline_ms: self.turn_deadline_ms,
        })
    }

    /// Milliseconds left on the turn deadline, honoring a frozen timer.
    pub(super) fn deadline_remaining_ms(&self) -> u64 {
        if let Some(remaining) = self.pause_remaining {
            return remaining.as_millis() as u64;
        }
        self.turn_deadline
            .map(|d| d.saturating_duration_since(Instant::now()).as_millis() as u64)
            .unwrap_or(0)
    }

    /// Freezes the session. The turn timer stops and the remaining time is
    /// captured so a resume can re-base the deadline.
    pub(super) fn pause(&mut self, reason: PauseReason) {
        if self.phase != SessionPhase::Playing {
            return;
        }
        self.phase = SessionPhase::Paused;
        self.pause_remaining = self
            .turn_deadline
            .map(|d| d.saturating_duration_since(Instant::now()));
        self.turn_deadline = None;
        self.grace_deadline = None;
        self.bump_version();
        if let Err(error) =
            self.store
                .update_session_phase(&self.session_id, SessionPhase::Paused, None)
        {
            tracing::error!(session_id = self.session_id, %error, "phase persistence failed");
        }
        tracing::info!(session_id = self.session_id, ?reason, "session paused");
        let frame = ServerFrame::SessionPaused { reason };
        self.log_event(frame.clone());
        self.broadcast(frame);
        self.write_snapshot();
    }

    /// Unfreezes the session and re-bases the turn deadline by the captured
    /// remaining time.
    pub(super) fn resume(&mut self) {
        if self.phase != SessionPhase::Paused {
            return;
        }
        self.phase = SessionPhase::Playing;
        if let Some(remaining) = self.pause_remaining.take() {
            self.turn_deadline = Some(Instant::now() + remaining);
            self.turn_deadline_ms = now_ms() + remaining.as_millis() as u64;
        }
        self.bump_version();
        if let Err(error) =
            self.store
                .update_session_phase(&self.session_id, SessionPhase::Playing, None)
        {
            tracing::error!(session_id = self.session_id, %error, "phase persistence failed");
        }
        tracing::info!(session_id = self.session_id, "session resumed");
        let frame = ServerFrame::SessionResumed {};
        self.log_event(frame.clone());
        self.broadcast(frame);
        if let Some(frame) = self.turn_change_frame() {
            self.broadcast(frame);
        }
        self.write_snapshot();
    }

    /// Terminal transition. The actor disposes once the last connection is
    /// gone.
    pub(super) fn end_session(&mut self, reason: SessionEndReason) {
        if self.phase == SessionPhase::Ended {
            return;
        }
        self.phase = SessionPhase::Ended;
        self.turn_deadline = None;
        self.grace_deadline = None;
        self.pause_remaining = None;
        self.bump_version();
        if let Err(error) = self.store.update_session_phase(
            &self.session_id,
            SessionPhase::Ended,
            Some(now_ms()),
        ) {
            tracing::error!(session_id = self.session_id, %error, "phase persistence failed");
        }
        tracing::info!(session_id = self.session_id, ?reason, "session ended");
        self.write_snapshot();
        let frame = ServerFrame::SessionEnded { reason };
        self.log_event(frame.clone());
        self.broadcast(frame);
        for handle in self.connections.values() {
            handle.shutdown();
        }
        self.connections.clear();
        self.dispose();
    }

    fn dispose(&mut self) {
        self.disposed = true;
    }

    /// Marks an invariant breach as fatal for the session: freeze, log the
    /// state hash, never recover automatically.
    pub(super) fn sim_violation(&mut self, detail: &str) {
        let hash = self
            .game
            .as_ref()
            .map(simulation::state_hash)
            .unwrap_or_default();
        tracing::error!(
            session_id = self.session_id,
            state_version = self.state_version,
            state_hash = format!("{hash:016x}"),
            detail,
            "simulation invariant violation"
        );
        self.pause(PauseReason::InternalError);
    }
}
