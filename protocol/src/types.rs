//! Shared data shapes that appear inside frames: session descriptors,
//! participants, chat entries and the stable error code set.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The stable error vocabulary. Serialized in SCREAMING_SNAKE_CASE, also
/// used verbatim as the close reason when a connection gets dropped.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Protocol,
    AuthTimeout,
    AuthFailed,
    Forbidden,
    RateLimited,
    NotYourTurn,
    InvalidAction,
    SessionNotFound,
    SessionFull,
    AlreadyEnded,
    SlowConsumer,
    IdleTimeout,
    ServerBusy,
    InternalSimViolation,
    Kicked,
    NotInSession,
    AlreadyInSession,
    CharacterNotFound,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Protocol => "PROTOCOL",
            ErrorCode::AuthTimeout => "AUTH_TIMEOUT",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::NotYourTurn => "NOT_YOUR_TURN",
            ErrorCode::InvalidAction => "INVALID_ACTION",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::SessionFull => "SESSION_FULL",
            ErrorCode::AlreadyEnded => "ALREADY_ENDED",
            ErrorCode::SlowConsumer => "SLOW_CONSUMER",
            ErrorCode::IdleTimeout => "IDLE_TIMEOUT",
            ErrorCode::ServerBusy => "SERVER_BUSY",
            ErrorCode::InternalSimViolation => "INTERNAL_SIM_VIOLATION",
            ErrorCode::Kicked => "KICKED",
            ErrorCode::NotInSession => "NOT_IN_SESSION",
            ErrorCode::AlreadyInSession => "ALREADY_IN_SESSION",
            ErrorCode::CharacterNotFound => "CHARACTER_NOT_FOUND",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Game difficulty, interpreted by the simulation content, not the runtime.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Normal,
    Hard,
}

/// Session configuration as chosen by the host at creation time.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Including the DM. Must be within 2..=8.
    pub max_players: u8,
    pub turn_deadline_seconds: u64,
    pub difficulty: Difficulty,
}

impl SessionConfig {
    pub const MIN_PLAYERS: u8 = 2;
    pub const MAX_PLAYERS: u8 = 8;

    pub fn validate(&self) -> bool {
        (Self::MIN_PLAYERS..=Self::MAX_PLAYERS).contains(&self.max_players)
            && self.turn_deadline_seconds > 0
    }
}

/// Session lifecycle phase.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Lobby,
    Playing,
    Paused,
    Ended,
}

/// Role of a participant inside a session.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Dm,
    Player,
}

/// One participant as shown to all session members.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: String,
    pub display_name: String,
    pub role: ParticipantRole,
    pub character_id: Option<String>,
    pub ready: bool,
    pub connected: bool,
}

/// The session descriptor sent on create/join.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub invite_code: String,
    pub host_user_id: String,
    pub config: SessionConfig,
    pub phase: SessionPhase,
    pub state_version: u64,
}

/// Kind of a chat entry.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Broadcast,
    Whisper,
    DmAnnounce,
    System,
}

/// One entry of the bounded per-session chat ring.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct ChatEntry {
    /// `None` for server-generated system messages.
    pub author: Option<String>,
    pub kind: ChatKind,
    /// Only set for whispers.
    pub recipient: Option<String>,
    pub text: String,
    pub ts: u64,
}

/// Why a session was paused.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    DmPause,
    InternalError,
    PersistenceFailure,
    ServerRestart,
    NoUnitsLeft,
}

/// Why a session ended.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    DmEnd,
    Idle,
}

/// The authenticated user as echoed in `hello`.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct UserView {
    pub user_id: String,
    pub display_name: String,
}
