//! The tagged frame unions for both directions plus the DM command set and
//! the event vocabulary carried by `state_update` frames.

use crate::types::{
    ChatEntry, ChatKind, Difficulty, ErrorCode, ParticipantInfo, PauseReason, SessionConfig,
    SessionEndReason, SessionInfo, UserView,
};
use serde::{Deserialize, Serialize};
use simulation::{Action, GameState, Position, SimEvent, UnitId};

/// Frames a client may send. The first frame on a connection must be
/// [`ClientFrame::Auth`].
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth { token: String },
    Ping {},
    Pong {},
    CreateSession { config: SessionConfig },
    JoinSession {
        invite_code: String,
        character_id: Option<String>,
    },
    LeaveSession {},
    Ready { ready: bool },
    Intent { action: Action },
    DmCommand(DmCommand),
    Chat {
        kind: ChatKind,
        recipient: Option<String>,
        text: String,
    },
    ResumeSync { last_seen_version: u64 },
}

/// The privileged command set, gated on the DM role by the session actor.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DmCommand {
    StartGame,
    PauseGame,
    ResumeGame,
    EndGame,
    SkipTurn,
    KickPlayer { user_id: String },
    GrantGold { user_id: String, amount: i64 },
    GrantXp { user_id: String, amount: i64 },
    GrantWeapon { user_id: String, weapon_id: String },
    SpawnMonster {
        position: Position,
        monster_type: String,
    },
    RemoveMonster { unit_id: UnitId },
    ModifyMonster {
        unit_id: UnitId,
        stat_deltas: StatDeltas,
    },
    Announce { text: String },
    ModifyConfig {
        turn_deadline_seconds: Option<u64>,
        max_players: Option<u8>,
        difficulty: Option<Difficulty>,
    },
}

/// Additive stat changes for `modify_monster`. Omitted fields stay as-is.
#[derive(PartialEq, Eq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatDeltas {
    pub hp: Option<i32>,
    pub max_hp: Option<i32>,
    pub attack: Option<i32>,
    pub defense: Option<i32>,
    pub initiative: Option<i32>,
    pub move_range: Option<i32>,
    pub attack_range: Option<i32>,
}

/// Frames the server sends.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Ping {},
    Pong {},
    Hello {
        user: UserView,
        capabilities: Vec<String>,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_seq: Option<u64>,
    },
    SessionCreated {
        session: SessionInfo,
        invite_code: String,
    },
    SessionJoined { session: SessionInfo },
    ParticipantUpdate {
        participants: Vec<ParticipantInfo>,
    },
    FullStateSync {
        state: GameState,
        state_version: u64,
    },
    StateUpdate {
        version: u64,
        events: Vec<GameEvent>,
    },
    TurnChange {
        current_unit: UnitId,
        user_id: Option<String>,
        /// Absolute wallclock deadline in unix milliseconds.
        deadline_ms: u64,
    },
    TurnTimeout {
        user_id: Option<String>,
        unit_id: UnitId,
    },
    Chat { entry: ChatEntry },
    DmEvent(DmEvent),
    SessionPaused { reason: PauseReason },
    SessionResumed {},
    SessionEnded { reason: SessionEndReason },
}

/// Why a turn ended, carried in [`GameEvent::TurnEnded`].
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnEndReason {
    Requested,
    Timeout,
    DmSkip,
    UnitDied,
    OwnerLeft,
}

/// Events inside `state_update` frames: the simulation events verbatim plus
/// the turn machine transitions the runtime itself generates.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GameEvent {
    UnitMoved {
        unit_id: UnitId,
        from: Position,
        to: Position,
        cost: i32,
    },
    UnitAttacked {
        attacker: UnitId,
        target: UnitId,
        damage: i32,
        remaining_hp: i32,
    },
    UnitDied { unit_id: UnitId },
    TurnEnded {
        unit_id: UnitId,
        reason: TurnEndReason,
    },
    GameStarted { round: u32 },
    RoundStarted { round: u32 },
}

impl From<SimEvent> for GameEvent {
    fn from(event: SimEvent) -> Self {
        match event {
            SimEvent::UnitMoved {
                unit_id,
                from,
                to,
                cost,
            } => GameEvent::UnitMoved {
                unit_id,
                from,
                to,
                cost,
            },
            SimEvent::UnitAttacked {
                attacker,
                target,
                damage,
                remaining_hp,
            } => GameEvent::UnitAttacked {
                attacker,
                target,
                damage,
                remaining_hp,
            },
            SimEvent::UnitDied { unit_id } => GameEvent::UnitDied { unit_id },
            SimEvent::TurnPassed { unit_id } => GameEvent::TurnEnded {
                unit_id,
                reason: TurnEndReason::Requested,
            },
        }
    }
}

/// Broadcast notifications about executed DM commands.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DmEvent {
    GoldGranted {
        user_id: String,
        amount: i64,
        total_gold: i64,
    },
    XpGranted {
        user_id: String,
        amount: i64,
        xp: i64,
        level: u32,
    },
    WeaponGranted {
        user_id: String,
        weapon_id: String,
        instance_id: String,
    },
    MonsterSpawned {
        unit_id: UnitId,
        monster_type: String,
        position: Position,
    },
    MonsterRemoved { unit_id: UnitId },
    MonsterModified { unit_id: UnitId },
    TurnSkipped { unit_id: UnitId },
    PlayerKicked { user_id: String },
    ConfigChanged { config: SessionConfig },
}
