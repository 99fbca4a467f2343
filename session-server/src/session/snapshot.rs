//! Snapshot persistence and restore. The snapshot is the complete recovery
//! record of one session: everything the actor needs to come back after a
//! process restart lives in here.

use super::{Participant, SessionActor, TurnState};
use crate::store::SnapshotRow;
use crate::time::now_ms;
use protocol::{ChatEntry, ParticipantRole, PauseReason, SessionConfig, SessionPhase};
use serde::{Deserialize, Serialize};
use simulation::{GameState, UnitId};
use std::time::Duration;

/// Consecutive snapshot failures after which the session is force-paused.
const MAX_SNAPSHOT_FAILURES: u32 = 3;

/// Budget for one snapshot write before a slow-persistence warning.
const SNAPSHOT_BUDGET: Duration = Duration::from_millis(500);

/// Serialized form of the turn machine inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub current_unit_id: UnitId,
    pub movement_remaining: i32,
    pub has_acted: bool,
    /// Time that was left on the deadline when the snapshot was taken.
    pub remaining_ms: u64,
}

/// Serialized form of one participant inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub user_id: String,
    pub display_name: String,
    pub role: ParticipantRole,
    pub character_id: Option<String>,
    pub ready: bool,
    pub kicked: bool,
    pub joined_ms: u64,
}

/// The versioned recovery record persisted through the store gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub phase: SessionPhase,
    pub config: SessionConfig,
    pub state_version: u64,
    pub game: Option<GameState>,
    pub turn: Option<TurnRecord>,
    pub participants: Vec<ParticipantRecord>,
    pub chat: Vec<ChatEntry>,
    pub monster_counter: u32,
    pub weapon_counter: u32,
}

impl SessionActor {
    /// Builds the recovery record from the live state.
    pub(super) fn snapshot_record(&self) -> SnapshotRecord {
        let turn = self.turn.as_ref().map(|turn| TurnRecord {
            current_unit_id: turn.current_unit_id.clone(),
            movement_remaining: turn.movement_remaining,
            has_acted: turn.has_acted,
            remaining_ms: self.deadline_remaining_ms(),
        });
        SnapshotRecord {
            phase: self.phase,
            config: self.config.clone(),
            state_version: self.state_version,
            game: self.game.clone(),
            turn,
            participants: self
                .participants
                .iter()
                .map(|p| ParticipantRecord {
                    user_id: p.user_id.clone(),
                    display_name: p.display_name.clone(),
                    role: p.role,
                    character_id: p.character_id.clone(),
                    ready: p.ready,
                    kicked: p.kicked,
                    joined_ms: p.joined_ms,
                })
                .collect(),
            chat: self.chat_ring.iter().cloned().collect(),
            monster_counter: self.monster_counter,
            weapon_counter: self.weapon_counter,
        }
    }

    /// Persists the current state. Failures are tolerated up to a limit, then
    /// the session is frozen rather than silently running without recovery.
    pub(super) fn write_snapshot(&mut self) {
        let record = self.snapshot_record();
        let started = std::time::Instant::now();
        let result = serde_json::to_vec(&record)
            .map_err(|e| e.to_string())
            .and_then(|data| {
                self.store
                    .put_snapshot(SnapshotRow {
                        session_id: self.session_id.clone(),
                        state_version: self.state_version,
                        data,
                        ts_ms: now_ms(),
                    })
                    .map_err(|e| e.to_string())
            });
        match result {
            Ok(()) => {
                self.mutations_since_snapshot = 0;
                self.snapshot_failures = 0;
                let elapsed = started.elapsed();
                if elapsed > SNAPSHOT_BUDGET {
                    tracing::warn!(
                        session_id = self.session_id,
                        state_version = self.state_version,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "slow snapshot write"
                    );
                }
            }
            Err(error) => {
                self.snapshot_failures += 1;
                tracing::error!(
                    session_id = self.session_id,
                    state_version = self.state_version,
                    failures = self.snapshot_failures,
                    error,
                    "snapshot write failed"
                );
                if self.snapshot_failures >= MAX_SNAPSHOT_FAILURES
                    && self.phase == SessionPhase::Playing
                {
                    self.pause(PauseReason::PersistenceFailure);
                }
            }
        }
    }

    /// Writes a snapshot when the mutation cadence asks for one.
    pub(super) fn maybe_snapshot(&mut self) {
        if self.mutations_since_snapshot >= self.server_config.snapshot_every_mutations {
            self.write_snapshot();
        }
    }

    /// Rebuilds the volatile actor state from a recovery record. Sessions
    /// that were mid-game come back paused until a DM resumes them.
    pub(super) fn apply_snapshot(&mut self, record: SnapshotRecord) {
        self.config = record.config;
        self.state_version = record.state_version;
        self.game = record.game;
        self.monster_counter = record.monster_counter;
        self.weapon_counter = record.weapon_counter;
        self.chat_ring = record.chat.into_iter().collect();
        self.participants = record
            .participants
            .into_iter()
            .map(|p| Participant {
                user_id: p.user_id,
                display_name: p.display_name,
                role: p.role,
                character_id: p.character_id,
                ready: p.ready,
                kicked: p.kicked,
                joined_ms: p.joined_ms,
                connected: false,
                disconnected_at: None,
            })
            .collect();
        self.turn = record.turn.as_ref().map(|t| TurnState {
            current_unit_id: t.current_unit_id.clone(),
            movement_remaining: t.movement_remaining,
            has_acted: t.has_acted,
        });
        match record.phase {
            SessionPhase::Playing | SessionPhase::Paused => {
                self.phase = SessionPhase::Paused;
                self.pause_remaining = record
                    .turn
                    .map(|t| Duration::from_millis(t.remaining_ms.max(1)));
            }
            phase => self.phase = phase,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_record_round_trips() {
        let record = SnapshotRecord {
            phase: SessionPhase::Playing,
            config: SessionConfig {
                max_players: 4,
                turn_deadline_seconds: 30,
                difficulty: protocol::Difficulty::Hard,
            },
            state_version: 17,
            game: Some(GameState::new_game(simulation::GameMap::standard(), vec![])),
            turn: None,
            participants: vec![ParticipantRecord {
                user_id: "u1".into(),
                display_name: "Alice".into(),
                role: ParticipantRole::Dm,
                character_id: None,
                ready: false,
                kicked: false,
                joined_ms: 12,
            }],
            chat: vec![],
            monster_counter: 3,
            weapon_counter: 1,
        };
        let data = serde_json::to_vec(&record).expect("serialize");
        let decoded: SnapshotRecord = serde_json::from_slice(&data).expect("deserialize");
        assert_eq!(decoded, record);
    }
}
