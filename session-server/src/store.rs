//! The store gateway: typed, transactional operations on the persistent
//! rows the runtime needs. No business logic lives here; the engine behind
//! the [`Store`] trait is opaque to the rest of the server. The in-memory
//! implementation backs local runs and tests.

use crate::time::now_ms;
use protocol::{SessionConfig, SessionPhase};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// A registered user, created at the first successful identity handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRow {
    pub user_id: String,
    pub display_name: String,
    pub created_ms: u64,
}

/// Base combat stats of a character, copied onto its unit when a game starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterStats {
    pub hp: i32,
    pub attack: i32,
    pub defense: i32,
    pub initiative: i32,
    pub move_range: i32,
    pub attack_range: i32,
}

impl Default for CharacterStats {
    fn default() -> Self {
        CharacterStats {
            hp: 10,
            attack: 3,
            defense: 1,
            initiative: 5,
            move_range: 4,
            attack_range: 1,
        }
    }
}

/// A character owned by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterRow {
    pub character_id: String,
    pub owner_user_id: String,
    pub class_tag: String,
    pub appearance: String,
    pub base_stats: CharacterStats,
    pub xp: i64,
    pub level: u32,
    pub created_ms: u64,
    pub updated_ms: u64,
}

/// A session row as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: String,
    pub invite_code: String,
    pub host_user_id: String,
    pub config: SessionConfig,
    pub phase: SessionPhase,
    pub created_ms: u64,
    pub ended_ms: Option<u64>,
}

/// A participant row as persisted, keyed by (session, user).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRow {
    pub session_id: String,
    pub user_id: String,
    pub is_dm: bool,
    pub character_id: Option<String>,
    pub joined_ms: u64,
}

/// A snapshot blob keyed by (session, state_version).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub session_id: String,
    pub state_version: u64,
    pub data: Vec<u8>,
    pub ts_ms: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("user {0} not found")]
    UserNotFound(String),
    #[error("character {0} not found")]
    CharacterNotFound(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
}

/// The typed operations the runtime performs. Implementations must be safe
/// for concurrent use; every call is one transaction.
pub trait Store: Send + Sync {
    /// Returns the user row, creating it on first contact.
    fn ensure_user(&self, user_id: &str, display_name: &str) -> Result<UserRow, StoreError>;
    fn get_user(&self, user_id: &str) -> Result<UserRow, StoreError>;

    fn create_character(
        &self,
        owner_user_id: &str,
        class_tag: &str,
        appearance: &str,
        base_stats: CharacterStats,
    ) -> Result<CharacterRow, StoreError>;
    fn get_character(&self, character_id: &str) -> Result<CharacterRow, StoreError>;
    /// Overwrites xp and level of a character.
    fn update_character_progress(
        &self,
        character_id: &str,
        xp: i64,
        level: u32,
    ) -> Result<CharacterRow, StoreError>;

    fn put_session(&self, row: SessionRow) -> Result<(), StoreError>;
    fn get_session(&self, session_id: &str) -> Result<SessionRow, StoreError>;
    fn update_session_phase(
        &self,
        session_id: &str,
        phase: SessionPhase,
        ended_ms: Option<u64>,
    ) -> Result<(), StoreError>;
    /// All sessions that have not ended, used for boot recovery and invite
    /// code uniqueness.
    fn list_active_sessions(&self) -> Result<Vec<SessionRow>, StoreError>;
    fn invite_code_in_use(&self, code: &str) -> Result<bool, StoreError>;

    fn put_participant(&self, row: ParticipantRow) -> Result<(), StoreError>;
    fn remove_participant(&self, session_id: &str, user_id: &str) -> Result<(), StoreError>;
    fn list_participants(&self, session_id: &str) -> Result<Vec<ParticipantRow>, StoreError>;

    fn put_snapshot(&self, row: SnapshotRow) -> Result<(), StoreError>;
    fn get_latest_snapshot(&self, session_id: &str) -> Result<Option<SnapshotRow>, StoreError>;
}

/// How many snapshots we retain per session; only the latest is ever read.
const SNAPSHOT_KEEP: usize = 8;

#[derive(Default)]
struct MemInner {
    users: HashMap<String, UserRow>,
    characters: HashMap<String, CharacterRow>,
    sessions: HashMap<String, SessionRow>,
    participants: HashMap<(String, String), ParticipantRow>,
    snapshots: HashMap<String, Vec<SnapshotRow>>,
    next_character: u64,
}

/// In-memory store behind a single mutex. Every trait method takes the lock
/// once, which is what makes each call transactional.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }
}

impl Store for MemStore {
    fn ensure_user(&self, user_id: &str, display_name: &str) -> Result<UserRow, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| UserRow {
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                created_ms: now_ms(),
            });
        Ok(row.clone())
    }

    fn get_user(&self, user_id: &str) -> Result<UserRow, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))
    }

    fn create_character(
        &self,
        owner_user_id: &str,
        class_tag: &str,
        appearance: &str,
        base_stats: CharacterStats,
    ) -> Result<CharacterRow, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.users.contains_key(owner_user_id) {
            return Err(StoreError::UserNotFound(owner_user_id.to_string()));
        }
        inner.next_character += 1;
        let now = now_ms();
        let row = CharacterRow {
            character_id: format!("char-{:04}", inner.next_character),
            owner_user_id: owner_user_id.to_string(),
            class_tag: class_tag.to_string(),
            appearance: appearance.to_string(),
            base_stats,
            xp: 0,
            level: 1,
            created_ms: now,
            updated_ms: now,
        };
        inner.characters.insert(row.character_id.clone(), row.clone());
        Ok(row)
    }

    fn get_character(&self, character_id: &str) -> Result<CharacterRow, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .characters
            .get(character_id)
            .cloned()
            .ok_or_else(|| StoreError::CharacterNotFound(character_id.to_string()))
    }

    fn update_character_progress(
        &self,
        character_id: &str,
        xp: i64,
        level: u32,
    ) -> Result<CharacterRow, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .characters
            .get_mut(character_id)
            .ok_or_else(|| StoreError::CharacterNotFound(character_id.to_string()))?;
        row.xp = xp;
        row.level = level;
        row.updated_ms = now_ms();
        Ok(row.clone())
    }

    fn put_session(&self, row: SessionRow) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.insert(row.session_id.clone(), row);
        Ok(())
    }

    fn get_session(&self, session_id: &str) -> Result<SessionRow, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    fn update_session_phase(
        &self,
        session_id: &str,
        phase: SessionPhase,
        ended_ms: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        row.phase = phase;
        if ended_ms.is_some() {
            row.ended_ms = ended_ms;
        }
        Ok(())
    }

    fn list_active_sessions(&self) -> Result<Vec<SessionRow>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.phase != SessionPhase::Ended)
            .cloned()
            .collect())
    }

    fn invite_code_in_use(&self, code: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sessions
            .values()
            .any(|s| s.phase != SessionPhase::Ended && s.invite_code == code))
    }

    fn put_participant(&self, row: ParticipantRow) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .participants
            .insert((row.session_id.clone(), row.user_id.clone()), row);
        Ok(())
    }

    fn remove_participant(&self, session_id: &str, user_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .participants
            .remove(&(session_id.to_string(), user_id.to_string()));
        Ok(())
    }

    fn list_participants(&self, session_id: &str) -> Result<Vec<ParticipantRow>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<ParticipantRow> = inner
            .participants
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.joined_ms);
        Ok(rows)
    }

    fn put_snapshot(&self, row: SnapshotRow) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let entries = inner.snapshots.entry(row.session_id.clone()).or_default();
        entries.push(row);
        entries.sort_by_key(|s| s.state_version);
        if entries.len() > SNAPSHOT_KEEP {
            let excess = entries.len() - SNAPSHOT_KEEP;
            entries.drain(..excess);
        }
        Ok(())
    }

    fn get_latest_snapshot(&self, session_id: &str) -> Result<Option<SnapshotRow>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .snapshots
            .get(session_id)
            .and_then(|entries| entries.last().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Difficulty;

    fn config() -> SessionConfig {
        SessionConfig {
            max_players: 4,
            turn_deadline_seconds: 30,
            difficulty: Difficulty::Normal,
        }
    }

    #[test]
    fn ensure_user_is_idempotent() {
        let store = MemStore::new();
        let first = store.ensure_user("u1", "Alice").expect("create");
        let second = store.ensure_user("u1", "Someone Else").expect("lookup");
        // The row is immutable after first contact.
        assert_eq!(first, second);
        assert_eq!(second.display_name, "Alice");
    }

    #[test]
    fn characters_require_an_owner() {
        let store = MemStore::new();
        assert!(matches!(
            store.create_character("ghost", "rogue", "", CharacterStats::default()),
            Err(StoreError::UserNotFound(_))
        ));
        store.ensure_user("u1", "Alice").expect("user");
        let row = store
            .create_character("u1", "rogue", "hooded", CharacterStats::default())
            .expect("character");
        assert_eq!(row.level, 1);
        assert_eq!(store.get_character(&row.character_id).expect("get"), row);
    }

    #[test]
    fn invite_code_uniqueness_ignores_ended_sessions() {
        let store = MemStore::new();
        let mut row = SessionRow {
            session_id: "s1".into(),
            invite_code: "AB12CD".into(),
            host_user_id: "u1".into(),
            config: config(),
            phase: SessionPhase::Lobby,
            created_ms: 1,
            ended_ms: None,
        };
        store.put_session(row.clone()).expect("put");
        assert!(store.invite_code_in_use("AB12CD").expect("check"));

        row.phase = SessionPhase::Ended;
        store.put_session(row).expect("put");
        assert!(!store.invite_code_in_use("AB12CD").expect("check"));
    }

    #[test]
    fn latest_snapshot_wins_and_history_is_bounded() {
        let store = MemStore::new();
        for version in 1..=20u64 {
            store
                .put_snapshot(SnapshotRow {
                    session_id: "s1".into(),
                    state_version: version,
                    data: vec![version as u8],
                    ts_ms: version,
                })
                .expect("put");
        }
        let latest = store
            .get_latest_snapshot("s1")
            .expect("get")
            .expect("present");
        assert_eq!(latest.state_version, 20);
    }
}
