//! The process-wide session index: live sessions by id and by invite code,
//! actor lifecycle, boot recovery. The whole registry sits behind one mutex;
//! the gameplay hot path never touches it.

use crate::auth::TokenVerifier;
use crate::config::ServerConfig;
use crate::rate_limit::RateLimiter;
use crate::session::{SessionActor, SessionMsg, SnapshotRecord};
use crate::store::{SessionRow, Store};
use crate::time::now_ms;
use protocol::{ErrorCode, SessionConfig, SessionPhase, UserView};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Invite codes are six characters from this alphabet.
const INVITE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const INVITE_LEN: usize = 6;

/// Everything the server needs per process, shared by all handlers.
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Arc<dyn Store>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub registry: SessionRegistry,
}

/// The registry-side reference to one live session actor.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub invite_code: String,
    pub inbox: mpsc::Sender<SessionMsg>,
}

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<String, SessionHandle>,
    by_code: HashMap<String, String>,
}

pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    config: Arc<ServerConfig>,
    store: Arc<dyn Store>,
    limiter: Arc<RateLimiter>,
}

impl SessionRegistry {
    pub fn new(config: Arc<ServerConfig>, store: Arc<dyn Store>, limiter: Arc<RateLimiter>) -> Self {
        SessionRegistry {
            inner: Mutex::new(RegistryInner::default()),
            config,
            store,
            limiter,
        }
    }

    /// Creates a session for the host: allocates a collision-free invite
    /// code, persists the row and spawns the actor.
    pub fn create(
        &self,
        host: &UserView,
        session_config: SessionConfig,
    ) -> Result<SessionHandle, ErrorCode> {
        if !session_config.validate() {
            return Err(ErrorCode::InvalidAction);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.by_id.len() >= self.config.max_sessions {
            tracing::warn!(max_sessions = self.config.max_sessions, "session cap reached");
            return Err(ErrorCode::ServerBusy);
        }
        let invite_code = self.allocate_code(&inner)?;
        let session_id = new_session_id();
        let row = SessionRow {
            session_id: session_id.clone(),
            invite_code: invite_code.clone(),
            host_user_id: host.user_id.clone(),
            config: session_config,
            phase: SessionPhase::Lobby,
            created_ms: now_ms(),
            ended_ms: None,
        };
        if let Err(error) = self.store.put_session(row.clone()) {
            tracing::error!(%error, "session row write failed");
            return Err(ErrorCode::ServerBusy);
        }
        let handle = self.spawn_actor(&row, None);
        inner.by_id.insert(session_id.clone(), handle.clone());
        inner.by_code.insert(invite_code.clone(), session_id.clone());
        tracing::info!(
            session_id,
            invite_code,
            host = host.user_id,
            "session created"
        );
        Ok(handle)
    }

    /// Resolves an invite code to the live session handle. Capacity and
    /// lifecycle rejections are the actor's to make on attach.
    pub fn join(&self, invite_code: &str) -> Result<SessionHandle, ErrorCode> {
        let code = invite_code.trim().to_ascii_uppercase();
        let inner = self.inner.lock().unwrap();
        let session_id = inner.by_code.get(&code).ok_or(ErrorCode::SessionNotFound)?;
        inner
            .by_id
            .get(session_id)
            .cloned()
            .ok_or(ErrorCode::SessionNotFound)
    }

    pub fn lookup(&self, session_id: &str) -> Option<SessionHandle> {
        self.inner.lock().unwrap().by_id.get(session_id).cloned()
    }

    pub fn dispose(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(handle) = inner.by_id.remove(session_id) {
            inner.by_code.remove(&handle.invite_code);
        }
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().by_id.len()
    }

    /// Watchdog sweep: forgets sessions whose actor has stopped. Actors end
    /// themselves on `end_game` or after the idle window, so this is the
    /// normal disposal path, not just a fallback.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock().unwrap();
        let RegistryInner { by_id, by_code } = &mut *inner;
        by_id.retain(|session_id, handle| {
            let alive = !handle.inbox.is_closed();
            if !alive {
                tracing::info!(session_id, "removing stopped session actor");
            }
            alive
        });
        by_code.retain(|_, session_id| by_id.contains_key(session_id));
    }

    /// Boot recovery: every non-ended session comes back from its latest
    /// snapshot, paused, until a DM resumes it.
    pub fn recover_all(&self) {
        let rows = match self.store.list_active_sessions() {
            Ok(rows) => rows,
            Err(error) => {
                tracing::error!(%error, "session recovery listing failed");
                return;
            }
        };
        let mut recovered = 0usize;
        for row in rows {
            let snapshot = match self.store.get_latest_snapshot(&row.session_id) {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    tracing::error!(session_id = row.session_id, %error, "snapshot lookup failed");
                    continue;
                }
            };
            let record = match snapshot {
                Some(snapshot) => match serde_json::from_slice::<SnapshotRecord>(&snapshot.data) {
                    Ok(record) => Some(record),
                    Err(error) => {
                        tracing::error!(
                            session_id = row.session_id,
                            %error,
                            "snapshot decode failed, skipping session"
                        );
                        continue;
                    }
                },
                None => None,
            };
            let handle = self.spawn_actor(&row, record);
            let mut inner = self.inner.lock().unwrap();
            inner
                .by_code
                .insert(row.invite_code.clone(), row.session_id.clone());
            inner.by_id.insert(row.session_id.clone(), handle);
            recovered += 1;
        }
        if recovered > 0 {
            tracing::info!(recovered, "sessions re-materialized from snapshots");
        }
    }

    fn spawn_actor(&self, row: &SessionRow, snapshot: Option<SnapshotRecord>) -> SessionHandle {
        let (inbox_tx, inbox_rx) = mpsc::channel(self.config.actor_inbox_capacity);
        let actor = match snapshot {
            Some(record) => SessionActor::restore(
                row,
                record,
                self.config.clone(),
                self.store.clone(),
                self.limiter.clone(),
                inbox_rx,
            ),
            None => SessionActor::new(
                row,
                self.config.clone(),
                self.store.clone(),
                self.limiter.clone(),
                inbox_rx,
            ),
        };
        tokio::spawn(actor.run());
        SessionHandle {
            session_id: row.session_id.clone(),
            invite_code: row.invite_code.clone(),
            inbox: inbox_tx,
        }
    }

    fn allocate_code(&self, inner: &RegistryInner) -> Result<String, ErrorCode> {
        let mut rng = rand::rng();
        // Collisions get rarer the more we retry; a bounded loop keeps a
        // pathological store from spinning us forever.
        for _ in 0..64 {
            let code: String = (0..INVITE_LEN)
                .map(|_| INVITE_ALPHABET[rng.random_range(0..INVITE_ALPHABET.len())] as char)
                .collect();
            let clash = inner.by_code.contains_key(&code)
                || self.store.invite_code_in_use(&code).unwrap_or(true);
            if !clash {
                return Ok(code);
            }
            tracing::debug!(code, "invite code collision, retrying");
        }
        Err(ErrorCode::ServerBusy)
    }
}

fn new_session_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..12)
        .map(|_| {
            let chars = b"abcdefghijklmnopqrstuvwxyz0123456789";
            chars[rng.random_range(0..chars.len())] as char
        })
        .collect();
    format!("sess-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn registry() -> SessionRegistry {
        let config = Arc::new(ServerConfig::default());
        SessionRegistry::new(
            config.clone(),
            Arc::new(MemStore::new()),
            Arc::new(RateLimiter::new(config.rate_limits.clone())),
        )
    }

    fn host() -> UserView {
        UserView {
            user_id: "u1".into(),
            display_name: "Host".into(),
        }
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            max_players: 4,
            turn_deadline_seconds: 30,
            difficulty: protocol::Difficulty::Normal,
        }
    }

    #[tokio::test]
    async fn create_allocates_a_wellformed_unique_code() {
        let registry = registry();
        let a = registry.create(&host(), session_config()).expect("create");
        let b = registry.create(&host(), session_config()).expect("create");
        for handle in [&a, &b] {
            assert_eq!(handle.invite_code.len(), 6);
            assert!(
                handle
                    .invite_code
                    .bytes()
                    .all(|c| INVITE_ALPHABET.contains(&c))
            );
        }
        assert_ne!(a.invite_code, b.invite_code);
        assert_eq!(registry.live_count(), 2);
    }

    #[tokio::test]
    async fn join_resolves_codes_case_insensitively() {
        let registry = registry();
        let created = registry.create(&host(), session_config()).expect("create");
        let joined = registry
            .join(&created.invite_code.to_lowercase())
            .expect("join");
        assert_eq!(joined.session_id, created.session_id);
        assert!(matches!(
            registry.join("ZZZZZZ"),
            Err(ErrorCode::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn session_cap_is_enforced() {
        let config = Arc::new(ServerConfig {
            max_sessions: 1,
            ..ServerConfig::default()
        });
        let registry = SessionRegistry::new(
            config.clone(),
            Arc::new(MemStore::new()),
            Arc::new(RateLimiter::new(config.rate_limits.clone())),
        );
        registry.create(&host(), session_config()).expect("create");
        assert!(matches!(
            registry.create(&host(), session_config()),
            Err(ErrorCode::ServerBusy)
        ));
    }

    #[tokio::test]
    async fn invalid_session_config_is_rejected() {
        let registry = registry();
        let mut config = session_config();
        config.max_players = 1;
        assert!(matches!(
            registry.create(&host(), config),
            Err(ErrorCode::InvalidAction)
        ));
    }
}
