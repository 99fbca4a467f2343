//! End-to-end session flows, driven through the actor inbox the same way
//! connections drive it: create and start a game, play a turn, time out,
//! reconnect, DM mutations, rate limiting, restart recovery.

use protocol::{
    ChatKind, Difficulty, DmCommand, DmEvent, ErrorCode, GameEvent, ServerFrame, SessionConfig,
    SessionInfo, SessionPhase, UserView,
};
use session_server::config::ServerConfig;
use session_server::rate_limit::RateLimiter;
use session_server::registry::SessionRegistry;
use session_server::session::{ConnectionHandle, Outbound, SessionMsg};
use session_server::store::{CharacterStats, MemStore, Store};
use simulation::{Action, Position, UnitId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

/// Generous against virtual time: failures still terminate, but the timeout
/// never fires before the game's own 30 s turn deadline does.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(300);

struct Harness {
    store: Arc<MemStore>,
    registry: SessionRegistry,
}

fn harness() -> Harness {
    let config = Arc::new(ServerConfig::default());
    let store = Arc::new(MemStore::new());
    let registry = SessionRegistry::new(
        config.clone(),
        store.clone(),
        Arc::new(RateLimiter::new(config.rate_limits.clone())),
    );
    Harness { store, registry }
}

fn session_config(turn_deadline_seconds: u64) -> SessionConfig {
    SessionConfig {
        max_players: 4,
        turn_deadline_seconds,
        difficulty: Difficulty::Normal,
    }
}

fn user(id: &str) -> UserView {
    UserView {
        user_id: id.to_string(),
        display_name: id.to_string(),
    }
}

/// A fake connection endpoint: the receiving half of the outbound queue the
/// actor writes into, plus the inbox sender a real connection would hold.
struct TestClient {
    user_id: String,
    conn_id: u64,
    rx: mpsc::Receiver<Outbound>,
    inbox: mpsc::Sender<SessionMsg>,
    seq: u64,
}

impl TestClient {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    async fn send(&mut self, message: SessionMsg) {
        self.inbox.send(message).await.expect("actor alive");
    }

    async fn intent(&mut self, action: Action) {
        let seq = self.next_seq();
        let user_id = self.user_id.clone();
        self.send(SessionMsg::Intent {
            user_id,
            action,
            seq,
        })
        .await;
    }

    async fn dm(&mut self, command: DmCommand) {
        let seq = self.next_seq();
        let user_id = self.user_id.clone();
        self.send(SessionMsg::Dm {
            user_id,
            command,
            seq,
        })
        .await;
    }

    async fn chat(&mut self, text: &str) {
        let seq = self.next_seq();
        let user_id = self.user_id.clone();
        self.send(SessionMsg::Chat {
            user_id,
            kind: ChatKind::Broadcast,
            recipient: None,
            text: text.to_string(),
            seq,
        })
        .await;
    }

    /// Receives frames until the predicate maps one to a value. Frames that
    /// do not match are skipped, because broadcasts interleave.
    async fn expect<T>(&mut self, mut pred: impl FnMut(&ServerFrame) -> Option<T>) -> T {
        tokio::time::timeout(EXPECT_TIMEOUT, async {
            loop {
                match self.rx.recv().await.expect("connection open") {
                    Outbound::Frame(frame) => {
                        if let Some(value) = pred(&frame) {
                            return value;
                        }
                    }
                    other => panic!("unexpected close signal {other:?}"),
                }
            }
        })
        .await
        .expect("frame within deadline")
    }

    async fn expect_error(&mut self, expected: ErrorCode) -> Option<u64> {
        self.expect(|frame| match frame {
            ServerFrame::Error {
                code,
                retry_after_ms,
                ..
            } if *code == expected => Some(*retry_after_ms),
            _ => None,
        })
        .await
    }

    /// Waits for the close signal the actor uses to drop this connection.
    async fn expect_close(&mut self, expected: ErrorCode) {
        tokio::time::timeout(EXPECT_TIMEOUT, async {
            loop {
                match self.rx.recv().await.expect("connection open") {
                    Outbound::Close(code) if code == expected => return,
                    _ => {}
                }
            }
        })
        .await
        .expect("close within deadline")
    }
}

async fn attach(
    inbox: &mpsc::Sender<SessionMsg>,
    user_id: &str,
    character_id: Option<String>,
) -> (TestClient, Result<SessionInfo, ErrorCode>) {
    let conn_id = NEXT_CONN.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel(256);
    let (reply_tx, reply_rx) = oneshot::channel();
    inbox
        .send(SessionMsg::Attach {
            user: user(user_id),
            character_id,
            handle: ConnectionHandle::new(conn_id, user_id.to_string(), tx),
            reply: reply_tx,
        })
        .await
        .expect("actor alive");
    let result = reply_rx.await.expect("attach reply");
    (
        TestClient {
            user_id: user_id.to_string(),
            conn_id,
            rx,
            inbox: inbox.clone(),
            seq: 0,
        },
        result,
    )
}

/// Seeds a character with explicit combat stats.
fn seed_character(store: &MemStore, owner: &str, initiative: i32, attack: i32) -> String {
    store.ensure_user(owner, owner).expect("user");
    store
        .create_character(
            owner,
            "fighter",
            "",
            CharacterStats {
                hp: 10,
                attack,
                defense: 1,
                initiative,
                move_range: 4,
                attack_range: 1,
            },
        )
        .expect("character")
        .character_id
}

/// Brings up a started game: DM `u1`, players `u2` (initiative 9) and `u3`
/// (initiative 2). Returns the clients and the two player unit ids.
async fn started_game(
    harness: &Harness,
    turn_deadline_seconds: u64,
) -> (TestClient, TestClient, TestClient, UnitId, UnitId) {
    harness.store.ensure_user("u1", "u1").expect("user");
    let c2 = seed_character(&harness.store, "u2", 9, 3);
    let c3 = seed_character(&harness.store, "u3", 2, 3);
    let handle = harness
        .registry
        .create(&user("u1"), session_config(turn_deadline_seconds))
        .expect("create");

    let (dm, result) = attach(&handle.inbox, "u1", None).await;
    result.expect("dm attached");
    let (mut p2, result) = attach(&handle.inbox, "u2", Some(c2.clone())).await;
    result.expect("u2 attached");
    let (mut p3, result) = attach(&handle.inbox, "u3", Some(c3.clone())).await;
    result.expect("u3 attached");

    for client in [&mut p2, &mut p3] {
        let seq = client.next_seq();
        let user_id = client.user_id.clone();
        client
            .send(SessionMsg::Ready {
                user_id,
                ready: true,
                seq,
            })
            .await;
    }
    let mut dm = dm;
    dm.dm(DmCommand::StartGame).await;

    let unit2 = UnitId::new(format!("pc-{c2}"));
    let unit3 = UnitId::new(format!("pc-{c3}"));
    (dm, p2, p3, unit2, unit3)
}

#[tokio::test(start_paused = true)]
async fn create_and_start_announces_round_one_and_first_turn() {
    let harness = harness();
    let (_dm, mut p2, _p3, unit2, _unit3) = started_game(&harness, 30).await;

    let (state, version) = p2
        .expect(|frame| match frame {
            ServerFrame::FullStateSync {
                state,
                state_version,
            } => Some((state.clone(), *state_version)),
            _ => None,
        })
        .await;
    assert_eq!(version, 1);
    assert_eq!(state.combat.round, 1);
    assert_eq!(state.units.len(), 2);

    let update_version = p2
        .expect(|frame| match frame {
            ServerFrame::StateUpdate { version, events }
                if events.contains(&GameEvent::GameStarted { round: 1 }) =>
            {
                Some(*version)
            }
            _ => None,
        })
        .await;
    assert_eq!(update_version, 1);

    // Highest initiative acts first.
    let (current, deadline_ms) = p2
        .expect(|frame| match frame {
            ServerFrame::TurnChange {
                current_unit,
                deadline_ms,
                ..
            } => Some((current_unit.clone(), *deadline_ms)),
            _ => None,
        })
        .await;
    assert_eq!(current, unit2);
    assert!(deadline_ms > 0);
}

#[tokio::test(start_paused = true)]
async fn move_attack_end_turn_flow() {
    let harness = harness();
    let (_dm, mut p2, mut p3, unit2, unit3) = started_game(&harness, 30).await;

    // Turn ownership: u3 may not act on u2's turn.
    p3.intent(Action::EndTurn {
        unit_id: unit3.clone(),
    })
    .await;
    p3.expect_error(ErrorCode::NotYourTurn).await;

    // A move past the movement budget is a validation error.
    p2.intent(Action::Move {
        unit_id: unit2.clone(),
        target: Position::new(0, 9),
    })
    .await;
    p2.expect_error(ErrorCode::InvalidAction).await;

    // u2 spawns at (0,0), u3 at (1,0). Move beside the target.
    p2.intent(Action::Move {
        unit_id: unit2.clone(),
        target: Position::new(1, 1),
    })
    .await;
    let version = p2
        .expect(|frame| match frame {
            ServerFrame::StateUpdate { version, events } => events.iter().find_map(|e| match e {
                GameEvent::UnitMoved { cost, to, .. } => {
                    assert_eq!(*cost, 2);
                    assert_eq!(*to, Position::new(1, 1));
                    Some(*version)
                }
                _ => None,
            }),
            _ => None,
        })
        .await;
    assert_eq!(version, 2);

    // Attack: damage is attack minus defense, clamped at zero.
    p2.intent(Action::Attack {
        unit_id: unit2.clone(),
        target: unit3.clone(),
    })
    .await;
    p2.expect(|frame| match frame {
        ServerFrame::StateUpdate { events, .. } => events.iter().find_map(|e| match e {
            GameEvent::UnitAttacked {
                damage,
                remaining_hp,
                ..
            } => {
                assert_eq!(*damage, 2);
                assert_eq!(*remaining_hp, 8);
                Some(())
            }
            _ => None,
        }),
        _ => None,
    })
    .await;

    // A second attack in the same turn is rejected.
    p2.intent(Action::Attack {
        unit_id: unit2.clone(),
        target: unit3.clone(),
    })
    .await;
    p2.expect_error(ErrorCode::InvalidAction).await;

    p2.intent(Action::EndTurn {
        unit_id: unit2.clone(),
    })
    .await;
    let current = p2
        .expect(|frame| match frame {
            ServerFrame::TurnChange { current_unit, .. } => Some(current_unit.clone()),
            _ => None,
        })
        .await;
    assert_eq!(current, unit3);
}

#[tokio::test(start_paused = true)]
async fn turn_deadline_times_out_and_advances() {
    let harness = harness();
    let (_dm, mut p2, _p3, unit2, unit3) = started_game(&harness, 30).await;

    // Nobody acts; virtual time runs into the deadline.
    let timed_out = p2
        .expect(|frame| match frame {
            ServerFrame::TurnTimeout { unit_id, .. } => Some(unit_id.clone()),
            _ => None,
        })
        .await;
    assert_eq!(timed_out, unit2);

    p2.expect(|frame| match frame {
        ServerFrame::StateUpdate { events, .. } => events.iter().find_map(|e| match e {
            GameEvent::TurnEnded { unit_id, reason } => {
                assert_eq!(unit_id, &unit2);
                assert_eq!(*reason, protocol::TurnEndReason::Timeout);
                Some(())
            }
            _ => None,
        }),
        _ => None,
    })
    .await;

    let current = p2
        .expect(|frame| match frame {
            ServerFrame::TurnChange { current_unit, .. } => Some(current_unit.clone()),
            _ => None,
        })
        .await;
    assert_eq!(current, unit3);
}

#[tokio::test(start_paused = true)]
async fn reconnect_replays_events_after_last_seen_version() {
    let harness = harness();
    let (_dm, mut p2, _p3, unit2, _unit3) = started_game(&harness, 30).await;

    p2.intent(Action::Move {
        unit_id: unit2.clone(),
        target: Position::new(0, 2),
    })
    .await;
    let seen = p2
        .expect(|frame| match frame {
            ServerFrame::StateUpdate { version, .. } => Some(*version),
            _ => None,
        })
        .await;

    p2.intent(Action::Move {
        unit_id: unit2.clone(),
        target: Position::new(1, 2),
    })
    .await;
    p2.expect(|frame| match frame {
        ServerFrame::StateUpdate { .. } => Some(()),
        _ => None,
    })
    .await;

    // Drop and come back within the window.
    let conn_id = p2.conn_id;
    let inbox = p2.inbox.clone();
    p2.send(SessionMsg::Detach {
        conn_id,
        user_id: "u2".into(),
    })
    .await;

    let (mut p2b, result) = attach(&inbox, "u2", None).await;
    let info = result.expect("rejoin accepted");
    assert_eq!(info.phase, SessionPhase::Playing);

    // Rejoin starts with a fresh full sync.
    let version = p2b
        .expect(|frame| match frame {
            ServerFrame::FullStateSync { state_version, .. } => Some(*state_version),
            _ => None,
        })
        .await;
    assert_eq!(version, seen + 1);

    // Catch-up replays only what was missed.
    let seq = p2b.next_seq();
    p2b.send(SessionMsg::ResumeSync {
        user_id: "u2".into(),
        conn_id: p2b.conn_id,
        last_seen_version: seen,
        seq,
    })
    .await;
    let replayed = p2b
        .expect(|frame| match frame {
            ServerFrame::StateUpdate { version, .. } => Some(*version),
            _ => None,
        })
        .await;
    assert_eq!(replayed, seen + 1);
    p2b.expect(|frame| match frame {
        ServerFrame::TurnChange { current_unit, .. } => {
            assert_eq!(current_unit, &unit2);
            Some(())
        }
        _ => None,
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn dm_grants_gold_and_spawns_monster_into_initiative() {
    let harness = harness();
    let (mut dm, mut p2, _p3, unit2, _unit3) = started_game(&harness, 30).await;

    // Negative grants are rejected.
    dm.dm(DmCommand::GrantGold {
        user_id: "u2".into(),
        amount: -5,
    })
    .await;
    dm.expect_error(ErrorCode::InvalidAction).await;

    dm.dm(DmCommand::GrantGold {
        user_id: "u2".into(),
        amount: 50,
    })
    .await;
    p2.expect(|frame| match frame {
        ServerFrame::DmEvent(DmEvent::GoldGranted {
            amount, total_gold, ..
        }) => {
            assert_eq!(*amount, 50);
            assert_eq!(*total_gold, 50);
            Some(())
        }
        _ => None,
    })
    .await;

    dm.dm(DmCommand::SpawnMonster {
        position: Position::new(7, 7),
        monster_type: "goblin".into(),
    })
    .await;
    let goblin = p2
        .expect(|frame| match frame {
            ServerFrame::DmEvent(DmEvent::MonsterSpawned {
                unit_id, position, ..
            }) => {
                assert_eq!(*position, Position::new(7, 7));
                Some(unit_id.clone())
            }
            _ => None,
        })
        .await;

    // The tile is taken now.
    dm.dm(DmCommand::SpawnMonster {
        position: Position::new(7, 7),
        monster_type: "goblin".into(),
    })
    .await;
    dm.expect_error(ErrorCode::InvalidAction).await;

    // The goblin enters the order at the next turn boundary.
    p2.intent(Action::EndTurn {
        unit_id: unit2.clone(),
    })
    .await;
    p2.expect(|frame| match frame {
        ServerFrame::TurnChange { .. } => Some(()),
        _ => None,
    })
    .await;

    let (mut probe, result) = attach(&dm.inbox.clone(), "u1", None).await;
    result.expect("rejoin");
    let state = probe
        .expect(|frame| match frame {
            ServerFrame::FullStateSync { state, .. } => Some(state.clone()),
            _ => None,
        })
        .await;
    assert!(state.combat.initiative_order.contains(&goblin));
    assert!(state.units.iter().any(|u| u.id == goblin));
}

#[tokio::test(start_paused = true)]
async fn thirty_first_intent_is_rate_limited_without_state_change() {
    let harness = harness();
    let (_dm, mut p2, mut p3, _unit2, unit3) = started_game(&harness, 600).await;

    // 30 admissions pass; each then bounces off turn ownership instead.
    for _ in 0..30 {
        p3.intent(Action::EndTurn {
            unit_id: unit3.clone(),
        })
        .await;
        p3.expect_error(ErrorCode::NotYourTurn).await;
    }
    p3.intent(Action::EndTurn {
        unit_id: unit3.clone(),
    })
    .await;
    let retry = p3.expect_error(ErrorCode::RateLimited).await;
    assert!(retry.is_some_and(|ms| ms > 0));

    // u3 is still attached and the session unharmed: chat still works.
    p3.chat("still here").await;
    p2.expect(|frame| match frame {
        ServerFrame::Chat { entry } => {
            assert_eq!(entry.text, "still here");
            Some(())
        }
        _ => None,
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn join_beyond_max_players_is_rejected() {
    let harness = harness();
    harness.store.ensure_user("u1", "u1").expect("user");
    harness.store.ensure_user("u2", "u2").expect("user");
    harness.store.ensure_user("u3", "u3").expect("user");
    let handle = harness
        .registry
        .create(
            &user("u1"),
            SessionConfig {
                max_players: 2,
                turn_deadline_seconds: 30,
                difficulty: Difficulty::Normal,
            },
        )
        .expect("create");

    let (_dm, result) = attach(&handle.inbox, "u1", None).await;
    result.expect("dm attached");
    let (_p2, result) = attach(&handle.inbox, "u2", None).await;
    result.expect("u2 attached");
    let (_p3, result) = attach(&handle.inbox, "u3", None).await;
    assert_eq!(result.unwrap_err(), ErrorCode::SessionFull);
}

#[tokio::test(start_paused = true)]
async fn kicked_player_is_closed_and_cannot_rejoin() {
    let harness = harness();
    let (mut dm, mut p2, _p3, _unit2, _unit3) = started_game(&harness, 30).await;

    dm.dm(DmCommand::KickPlayer {
        user_id: "u2".into(),
    })
    .await;
    p2.expect_close(ErrorCode::Kicked).await;

    let (_again, result) = attach(&dm.inbox.clone(), "u2", None).await;
    assert_eq!(result.unwrap_err(), ErrorCode::Kicked);
}

#[tokio::test(start_paused = true)]
async fn restart_recovery_comes_back_paused() {
    let harness = harness();
    let (mut dm, mut p2, _p3, unit2, _unit3) = started_game(&harness, 30).await;

    p2.intent(Action::Move {
        unit_id: unit2.clone(),
        target: Position::new(0, 2),
    })
    .await;
    p2.expect(|frame| match frame {
        ServerFrame::StateUpdate { .. } => Some(()),
        _ => None,
    })
    .await;
    dm.send(SessionMsg::SnapshotRequest).await;
    // The inbox is FIFO: once the chat comes back, the snapshot is on disk.
    dm.chat("checkpoint").await;
    dm.expect(|frame| match frame {
        ServerFrame::Chat { entry } => (entry.text == "checkpoint").then_some(()),
        _ => None,
    })
    .await;

    // A second registry over the same store is the restarted process.
    let config = Arc::new(ServerConfig::default());
    let registry2 = SessionRegistry::new(
        config.clone(),
        harness.store.clone(),
        Arc::new(RateLimiter::new(config.rate_limits.clone())),
    );
    registry2.recover_all();

    let rows = harness.store.list_active_sessions().expect("sessions");
    let row = rows.first().expect("session row");
    let handle = registry2.lookup(&row.session_id).expect("recovered handle");
    let (mut dm2, result) = attach(&handle.inbox, "u1", None).await;
    let info = result.expect("attach to recovered session");
    assert_eq!(info.phase, SessionPhase::Paused);

    // The DM resumes explicitly and play continues where it stopped.
    dm2.dm(DmCommand::ResumeGame).await;
    dm2.expect(|frame| match frame {
        ServerFrame::SessionResumed {} => Some(()),
        _ => None,
    })
    .await;
    dm2.expect(|frame| match frame {
        ServerFrame::TurnChange { current_unit, .. } => {
            assert_eq!(current_unit, &unit2);
            Some(())
        }
        _ => None,
    })
    .await;
}
