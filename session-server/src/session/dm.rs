//! The dungeon master command layer. Every command is role-gated on the
//! session host, rate limited on its own bucket and executed inside the
//! actor like any other mutation.

use super::{BoundaryOp, SessionActor};
use crate::rate_limit::Bucket;
use crate::time::now_ms;
use protocol::{
    ChatEntry, ChatKind, Difficulty, DmCommand, DmEvent, ErrorCode, GameEvent, PauseReason,
    ServerFrame, SessionEndReason, SessionPhase, StatDeltas, TurnEndReason,
};
use simulation::{
    GameMap, GameState, OwnerKind, Position, Unit, UnitId, UnitStats, level_for_xp,
    lookup_monster, lookup_weapon,
};

impl SessionActor {
    pub(super) fn handle_dm_command(&mut self, user_id: &str, command: DmCommand, seq: u64) {
        if user_id != self.host_user_id {
            self.send_error(
                user_id,
                ErrorCode::Forbidden,
                "dungeon master commands require the host role",
                None,
                Some(seq),
            );
            return;
        }
        let decision = self.limiter.check(user_id, Bucket::Dm);
        if !decision.allowed {
            self.send_error(
                user_id,
                ErrorCode::RateLimited,
                "dm command rate limit exceeded",
                Some(decision.retry_after_ms),
                Some(seq),
            );
            return;
        }
        let result = match command {
            DmCommand::StartGame => self.dm_start_game(),
            DmCommand::PauseGame => self.dm_pause_game(),
            DmCommand::ResumeGame => self.dm_resume_game(),
            DmCommand::EndGame => self.dm_end_game(),
            DmCommand::SkipTurn => self.dm_skip_turn(),
            DmCommand::KickPlayer { user_id: target } => self.dm_kick_player(&target),
            DmCommand::GrantGold {
                user_id: target,
                amount,
            } => self.dm_grant_gold(&target, amount),
            DmCommand::GrantXp {
                user_id: target,
                amount,
            } => self.dm_grant_xp(&target, amount),
            DmCommand::GrantWeapon {
                user_id: target,
                weapon_id,
            } => self.dm_grant_weapon(&target, &weapon_id),
            DmCommand::SpawnMonster {
                position,
                monster_type,
            } => self.dm_spawn_monster(position, &monster_type),
            DmCommand::RemoveMonster { unit_id } => self.dm_remove_monster(&unit_id),
            DmCommand::ModifyMonster {
                unit_id,
                stat_deltas,
            } => self.dm_modify_monster(&unit_id, &stat_deltas),
            DmCommand::Announce { text } => self.dm_announce(&text),
            DmCommand::ModifyConfig {
                turn_deadline_seconds,
                max_players,
                difficulty,
            } => self.dm_modify_config(turn_deadline_seconds, max_players, difficulty),
        };
        if let Err((code, message)) = result {
            tracing::debug!(
                session_id = self.session_id,
                user_id,
                %code,
                message,
                "dm command rejected"
            );
            self.send_error(user_id, code, message, None, Some(seq));
        } else {
            self.maybe_snapshot();
        }
    }

    fn dm_start_game(&mut self) -> Result<(), (ErrorCode, String)> {
        if self.phase != SessionPhase::Lobby {
            return Err((ErrorCode::InvalidAction, "game already started".into()));
        }
        let active: Vec<_> = self.participants.iter().filter(|p| !p.kicked).collect();
        if active.len() < 2 {
            return Err((
                ErrorCode::InvalidAction,
                "at least two participants required".into(),
            ));
        }
        if !active
            .iter()
            .filter(|p| p.role == protocol::ParticipantRole::Player)
            .all(|p| p.ready)
        {
            return Err((ErrorCode::InvalidAction, "not all players are ready".into()));
        }

        let map = GameMap::standard();
        let mut spawns = map.spawn_positions().collect::<Vec<_>>().into_iter();
        let mut units = Vec::new();
        for participant in self
            .participants
            .iter()
            .filter(|p| !p.kicked && p.character_id.is_some())
        {
            let character_id = participant.character_id.clone().expect("filtered");
            let character = self
                .store
                .get_character(&character_id)
                .map_err(|e| (ErrorCode::CharacterNotFound, e.to_string()))?;
            let position = spawns
                .next()
                .ok_or((ErrorCode::InvalidAction, "map has no free spawn tile".into()))?;
            units.push(Unit {
                id: UnitId::new(format!("pc-{character_id}")),
                owner_kind: OwnerKind::Player,
                owner_user_id: Some(participant.user_id.clone()),
                position,
                stats: UnitStats {
                    hp: character.base_stats.hp,
                    max_hp: character.base_stats.hp,
                    attack: character.base_stats.attack,
                    defense: character.base_stats.defense,
                    initiative: character.base_stats.initiative,
                    move_range: character.base_stats.move_range,
                    attack_range: character.base_stats.attack_range,
                },
            });
        }

        let state = GameState::new_game(map, units);
        self.phase = SessionPhase::Playing;
        self.bump_version();
        if let Err(error) =
            self.store
                .update_session_phase(&self.session_id, SessionPhase::Playing, None)
        {
            tracing::error!(session_id = self.session_id, %error, "phase persistence failed");
        }
        tracing::info!(
            session_id = self.session_id,
            units = state.units.len(),
            "game started"
        );
        let sync = ServerFrame::FullStateSync {
            state: state.clone(),
            state_version: self.state_version,
        };
        self.game = Some(state);
        self.broadcast(sync);
        let update = ServerFrame::StateUpdate {
            version: self.state_version,
            events: vec![GameEvent::GameStarted { round: 1 }],
        };
        self.log_event(update.clone());
        self.broadcast(update);
        self.begin_turn();
        self.write_snapshot();
        Ok(())
    }

    fn dm_pause_game(&mut self) -> Result<(), (ErrorCode, String)> {
        if self.phase != SessionPhase::Playing {
            return Err((ErrorCode::InvalidAction, "session is not playing".into()));
        }
        self.pause(PauseReason::DmPause);
        Ok(())
    }

    fn dm_resume_game(&mut self) -> Result<(), (ErrorCode, String)> {
        if self.phase != SessionPhase::Paused {
            return Err((ErrorCode::InvalidAction, "session is not paused".into()));
        }
        self.resume();
        Ok(())
    }

    fn dm_end_game(&mut self) -> Result<(), (ErrorCode, String)> {
        if self.phase == SessionPhase::Ended {
            return Err((ErrorCode::AlreadyEnded, "session has ended".into()));
        }
        self.end_session(SessionEndReason::DmEnd);
        Ok(())
    }

    fn dm_skip_turn(&mut self) -> Result<(), (ErrorCode, String)> {
        if self.phase != SessionPhase::Playing {
            return Err((ErrorCode::InvalidAction, "session is not playing".into()));
        }
        let Some(turn) = self.turn.as_ref() else {
            return Err((ErrorCode::InvalidAction, "no turn is active".into()));
        };
        let unit_id = turn.current_unit_id.clone();
        self.bump_version();
        let update = ServerFrame::StateUpdate {
            version: self.state_version,
            events: vec![GameEvent::TurnEnded {
                unit_id: unit_id.clone(),
                reason: TurnEndReason::DmSkip,
            }],
        };
        self.log_event(update.clone());
        self.broadcast(update);
        self.emit_dm_event(DmEvent::TurnSkipped { unit_id });
        self.advance_turn();
        Ok(())
    }

    fn dm_kick_player(&mut self, target: &str) -> Result<(), (ErrorCode, String)> {
        if target == self.host_user_id {
            return Err((ErrorCode::InvalidAction, "the host cannot be kicked".into()));
        }
        let Some(participant) = self
            .participants
            .iter_mut()
            .find(|p| p.user_id == target && !p.kicked)
        else {
            return Err((ErrorCode::InvalidAction, "no such participant".into()));
        };
        participant.kicked = true;
        participant.ready = false;

        // Their connections get told and dropped right away; the roster and
        // initiative change at the turn boundary.
        let doomed: Vec<u64> = self
            .connections
            .values()
            .filter(|h| h.user_id == target)
            .map(|h| h.conn_id)
            .collect();
        for conn_id in doomed {
            if let Some(handle) = self.connections.remove(&conn_id) {
                handle.close(ErrorCode::Kicked);
            }
        }

        if self.phase == SessionPhase::Playing {
            self.pending_boundary.push(BoundaryOp::RemoveParticipant {
                user_id: target.to_string(),
                kicked: true,
            });
        } else {
            self.remove_participant_now(target);
        }
        self.bump_version();
        self.emit_dm_event(DmEvent::PlayerKicked {
            user_id: target.to_string(),
        });
        let frame = self.participant_update_frame();
        self.broadcast(frame);
        Ok(())
    }

    fn dm_grant_gold(&mut self, target: &str, amount: i64) -> Result<(), (ErrorCode, String)> {
        if amount <= 0 {
            return Err((ErrorCode::InvalidAction, "amount must be positive".into()));
        }
        self.require_participant(target)?;
        let Some(game) = self.game.as_mut() else {
            return Err((ErrorCode::InvalidAction, "no active game".into()));
        };
        game.inventory.gold += amount;
        let total_gold = game.inventory.gold;
        self.bump_version();
        self.emit_dm_event(DmEvent::GoldGranted {
            user_id: target.to_string(),
            amount,
            total_gold,
        });
        Ok(())
    }

    fn dm_grant_xp(&mut self, target: &str, amount: i64) -> Result<(), (ErrorCode, String)> {
        if amount <= 0 {
            return Err((ErrorCode::InvalidAction, "amount must be positive".into()));
        }
        let character_id = self
            .require_participant(target)?
            .ok_or((ErrorCode::InvalidAction, "participant has no character".into()))?;
        let character = self
            .store
            .get_character(&character_id)
            .map_err(|e| (ErrorCode::CharacterNotFound, e.to_string()))?;
        let xp = character.xp + amount;
        let level = level_for_xp(xp);
        self.store
            .update_character_progress(&character_id, xp, level)
            .map_err(|e| (ErrorCode::CharacterNotFound, e.to_string()))?;
        self.bump_version();
        self.emit_dm_event(DmEvent::XpGranted {
            user_id: target.to_string(),
            amount,
            xp,
            level,
        });
        Ok(())
    }

    fn dm_grant_weapon(
        &mut self,
        target: &str,
        weapon_id: &str,
    ) -> Result<(), (ErrorCode, String)> {
        let Some(spec) = lookup_weapon(weapon_id) else {
            return Err((
                ErrorCode::InvalidAction,
                format!("unknown weapon {weapon_id}"),
            ));
        };
        self.require_participant(target)?;
        if self.game.is_none() {
            return Err((ErrorCode::InvalidAction, "no active game".into()));
        }
        self.weapon_counter += 1;
        let instance_id = format!("w-{:04}", self.weapon_counter);
        let game = self.game.as_mut().expect("game present");
        game.inventory.weapons.push(simulation::WeaponInstance {
            instance_id: instance_id.clone(),
            weapon_id: spec.id.to_string(),
            name: spec.name.to_string(),
        });
        self.bump_version();
        self.emit_dm_event(DmEvent::WeaponGranted {
            user_id: target.to_string(),
            weapon_id: weapon_id.to_string(),
            instance_id,
        });
        Ok(())
    }

    fn dm_spawn_monster(
        &mut self,
        position: Position,
        monster_type: &str,
    ) -> Result<(), (ErrorCode, String)> {
        let Some(spec) = lookup_monster(monster_type) else {
            return Err((
                ErrorCode::InvalidAction,
                format!("unknown monster type {monster_type}"),
            ));
        };
        {
            let Some(game) = self.game.as_ref() else {
                return Err((ErrorCode::InvalidAction, "no active game".into()));
            };
            if !game.map.is_walkable(&position) {
                return Err((
                    ErrorCode::InvalidAction,
                    format!("tile {position} is not walkable"),
                ));
            }
            if game.unit_at(&position).is_some() {
                return Err((
                    ErrorCode::InvalidAction,
                    format!("tile {position} is occupied"),
                ));
            }
        }
        self.monster_counter += 1;
        let unit_id = UnitId::new(format!("mon-{:03}-{}", self.monster_counter, spec.id));
        let game = self.game.as_mut().expect("game present");
        game.units.push(Unit {
            id: unit_id.clone(),
            owner_kind: OwnerKind::Monster,
            owner_user_id: None,
            position,
            stats: spec.stats(),
        });
        // The new unit enters the order at the next turn boundary.
        self.initiative_dirty = true;
        self.bump_version();
        self.emit_dm_event(DmEvent::MonsterSpawned {
            unit_id,
            monster_type: monster_type.to_string(),
            position,
        });
        Ok(())
    }

    fn dm_remove_monster(&mut self, unit_id: &UnitId) -> Result<(), (ErrorCode, String)> {
        let Some(game) = self.game.as_mut() else {
            return Err((ErrorCode::InvalidAction, "no active game".into()));
        };
        match game.unit(unit_id) {
            Some(unit) if unit.owner_kind == OwnerKind::Monster => {}
            Some(_) => {
                return Err((
                    ErrorCode::InvalidAction,
                    "only monsters can be removed".into(),
                ));
            }
            None => {
                return Err((ErrorCode::InvalidAction, format!("no such unit {unit_id}")));
            }
        }
        let was_current = self
            .turn
            .as_ref()
            .is_some_and(|t| &t.current_unit_id == unit_id);
        game.remove_unit(unit_id);
        self.initiative_dirty = true;
        self.bump_version();
        self.emit_dm_event(DmEvent::MonsterRemoved {
            unit_id: unit_id.clone(),
        });
        if was_current {
            self.end_current_turn(unit_id.clone(), TurnEndReason::UnitDied);
        }
        Ok(())
    }

    fn dm_modify_monster(
        &mut self,
        unit_id: &UnitId,
        deltas: &StatDeltas,
    ) -> Result<(), (ErrorCode, String)> {
        let Some(game) = self.game.as_mut() else {
            return Err((ErrorCode::InvalidAction, "no active game".into()));
        };
        let died;
        {
            let Some(unit) = game.unit_mut(unit_id) else {
                return Err((ErrorCode::InvalidAction, format!("no such unit {unit_id}")));
            };
            if unit.owner_kind != OwnerKind::Monster {
                return Err((
                    ErrorCode::InvalidAction,
                    "only monsters can be modified".into(),
                ));
            }
            let stats = &mut unit.stats;
            let apply = |value: i32, delta: Option<i32>| (value + delta.unwrap_or(0)).max(0);
            stats.attack = apply(stats.attack, deltas.attack);
            stats.defense = apply(stats.defense, deltas.defense);
            stats.initiative = apply(stats.initiative, deltas.initiative);
            stats.move_range = apply(stats.move_range, deltas.move_range);
            stats.attack_range = apply(stats.attack_range, deltas.attack_range);
            stats.max_hp = apply(stats.max_hp, deltas.max_hp);
            stats.hp = apply(stats.hp, deltas.hp).min(stats.max_hp);
            died = stats.hp == 0;
        }
        if deltas.initiative.is_some() {
            self.initiative_dirty = true;
        }
        self.bump_version();
        self.emit_dm_event(DmEvent::MonsterModified {
            unit_id: unit_id.clone(),
        });
        if died {
            let game = self.game.as_mut().expect("game present");
            game.remove_unit(unit_id);
            self.initiative_dirty = true;
            let update = ServerFrame::StateUpdate {
                version: self.state_version,
                events: vec![GameEvent::UnitDied {
                    unit_id: unit_id.clone(),
                }],
            };
            self.log_event(update.clone());
            self.broadcast(update);
            let was_current = self
                .turn
                .as_ref()
                .is_some_and(|t| &t.current_unit_id == unit_id);
            if was_current {
                self.end_current_turn(unit_id.clone(), TurnEndReason::UnitDied);
            }
        }
        Ok(())
    }

    fn dm_announce(&mut self, text: &str) -> Result<(), (ErrorCode, String)> {
        let text = protocol::sanitize_text(text);
        if text.is_empty() {
            return Err((ErrorCode::InvalidAction, "empty announcement".into()));
        }
        let entry = ChatEntry {
            author: Some(self.host_user_id.clone()),
            kind: ChatKind::DmAnnounce,
            recipient: None,
            text,
            ts: now_ms(),
        };
        self.push_chat(entry.clone());
        self.bump_version();
        self.broadcast(ServerFrame::Chat { entry });
        Ok(())
    }

    fn dm_modify_config(
        &mut self,
        turn_deadline_seconds: Option<u64>,
        max_players: Option<u8>,
        difficulty: Option<Difficulty>,
    ) -> Result<(), (ErrorCode, String)> {
        if self.phase != SessionPhase::Lobby {
            return Err((
                ErrorCode::InvalidAction,
                "configuration is frozen once the game started".into(),
            ));
        }
        let mut config = self.config.clone();
        if let Some(deadline) = turn_deadline_seconds {
            config.turn_deadline_seconds = deadline;
        }
        if let Some(max) = max_players {
            config.max_players = max;
        }
        if let Some(difficulty) = difficulty {
            config.difficulty = difficulty;
        }
        if !config.validate() {
            return Err((ErrorCode::InvalidAction, "invalid configuration".into()));
        }
        let active = self.participants.iter().filter(|p| !p.kicked).count();
        if (config.max_players as usize) < active {
            return Err((
                ErrorCode::InvalidAction,
                "max_players below current participant count".into(),
            ));
        }
        self.config = config.clone();
        match self.store.get_session(&self.session_id) {
            Ok(mut row) => {
                row.config = config.clone();
                if let Err(error) = self.store.put_session(row) {
                    tracing::error!(session_id = self.session_id, %error, "config persistence failed");
                }
            }
            Err(error) => {
                tracing::error!(session_id = self.session_id, %error, "config persistence failed");
            }
        }
        self.bump_version();
        self.emit_dm_event(DmEvent::ConfigChanged { config });
        Ok(())
    }

    /// Ends the running turn outside the normal intent path, e.g. when the
    /// acting unit was removed by a DM command or died from its own action.
    pub(super) fn end_current_turn(&mut self, unit_id: UnitId, reason: TurnEndReason) {
        let update = ServerFrame::StateUpdate {
            version: self.state_version,
            events: vec![GameEvent::TurnEnded { unit_id, reason }],
        };
        self.log_event(update.clone());
        self.broadcast(update);
        self.advance_turn();
    }

    fn emit_dm_event(&mut self, event: DmEvent) {
        let frame = ServerFrame::DmEvent(event);
        self.log_event(frame.clone());
        self.broadcast(frame);
    }

    /// Participant lookup shared by the grant commands. Returns the attached
    /// character id.
    fn require_participant(
        &self,
        user_id: &str,
    ) -> Result<Option<String>, (ErrorCode, String)> {
        self.participants
            .iter()
            .find(|p| p.user_id == user_id && !p.kicked)
            .map(|p| p.character_id.clone())
            .ok_or((ErrorCode::InvalidAction, "no such participant".into()))
    }
}
