//! The turn machine: one deadline per session, auto-skip on expiry, boundary
//! application of queued membership changes, round rollover with initiative
//! recomputation when the roster changed.

use super::{BoundaryOp, SessionActor, TurnState};
use crate::time::now_ms;
use protocol::{GameEvent, PauseReason, ServerFrame, SessionPhase, TurnEndReason};
use simulation::compute_initiative;
use std::time::Duration;
use tokio::time::Instant;

impl SessionActor {
    /// Initializes the turn state for the unit under the pointer, arms the
    /// deadline and announces the turn.
    pub(super) fn begin_turn(&mut self) {
        let Some(game) = self.game.as_ref() else {
            return;
        };
        let Some(unit_id) = game
            .combat
            .initiative_order
            .get(game.combat.current_index)
            .cloned()
        else {
            return;
        };
        let Some(unit) = game.unit(&unit_id) else {
            return;
        };
        self.turn = Some(TurnState {
            current_unit_id: unit_id,
            movement_remaining: unit.stats.move_range,
            has_acted: false,
        });
        let secs = self.config.turn_deadline_seconds;
        self.turn_deadline = Some(Instant::now() + Duration::from_secs(secs));
        self.turn_deadline_ms = now_ms() + secs * 1000;
        self.grace_deadline = None;
        if let Some(frame) = self.turn_change_frame() {
            self.broadcast(frame);
        }
    }

    /// Moves the pointer past the just-ended turn. Queued membership changes
    /// apply first, then the order is recomputed if units were added or
    /// removed, then the pointer lands on the logical successor.
    pub(super) fn advance_turn(&mut self) {
        self.turn_deadline = None;
        self.grace_deadline = None;
        let ended = self.turn.take().map(|t| t.current_unit_id);
        self.apply_boundary_ops();

        let recompute = self.initiative_dirty;
        self.initiative_dirty = false;

        let mut empty = false;
        let mut wrapped_round = None;
        if let Some(game) = self.game.as_mut() {
            // The unit that should act next, read from the order as it is
            // now. When the ended unit is gone the pointer already slid onto
            // its successor.
            let next_hint = match ended.as_ref() {
                Some(e) if game.combat.initiative_order.get(game.combat.current_index) == Some(e) => {
                    game.combat.initiative_order.get(game.combat.current_index + 1).cloned()
                }
                _ => game
                    .combat
                    .initiative_order
                    .get(game.combat.current_index)
                    .cloned(),
            };
            if recompute {
                game.combat.initiative_order = compute_initiative(&game.units);
            }
            if game.combat.initiative_order.is_empty() {
                empty = true;
            } else {
                let position = next_hint
                    .and_then(|hint| game.combat.initiative_order.iter().position(|u| *u == hint));
                game.combat.current_index = match position {
                    Some(index) => index,
                    None => {
                        game.combat.round += 1;
                        wrapped_round = Some(game.combat.round);
                        0
                    }
                };
            }
        } else {
            return;
        }

        if empty {
            tracing::warn!(session_id = self.session_id, "no live units left");
            self.pause(PauseReason::NoUnitsLeft);
            return;
        }
        if let Some(round) = wrapped_round {
            let frame = ServerFrame::StateUpdate {
                version: self.state_version,
                events: vec![GameEvent::RoundStarted { round }],
            };
            self.log_event(frame.clone());
            self.broadcast(frame);
        }
        self.begin_turn();
    }

    /// Deadline or disconnect grace expired: the turn ends as if the player
    /// had sent `end_turn`, tagged as a timeout.
    pub(super) fn on_turn_deadline(&mut self) {
        self.turn_deadline = None;
        self.grace_deadline = None;
        if self.phase != SessionPhase::Playing {
            return;
        }
        let Some(turn) = self.turn.as_ref() else {
            return;
        };
        let unit_id = turn.current_unit_id.clone();
        let user_id = self.current_turn_user();
        tracing::debug!(
            session_id = self.session_id,
            unit_id = %unit_id,
            "turn deadline expired"
        );
        self.bump_version();
        let timeout = ServerFrame::TurnTimeout {
            user_id,
            unit_id: unit_id.clone(),
        };
        self.log_event(timeout.clone());
        self.broadcast(timeout);
        let update = ServerFrame::StateUpdate {
            version: self.state_version,
            events: vec![GameEvent::TurnEnded {
                unit_id,
                reason: TurnEndReason::Timeout,
            }],
        };
        self.log_event(update.clone());
        self.broadcast(update);
        self.advance_turn();
        self.maybe_snapshot();
    }

    /// Applies the membership changes queued while the turn was running.
    fn apply_boundary_ops(&mut self) {
        let ops = std::mem::take(&mut self.pending_boundary);
        if ops.is_empty() {
            return;
        }
        for op in ops {
            match op {
                BoundaryOp::RemoveParticipant { user_id, kicked } => {
                    tracing::info!(
                        session_id = self.session_id,
                        user_id,
                        kicked,
                        "participant removed at turn boundary"
                    );
                    self.remove_participant_now(&user_id);
                }
            }
        }
        let frame = self.participant_update_frame();
        self.broadcast(frame);
    }
}
