//! The gameplay hot path: admission, phase, turn ownership and resource
//! checks, then the simulation call, commit, broadcast and turn advance.
//! Everything here runs inside the actor, one intent at a time.

use super::SessionActor;
use crate::rate_limit::Bucket;
use protocol::{ErrorCode, GameEvent, ServerFrame, SessionPhase, TurnEndReason};
use simulation::{Action, ActionOutcome, OwnerKind, apply_action};

impl SessionActor {
    pub(super) fn handle_intent(&mut self, user_id: &str, action: Action, seq: u64) {
        let decision = self.limiter.check(user_id, Bucket::Action);
        if !decision.allowed {
            self.send_error(
                user_id,
                ErrorCode::RateLimited,
                "action rate limit exceeded",
                Some(decision.retry_after_ms),
                Some(seq),
            );
            return;
        }

        let move_cost = match self.validate_intent(user_id, &action) {
            Ok(cost) => cost,
            Err((code, message)) => {
                tracing::debug!(
                    session_id = self.session_id,
                    user_id,
                    %code,
                    message,
                    "intent rejected"
                );
                self.send_error(user_id, code, message, None, Some(seq));
                return;
            }
        };

        let Some(game) = self.game.as_ref() else {
            return;
        };
        let outcome = match apply_action(game, &action) {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::debug!(session_id = self.session_id, user_id, %error, "intent rejected by simulation");
                self.send_error(
                    user_id,
                    ErrorCode::InvalidAction,
                    error.to_string(),
                    None,
                    Some(seq),
                );
                return;
            }
        };
        let ActionOutcome { state, events } = outcome;
        if let Err(violation) = state.check_invariants() {
            // The pre-checked action still produced an illegal state: the
            // session is frozen rather than committing a corrupt state.
            self.send_error(
                user_id,
                ErrorCode::InternalSimViolation,
                violation.to_string(),
                None,
                Some(seq),
            );
            self.sim_violation(&violation.to_string());
            return;
        }

        self.game = Some(state);
        self.bump_version();

        let mut turn_over = matches!(action, Action::EndTurn { .. });
        if let Some(turn) = self.turn.as_mut() {
            match &action {
                Action::Move { .. } => turn.movement_remaining -= move_cost,
                Action::Attack { .. } => turn.has_acted = true,
                Action::EndTurn { .. } => {}
            }
            if turn.movement_remaining == 0 && turn.has_acted {
                turn_over = true;
            }
        }

        let update = ServerFrame::StateUpdate {
            version: self.state_version,
            events: events.into_iter().map(GameEvent::from).collect(),
        };
        self.log_event(update.clone());
        self.broadcast(update);

        // The acting unit may no longer exist after the commit; the pointer
        // then advances as if end_turn was received.
        let dead_current = self.turn.as_ref().and_then(|turn| {
            let gone = self
                .game
                .as_ref()
                .is_none_or(|game| game.unit(&turn.current_unit_id).is_none());
            gone.then(|| turn.current_unit_id.clone())
        });
        if let Some(unit_id) = dead_current {
            self.end_current_turn(unit_id, TurnEndReason::UnitDied);
        } else if turn_over {
            self.advance_turn();
        }
        self.maybe_snapshot();
    }

    /// Phase, turn ownership and resource checks. Returns the movement cost
    /// for move actions so the hot path does not re-measure after the unit
    /// has already been relocated.
    fn validate_intent(&self, user_id: &str, action: &Action) -> Result<i32, (ErrorCode, String)> {
        if self.phase != SessionPhase::Playing {
            return Err((
                ErrorCode::InvalidAction,
                "session is not in a running game".into(),
            ));
        }
        let Some(turn) = self.turn.as_ref() else {
            return Err((ErrorCode::NotYourTurn, "no turn is active".into()));
        };
        if action.unit_id() != &turn.current_unit_id {
            return Err((
                ErrorCode::NotYourTurn,
                format!("it is {}'s turn", turn.current_unit_id),
            ));
        }
        let Some(game) = self.game.as_ref() else {
            return Err((ErrorCode::InvalidAction, "no game state".into()));
        };
        let Some(unit) = game.unit(action.unit_id()) else {
            return Err((ErrorCode::NotYourTurn, "acting unit is gone".into()));
        };
        let commands_unit = match unit.owner_kind {
            OwnerKind::Player => unit.owner_user_id.as_deref() == Some(user_id),
            // Monsters act on the DM's behalf.
            OwnerKind::Monster => user_id == self.host_user_id,
        };
        if !commands_unit {
            return Err((
                ErrorCode::NotYourTurn,
                "unit is not commanded by you".into(),
            ));
        }

        match action {
            Action::Move { target, .. } => {
                let cost = unit.position.distance(target);
                if cost == 0 {
                    return Err((ErrorCode::InvalidAction, "already on that tile".into()));
                }
                if cost > turn.movement_remaining {
                    return Err((
                        ErrorCode::InvalidAction,
                        format!(
                            "move costs {cost}, only {} movement left",
                            turn.movement_remaining
                        ),
                    ));
                }
                Ok(cost)
            }
            Action::Attack { unit_id, target } => {
                if turn.has_acted {
                    return Err((ErrorCode::InvalidAction, "unit has already acted".into()));
                }
                if target == unit_id {
                    return Err((ErrorCode::InvalidAction, "a unit cannot attack itself".into()));
                }
                let Some(victim) = game.unit(target) else {
                    return Err((ErrorCode::InvalidAction, "no such target".into()));
                };
                if unit.position.distance(&victim.position) > unit.stats.attack_range {
                    return Err((ErrorCode::InvalidAction, "target out of range".into()));
                }
                Ok(0)
            }
            Action::EndTurn { .. } => Ok(0),
        }
    }
}
