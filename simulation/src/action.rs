//! Action application. [`apply_action`] is the single entry point: it never
//! mutates its input, it returns the successor state together with the events
//! that describe what happened.

use crate::state::{GameState, Position, UnitId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A gameplay action as validated by the session runtime.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Move the unit to the target tile.
    Move { unit_id: UnitId, target: Position },
    /// Attack the target unit.
    Attack { unit_id: UnitId, target: UnitId },
    /// Yield the rest of the turn.
    EndTurn { unit_id: UnitId },
}

impl Action {
    /// The unit the action acts with.
    pub fn unit_id(&self) -> &UnitId {
        match self {
            Action::Move { unit_id, .. }
            | Action::Attack { unit_id, .. }
            | Action::EndTurn { unit_id } => unit_id,
        }
    }
}

/// What an accepted action did to the state.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimEvent {
    UnitMoved {
        unit_id: UnitId,
        from: Position,
        to: Position,
        /// Movement points spent (Manhattan distance).
        cost: i32,
    },
    UnitAttacked {
        attacker: UnitId,
        target: UnitId,
        damage: i32,
        remaining_hp: i32,
    },
    UnitDied {
        unit_id: UnitId,
    },
    TurnPassed {
        unit_id: UnitId,
    },
}

/// The successor state plus the emitted events.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub state: GameState,
    pub events: Vec<SimEvent>,
}

/// Rejection reasons. The runtime has already checked phase, ownership and
/// turn resources, so everything here is about the board itself.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimError {
    #[error("unit {0} does not exist")]
    UnknownUnit(UnitId),
    #[error("tile {0} is outside the map")]
    OutOfBounds(Position),
    #[error("tile {0} is not walkable")]
    Blocked(Position),
    #[error("tile {0} is occupied")]
    TileOccupied(Position),
}

/// Applies one action to the state. Pure: the input state is untouched.
pub fn apply_action(state: &GameState, action: &Action) -> Result<ActionOutcome, SimError> {
    let mut next = state.clone();
    let mut events = Vec::new();

    match action {
        Action::Move { unit_id, target } => {
            let unit = next
                .unit(unit_id)
                .ok_or_else(|| SimError::UnknownUnit(unit_id.clone()))?;
            let from = unit.position;
            if !next.map.contains(target) {
                return Err(SimError::OutOfBounds(*target));
            }
            if !next.map.is_walkable(target) {
                return Err(SimError::Blocked(*target));
            }
            if next.unit_at(target).is_some_and(|u| &u.id != unit_id) {
                return Err(SimError::TileOccupied(*target));
            }
            let cost = from.distance(target);
            next.unit_mut(unit_id)
                .ok_or_else(|| SimError::UnknownUnit(unit_id.clone()))?
                .position = *target;
            events.push(SimEvent::UnitMoved {
                unit_id: unit_id.clone(),
                from,
                to: *target,
                cost,
            });
        }
        Action::Attack { unit_id, target } => {
            let attacker = next
                .unit(unit_id)
                .ok_or_else(|| SimError::UnknownUnit(unit_id.clone()))?;
            let attack = attacker.stats.attack;
            let victim = next
                .unit(target)
                .ok_or_else(|| SimError::UnknownUnit(target.clone()))?;
            let damage = (attack - victim.stats.defense).max(0);
            let remaining_hp = (victim.stats.hp - damage).max(0);
            next.unit_mut(target)
                .ok_or_else(|| SimError::UnknownUnit(target.clone()))?
                .stats
                .hp = remaining_hp;
            events.push(SimEvent::UnitAttacked {
                attacker: unit_id.clone(),
                target: target.clone(),
                damage,
                remaining_hp,
            });
            if remaining_hp == 0 {
                next.remove_unit(target);
                events.push(SimEvent::UnitDied {
                    unit_id: target.clone(),
                });
            }
        }
        Action::EndTurn { unit_id } => {
            if next.unit(unit_id).is_none() {
                return Err(SimError::UnknownUnit(unit_id.clone()));
            }
            events.push(SimEvent::TurnPassed {
                unit_id: unit_id.clone(),
            });
        }
    }

    Ok(ActionOutcome {
        state: next,
        events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{GameMap, OwnerKind, Unit, UnitStats};

    fn unit(id: &str, x: i32, y: i32, attack: i32, defense: i32, hp: i32) -> Unit {
        Unit {
            id: UnitId::new(id),
            owner_kind: OwnerKind::Player,
            owner_user_id: Some("user".into()),
            position: Position::new(x, y),
            stats: UnitStats {
                hp,
                max_hp: hp,
                attack,
                defense,
                initiative: 5,
                move_range: 4,
                attack_range: 1,
            },
        }
    }

    fn state(units: Vec<Unit>) -> GameState {
        GameState::new_game(GameMap::standard(), units)
    }

    #[test]
    fn move_relocates_and_reports_cost() {
        let s = state(vec![unit("a", 2, 2, 3, 1, 10)]);
        let action = Action::Move {
            unit_id: UnitId::new("a"),
            target: Position::new(3, 5),
        };
        let outcome = apply_action(&s, &action).expect("legal move");
        assert_eq!(
            outcome.state.unit(&UnitId::new("a")).unwrap().position,
            Position::new(3, 5)
        );
        assert_eq!(
            outcome.events,
            vec![SimEvent::UnitMoved {
                unit_id: UnitId::new("a"),
                from: Position::new(2, 2),
                to: Position::new(3, 5),
                cost: 4,
            }]
        );
        // The input state is untouched.
        assert_eq!(s.unit(&UnitId::new("a")).unwrap().position, Position::new(2, 2));
    }

    #[test]
    fn move_rejects_blocked_and_occupied_tiles() {
        let s = state(vec![unit("a", 2, 2, 3, 1, 10), unit("b", 3, 3, 3, 1, 10)]);
        let blocked = Action::Move {
            unit_id: UnitId::new("a"),
            target: Position::new(5, 5),
        };
        assert_eq!(
            apply_action(&s, &blocked),
            Err(SimError::Blocked(Position::new(5, 5)))
        );
        let occupied = Action::Move {
            unit_id: UnitId::new("a"),
            target: Position::new(3, 3),
        };
        assert_eq!(
            apply_action(&s, &occupied),
            Err(SimError::TileOccupied(Position::new(3, 3)))
        );
    }

    #[test]
    fn attack_clamps_damage_at_zero() {
        let s = state(vec![unit("a", 2, 2, 1, 0, 10), unit("b", 2, 3, 3, 5, 10)]);
        let action = Action::Attack {
            unit_id: UnitId::new("a"),
            target: UnitId::new("b"),
        };
        let outcome = apply_action(&s, &action).expect("attack");
        assert_eq!(
            outcome.events,
            vec![SimEvent::UnitAttacked {
                attacker: UnitId::new("a"),
                target: UnitId::new("b"),
                damage: 0,
                remaining_hp: 10,
            }]
        );
    }

    #[test]
    fn lethal_attack_removes_the_target() {
        let s = state(vec![unit("a", 2, 2, 9, 0, 10), unit("b", 2, 3, 3, 1, 4)]);
        let action = Action::Attack {
            unit_id: UnitId::new("a"),
            target: UnitId::new("b"),
        };
        let outcome = apply_action(&s, &action).expect("attack");
        assert!(outcome.state.unit(&UnitId::new("b")).is_none());
        assert!(
            !outcome
                .state
                .combat
                .initiative_order
                .contains(&UnitId::new("b"))
        );
        assert_eq!(
            outcome.events[1],
            SimEvent::UnitDied {
                unit_id: UnitId::new("b")
            }
        );
        outcome.state.check_invariants().expect("invariants hold");
    }

    #[test]
    fn end_turn_leaves_state_unchanged() {
        let s = state(vec![unit("a", 2, 2, 3, 1, 10)]);
        let action = Action::EndTurn {
            unit_id: UnitId::new("a"),
        };
        let outcome = apply_action(&s, &action).expect("end turn");
        assert_eq!(outcome.state, s);
    }
}
