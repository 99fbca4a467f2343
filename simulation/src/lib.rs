//! The deterministic combat simulation. This crate is a pure rules module:
//! it owns the game state types and exposes [`apply_action`], a function of
//! `(state, action) -> (state', events)` with no clocks, no randomness and no
//! I/O. The session runtime treats it as an external module and never
//! mutates state by other means.

mod action;
mod catalog;
mod state;

pub use action::{Action, ActionOutcome, SimError, SimEvent, apply_action};
pub use catalog::{
    MonsterSpec, WeaponSpec, level_for_xp, lookup_monster, lookup_weapon, monster_catalog,
    weapon_catalog,
};
pub use state::{
    CombatBlock, GameMap, GameState, InvariantViolation, Inventory, OwnerKind, Position, Unit,
    UnitId, UnitStats, WeaponInstance, compute_initiative, state_hash,
};
