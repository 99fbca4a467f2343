//! The canonical game state with the helper queries the runtime needs.
//! Everything here is plain serializable data, the state travels over the
//! wire on full syncs and into snapshots unchanged.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// A tile coordinate on the map. Origin is in the lower left corner.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Position { x, y }
    }

    /// Manhattan distance, the metric for both movement cost and attack range.
    pub fn distance(&self, other: &Position) -> i32 {
        (self.x - other.x).abs() + (self.y - other.y).abs()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Identifier of a unit on the map. Ids are plain strings so that initiative
/// ties can be broken by lexicographic order.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> Self {
        UnitId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who commands a unit.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    /// A player character, commanded by the owning user.
    Player,
    /// A monster, commanded by the dungeon master.
    Monster,
}

/// The combat relevant numbers of a unit.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct UnitStats {
    pub hp: i32,
    pub max_hp: i32,
    pub attack: i32,
    pub defense: i32,
    pub initiative: i32,
    pub move_range: i32,
    pub attack_range: i32,
}

/// One unit on the map.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub owner_kind: OwnerKind,
    /// The commanding user for player units, `None` for monsters.
    pub owner_user_id: Option<String>,
    pub position: Position,
    pub stats: UnitStats,
}

impl Unit {
    pub fn is_alive(&self) -> bool {
        self.stats.hp > 0
    }
}

/// A weapon instance in the shared party inventory.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct WeaponInstance {
    /// Unique per instance, so two longswords stay distinguishable.
    pub instance_id: String,
    /// The catalog id this instance was minted from.
    pub weapon_id: String,
    pub name: String,
}

/// The shared party inventory.
#[derive(PartialEq, Eq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    pub gold: i64,
    pub weapons: Vec<WeaponInstance>,
}

/// Initiative order, turn pointer and round counter.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct CombatBlock {
    /// Unit ids in acting order for the current round.
    pub initiative_order: Vec<UnitId>,
    /// Index into [`Self::initiative_order`] of the unit whose turn it is.
    pub current_index: usize,
    /// Round counter, starts at 1 when the game begins.
    pub round: u32,
}

/// The static map. Tiles are walkable unless listed in `blocked`.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct GameMap {
    pub width: i32,
    pub height: i32,
    pub blocked: BTreeSet<Position>,
}

impl GameMap {
    /// The standard skirmish map used when a game starts.
    pub fn standard() -> Self {
        let blocked = [
            Position::new(5, 5),
            Position::new(5, 6),
            Position::new(6, 5),
            Position::new(9, 2),
            Position::new(2, 9),
        ]
        .into_iter()
        .collect();
        GameMap {
            width: 12,
            height: 12,
            blocked,
        }
    }

    pub fn contains(&self, pos: &Position) -> bool {
        pos.x >= 0 && pos.y >= 0 && pos.x < self.width && pos.y < self.height
    }

    pub fn is_walkable(&self, pos: &Position) -> bool {
        self.contains(pos) && !self.blocked.contains(pos)
    }

    /// Candidate spawn tiles for player placement, scanning up the left edge.
    pub fn spawn_positions(&self) -> impl Iterator<Item = Position> + '_ {
        (0..self.height)
            .flat_map(|y| (0..self.width.min(2)).map(move |x| Position::new(x, y)))
            .filter(|p| self.is_walkable(p))
    }
}

/// The complete canonical game state of one session.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct GameState {
    pub map: GameMap,
    pub units: Vec<Unit>,
    pub combat: CombatBlock,
    pub inventory: Inventory,
}

impl GameState {
    /// Builds the state for a fresh game from the placed units. Initiative is
    /// computed immediately, the round counter starts at 1.
    pub fn new_game(map: GameMap, units: Vec<Unit>) -> Self {
        let initiative_order = compute_initiative(&units);
        GameState {
            map,
            units,
            combat: CombatBlock {
                initiative_order,
                current_index: 0,
                round: 1,
            },
            inventory: Inventory::default(),
        }
    }

    pub fn unit(&self, id: &UnitId) -> Option<&Unit> {
        self.units.iter().find(|u| &u.id == id)
    }

    pub fn unit_mut(&mut self, id: &UnitId) -> Option<&mut Unit> {
        self.units.iter_mut().find(|u| &u.id == id)
    }

    pub fn unit_at(&self, pos: &Position) -> Option<&Unit> {
        self.units.iter().find(|u| &u.position == pos)
    }

    /// The unit whose turn it currently is, if the order is non-empty.
    pub fn current_unit(&self) -> Option<&Unit> {
        self.combat
            .initiative_order
            .get(self.combat.current_index)
            .and_then(|id| self.unit(id))
    }

    /// Removes a unit from the roster and the initiative order, keeping the
    /// turn pointer on the same logical successor. Returns false if the unit
    /// was not present.
    pub fn remove_unit(&mut self, id: &UnitId) -> bool {
        let Some(pos) = self.units.iter().position(|u| &u.id == id) else {
            return false;
        };
        self.units.remove(pos);
        if let Some(order_pos) = self
            .combat
            .initiative_order
            .iter()
            .position(|entry| entry == id)
        {
            self.combat.initiative_order.remove(order_pos);
            if order_pos < self.combat.current_index {
                self.combat.current_index -= 1;
            }
        }
        true
    }

    /// Verifies the structural invariants the runtime guarantees around every
    /// mutation. A violation here means a bug in the simulation or a caller
    /// that mutated state directly.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut seen_ids = BTreeSet::new();
        let mut seen_positions = BTreeSet::new();
        for unit in &self.units {
            if !seen_ids.insert(&unit.id) {
                return Err(InvariantViolation::DuplicateUnitId(unit.id.clone()));
            }
            if !seen_positions.insert(unit.position) {
                return Err(InvariantViolation::SharedTile(unit.position));
            }
            if unit.stats.hp < 0 || unit.stats.hp > unit.stats.max_hp {
                return Err(InvariantViolation::HpOutOfBounds {
                    unit: unit.id.clone(),
                    hp: unit.stats.hp,
                    max_hp: unit.stats.max_hp,
                });
            }
        }
        for id in &self.combat.initiative_order {
            match self.unit(id) {
                Some(unit) if unit.is_alive() => {}
                _ => return Err(InvariantViolation::DeadUnitInInitiative(id.clone())),
            }
        }
        Ok(())
    }
}

/// A broken structural invariant, see [`GameState::check_invariants`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("duplicate unit id {0}")]
    DuplicateUnitId(UnitId),
    #[error("two units share tile {0}")]
    SharedTile(Position),
    #[error("unit {unit} has hp {hp} outside [0, {max_hp}]")]
    HpOutOfBounds { unit: UnitId, hp: i32, max_hp: i32 },
    #[error("initiative order references dead or missing unit {0}")]
    DeadUnitInInitiative(UnitId),
}

/// Computes the acting order: highest initiative first, ties broken by unit
/// id lexicographically, then by roster insertion order.
pub fn compute_initiative(units: &[Unit]) -> Vec<UnitId> {
    let mut indexed: Vec<(usize, &Unit)> = units.iter().filter(|u| u.is_alive()).enumerate().collect();
    indexed.sort_by(|(ia, a), (ib, b)| {
        b.stats
            .initiative
            .cmp(&a.stats.initiative)
            .then_with(|| a.id.cmp(&b.id))
            .then_with(|| ia.cmp(ib))
    });
    indexed.into_iter().map(|(_, u)| u.id.clone()).collect()
}

/// A stable hash over the serialized state, logged when a session has to be
/// frozen after an invariant violation.
pub fn state_hash(state: &GameState) -> u64 {
    let encoded = serde_json::to_string(state).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    encoded.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str, x: i32, y: i32, initiative: i32) -> Unit {
        Unit {
            id: UnitId::new(id),
            owner_kind: OwnerKind::Player,
            owner_user_id: Some("user".into()),
            position: Position::new(x, y),
            stats: UnitStats {
                hp: 10,
                max_hp: 10,
                attack: 3,
                defense: 1,
                initiative,
                move_range: 4,
                attack_range: 1,
            },
        }
    }

    #[test]
    fn initiative_sorts_highest_first_with_id_tiebreak() {
        let units = vec![unit("b", 0, 0, 5), unit("c", 1, 0, 7), unit("a", 2, 0, 5)];
        let order = compute_initiative(&units);
        assert_eq!(
            order,
            vec![UnitId::new("c"), UnitId::new("a"), UnitId::new("b")]
        );
    }

    #[test]
    fn initiative_skips_dead_units() {
        let mut units = vec![unit("a", 0, 0, 5), unit("b", 1, 0, 9)];
        units[1].stats.hp = 0;
        assert_eq!(compute_initiative(&units), vec![UnitId::new("a")]);
    }

    #[test]
    fn remove_unit_keeps_turn_pointer_on_successor() {
        let units = vec![unit("a", 0, 0, 9), unit("b", 1, 0, 5), unit("c", 2, 0, 3)];
        let mut state = GameState::new_game(GameMap::standard(), units);
        state.combat.current_index = 2; // c is acting
        assert!(state.remove_unit(&UnitId::new("a")));
        assert_eq!(state.combat.current_index, 1);
        assert_eq!(
            state.combat.initiative_order,
            vec![UnitId::new("b"), UnitId::new("c")]
        );
    }

    #[test]
    fn invariants_catch_shared_tiles() {
        let units = vec![unit("a", 3, 3, 5), unit("b", 3, 3, 4)];
        let state = GameState::new_game(GameMap::standard(), units);
        assert_eq!(
            state.check_invariants(),
            Err(InvariantViolation::SharedTile(Position::new(3, 3)))
        );
    }

    #[test]
    fn invariants_catch_hp_out_of_bounds() {
        let mut units = vec![unit("a", 3, 3, 5)];
        units[0].stats.hp = 12;
        let state = GameState::new_game(GameMap::standard(), units);
        assert!(matches!(
            state.check_invariants(),
            Err(InvariantViolation::HpOutOfBounds { .. })
        ));
    }

    #[test]
    fn state_survives_serialization_round_trip() {
        let units = vec![unit("a", 0, 0, 5), unit("b", 1, 0, 3)];
        let mut state = GameState::new_game(GameMap::standard(), units);
        state.inventory.gold = 42;
        state.inventory.weapons.push(WeaponInstance {
            instance_id: "w-1".into(),
            weapon_id: "longsword".into(),
            name: "Longsword".into(),
        });
        let encoded = serde_json::to_string(&state).expect("serialize");
        let decoded: GameState = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(state, decoded);
    }
}
