//! The fixed content catalogs. DM grants and spawns are validated against
//! these tables, nothing outside them can enter a game.

use crate::state::UnitStats;

/// A weapon the DM can grant into the shared inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeaponSpec {
    pub id: &'static str,
    pub name: &'static str,
}

/// A monster type the DM can spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonsterSpec {
    pub id: &'static str,
    pub name: &'static str,
    pub hp: i32,
    pub attack: i32,
    pub defense: i32,
    pub initiative: i32,
    pub move_range: i32,
    pub attack_range: i32,
}

impl MonsterSpec {
    pub fn stats(&self) -> UnitStats {
        UnitStats {
            hp: self.hp,
            max_hp: self.hp,
            attack: self.attack,
            defense: self.defense,
            initiative: self.initiative,
            move_range: self.move_range,
            attack_range: self.attack_range,
        }
    }
}

static WEAPONS: [WeaponSpec; 5] = [
    WeaponSpec { id: "dagger", name: "Dagger" },
    WeaponSpec { id: "shortsword", name: "Shortsword" },
    WeaponSpec { id: "longsword", name: "Longsword" },
    WeaponSpec { id: "warhammer", name: "Warhammer" },
    WeaponSpec { id: "longbow", name: "Longbow" },
];

#[rustfmt::skip]
static MONSTERS: [MonsterSpec; 4] = [
    MonsterSpec { id: "goblin",   name: "Goblin",   hp: 6,  attack: 2, defense: 0, initiative: 6, move_range: 4, attack_range: 1 },
    MonsterSpec { id: "skeleton", name: "Skeleton", hp: 8,  attack: 3, defense: 1, initiative: 4, move_range: 3, attack_range: 1 },
    MonsterSpec { id: "orc",      name: "Orc",      hp: 12, attack: 4, defense: 2, initiative: 3, move_range: 3, attack_range: 1 },
    MonsterSpec { id: "ogre",     name: "Ogre",     hp: 20, attack: 6, defense: 3, initiative: 1, move_range: 2, attack_range: 1 },
];

pub fn weapon_catalog() -> &'static [WeaponSpec] {
    &WEAPONS
}

pub fn monster_catalog() -> &'static [MonsterSpec] {
    &MONSTERS
}

pub fn lookup_weapon(id: &str) -> Option<&'static WeaponSpec> {
    WEAPONS.iter().find(|w| w.id == id)
}

pub fn lookup_monster(id: &str) -> Option<&'static MonsterSpec> {
    MONSTERS.iter().find(|m| m.id == id)
}

/// The character level for an xp total: `floor(sqrt(xp / 100)) + 1`.
pub fn level_for_xp(xp: i64) -> u32 {
    let base = (xp.max(0) / 100) as f64;
    base.sqrt().floor() as u32 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookups() {
        assert!(lookup_weapon("longsword").is_some());
        assert!(lookup_weapon("excalibur").is_none());
        assert_eq!(lookup_monster("goblin").unwrap().hp, 6);
        assert!(lookup_monster("dragon").is_none());
    }

    #[test]
    fn level_curve_matches_formula() {
        assert_eq!(level_for_xp(0), 1);
        assert_eq!(level_for_xp(99), 1);
        assert_eq!(level_for_xp(100), 2);
        assert_eq!(level_for_xp(399), 2);
        assert_eq!(level_for_xp(400), 3);
        assert_eq!(level_for_xp(900), 4);
    }
}
