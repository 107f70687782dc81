// =============================================================================
// Game Catalog
// =============================================================================
//
// Per-game knowledge lives here as data: which button combinations are worth
// a policy gate, where the score and lives live in RAM, and how many START
// presses it takes to get from the title screen into play.

#[derive(Clone, Copy, Debug)]
pub struct GameConfig {
    pub name: &'static str,
    /// Curated action list, one Bernoulli gate per entry. An empty gate
    /// vector is the no-op, so none of the lists carry one.
    pub actions: &'static [&'static [&'static str]],
    /// RAM addresses of the on-screen score, one BCD digit per byte, most
    /// significant first. Empty disables score rewards.
    pub score_digits: &'static [u16],
    pub lives_addr: Option<u16>,
    /// Per-frame score jumps at or above this read as mid-update garbage.
    pub max_score_delta: i64,
    pub start_presses: u32,
}

const KUNG_FU_ACTIONS: [&[&str]; 12] = [
    &["RIGHT"],
    &["LEFT"],
    &["DOWN"],
    &["UP"],
    &["RIGHT", "B"],
    &["RIGHT", "A"],
    &["LEFT", "B"],
    &["LEFT", "A"],
    &["DOWN", "B"],
    &["DOWN", "A"],
    &["UP", "B"],
    &["UP", "A"],
];

const MARIO_ACTIONS: [&[&str]; 8] = [
    &["RIGHT"],
    &["RIGHT", "A"],
    &["RIGHT", "B"],
    &["RIGHT", "A", "B"],
    &["A"],
    &["LEFT"],
    &["LEFT", "A"],
    &["DOWN"],
];

const ALL_BUTTONS: [&[&str]; 8] = [
    &["B"],
    &["A"],
    &["SELECT"],
    &["START"],
    &["UP"],
    &["DOWN"],
    &["LEFT"],
    &["RIGHT"],
];

pub fn kung_fu() -> GameConfig {
    GameConfig {
        name: "kung-fu",
        actions: &KUNG_FU_ACTIONS,
        score_digits: &[0x0531, 0x0532, 0x0533, 0x0534, 0x0535, 0x0536],
        lives_addr: Some(0x005C),
        max_score_delta: 5_000,
        start_presses: 2,
    }
}

pub fn super_mario_bros() -> GameConfig {
    GameConfig {
        name: "super-mario-bros",
        actions: &MARIO_ACTIONS,
        score_digits: &[0x07DD, 0x07DE, 0x07DF, 0x07E0, 0x07E1, 0x07E2],
        lives_addr: Some(0x075A),
        max_score_delta: 10_000,
        start_presses: 1,
    }
}

/// Fallback for games without a curated entry: one gate per native button
/// and no RAM map, so reward comes only from wrapper stages and episodes end
/// only at the step cap.
pub fn all_buttons() -> GameConfig {
    GameConfig {
        name: "unknown",
        actions: &ALL_BUTTONS,
        score_digits: &[],
        lives_addr: None,
        max_score_delta: i64::MAX,
        start_presses: 1,
    }
}

pub fn for_name(name: &str) -> GameConfig {
    let key: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    match key.as_str() {
        "kungfu" | "kungfumaster" => kung_fu(),
        "smb" | "mario" | "supermariobros" => super_mario_bros(),
        _ => {
            eprintln!("⚠️ Unknown game {:?}; assuming one action per button", name);
            all_buttons()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionMap, NES_BUTTONS};

    #[test]
    fn every_catalog_entry_resolves_against_the_joypad() {
        for config in [kung_fu(), super_mario_bros(), all_buttons()] {
            let map = ActionMap::new(&NES_BUTTONS, config.actions)
                .unwrap_or_else(|e| panic!("{}: {}", config.name, e));
            assert_eq!(map.num_actions(), config.actions.len());
        }
    }

    #[test]
    fn names_normalize_before_lookup() {
        assert_eq!(for_name("Kung-Fu").name, "kung-fu");
        assert_eq!(for_name("kungfu_master").name, "kung-fu");
        assert_eq!(for_name("SuperMarioBros").name, "super-mario-bros");
        assert_eq!(for_name("SMB").name, "super-mario-bros");
    }

    #[test]
    fn unknown_games_fall_back_to_raw_buttons() {
        let config = for_name("Columns-Genesis");
        assert_eq!(config.actions.len(), NES_BUTTONS.len());
        assert!(config.score_digits.is_empty());
        assert_eq!(config.lives_addr, None);
    }
}
