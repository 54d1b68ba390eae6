//! Level Catalog
//!
//! Explicitly authored list of playable levels offered when hosting.

use serde::{Serialize, Deserialize};

use crate::core::ids::LevelId;

/// One playable level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelEntry {
    /// Human-friendly name for menus.
    pub display_name: String,
    /// Exact level id passed to the scene facility.
    pub level_id: LevelId,
    /// Default match time in seconds.
    pub default_match_seconds: u32,
    /// Name of the spawn zone object authored in the level.
    pub spawn_zone_name: String,
}

impl LevelEntry {
    /// Entry with the conventional `StartZone` spawn zone name.
    pub fn new(display_name: &str, level_id: &str, default_match_seconds: u32) -> Self {
        Self {
            display_name: display_name.to_string(),
            level_id: LevelId::new(level_id),
            default_match_seconds,
            spawn_zone_name: "StartZone".to_string(),
        }
    }
}

/// Ordered list of playable levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelCatalog {
    entries: Vec<LevelEntry>,
}

impl Default for LevelCatalog {
    fn default() -> Self {
        Self::new(vec![LevelEntry::new("Surf Intro", "Surf_Intro", 180)])
    }
}

impl LevelCatalog {
    /// Create from entries in menu order.
    pub fn new(entries: Vec<LevelEntry>) -> Self {
        Self { entries }
    }

    /// Entry at a menu index.
    pub fn get(&self, index: usize) -> Option<&LevelEntry> {
        self.entries.get(index)
    }
}
