//! Session Context
//!
//! Process-local, non-replicated settings carried from lobby formation to
//! match start: which level to play and for how long. One value is owned by
//! the node and handed by reference to the roster and match controller.

use crate::core::ids::LevelId;
use crate::game::catalog::LevelCatalog;

/// Match length used when no catalog entry supplies one (seconds).
pub const DEFAULT_MATCH_SECONDS: u32 = 180;

/// Shortest match a catalog entry may request (seconds).
pub const MIN_CATALOG_MATCH_SECONDS: u32 = 30;

/// Transient lobby-to-match settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// Level chosen for the next match (empty = none).
    pub selected_level: LevelId,
    /// Match duration in seconds as requested.
    pub match_seconds: u32,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            selected_level: LevelId::none(),
            match_seconds: DEFAULT_MATCH_SECONDS,
        }
    }
}

impl SessionContext {
    /// Create with an explicit level and duration.
    pub fn new(selected_level: LevelId, match_seconds: u32) -> Self {
        Self { selected_level, match_seconds }
    }

    /// Build from a catalog selection made while hosting.
    ///
    /// An out-of-range index yields an empty level and the default duration.
    pub fn from_selection(catalog: &LevelCatalog, index: usize) -> Self {
        match catalog.get(index) {
            Some(entry) => Self {
                selected_level: entry.level_id.clone(),
                match_seconds: entry.default_match_seconds.max(MIN_CATALOG_MATCH_SECONDS),
            },
            None => Self::default(),
        }
    }

    /// Whether a level has been selected.
    pub fn has_level(&self) -> bool {
        !self.selected_level.is_empty()
    }

    /// Duration the match controller should run, never below one second.
    pub fn match_duration(&self) -> u32 {
        self.match_seconds.max(1)
    }

    /// Overwrite with the values from a force-start order.
    pub fn populate(&mut self, level: LevelId, match_seconds: u32) {
        self.selected_level = level;
        self.match_seconds = match_seconds;
    }
}
