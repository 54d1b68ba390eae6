//! Config Store
//!
//! Replicated table of named tunables (`sv_*` console variables).
//!
//! The authority seeds the defaults at start and applies every mutation it
//! receives without range or type validation. Readers supply their own
//! default for keys that were never set.

use std::fmt;
use serde::{Serialize, Deserialize};
use tracing::info;

use crate::network::replica::{MapOp, Mirror, Owner, ReplicaRole, ReplicatedMap};

// =============================================================================
// KEYS & DEFAULTS
// =============================================================================

/// Ground max speed.
pub const SV_MAXSPEED: &str = "sv_maxspeed";
/// Air acceleration.
pub const SV_AIRACCELERATE: &str = "sv_airaccelerate";
/// Ground acceleration.
pub const SV_ACCELERATE: &str = "sv_accelerate";
/// Ground friction.
pub const SV_FRICTION: &str = "sv_friction";
/// Friction while surfing a ramp.
pub const SV_SURF_FRICTION: &str = "sv_surf_friction";
/// Gravity.
pub const SV_GRAVITY: &str = "sv_gravity";
/// Air speed cap (0 = uncapped).
pub const SV_AIRCAP: &str = "sv_aircap";
/// Auto bunny-hop toggle.
pub const SV_AUTOBHOP: &str = "sv_autobhop";

/// Entries seeded by the authority at start.
pub const DEFAULT_ENTRIES: [(&str, ConfigValue); 8] = [
    (SV_ACCELERATE, ConfigValue::Float(14.0)),
    (SV_AIRACCELERATE, ConfigValue::Float(80.0)),
    (SV_FRICTION, ConfigValue::Float(6.0)),
    (SV_SURF_FRICTION, ConfigValue::Float(0.5)),
    (SV_GRAVITY, ConfigValue::Float(30.0)),
    (SV_AUTOBHOP, ConfigValue::Int(1)),
    (SV_MAXSPEED, ConfigValue::Float(7.0)),
    (SV_AIRCAP, ConfigValue::Float(0.0)),
];

/// Value kind of a known key, if the key is known.
pub fn kind_of(key: &str) -> Option<ConfigKind> {
    DEFAULT_ENTRIES
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.kind())
}

// =============================================================================
// VALUES
// =============================================================================

/// Value kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKind {
    /// `f32` value.
    Float,
    /// `i32` value.
    Int,
}

/// A tunable value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigValue {
    /// Float tunable.
    Float(f32),
    /// Integer tunable.
    Int(i32),
}

impl ConfigValue {
    /// Kind of this value.
    pub fn kind(&self) -> ConfigKind {
        match self {
            ConfigValue::Float(_) => ConfigKind::Float,
            ConfigValue::Int(_) => ConfigKind::Int,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Float(v) => write!(f, "{}", v),
            ConfigValue::Int(v) => write!(f, "{}", v),
        }
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Replicated tunables.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore<R: ReplicaRole = Owner> {
    entries: ReplicatedMap<String, ConfigValue, R>,
}

/// Participant-side mirror.
pub type ConfigView = ConfigStore<Mirror>;

impl<R: ReplicaRole> ConfigStore<R> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self { entries: ReplicatedMap::new() }
    }

    /// Raw entry.
    pub fn get(&self, key: &str) -> Option<ConfigValue> {
        self.entries.get(&key.to_string()).copied()
    }

    /// Float value, or `default` when the key is unset or holds an int.
    pub fn get_float(&self, key: &str, default: f32) -> f32 {
        match self.get(key) {
            Some(ConfigValue::Float(v)) => v,
            _ => default,
        }
    }

    /// Int value, or `default` when the key is unset or holds a float.
    pub fn get_int(&self, key: &str, default: i32) -> i32 {
        match self.get(key) {
            Some(ConfigValue::Int(v)) => v,
            _ => default,
        }
    }

    /// All entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ConfigValue)> + '_ {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ConfigStore<Owner> {
    /// Clear and seed [`DEFAULT_ENTRIES`].
    pub fn initialize_defaults(&mut self) {
        self.entries.clear();
        for (key, value) in DEFAULT_ENTRIES {
            self.entries.insert(key.to_string(), value);
        }
        info!("Config initialized with {} defaults", DEFAULT_ENTRIES.len());
    }

    /// Set a float entry.
    pub fn set_float(&mut self, key: &str, value: f32) {
        self.set(key, ConfigValue::Float(value));
    }

    /// Set an int entry.
    pub fn set_int(&mut self, key: &str, value: i32) {
        self.set(key, ConfigValue::Int(value));
    }

    /// Set an entry of either kind.
    pub fn set(&mut self, key: &str, value: ConfigValue) {
        info!("Config {} = {}", key, value);
        self.entries.insert(key.to_string(), value);
    }

    /// Take pending replication ops.
    pub fn drain_changes(&mut self) -> Vec<MapOp<String, ConfigValue>> {
        self.entries.drain_changes()
    }

    /// Full table for a late joiner.
    pub fn snapshot(&self) -> Vec<MapOp<String, ConfigValue>> {
        self.entries.snapshot()
    }
}

impl ConfigStore<Mirror> {
    /// Apply a replicated op.
    pub(crate) fn apply(&mut self, op: MapOp<String, ConfigValue>) {
        self.entries.apply(op);
    }
}

// =============================================================================
// MOTOR TUNING
// =============================================================================

/// Movement parameters read by the motor each frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorTuning {
    /// `sv_maxspeed`.
    pub max_speed: f32,
    /// `sv_airaccelerate`.
    pub air_accelerate: f32,
    /// `sv_accelerate`.
    pub accelerate: f32,
    /// `sv_friction`.
    pub friction: f32,
    /// `sv_surf_friction`.
    pub surf_friction: f32,
    /// `sv_gravity`.
    pub gravity: f32,
    /// `sv_aircap`.
    pub air_cap: f32,
    /// `sv_autobhop != 0`.
    pub auto_bhop: bool,
}

impl Default for MotorTuning {
    fn default() -> Self {
        Self {
            max_speed: 7.0,
            air_accelerate: 80.0,
            accelerate: 14.0,
            friction: 6.0,
            surf_friction: 0.5,
            gravity: 30.0,
            air_cap: 0.0,
            auto_bhop: true,
        }
    }
}

impl MotorTuning {
    /// Read from either side's store, falling back to the built-in defaults.
    pub fn from_config<R: ReplicaRole>(config: &ConfigStore<R>) -> Self {
        let d = Self::default();
        Self {
            max_speed: config.get_float(SV_MAXSPEED, d.max_speed),
            air_accelerate: config.get_float(SV_AIRACCELERATE, d.air_accelerate),
            accelerate: config.get_float(SV_ACCELERATE, d.accelerate),
            friction: config.get_float(SV_FRICTION, d.friction),
            surf_friction: config.get_float(SV_SURF_FRICTION, d.surf_friction),
            gravity: config.get_float(SV_GRAVITY, d.gravity),
            air_cap: config.get_float(SV_AIRCAP, d.air_cap),
            auto_bhop: config.get_int(SV_AUTOBHOP, 1) != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_initialize_defaults() {
        let mut store = ConfigStore::new();
        store.initialize_defaults();

        assert_eq!(store.len(), 8);
        assert_eq!(store.get_float(SV_GRAVITY, 0.0), 30.0);
        assert_eq!(store.get_float(SV_SURF_FRICTION, 0.0), 0.5);
        assert_eq!(store.get_int(SV_AUTOBHOP, 0), 1);
    }

    #[test]
    fn test_missing_key_returns_default() {
        let store: ConfigStore = ConfigStore::new();
        assert_eq!(store.get_float("sv_unknown", 3.5), 3.5);
        assert_eq!(store.get_int("sv_unknown", -2), -2);
    }

    #[test]
    fn test_kind_mismatch_returns_default() {
        let mut store = ConfigStore::new();
        store.set_int(SV_GRAVITY, 10);
        assert_eq!(store.get_float(SV_GRAVITY, 30.0), 30.0);
        assert_eq!(store.get_int(SV_GRAVITY, 0), 10);
    }

    #[test]
    fn test_no_validation() {
        let mut store = ConfigStore::new();
        store.set_float(SV_GRAVITY, -1.0e9);
        assert_eq!(store.get_float(SV_GRAVITY, 0.0), -1.0e9);
    }

    #[test]
    fn test_kind_of() {
        assert_eq!(kind_of(SV_AUTOBHOP), Some(ConfigKind::Int));
        assert_eq!(kind_of(SV_MAXSPEED), Some(ConfigKind::Float));
        assert_eq!(kind_of("mp_timelimit"), None);
    }

    #[test]
    fn test_motor_tuning_reads_mirror() {
        let mut store = ConfigStore::new();
        store.initialize_defaults();
        store.set_float(SV_MAXSPEED, 9.5);
        store.set_int(SV_AUTOBHOP, 0);

        let mut view = ConfigView::new();
        for op in store.drain_changes() {
            view.apply(op);
        }

        let tuning = MotorTuning::from_config(&view);
        assert_eq!(tuning.max_speed, 9.5);
        assert!(!tuning.auto_bhop);
        assert_eq!(tuning.air_accelerate, 80.0);
    }

    #[test]
    fn test_motor_tuning_empty_store() {
        let store: ConfigStore = ConfigStore::new();
        assert_eq!(MotorTuning::from_config(&store), MotorTuning::default());
    }

    proptest! {
        #[test]
        fn prop_read_after_write(value in proptest::num::f32::NORMAL, default in -100.0f32..100.0) {
            let mut store = ConfigStore::new();
            prop_assert_eq!(store.get_float("sv_custom", default), default);

            store.set_float("sv_custom", value);
            prop_assert_eq!(store.get_float("sv_custom", default), value);
            prop_assert_eq!(store.get_float("sv_other", default), default);
        }
    }
}
