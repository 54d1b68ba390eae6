//! Game Logic Module
//!
//! Session state that the authority owns and participants mirror, plus the
//! match clock and respawn placement. Every type here is driven by explicit
//! `now` timestamps, so it can be stepped deterministically in tests.
//!
//! ## Module Structure
//!
//! - `catalog`: Levels offered when hosting
//! - `context`: Lobby-to-match settings (level, duration)
//! - `roster`: Per-connection readiness and identity
//! - `config_store`: Replicated movement tunables
//! - `console`: `key value` command parsing
//! - `spawn`: Spawn zones and respawn point sampling
//! - `match_flow`: Match timer, expiry and respawn authority
//! - `death_watch`: Participant-side fall detection

pub mod catalog;
pub mod context;
pub mod roster;
pub mod config_store;
pub mod console;
pub mod spawn;
pub mod match_flow;
pub mod death_watch;

// Re-export key types
pub use catalog::{LevelCatalog, LevelEntry};
pub use context::SessionContext;
pub use roster::{LobbyRow, RosterEntry, RosterError, RosterView, SessionRoster};
pub use config_store::{ConfigKind, ConfigStore, ConfigValue, ConfigView, MotorTuning};
pub use console::{ConsoleCommand, ConsoleError};
pub use spawn::SpawnZone;
pub use match_flow::{AvatarDriver, MatchController, MatchError, MatchSettings, MatchSignal};
#[cfg(any(test, feature = "demo"))]
pub use match_flow::{AvatarRegistry, AvatarState};
pub use death_watch::DeathWatch;
