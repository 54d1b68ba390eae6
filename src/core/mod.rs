//! Core primitives.
//!
//! Identifiers, spatial math and the seeded RNG used for spawn placement.
//! Nothing here touches I/O or wall-clock time.

pub mod ids;
pub mod math;
pub mod rng;

// Re-export core types
pub use ids::{ConnectionId, EntityId, ExternalId, LevelId, SessionId};
pub use math::{Quat, Transform, Vec3};
pub use rng::{derive_match_seed, DeterministicRng};
