//! Spawn Zones
//!
//! Box-shaped regions authored in a level from which respawn points are
//! drawn uniformly in the zone's local frame.

use serde::{Serialize, Deserialize};

use crate::core::math::{Transform, Vec3};
use crate::core::rng::DeterministicRng;

/// Local height above the zone origin at which avatars are placed.
pub const SPAWN_HEIGHT: f32 = 0.2;

/// Default authored zone size (full extents).
pub const DEFAULT_ZONE_SIZE: Vec3 = Vec3::new(8.0, 2.0, 8.0);

/// A spawn region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpawnZone {
    /// Zone origin and orientation in world space.
    pub transform: Transform,
    /// Half size of the box along local X/Y/Z.
    pub half_extents: Vec3,
}

impl SpawnZone {
    /// Create from a transform and half extents.
    pub fn new(transform: Transform, half_extents: Vec3) -> Self {
        Self { transform, half_extents: half_extents.abs() }
    }

    /// Create from full box size, as authored in level files.
    pub fn from_size(transform: Transform, size: Vec3) -> Self {
        Self::new(transform, size.scale(0.5))
    }

    /// Draw a local-space point: x and z uniform within the half extents,
    /// y fixed at [`SPAWN_HEIGHT`].
    pub fn sample_local(&self, rng: &mut DeterministicRng) -> Vec3 {
        let hx = self.half_extents.x;
        let hz = self.half_extents.z;
        Vec3::new(
            rng.next_f32_range(-hx, hx),
            SPAWN_HEIGHT,
            rng.next_f32_range(-hz, hz),
        )
    }

    /// Draw a world-space respawn point.
    pub fn random_point(&self, rng: &mut DeterministicRng) -> Vec3 {
        self.transform.transform_point(self.sample_local(rng))
    }

    /// Facing direction for spawned avatars.
    pub fn forward(&self) -> Vec3 {
        self.transform.forward()
    }
}

impl Default for SpawnZone {
    fn default() -> Self {
        Self::from_size(Transform::default(), DEFAULT_ZONE_SIZE)
    }
}
