//! Death Watch
//!
//! Participant-side fall detection. When an owned avatar drops below the
//! kill height a countdown starts; when it elapses the avatar is due for a
//! respawn request and the watch re-arms.

use std::collections::BTreeMap;
use tracing::info;

use crate::core::ids::EntityId;

/// Fall detector for the avatars this participant owns.
#[derive(Debug, Clone)]
pub struct DeathWatch {
    kill_y: f32,
    delay: f64,
    deadlines: BTreeMap<EntityId, f64>,
}

impl DeathWatch {
    /// Create with a kill height and respawn delay in seconds.
    pub fn new(kill_y: f32, delay: f64) -> Self {
        Self { kill_y, delay, deadlines: BTreeMap::new() }
    }

    /// Report an avatar height. Starts a countdown if the avatar fell and
    /// none is running.
    pub fn observe(&mut self, entity: EntityId, height: f32, now: f64) {
        if height < self.kill_y && !self.deadlines.contains_key(&entity) {
            info!("Avatar {} fell below {}; respawn in {}s", entity, self.kill_y, self.delay);
            self.deadlines.insert(entity, now + self.delay);
        }
    }

    /// Avatars whose countdown elapsed by `now`. Each is returned once.
    pub fn update(&mut self, now: f64) -> Vec<EntityId> {
        let due: Vec<EntityId> = self
            .deadlines
            .iter()
            .filter(|(_, at)| now >= **at)
            .map(|(id, _)| *id)
            .collect();

        for id in &due {
            self.deadlines.remove(id);
        }
        due
    }

    /// Whole seconds left for the HUD, if a countdown is running.
    pub fn remaining_seconds(&self, entity: EntityId, now: f64) -> Option<u32> {
        self.deadlines
            .get(&entity)
            .map(|at| (at - now).max(0.0).ceil() as u32)
    }

    /// Drop every running countdown.
    pub fn reset(&mut self) {
        self.deadlines.clear();
    }
}
