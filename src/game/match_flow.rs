//! Match Flow
//!
//! Authority-side lifecycle of one match:
//!
//! ```text
//! start ──1s──> tick ──1s──> tick ... ──> 0 (Expired) ──grace──> TeardownDue
//! ```
//!
//! The controller is driven by wall-clock seconds passed into `update`.
//! Missed seconds are caught up one at a time and expiry is latched, so a
//! stalled loop can never skip or repeat the end-of-match signal.

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core::ids::{ConnectionId, EntityId};
use crate::core::math::Vec3;
use crate::core::rng::DeterministicRng;
use crate::game::context::SessionContext;
use crate::game::spawn::SpawnZone;

// =============================================================================
// COLLABORATOR
// =============================================================================

/// Movement collaborator that owns avatar entities.
pub trait AvatarDriver: Send {
    /// Connection that owns an avatar, if the entity exists.
    fn owner_of(&self, entity: EntityId) -> Option<ConnectionId>;

    /// Place an avatar at `position` facing `forward`, clearing its velocity.
    fn teleport(&mut self, entity: EntityId, position: Vec3, forward: Vec3);
}

#[cfg(any(test, feature = "demo"))]
pub use registry::{AvatarRegistry, AvatarState};

#[cfg(any(test, feature = "demo"))]
mod registry {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    use super::AvatarDriver;
    use crate::core::ids::{ConnectionId, EntityId};
    use crate::core::math::Vec3;

    /// Avatar state kept by [`AvatarRegistry`].
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct AvatarState {
        /// Owning connection.
        pub owner: ConnectionId,
        /// World position.
        pub position: Vec3,
        /// Facing direction.
        pub forward: Vec3,
        /// Respawn teleports so far.
        pub teleports: u32,
    }

    /// Shared in-memory avatar table.
    ///
    /// Cloning shares the table, so a host application can keep a handle while
    /// the node owns another.
    #[derive(Debug, Clone, Default)]
    pub struct AvatarRegistry {
        avatars: Arc<Mutex<BTreeMap<EntityId, AvatarState>>>,
    }

    impl AvatarRegistry {
        /// Create an empty registry.
        pub fn new() -> Self {
            Self::default()
        }

        /// Register an avatar for `owner` at `position`.
        pub fn spawn(&self, entity: EntityId, owner: ConnectionId, position: Vec3) {
            let state = AvatarState { owner, position, forward: Vec3::FORWARD, teleports: 0 };
            self.lock().insert(entity, state);
        }

        /// Move an avatar without counting a teleport (physics step).
        pub fn set_position(&self, entity: EntityId, position: Vec3) {
            if let Some(a) = self.lock().get_mut(&entity) {
                a.position = position;
            }
        }

        /// Current state of an avatar.
        pub fn get(&self, entity: EntityId) -> Option<AvatarState> {
            self.lock().get(&entity).copied()
        }

        fn lock(&self) -> MutexGuard<'_, BTreeMap<EntityId, AvatarState>> {
            self.avatars.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl AvatarDriver for AvatarRegistry {
        fn owner_of(&self, entity: EntityId) -> Option<ConnectionId> {
            self.lock().get(&entity).map(|a| a.owner)
        }

        fn teleport(&mut self, entity: EntityId, position: Vec3, forward: Vec3) {
            if let Some(a) = self.lock().get_mut(&entity) {
                a.position = position;
                a.forward = forward;
                a.teleports += 1;
            }
        }
    }
}

// =============================================================================
// ERRORS & SIGNALS
// =============================================================================

/// Match controller errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    /// The level has no spawn zone; respawns cannot be placed.
    #[error("no spawn zone in the match level")]
    SpawnZoneMissing,
    /// Respawn requested for an entity the driver does not know.
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),
    /// Respawn requested by a connection that does not own the entity.
    #[error("connection {sender} does not own entity {entity}")]
    NotOwner {
        /// Entity to respawn.
        entity: EntityId,
        /// Requesting connection.
        sender: ConnectionId,
    },
}

/// Output of [`MatchController::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSignal {
    /// One second elapsed; new remaining value.
    TimerChanged(u32),
    /// Timer reached zero. Emitted once per match.
    Expired,
    /// Grace period after expiry elapsed. Emitted once per match.
    TeardownDue,
}

/// Fixed parameters for a match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchSettings {
    /// Height below which avatars count as fallen.
    pub kill_y: f32,
    /// Delay between expiry and teardown (seconds).
    pub teardown_grace: f64,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self { kill_y: -100.0, teardown_grace: 0.5 }
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Authority-side match state.
#[derive(Debug, Clone)]
pub struct MatchController {
    remaining: u32,
    spawn: Option<SpawnZone>,
    rng: DeterministicRng,
    settings: MatchSettings,
    next_tick_at: f64,
    expired: bool,
    teardown_at: Option<f64>,
    teardown_fired: bool,
}

impl MatchController {
    /// Start a match at `now` using the context's duration and the level's
    /// spawn zones.
    pub fn start(
        context: &SessionContext,
        zones: &[SpawnZone],
        now: f64,
        rng: DeterministicRng,
        settings: MatchSettings,
    ) -> Self {
        let remaining = context.match_duration();

        let spawn = match zones {
            [] => {
                error!("{} in {}", MatchError::SpawnZoneMissing, context.selected_level);
                None
            }
            [only] => Some(*only),
            [first, ..] => {
                warn!(
                    "{} spawn zones in {}; using the first",
                    zones.len(),
                    context.selected_level
                );
                Some(*first)
            }
        };

        info!("Match started: level={} t={}s", context.selected_level, remaining);

        Self {
            remaining,
            spawn,
            rng,
            settings,
            next_tick_at: now + 1.0,
            expired: false,
            teardown_at: None,
            teardown_fired: false,
        }
    }

    /// Advance to `now`.
    pub fn update(&mut self, now: f64) -> Vec<MatchSignal> {
        let mut signals = Vec::new();

        while !self.expired && now >= self.next_tick_at {
            let tick_at = self.next_tick_at;
            self.next_tick_at += 1.0;
            self.remaining = self.remaining.saturating_sub(1);
            signals.push(MatchSignal::TimerChanged(self.remaining));

            if self.remaining == 0 {
                info!("Match timer expired");
                self.expired = true;
                self.teardown_at = Some(tick_at + self.settings.teardown_grace);
                signals.push(MatchSignal::Expired);
            }
        }

        if let Some(at) = self.teardown_at {
            if !self.teardown_fired && now >= at {
                self.teardown_fired = true;
                signals.push(MatchSignal::TeardownDue);
            }
        }

        signals
    }

    /// Draw a respawn point and facing.
    pub fn respawn_point(&mut self) -> Result<(Vec3, Vec3), MatchError> {
        let zone = self.spawn.as_ref().ok_or(MatchError::SpawnZoneMissing)?;
        Ok((zone.random_point(&mut self.rng), zone.forward()))
    }

    /// Teleport `entity` to a fresh respawn point.
    pub fn respawn(
        &mut self,
        entity: EntityId,
        driver: &mut dyn AvatarDriver,
    ) -> Result<Vec3, MatchError> {
        if driver.owner_of(entity).is_none() {
            return Err(MatchError::UnknownEntity(entity));
        }

        let (position, forward) = self.respawn_point()?;
        debug!("Respawn {} at {}", entity, position);
        driver.teleport(entity, position, forward);
        Ok(position)
    }

    /// Seconds left.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Height below which avatars count as fallen.
    pub fn kill_y(&self) -> f32 {
        self.settings.kill_y
    }

    /// Whether the timer reached zero.
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Zone respawns are drawn from, if the level had one.
    pub fn spawn_zone(&self) -> Option<&SpawnZone> {
        self.spawn.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::LevelId;
    use crate::core::math::Transform;
    use proptest::prelude::*;

    fn ctx(seconds: u32) -> SessionContext {
        SessionContext::new(LevelId::new("Surf_Intro"), seconds)
    }

    fn start(seconds: u32, zones: &[SpawnZone], now: f64) -> MatchController {
        MatchController::start(
            &ctx(seconds),
            zones,
            now,
            DeterministicRng::new(1),
            MatchSettings::default(),
        )
    }

    #[test]
    fn test_counts_down_once_per_second() {
        let mut m = start(3, &[SpawnZone::default()], 0.0);
        assert_eq!(m.remaining(), 3);

        assert!(m.update(0.99).is_empty());
        assert_eq!(m.update(1.0), vec![MatchSignal::TimerChanged(2)]);
        assert!(m.update(1.5).is_empty());
        assert_eq!(m.update(2.0), vec![MatchSignal::TimerChanged(1)]);
        assert_eq!(
            m.update(3.0),
            vec![MatchSignal::TimerChanged(0), MatchSignal::Expired]
        );
        assert!(m.update(3.4).is_empty());
        assert_eq!(m.update(3.5), vec![MatchSignal::TeardownDue]);
        assert!(m.update(10.0).is_empty());
        assert_eq!(m.remaining(), 0);
    }

    #[test]
    fn test_zero_duration_runs_one_second() {
        let mut m = start(0, &[SpawnZone::default()], 5.0);
        assert_eq!(m.remaining(), 1);
        assert_eq!(
            m.update(6.0),
            vec![MatchSignal::TimerChanged(0), MatchSignal::Expired]
        );
    }

    #[test]
    fn test_stall_catches_up_and_latches() {
        let mut m = start(3, &[SpawnZone::default()], 0.0);

        // Ten seconds stalled: three ticks, one expiry, teardown 0.5s after the last tick
        let signals = m.update(10.0);
        assert_eq!(
            signals,
            vec![
                MatchSignal::TimerChanged(2),
                MatchSignal::TimerChanged(1),
                MatchSignal::TimerChanged(0),
                MatchSignal::Expired,
                MatchSignal::TeardownDue,
            ]
        );
        assert!(m.update(20.0).is_empty());
    }

    #[test]
    fn test_missing_spawn_zone() {
        let mut m = start(60, &[], 0.0);
        assert!(m.spawn_zone().is_none());
        assert_eq!(m.respawn_point(), Err(MatchError::SpawnZoneMissing));

        // Match still runs
        assert_eq!(m.update(1.0), vec![MatchSignal::TimerChanged(59)]);
    }

    #[test]
    fn test_multiple_zones_uses_first() {
        let first = SpawnZone::from_size(Transform::from_origin(Vec3::new(0.0, 0.0, 0.0)), Vec3::ZERO);
        let second = SpawnZone::from_size(Transform::from_origin(Vec3::new(50.0, 0.0, 0.0)), Vec3::ZERO);
        let mut m = start(60, &[first, second], 0.0);

        let (p, _) = m.respawn_point().unwrap();
        assert!(p.approx_eq(Vec3::new(0.0, 0.2, 0.0), 1e-6));
    }

    #[test]
    fn test_respawn_teleports() {
        let mut avatars = AvatarRegistry::new();
        avatars.spawn(EntityId(7), ConnectionId(1), Vec3::new(0.0, -150.0, 0.0));

        let mut m = start(60, &[SpawnZone::default()], 0.0);
        let pos = m.respawn(EntityId(7), &mut avatars).unwrap();

        let state = avatars.get(EntityId(7)).unwrap();
        assert_eq!(state.position, pos);
        assert_eq!(state.forward, Vec3::FORWARD);
        assert_eq!(state.teleports, 1);
        assert_eq!(pos.y, 0.2);

        assert_eq!(
            m.respawn(EntityId(99), &mut avatars),
            Err(MatchError::UnknownEntity(EntityId(99)))
        );
    }

    proptest! {
        #[test]
        fn prop_timer_floor_and_single_expiry(
            seconds in 0u32..20,
            steps in proptest::collection::vec(0.0f64..3.0, 1..60),
        ) {
            let mut m = start(seconds, &[SpawnZone::default()], 0.0);
            let mut now = 0.0;
            let mut expired = 0;
            let mut teardowns = 0;

            for dt in steps {
                now += dt;
                for s in m.update(now) {
                    match s {
                        MatchSignal::Expired => expired += 1,
                        MatchSignal::TeardownDue => teardowns += 1,
                        MatchSignal::TimerChanged(_) => {}
                    }
                }
            }
            // Flush everything
            for s in m.update(now + 100.0) {
                match s {
                    MatchSignal::Expired => expired += 1,
                    MatchSignal::TeardownDue => teardowns += 1,
                    MatchSignal::TimerChanged(_) => {}
                }
            }

            prop_assert_eq!(expired, 1);
            prop_assert_eq!(teardowns, 1);
            prop_assert_eq!(m.remaining(), 0);
        }
    }
}
