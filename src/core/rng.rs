//! Seeded Random Number Generator
//!
//! Uses Xorshift128+ for fast, reproducible randomness.
//! The authority seeds one generator per match so respawn draws can be
//! replayed from the session id and level alone.

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

use super::ids::{LevelId, SessionId};

/// Seeded PRNG using the Xorshift128+ algorithm.
///
/// # Example
///
/// ```
/// use surf_lobby::core::rng::DeterministicRng;
///
/// let mut a = DeterministicRng::new(12345);
/// let mut b = DeterministicRng::new(12345);
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// Uses SplitMix64 to initialize the internal state, ensuring
    /// good distribution even from weak seeds.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Ensure state is never all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Create the respawn RNG for one match.
    pub fn for_match(session: SessionId, level: &LevelId, match_index: u32) -> Self {
        Self::new(derive_match_seed(session, level, match_index))
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a float in [0, 1).
    #[inline]
    pub fn next_unit_f32(&mut self) -> f32 {
        // 24 high bits fit the f32 mantissa exactly
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }

    /// Generate a float in [min, max].
    ///
    /// Returns `min` for an empty or inverted range.
    #[inline]
    pub fn next_f32_range(&mut self, min: f32, max: f32) -> f32 {
        if !(min < max) {
            return min;
        }
        let v = min + (max - min) * self.next_unit_f32();
        v.clamp(min, max)
    }
}

/// SplitMix64 for seed initialization.
/// Produces well-distributed values from sequential seeds.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Derive a match seed from the session, level and match counter.
pub fn derive_match_seed(session: SessionId, level: &LevelId, match_index: u32) -> u64 {
    let mut hasher = Sha256::new();

    // Domain separator
    hasher.update(b"SURF_LOBBY_SPAWN_V1");
    hasher.update(session.0.to_le_bytes());
    hasher.update(level.as_str().as_bytes());
    hasher.update(match_index.to_le_bytes());

    let hash = hasher.finalize();

    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[0..8]);
    u64::from_le_bytes(seed)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_determinism() {
        // Same seed must produce same sequence
        let mut rng1 = DeterministicRng::new(12345);
        let mut rng2 = DeterministicRng::new(12345);

        for _ in 0..1000 {
            assert_eq!(rng1.next_u64(), rng2.next_u64());
        }
    }

    #[test]
    fn test_rng_different_seeds() {
        let mut rng1 = DeterministicRng::new(12345);
        let mut rng2 = DeterministicRng::new(54321);

        // Very unlikely to match
        assert_ne!(rng1.next_u64(), rng2.next_u64());
    }

    #[test]
    fn test_unit_range() {
        let mut rng = DeterministicRng::new(9999);

        for _ in 0..10_000 {
            let v = rng.next_unit_f32();
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn test_f32_range_bounds() {
        let mut rng = DeterministicRng::new(7777);

        for _ in 0..10_000 {
            let v = rng.next_f32_range(-4.0, 4.0);
            assert!((-4.0..=4.0).contains(&v));
        }

        // Degenerate ranges
        assert_eq!(rng.next_f32_range(0.0, 0.0), 0.0);
        assert_eq!(rng.next_f32_range(3.0, -3.0), 3.0);
    }

    #[test]
    fn test_f32_range_covers_both_halves() {
        let mut rng = DeterministicRng::new(31337);
        let draws: Vec<f32> = (0..1000).map(|_| rng.next_f32_range(-1.0, 1.0)).collect();

        assert!(draws.iter().any(|v| *v < -0.5));
        assert!(draws.iter().any(|v| *v > 0.5));
    }

    #[test]
    fn test_derive_match_seed() {
        let level = LevelId::new("Surf_Intro");

        let seed1 = derive_match_seed(SessionId(1), &level, 0);
        let seed2 = derive_match_seed(SessionId(1), &level, 0);
        assert_eq!(seed1, seed2);

        assert_ne!(seed1, derive_match_seed(SessionId(2), &level, 0));
        assert_ne!(seed1, derive_match_seed(SessionId(1), &LevelId::new("Surf_Utopia"), 0));
        assert_ne!(seed1, derive_match_seed(SessionId(1), &level, 1));
    }

    #[test]
    fn test_clone_continues_sequence() {
        let mut rng = DeterministicRng::new(5555);

        for _ in 0..50 {
            rng.next_u64();
        }

        let mut fork = rng.clone();
        for _ in 0..10 {
            assert_eq!(rng.next_u64(), fork.next_u64());
        }
    }
}
