//! Simulated environment: virtual clock and seeded randomness.
//!
//! Every clone shares one clock and one RNG, so a server, its clients and
//! the test driving them all observe the same time and draw from one
//! deterministic stream. Time only moves when the test calls
//! [`SimEnv::advance`].

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use plansync_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Wall-clock origin of every simulation, 2024-01-01T00:00:00Z.
const EPOCH_MS: u64 = 1_704_067_200_000;

/// Instant on the virtual clock: offset from the simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimInstant(Duration);

impl SimInstant {
    /// Offset from the simulation start.
    pub fn elapsed(self) -> Duration {
        self.0
    }
}

impl std::ops::Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl std::ops::Add<Duration> for SimInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs)
    }
}

#[derive(Debug)]
struct Shared {
    clock: Duration,
    rng: ChaCha8Rng,
}

/// Deterministic [`Environment`] for simulation tests.
#[derive(Debug, Clone)]
pub struct SimEnv {
    shared: Arc<Mutex<Shared>>,
}

impl SimEnv {
    /// Environment seeded with `seed`, clock at zero.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                clock: Duration::ZERO,
                rng: ChaCha8Rng::seed_from_u64(seed),
            })),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.shared.lock().clock += by;
    }

    /// Time since the simulation started.
    pub fn elapsed(&self) -> Duration {
        self.shared.lock().clock
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(self.shared.lock().clock)
    }

    fn wall_clock_ms(&self) -> u64 {
        let elapsed = u64::try_from(self.shared.lock().clock.as_millis()).unwrap_or(u64::MAX);
        EPOCH_MS.saturating_add(elapsed)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.shared.lock().rng.fill_bytes(buffer);
    }
}
