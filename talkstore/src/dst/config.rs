//! SimConfig - Simulation Configuration
//!
//! `TigerStyle`: Seed management for deterministic testing.

use std::env;

use rand::Rng;

/// Environment variable carrying a replay seed.
pub const DST_SEED_ENV: &str = "DST_SEED";

/// Configuration for a simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    seed: u64,
}

impl SimConfig {
    /// Create config with explicit seed.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self { seed }
    }

    /// Create config from `DST_SEED` or a random seed.
    ///
    /// The chosen seed is logged so a failing run can be replayed.
    #[must_use]
    pub fn from_env_or_random() -> Self {
        let parsed = env::var(DST_SEED_ENV)
            .ok()
            .and_then(|raw| match raw.parse::<u64>() {
                Ok(seed) => Some(seed),
                Err(_) => {
                    tracing::warn!(value = %raw, "ignoring malformed DST_SEED");
                    None
                }
            });

        let seed = parsed.unwrap_or_else(|| {
            let seed = rand::thread_rng().gen::<u64>();
            tracing::info!(seed, "DST: generated random seed (replay with DST_SEED={seed})");
            seed
        });
        Self::with_seed(seed)
    }

    /// Get the seed.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::from_env_or_random()
    }
}
