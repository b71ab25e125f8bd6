//! Fault injection for orchestrator tests.
//!
//! Converts a share of otherwise-successful exchanges into manufactured
//! failures before they are classified. Never configured in production.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use portalsync_protocol::{ErrorCode, NetError};

use crate::config::{FaultConfig, FaultMode};

enum Picker {
    Every { rate: u32, seen: u32 },
    Random { rate: u32, rng: StdRng },
}

pub struct FaultInjector {
    picker: Mutex<Picker>,
    code: ErrorCode,
}

impl FaultInjector {
    /// Fails every `rate`-th exchange: with `rate = 4`, exchanges 4, 8, 12...
    pub fn every(rate: u32) -> Self {
        Self::with_picker(Picker::Every {
            rate: rate.max(1),
            seen: 0,
        })
    }

    /// Fails each exchange with probability `1/rate`, reproducibly for a seed.
    pub fn random(rate: u32, seed: u64) -> Self {
        Self::with_picker(Picker::Random {
            rate: rate.max(1),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn from_config(config: &FaultConfig) -> Self {
        let injector = match config.mode {
            FaultMode::Every => Self::every(config.rate),
            FaultMode::Random => {
                let seed = config.seed.unwrap_or_else(|| rand::thread_rng().r#gen());
                Self::random(config.rate, seed)
            }
        };
        injector.with_code(config.code)
    }

    fn with_picker(picker: Picker) -> Self {
        Self {
            picker: Mutex::new(picker),
            code: ErrorCode::Connection,
        }
    }

    /// Code of the manufactured failures (default `Connection`).
    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = code;
        self
    }

    /// Decides whether this successful exchange is turned into a failure.
    pub fn inject(&self) -> Option<NetError> {
        let fail = match &mut *self.picker.lock().unwrap() {
            Picker::Every { rate, seen } => {
                *seen += 1;
                *seen % *rate == 0
            }
            Picker::Random { rate, rng } => rng.gen_ratio(1, *rate),
        };
        if !fail {
            return None;
        }
        debug!(code = %self.code, "injecting fault");
        Some(NetError::new(self.code, "injected fault"))
    }
}

impl std::fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjector")
            .field("code", &self.code)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_fails_exact_period() {
        let injector = FaultInjector::every(4);
        let failed: Vec<usize> = (1..=12)
            .filter(|_| injector.inject().is_some())
            .collect();
        assert_eq!(failed.len(), 3);

        let injector = FaultInjector::every(4);
        let pattern: Vec<bool> = (0..8).map(|_| injector.inject().is_some()).collect();
        assert_eq!(
            pattern,
            vec![false, false, false, true, false, false, false, true]
        );
    }

    #[test]
    fn rate_one_fails_everything() {
        let injector = FaultInjector::every(1);
        assert!((0..5).all(|_| injector.inject().is_some()));
        let injector = FaultInjector::random(1, 7);
        assert!((0..5).all(|_| injector.inject().is_some()));
    }

    #[test]
    fn random_is_reproducible_for_a_seed() {
        let a = FaultInjector::random(3, 42);
        let b = FaultInjector::random(3, 42);
        let run_a: Vec<bool> = (0..64).map(|_| a.inject().is_some()).collect();
        let run_b: Vec<bool> = (0..64).map(|_| b.inject().is_some()).collect();
        assert_eq!(run_a, run_b);
        assert!(run_a.iter().any(|f| *f));
        assert!(run_a.iter().any(|f| !*f));
    }

    #[test]
    fn manufactured_code_is_configurable() {
        let injector = FaultInjector::every(1).with_code(ErrorCode::Timeout);
        assert_eq!(injector.inject().unwrap().code(), ErrorCode::Timeout);

        let injector = FaultInjector::every(1);
        assert_eq!(injector.inject().unwrap().code(), ErrorCode::Connection);
    }

    #[test]
    fn from_config_modes() {
        let every = FaultInjector::from_config(&FaultConfig::every(2));
        assert!(every.inject().is_none());
        assert_eq!(every.inject().unwrap().code(), ErrorCode::Connection);

        let random = FaultInjector::from_config(&FaultConfig {
            rate: 1,
            mode: FaultMode::Random,
            seed: Some(3),
            code: ErrorCode::Disconnected,
        });
        assert_eq!(random.inject().unwrap().code(), ErrorCode::Disconnected);
    }
}
