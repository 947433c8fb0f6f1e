//! Algorithm settings shared between the control side and strategy factories.
//!
//! Factories take a `snapshot()` when a stage rebuilds its inner stream, so a settings
//! change is picked up at the next rebuild and never in the middle of a frame.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub const DEFAULT_DENOISE_RADIUS: u32 = 1;
pub const DEFAULT_BACKGROUND_LEARNING_RATE: f32 = 0.05;
pub const DEFAULT_THRESHOLD: u8 = 30;
pub const DEFAULT_MIN_COVERAGE: f32 = 0.02;
const MAX_DENOISE_RADIUS: u32 = 8;

#[derive(Clone, Debug, PartialEq)]
pub struct AlgorithmSettings {
    /// Box blur radius; 0 disables denoising.
    pub denoise_radius: u32,
    /// Weight of each new frame in the running-average background, in `(0, 1]`.
    pub background_learning_rate: f32,
    /// Minimum absolute luma difference counted as foreground.
    pub threshold: u8,
    /// Foreground fraction at or above which a frame counts as occupied.
    pub min_coverage: f32,
}

impl Default for AlgorithmSettings {
    fn default() -> Self {
        Self {
            denoise_radius: DEFAULT_DENOISE_RADIUS,
            background_learning_rate: DEFAULT_BACKGROUND_LEARNING_RATE,
            threshold: DEFAULT_THRESHOLD,
            min_coverage: DEFAULT_MIN_COVERAGE,
        }
    }
}

impl AlgorithmSettings {
    pub fn validate(&self) -> Result<()> {
        if self.denoise_radius > MAX_DENOISE_RADIUS {
            return Err(anyhow!(
                "denoise_radius must be at most {}",
                MAX_DENOISE_RADIUS
            ));
        }
        if !(self.background_learning_rate > 0.0 && self.background_learning_rate <= 1.0) {
            return Err(anyhow!("background_learning_rate must be in (0, 1]"));
        }
        if self.threshold == 0 {
            return Err(anyhow!("threshold must be in 1..=255"));
        }
        if !(self.min_coverage > 0.0 && self.min_coverage <= 1.0) {
            return Err(anyhow!("min_coverage must be in (0, 1]"));
        }
        Ok(())
    }
}

/// Read-mostly settings cell. Cloning shares the value.
pub struct SharedSettings<S> {
    inner: Arc<SettingsInner<S>>,
}

struct SettingsInner<S> {
    value: RwLock<S>,
    version: AtomicU64,
}

impl<S> Clone for SharedSettings<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Clone> SharedSettings<S> {
    pub fn new(value: S) -> Self {
        Self {
            inner: Arc::new(SettingsInner {
                value: RwLock::new(value),
                version: AtomicU64::new(0),
            }),
        }
    }

    pub fn snapshot(&self) -> S {
        self.inner
            .value
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Incremented on every change.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    pub fn replace(&self, value: S) -> u64 {
        self.update(|current| *current = value)
    }

    pub fn update<F: FnOnce(&mut S)>(&self, f: F) -> u64 {
        let mut guard = self
            .inner
            .value
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard);
        self.inner.version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() -> Result<()> {
        AlgorithmSettings::default().validate()
    }

    #[test]
    fn rejects_out_of_range_values() {
        let bad = [
            AlgorithmSettings {
                background_learning_rate: 0.0,
                ..AlgorithmSettings::default()
            },
            AlgorithmSettings {
                threshold: 0,
                ..AlgorithmSettings::default()
            },
            AlgorithmSettings {
                min_coverage: 1.5,
                ..AlgorithmSettings::default()
            },
            AlgorithmSettings {
                denoise_radius: 50,
                ..AlgorithmSettings::default()
            },
        ];
        for settings in bad {
            assert!(settings.validate().is_err(), "{:?}", settings);
        }
    }

    #[test]
    fn clones_observe_updates() {
        let settings = SharedSettings::new(AlgorithmSettings::default());
        let view = settings.clone();
        assert_eq!(settings.update(|s| s.threshold = 99), 1);
        assert_eq!(view.snapshot().threshold, 99);
        assert_eq!(view.version(), 1);
    }
}
