//! Reference frame strategies and their settings-driven factories.
//!
//! Each factory reads the current `AlgorithmSettings` when it is called, which a
//! `Stage` does only when it rebuilds its inner stream.

mod background;
mod denoise;
mod detect;
mod threshold;

pub use background::RunningAverageBackground;
pub use denoise::BoxDenoise;
pub use detect::CoverageDetector;
pub use threshold::ThresholdCorrect;

use anyhow::Result;

use crate::frame::{Detection, Frame, Mask};
use crate::settings::{AlgorithmSettings, SharedSettings};
use crate::stream::Strategy;

pub fn denoise_factory(
    settings: SharedSettings<AlgorithmSettings>,
) -> impl Fn() -> Result<Box<dyn Strategy<Frame, Frame>>> + Send + Sync + 'static {
    move || {
        let strategy: Box<dyn Strategy<Frame, Frame>> =
            Box::new(BoxDenoise::new(settings.snapshot().denoise_radius));
        Ok(strategy)
    }
}

pub fn background_factory(
    settings: SharedSettings<AlgorithmSettings>,
) -> impl Fn() -> Result<Box<dyn Strategy<Frame, Frame>>> + Send + Sync + 'static {
    move || {
        let rate = settings.snapshot().background_learning_rate;
        let strategy: Box<dyn Strategy<Frame, Frame>> =
            Box::new(RunningAverageBackground::new(rate));
        Ok(strategy)
    }
}

pub fn correct_factory(
    settings: SharedSettings<AlgorithmSettings>,
) -> impl Fn() -> Result<Box<dyn Strategy<Frame, Mask>>> + Send + Sync + 'static {
    move || {
        let strategy: Box<dyn Strategy<Frame, Mask>> =
            Box::new(ThresholdCorrect::new(settings.snapshot().threshold));
        Ok(strategy)
    }
}

pub fn detect_factory(
    settings: SharedSettings<AlgorithmSettings>,
) -> impl Fn() -> Result<Box<dyn Strategy<Mask, Detection>>> + Send + Sync + 'static {
    move || {
        let snapshot = settings.snapshot();
        snapshot.validate()?;
        let strategy: Box<dyn Strategy<Mask, Detection>> =
            Box::new(CoverageDetector::new(snapshot.min_coverage));
        Ok(strategy)
    }
}
