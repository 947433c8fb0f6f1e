use anyhow::Result;

use crate::frame::Frame;
use crate::stream::Strategy;

/// Exponential running-average background model.
///
/// Emits the absolute difference between each frame and the model, then folds the
/// frame into the model. The first frame (and the first after `reset` or a change of
/// dimensions) seeds the model and yields an all-zero difference.
pub struct RunningAverageBackground {
    learning_rate: f32,
    model: Option<Model>,
    name: String,
}

struct Model {
    width: u32,
    height: u32,
    mean: Vec<f32>,
}

impl RunningAverageBackground {
    pub fn new(learning_rate: f32) -> Self {
        let learning_rate = learning_rate.clamp(f32::EPSILON, 1.0);
        Self {
            learning_rate,
            model: None,
            name: format!("running-average(rate={})", learning_rate),
        }
    }

    pub fn is_seeded(&self) -> bool {
        self.model.is_some()
    }
}

impl Strategy<Frame, Frame> for RunningAverageBackground {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, frame: Frame) -> Result<Frame> {
        let model = match self.model.as_mut() {
            Some(model) if model.width == frame.width() && model.height == frame.height() => {
                model
            }
            _ => {
                log::debug!(
                    "{}: seeding {}x{} background",
                    self.name,
                    frame.width(),
                    frame.height()
                );
                self.model = Some(Model {
                    width: frame.width(),
                    height: frame.height(),
                    mean: frame.pixels().iter().map(|&p| p as f32).collect(),
                });
                return frame.derive(vec![0; frame.pixels().len()]);
            }
        };

        let rate = self.learning_rate;
        let mut diff = Vec::with_capacity(model.mean.len());
        for (mean, &pixel) in model.mean.iter_mut().zip(frame.pixels()) {
            let value = pixel as f32;
            diff.push((value - *mean).abs().round().min(255.0) as u8);
            *mean += rate * (value - *mean);
        }
        frame.derive(diff)
    }

    fn reset(&mut self) {
        self.model = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difference_against_learned_background() -> Result<()> {
        let mut bg = RunningAverageBackground::new(0.5);
        let first = bg.apply(Frame::filled(2, 2, 100, 0))?;
        assert!(first.pixels().iter().all(|&p| p == 0));

        let changed = bg.apply(Frame::new(2, 2, vec![100, 100, 100, 200], 1)?)?;
        assert_eq!(changed.pixels(), &[0, 0, 0, 100]);

        // model for the last pixel is now 150
        let again = bg.apply(Frame::new(2, 2, vec![100, 100, 100, 200], 2)?)?;
        assert_eq!(again.pixel(1, 1), Some(50));
        Ok(())
    }

    #[test]
    fn reset_reseeds_the_model() -> Result<()> {
        let mut bg = RunningAverageBackground::new(0.1);
        bg.apply(Frame::filled(3, 3, 10, 0))?;
        assert!(bg.is_seeded());
        bg.reset();
        assert!(!bg.is_seeded());
        let out = bg.apply(Frame::filled(3, 3, 250, 1))?;
        assert!(out.pixels().iter().all(|&p| p == 0));
        Ok(())
    }

    #[test]
    fn new_dimensions_reseed() -> Result<()> {
        let mut bg = RunningAverageBackground::new(0.1);
        bg.apply(Frame::filled(3, 3, 10, 0))?;
        let out = bg.apply(Frame::filled(4, 2, 200, 1))?;
        assert!(out.pixels().iter().all(|&p| p == 0));
        Ok(())
    }
}
