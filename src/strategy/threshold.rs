use anyhow::Result;

use crate::frame::{Frame, Mask};
use crate::stream::Strategy;

/// Turns a difference image into a foreground mask.
///
/// A pixel is foreground when its difference reaches `threshold`. Isolated foreground
/// pixels (no foreground among their 8 neighbours) are cleared as speckle.
pub struct ThresholdCorrect {
    threshold: u8,
    name: String,
}

impl ThresholdCorrect {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold,
            name: format!("threshold({})", threshold),
        }
    }
}

impl Strategy<Frame, Mask> for ThresholdCorrect {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, diff: Frame) -> Result<Mask> {
        let w = diff.width() as i64;
        let h = diff.height() as i64;
        let raw: Vec<bool> = diff.pixels().iter().map(|&p| p >= self.threshold).collect();

        let set = |x: i64, y: i64| x >= 0 && y >= 0 && x < w && y < h && raw[(y * w + x) as usize];
        let mut cleaned = raw.clone();
        for y in 0..h {
            for x in 0..w {
                if !raw[(y * w + x) as usize] {
                    continue;
                }
                let has_neighbour = (-1..=1)
                    .flat_map(|dy| (-1..=1).map(move |dx| (dx, dy)))
                    .filter(|&(dx, dy)| dx != 0 || dy != 0)
                    .any(|(dx, dy)| set(x + dx, y + dy));
                if !has_neighbour {
                    cleaned[(y * w + x) as usize] = false;
                }
            }
        }
        Mask::for_frame(&diff, cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_and_removes_speckle() -> Result<()> {
        #[rustfmt::skip]
        let diff = Frame::new(4, 4, vec![
            90,  0,  0,  0,
             0,  0, 50, 60,
             0,  0, 70, 10,
             0,  0,  0,  0,
        ], 0)?;
        let mask = ThresholdCorrect::new(30).apply(diff)?;

        assert!(!mask.is_set(0, 0), "isolated pixel is speckle");
        assert!(mask.is_set(2, 1));
        assert!(mask.is_set(3, 1));
        assert!(mask.is_set(2, 2));
        assert!(!mask.is_set(3, 2), "below threshold");
        assert_eq!(mask.foreground_count(), 3);
        Ok(())
    }
}
