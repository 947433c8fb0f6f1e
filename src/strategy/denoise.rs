use anyhow::Result;

use crate::frame::Frame;
use crate::stream::Strategy;

/// Separable box blur over a `(2r+1)²` window with clamped edges.
pub struct BoxDenoise {
    radius: u32,
    name: String,
}

impl BoxDenoise {
    pub fn new(radius: u32) -> Self {
        Self {
            radius,
            name: format!("box-denoise(r={})", radius),
        }
    }
}

impl Strategy<Frame, Frame> for BoxDenoise {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, frame: Frame) -> Result<Frame> {
        if self.radius == 0 {
            return Ok(frame);
        }
        let w = frame.width() as usize;
        let h = frame.height() as usize;
        let r = self.radius as usize;
        let src = frame.pixels();

        let mut horizontal = vec![0u8; src.len()];
        for y in 0..h {
            let row = &src[y * w..(y + 1) * w];
            for x in 0..w {
                horizontal[y * w + x] = window_mean(x, r, w, |i| row[i]);
            }
        }

        let mut out = vec![0u8; src.len()];
        for x in 0..w {
            for y in 0..h {
                out[y * w + x] = window_mean(y, r, h, |i| horizontal[i * w + x]);
            }
        }
        frame.derive(out)
    }
}

fn window_mean(center: usize, radius: usize, len: usize, at: impl Fn(usize) -> u8) -> u8 {
    let lo = center.saturating_sub(radius);
    let hi = (center + radius).min(len - 1);
    let sum: u32 = (lo..=hi).map(|i| at(i) as u32).sum();
    let count = (hi - lo + 1) as u32;
    ((sum + count / 2) / count) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolated_spike_is_smoothed() -> Result<()> {
        let mut pixels = vec![0u8; 25];
        pixels[12] = 90; // centre of 5x5
        let frame = Frame::new(5, 5, pixels, 3)?;

        let out = BoxDenoise::new(1).apply(frame)?;
        assert_eq!(out.pixel(2, 2), Some(10));
        assert_eq!(out.pixel(1, 1), Some(10));
        assert_eq!(out.pixel(0, 0), Some(0));
        assert_eq!(out.sequence, 3);
        Ok(())
    }

    #[test]
    fn radius_zero_passes_through() -> Result<()> {
        let frame = Frame::new(2, 1, vec![7, 9], 0)?;
        let out = BoxDenoise::new(0).apply(frame)?;
        assert_eq!(out.pixels(), &[7, 9]);
        Ok(())
    }

    #[test]
    fn uniform_frame_is_unchanged() -> Result<()> {
        let out = BoxDenoise::new(2).apply(Frame::filled(6, 4, 77, 0))?;
        assert!(out.pixels().iter().all(|&p| p == 77));
        Ok(())
    }
}
