//! Pipeline payloads.
//!
//! - `Frame`: 8-bit luma image. Pixels live behind an `Arc` so broadcasting a frame to
//!   several subscribers never copies the buffer.
//! - `Mask`: binary foreground mask derived from a frame.
//! - `Detection`: per-frame presence decision.
//!
//! Every payload carries the capture sequence number and instant of the frame it was
//! derived from, so downstream consumers can measure end-to-end latency.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone, Debug)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Arc<[u8]>,
    pub sequence: u64,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>, sequence: u64) -> Result<Self> {
        check_len("frame", width, height, pixels.len())?;
        Ok(Self {
            width,
            height,
            pixels: pixels.into(),
            sequence,
            captured_at: Instant::now(),
        })
    }

    /// Uniform frame, mostly useful for seeding models and in tests.
    pub fn filled(width: u32, height: u32, value: u8, sequence: u64) -> Self {
        Self {
            width,
            height,
            pixels: vec![value; width as usize * height as usize].into(),
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// New pixels for the same capture. Sequence and capture instant carry over.
    pub fn derive(&self, pixels: Vec<u8>) -> Result<Self> {
        check_len("derived frame", self.width, self.height, pixels.len())?;
        Ok(Self {
            width: self.width,
            height: self.height,
            pixels: pixels.into(),
            sequence: self.sequence,
            captured_at: self.captured_at,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Luma at `(x, y)`, or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<u8> {
        offset(self.width, self.height, x, y).and_then(|i| self.pixels.get(i).copied())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug)]
pub struct Mask {
    width: u32,
    height: u32,
    values: Arc<[bool]>,
    pub sequence: u64,
    pub captured_at: Instant,
}

impl Mask {
    /// Mask for `source`, which must have the same dimensions.
    pub fn for_frame(source: &Frame, values: Vec<bool>) -> Result<Self> {
        check_len("mask", source.width, source.height, values.len())?;
        Ok(Self {
            width: source.width,
            height: source.height,
            values: values.into(),
            sequence: source.sequence,
            captured_at: source.captured_at,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// `false` outside the mask.
    pub fn is_set(&self, x: u32, y: u32) -> bool {
        offset(self.width, self.height, x, y)
            .and_then(|i| self.values.get(i).copied())
            .unwrap_or(false)
    }

    pub fn foreground_count(&self) -> usize {
        self.values.iter().filter(|&&set| set).count()
    }

    /// Fraction of set pixels, in `0.0..=1.0`.
    pub fn coverage(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.foreground_count() as f32 / self.values.len() as f32
    }

    /// Smallest box enclosing every set pixel.
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0;
        let mut max_y = 0;
        let mut any = false;
        for y in 0..self.height {
            for x in 0..self.width {
                if self.is_set(x, y) {
                    any = true;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }
        any.then(|| BoundingBox {
            x: min_x,
            y: min_y,
            width: max_x - min_x + 1,
            height: max_y - min_y + 1,
        })
    }
}

/// Presence decision for one frame.
#[derive(Clone, Debug)]
pub struct Detection {
    pub sequence: u64,
    pub captured_at: Instant,
    pub present: bool,
    pub coverage: f32,
    pub bounding_box: Option<BoundingBox>,
}

/// Row-major index, computed in `usize` so large frames cannot wrap.
fn offset(width: u32, height: u32, x: u32, y: u32) -> Option<usize> {
    (x < width && y < height).then(|| y as usize * width as usize + x as usize)
}

fn check_len(what: &str, width: u32, height: u32, len: usize) -> Result<()> {
    let expected = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| anyhow!("{} dimensions overflow", what))?;
    if len != expected {
        return Err(anyhow!(
            "{} length mismatch: expected {}, got {}",
            what,
            expected,
            len
        ));
    }
    Ok(())
}
