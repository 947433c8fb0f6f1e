//! Synthetic capture source for `stub://` URLs.
//!
//! Renders a static gradient with a little sensor noise and, for part of every motion
//! period, a bright block sliding across the scene. Deterministic for a given name so
//! test runs are reproducible.

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::normalize::PixelFormat;
use super::{CaptureSource, RawFrame};

const DEFAULT_MOTION_PERIOD: u64 = 100;
const DEFAULT_MOTION_ACTIVE: u64 = 40;
const NOISE_AMPLITUDE: i16 = 3;
const BLOCK_LUMA: u8 = 235;

pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    format: PixelFormat,
    motion_period: u64,
    motion_active: u64,
    frame_count: u64,
    rng: StdRng,
}

impl SyntheticSource {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("synthetic source needs non-zero dimensions"));
        }
        let name = name.into();
        let seed = name
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325_u64, |acc, b| {
                (acc ^ b as u64).wrapping_mul(0x0100_0000_01b3)
            });
        Ok(Self {
            name,
            width,
            height,
            format: PixelFormat::Gray8,
            motion_period: DEFAULT_MOTION_PERIOD,
            motion_active: DEFAULT_MOTION_ACTIVE,
            frame_count: 0,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Emit frames in `format` instead of luma.
    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// The block is visible for the first `active` frames of every `period`.
    /// `active == 0` renders an empty scene.
    pub fn with_motion(mut self, period: u64, active: u64) -> Self {
        self.motion_period = period.max(1);
        self.motion_active = active.min(self.motion_period);
        self
    }

    fn block_origin(&self) -> Option<(u32, u32)> {
        let phase = self.frame_count % self.motion_period;
        if phase >= self.motion_active {
            return None;
        }
        let block_w = (self.width / 4).max(1);
        let travel = self.width.saturating_sub(block_w) as u64;
        let x = if self.motion_active <= 1 {
            0
        } else {
            (travel * phase / (self.motion_active - 1)) as u32
        };
        let y = self.height.saturating_sub((self.height / 4).max(1)) / 2;
        Some((x, y))
    }

    fn render_luma(&mut self) -> Vec<u8> {
        let w = self.width;
        let h = self.height;
        let block = self.block_origin();
        let block_w = (w / 4).max(1);
        let block_h = (h / 4).max(1);
        let mut luma = Vec::with_capacity(w as usize * h as usize);
        for y in 0..h {
            for x in 0..w {
                let inside = block.is_some_and(|(bx, by)| {
                    x >= bx && x < bx + block_w && y >= by && y < by + block_h
                });
                let base = if inside {
                    BLOCK_LUMA as i16
                } else {
                    40 + (x * 80 / w.max(1)) as i16
                };
                let noise = self.rng.gen_range(-NOISE_AMPLITUDE..=NOISE_AMPLITUDE);
                luma.push((base + noise).clamp(0, 255) as u8);
            }
        }
        luma
    }

    fn encode(&self, luma: Vec<u8>) -> Vec<u8> {
        match self.format {
            PixelFormat::Gray8 => luma,
            PixelFormat::Rgb24 => luma.iter().flat_map(|&y| [y, y, y]).collect(),
            PixelFormat::Nv12 => {
                let chroma = luma.len() / 2;
                let mut data = luma;
                data.resize(data.len() + chroma, 128);
                data
            }
        }
    }
}

impl CaptureSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_frame(&mut self) -> Result<Option<RawFrame>> {
        let luma = self.render_luma();
        self.frame_count = self.frame_count.wrapping_add(1);
        Ok(Some(RawFrame {
            width: self.width,
            height: self.height,
            format: self.format,
            data: self.encode(luma),
        }))
    }
}
