use anyhow::Result;

use crate::frame::{Detection, Mask};
use crate::stream::Strategy;

/// Reports presence when the foreground covers at least `min_coverage` of the frame.
pub struct CoverageDetector {
    min_coverage: f32,
    name: String,
}

impl CoverageDetector {
    pub fn new(min_coverage: f32) -> Self {
        Self {
            min_coverage,
            name: format!("coverage(>={})", min_coverage),
        }
    }
}

impl Strategy<Mask, Detection> for CoverageDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, mask: Mask) -> Result<Detection> {
        let coverage = mask.coverage();
        let present = coverage >= self.min_coverage;
        Ok(Detection {
            sequence: mask.sequence,
            captured_at: mask.captured_at,
            present,
            coverage,
            bounding_box: if present { mask.bounding_box() } else { None },
        })
    }
}
