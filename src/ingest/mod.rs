//! Frame ingestion.
//!
//! Capture sources produce `RawFrame`s in whatever pixel layout the device delivers.
//! `CameraCaptureLoop` polls one source at a fixed cadence, normalises each frame to
//! luma and broadcasts it as a pipeline `Frame`.
//!
//! Sources:
//! - `stub://<name>`: synthetic scene (always available)
//! - local directory of PNG/JPEG images (feature: ingest-image)

pub mod capture;
#[cfg(feature = "ingest-image")]
pub mod directory;
pub mod normalize;
pub mod synthetic;

pub use capture::{CameraCaptureLoop, CaptureConfig, CaptureHandle, FRAME_COUNTER_LIMIT};
#[cfg(feature = "ingest-image")]
pub use directory::DirectorySource;
pub use normalize::{normalize_to_luma, PixelFormat};
pub use synthetic::SyntheticSource;

use anyhow::Result;

/// Unnormalised capture output.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

/// Something that can be polled for frames.
///
/// `query_frame` is a plain blocking call. `Ok(None)` means "no frame this tick" and is
/// not an error; `Err` is a capture failure and ends the capture loop.
pub trait CaptureSource: Send {
    fn name(&self) -> &str;

    fn query_frame(&mut self) -> Result<Option<RawFrame>>;
}

/// Open the source named by `url`.
pub fn open_source(url: &str, width: u32, height: u32) -> Result<Box<dyn CaptureSource>> {
    if url.starts_with("stub://") {
        log::info!("capture: {} (synthetic, {}x{})", url, width, height);
        return Ok(Box::new(SyntheticSource::new(url, width, height)?));
    }
    if url.contains("://") {
        anyhow::bail!("unsupported capture source {} (use stub:// or a local directory)", url);
    }
    #[cfg(feature = "ingest-image")]
    {
        Ok(Box::new(DirectorySource::open(std::path::Path::new(url))?))
    }
    #[cfg(not(feature = "ingest-image"))]
    {
        anyhow::bail!("directory capture requires the ingest-image feature")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_urls_open_synthetic_sources() -> Result<()> {
        let mut source = open_source("stub://porch", 32, 24)?;
        assert_eq!(source.name(), "stub://porch");
        let raw = source.query_frame()?;
        assert!(raw.is_some_and(|raw| raw.data.len() == 32 * 24));
        Ok(())
    }

    #[test]
    fn remote_urls_are_rejected() {
        assert!(open_source("rtsp://camera/stream", 32, 24).is_err());
    }
}
