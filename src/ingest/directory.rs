//! Image-directory capture source.
//!
//! Cycles through the PNG/JPEG files of a local directory in file-name order, decoding
//! each to luma. Useful for replaying recorded scenes through the pipeline.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::normalize::PixelFormat;
use super::{CaptureSource, RawFrame};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

pub struct DirectorySource {
    name: String,
    files: Vec<PathBuf>,
    next: usize,
}

impl DirectorySource {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("failed to read capture directory {}", dir.display()))?
        {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if path.is_file() && is_image {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(anyhow!("no images found in {}", dir.display()));
        }
        files.sort();
        log::info!(
            "DirectorySource: {} image(s) from {}",
            files.len(),
            dir.display()
        );
        Ok(Self {
            name: dir.display().to_string(),
            files,
            next: 0,
        })
    }
}

impl CaptureSource for DirectorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_frame(&mut self) -> Result<Option<RawFrame>> {
        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();
        let image = image::open(path)
            .with_context(|| format!("failed to decode {}", path.display()))?
            .to_luma8();
        Ok(Some(RawFrame {
            width: image.width(),
            height: image.height(),
            format: PixelFormat::Gray8,
            data: image.into_raw(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_images_in_name_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        image::GrayImage::from_pixel(4, 2, image::Luma([10])).save(dir.path().join("b.png"))?;
        image::GrayImage::from_pixel(4, 2, image::Luma([20])).save(dir.path().join("a.png"))?;
        std::fs::write(dir.path().join("notes.txt"), b"ignored")?;

        let mut source = DirectorySource::open(dir.path())?;
        let mut firsts = Vec::new();
        for _ in 0..3 {
            let raw = source.query_frame()?.ok_or_else(|| anyhow!("no frame"))?;
            assert_eq!((raw.width, raw.height), (4, 2));
            firsts.push(raw.data[0]);
        }
        assert_eq!(firsts, vec![20, 10, 20]);
        Ok(())
    }

    #[test]
    fn empty_directory_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(DirectorySource::open(dir.path()).is_err());
        Ok(())
    }
}
