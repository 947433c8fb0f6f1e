use anyhow::{anyhow, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Nv12,
}

impl PixelFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gray8" | "gray" | "luma" => Ok(Self::Gray8),
            "rgb24" | "rgb" => Ok(Self::Rgb24),
            "nv12" => Ok(Self::Nv12),
            other => Err(anyhow!("unsupported pixel format: {}", other)),
        }
    }
}

/// Convert a raw capture buffer into 8-bit luma.
pub fn normalize_to_luma(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>> {
    let plane = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
    match format {
        PixelFormat::Gray8 => {
            expect_len("Gray8", plane, pixels.len())?;
            Ok(pixels.to_vec())
        }
        PixelFormat::Rgb24 => {
            let expected = plane
                .checked_mul(3)
                .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))?;
            expect_len("RGB", expected, pixels.len())?;
            Ok(pixels.chunks_exact(3).map(rgb_to_luma).collect())
        }
        PixelFormat::Nv12 => {
            // Y plane followed by interleaved UV at quarter resolution.
            let expected = plane
                .checked_add(plane / 2)
                .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
            expect_len("NV12", expected, pixels.len())?;
            Ok(pixels[..plane].to_vec())
        }
    }
}

fn rgb_to_luma(rgb: &[u8]) -> u8 {
    let y = 0.299_f32 * rgb[0] as f32 + 0.587_f32 * rgb[1] as f32 + 0.114_f32 * rgb[2] as f32;
    y.round().clamp(0.0, 255.0) as u8
}

fn expect_len(format: &str, expected: usize, actual: usize) -> Result<()> {
    if actual != expected {
        return Err(anyhow!(
            "{} frame length mismatch: expected {}, got {}",
            format,
            expected,
            actual
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_keeps_the_y_plane() -> Result<()> {
        let y_plane = vec![10u8, 20, 30, 40];
        let uv_plane = vec![128u8; 2];
        let nv12 = [y_plane.clone(), uv_plane].concat();

        let luma = normalize_to_luma(&nv12, 2, 2, PixelFormat::Nv12)?;
        assert_eq!(luma, y_plane);
        Ok(())
    }

    #[test]
    fn gray_rgb_maps_to_same_luma() -> Result<()> {
        let pixels = vec![128u8; 12];
        let luma = normalize_to_luma(&pixels, 2, 2, PixelFormat::Rgb24)?;
        assert_eq!(luma, vec![128u8; 4]);
        Ok(())
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let err = normalize_to_luma(&[0u8; 5], 2, 2, PixelFormat::Gray8).unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
    }

    #[test]
    fn parses_format_names() -> Result<()> {
        assert_eq!(PixelFormat::parse("RGB24")?, PixelFormat::Rgb24);
        assert_eq!(PixelFormat::parse("luma")?, PixelFormat::Gray8);
        assert!(PixelFormat::parse("yuyv").is_err());
        Ok(())
    }
}
