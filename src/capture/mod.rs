//! Screen capture for death detection.
//!
//! This module provides:
//! - The `FrameSource` trait the detection worker pulls frames from
//! - A persistent Windows Graphics Capture source (`wgc`, Windows only)
//! - Window discovery by process name (`window`)

#[cfg(windows)]
pub mod wgc;
pub mod window;

use image::{Rgba, RgbaImage};

use crate::config::CaptureTarget;
use crate::detection::RegionOfInterest;
use crate::error::CaptureError;

/// Produces frames of the screen or a window on demand.
///
/// Resolution may change between calls. Sources hold GPU resources that are
/// bound to the thread that opened them, so they are not `Send`.
pub trait FrameSource {
    fn grab(&mut self) -> Result<RgbaImage, CaptureError>;
}

/// Opens a capture source for the configured target.
#[cfg(windows)]
pub fn open_source(target: &CaptureTarget) -> Result<Box<dyn FrameSource>, CaptureError> {
    Ok(Box::new(wgc::WgcSource::open(target)?))
}

#[cfg(not(windows))]
pub fn open_source(target: &CaptureTarget) -> Result<Box<dyn FrameSource>, CaptureError> {
    Err(CaptureError::Unavailable(format!(
        "cannot capture {} on this platform",
        target
    )))
}

/// Copies a region of a BGRA buffer into a new RGBA image.
///
/// `crop` is clamped to the source; rows are `row_pitch` bytes apart.
pub fn bgra_to_rgba(
    src: &[u8],
    row_pitch: usize,
    src_width: u32,
    src_height: u32,
    crop: &RegionOfInterest,
) -> RgbaImage {
    let x0 = crop.x.min(src_width);
    let y0 = crop.y.min(src_height);
    let width = crop.right().min(src_width) - x0;
    let height = crop.bottom().min(src_height) - y0;

    let mut img = RgbaImage::new(width, height);
    for y in 0..height {
        let row = (y0 + y) as usize * row_pitch;
        for x in 0..width {
            let offset = row + (x0 + x) as usize * 4;
            let Some(px) = src.get(offset..offset + 4) else {
                continue;
            };
            // BGRA -> RGBA
            img.put_pixel(x, y, Rgba([px[2], px[1], px[0], px[3]]));
        }
    }
    img
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bgra_conversion_with_padding_and_crop() {
        // 3x2 source, row pitch padded to 16 bytes
        let mut src = vec![0u8; 32];
        for y in 0..2usize {
            for x in 0..3usize {
                let o = y * 16 + x * 4;
                src[o] = 10 * x as u8; // B
                src[o + 1] = 100; // G
                src[o + 2] = 200 + y as u8; // R
                src[o + 3] = 255;
            }
        }
        let crop = RegionOfInterest::new(1, 1, 5, 5).unwrap();
        let img = bgra_to_rgba(&src, 16, 3, 2, &crop);
        assert_eq!(img.dimensions(), (2, 1));
        assert_eq!(img.get_pixel(0, 0), &Rgba([201, 100, 10, 255]));
        assert_eq!(img.get_pixel(1, 0), &Rgba([201, 100, 20, 255]));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_capture_unavailable_off_windows() {
        assert!(matches!(
            open_source(&CaptureTarget::PrimaryMonitor),
            Err(CaptureError::Unavailable(_))
        ));
    }
}
