//! Region of interest, grayscale templates, and the slot that owns the
//! active death template for a monitoring session.

use image::{GrayImage, RgbaImage, imageops};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, TryLockError};

use crate::error::{ScoreError, TemplateBusy};

/// A rectangle in source-frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RegionOfInterest {
    /// Creates a region, rejecting zero-sized rectangles.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self {
            x,
            y,
            width,
            height,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Right edge (exclusive), saturating on overflow.
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// Bottom edge (exclusive), saturating on overflow.
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// True if the region lies entirely inside a `width`x`height` frame.
    pub fn fits_in(&self, width: u32, height: u32) -> bool {
        self.right() <= width && self.bottom() <= height
    }

    /// Grows the region by `margin` on every side, clamped to the frame.
    pub fn expanded(&self, margin: u32, frame_width: u32, frame_height: u32) -> Self {
        let x = self.x.saturating_sub(margin);
        let y = self.y.saturating_sub(margin);
        let right = self.right().saturating_add(margin).min(frame_width);
        let bottom = self.bottom().saturating_add(margin).min(frame_height);
        Self {
            x,
            y,
            width: right.saturating_sub(x),
            height: bottom.saturating_sub(y),
        }
    }
}

impl std::fmt::Display for RegionOfInterest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} at ({}, {})", self.width, self.height, self.x, self.y)
    }
}

/// An owned grayscale reference image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template {
    image: GrayImage,
}

impl Template {
    /// Builds a template from raw grayscale bytes.
    ///
    /// Returns `None` if the buffer length does not match `width * height`
    /// or either dimension is zero.
    pub fn from_gray_bytes(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        if width == 0 || height == 0 || pixels.len() != (width as usize) * (height as usize) {
            return None;
        }
        GrayImage::from_raw(width, height, pixels).map(|image| Self { image })
    }

    /// Wraps a decoded grayscale image. Empty images are rejected.
    pub fn from_gray_image(image: GrayImage) -> Option<Self> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }
        Some(Self { image })
    }

    /// Cuts the region out of an RGBA frame and converts it to grayscale.
    pub fn capture(frame: &RgbaImage, roi: &RegionOfInterest) -> Result<Self, ScoreError> {
        let (fw, fh) = frame.dimensions();
        if !roi.is_valid() || !roi.fits_in(fw, fh) {
            return Err(ScoreError::SizeMismatch {
                frame_width: fw,
                frame_height: fh,
                roi_x: roi.x,
                roi_y: roi.y,
                roi_width: roi.width,
                roi_height: roi.height,
                template_width: roi.width,
                template_height: roi.height,
            });
        }
        Ok(Self {
            image: to_grayscale(frame, roi),
        })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }
}

/// Crops a region of an RGBA frame and converts it to grayscale.
///
/// The caller guarantees the region fits.
pub fn to_grayscale(frame: &RgbaImage, roi: &RegionOfInterest) -> GrayImage {
    let region = imageops::crop_imm(frame, roi.x, roi.y, roi.width, roi.height).to_image();
    imageops::grayscale(&region)
}

/// The death template together with the region it was captured from.
#[derive(Clone, Debug, PartialEq)]
pub struct DeathTemplate {
    pub roi: RegionOfInterest,
    pub template: Template,
}

/// Holds the active death template.
///
/// Scoring and replacement both take the slot with a non-blocking
/// `try_lock`: whichever side finds it taken backs off instead of waiting.
#[derive(Debug, Default)]
pub struct TemplateSlot {
    current: Mutex<Option<DeathTemplate>>,
}

/// Exclusive access to the template for the duration of one scoring pass.
pub struct ScoringGuard<'a> {
    guard: MutexGuard<'a, Option<DeathTemplate>>,
}

impl ScoringGuard<'_> {
    pub fn template(&self) -> Option<&DeathTemplate> {
        self.guard.as_ref()
    }
}

impl TemplateSlot {
    pub fn new(initial: Option<DeathTemplate>) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    /// Claims the slot for scoring. Fails if a replacement is in progress.
    pub fn begin_scoring(&self) -> Result<ScoringGuard<'_>, TemplateBusy> {
        self.try_take().map(|guard| ScoringGuard { guard })
    }

    /// Swaps in a new template (or clears it). Fails while a scoring pass
    /// holds the slot.
    pub fn replace(&self, next: Option<DeathTemplate>) -> Result<(), TemplateBusy> {
        let mut guard = self.try_take()?;
        *guard = next;
        Ok(())
    }

    /// Returns true if a template is loaded.
    pub fn is_loaded(&self) -> Result<bool, TemplateBusy> {
        Ok(self.try_take()?.is_some())
    }

    fn try_take(&self) -> Result<MutexGuard<'_, Option<DeathTemplate>>, TemplateBusy> {
        match self.current.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(TemplateBusy),
        }
    }
}
