//! Frame scoring against the death template.
//!
//! Two backends share the same contract: the default normalized
//! cross-correlation matcher and a cheaper squared-difference fallback.
//! A monitoring session uses exactly one of them.

use image::{GrayImage, ImageBuffer, Luma, RgbaImage};
use imageproc::definitions::Image;
use imageproc::integral_image::{integral_image, integral_squared_image};
use imageproc::template_matching::{MatchTemplateMethod, find_extremes, match_template};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::template::{RegionOfInterest, Template, to_grayscale};
use crate::error::ScoreError;

/// Score of one processed frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatchResult {
    /// Similarity in [0, 1], 1.0 being a perfect match
    pub score: f32,
    pub at: Instant,
}

impl MatchResult {
    /// True if the score reaches `threshold_percent` (0-100).
    pub fn exceeds(&self, threshold_percent: u8) -> bool {
        self.score >= threshold_percent as f32 / 100.0
    }
}

/// Which similarity metric a session uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionBackend {
    /// Zero-mean normalized cross-correlation
    #[default]
    Template,
    /// Root-mean-square difference, for when matching is too slow or noisy
    ScreenDiff,
}

/// Scores a frame region against a template.
pub trait MatchScorer: Send {
    fn score(
        &self,
        frame: &RgbaImage,
        template: &Template,
        roi: &RegionOfInterest,
        at: Instant,
    ) -> Result<MatchResult, ScoreError>;
}

/// Builds the scorer for a backend.
pub fn scorer_for(backend: DetectionBackend, search_margin: u32) -> Box<dyn MatchScorer> {
    match backend {
        DetectionBackend::Template => Box::new(NccScorer::new(search_margin)),
        DetectionBackend::ScreenDiff => Box::new(DiffScorer::new(search_margin)),
    }
}

/// Normalized cross-correlation matcher (`TM_CCOEFF_NORMED` semantics).
///
/// The template is slid over the ROI grown by `search_margin` pixels on each
/// side; the best placement wins. Negative correlation is reported as 0.
#[derive(Clone, Copy, Debug)]
pub struct NccScorer {
    search_margin: u32,
}

impl NccScorer {
    pub fn new(search_margin: u32) -> Self {
        Self { search_margin }
    }
}

impl MatchScorer for NccScorer {
    fn score(
        &self,
        frame: &RgbaImage,
        template: &Template,
        roi: &RegionOfInterest,
        at: Instant,
    ) -> Result<MatchResult, ScoreError> {
        let window = search_window(frame, template, roi, self.search_margin)?;
        let score = best_ncc(&window, template.image());
        Ok(MatchResult { score, at })
    }
}

/// Squared-difference matcher: `1 - RMS / 255` at the best placement.
#[derive(Clone, Copy, Debug)]
pub struct DiffScorer {
    search_margin: u32,
}

impl DiffScorer {
    pub fn new(search_margin: u32) -> Self {
        Self { search_margin }
    }
}

impl MatchScorer for DiffScorer {
    fn score(
        &self,
        frame: &RgbaImage,
        template: &Template,
        roi: &RegionOfInterest,
        at: Instant,
    ) -> Result<MatchResult, ScoreError> {
        let window = search_window(frame, template, roi, self.search_margin)?;
        let score = best_diff(&window, template.image());
        Ok(MatchResult { score, at })
    }
}

/// Validates sizes and extracts the grayscale search window.
fn search_window(
    frame: &RgbaImage,
    template: &Template,
    roi: &RegionOfInterest,
    margin: u32,
) -> Result<GrayImage, ScoreError> {
    let (fw, fh) = frame.dimensions();
    let (tw, th) = (template.width(), template.height());

    let fits = roi.is_valid()
        && roi.fits_in(fw, fh)
        && fw >= tw
        && fh >= th
        && roi.width >= tw
        && roi.height >= th;
    if !fits {
        return Err(ScoreError::SizeMismatch {
            frame_width: fw,
            frame_height: fh,
            roi_x: roi.x,
            roi_y: roi.y,
            roi_width: roi.width,
            roi_height: roi.height,
            template_width: tw,
            template_height: th,
        });
    }

    let search = roi.expanded(margin, fw, fh);
    Ok(to_grayscale(frame, &search))
}

/// Sum and scaled variance (`n * sum(v^2) - sum(v)^2`) of a patch.
#[derive(Clone, Copy, Debug)]
struct PatchStats {
    sum: i128,
    spread: i128,
}

impl PatchStats {
    fn new(sum: u64, squares: u64, n: i128) -> Self {
        let sum = sum as i128;
        Self {
            sum,
            spread: n * squares as i128 - sum * sum,
        }
    }
}

/// Box sum over `w`x`h` at (x, y) of a zero-padded integral image.
fn box_sum(integral: &Image<Luma<u64>>, x: u32, y: u32, w: u32, h: u32) -> u64 {
    let at = |px: u32, py: u32| integral.get_pixel(px, py)[0];
    at(x + w, y + h) + at(x, y) - at(x + w, y) - at(x, y + h)
}

/// Best `TM_CCOEFF_NORMED` score of the template over the window.
///
/// The raw cross-correlation map comes from `match_template`; per-placement
/// means and variances come from integral images.
fn best_ncc(window: &GrayImage, template: &GrayImage) -> f32 {
    let (tw, th) = template.dimensions();
    let n = tw as i128 * th as i128;

    let t_sums: Image<Luma<u64>> = integral_image::<_, u64>(template);
    let t_squares: Image<Luma<u64>> = integral_squared_image::<_, u64>(template);
    let t = PatchStats::new(
        box_sum(&t_sums, 0, 0, tw, th),
        box_sum(&t_squares, 0, 0, tw, th),
        n,
    );

    let w_sums: Image<Luma<u64>> = integral_image::<_, u64>(window);
    let w_squares: Image<Luma<u64>> = integral_squared_image::<_, u64>(window);
    let cross = match_template(window, template, MatchTemplateMethod::CrossCorrelation);

    let scores: Image<Luma<f32>> = ImageBuffer::from_fn(cross.width(), cross.height(), |x, y| {
        let w = PatchStats::new(
            box_sum(&w_sums, x, y, tw, th),
            box_sum(&w_squares, x, y, tw, th),
            n,
        );
        let score = if t.spread == 0 || w.spread == 0 {
            flat_similarity(&t, &w, n)
        } else {
            let numerator = n as f64 * cross.get_pixel(x, y)[0] as f64 - (w.sum * t.sum) as f64;
            numerator / ((t.spread as f64) * (w.spread as f64)).sqrt()
        };
        Luma([score as f32])
    });

    find_extremes(&scores).max_value.clamp(0.0, 1.0)
}

/// Correlation is undefined when either side has no variance. Two flat
/// patches compare by brightness; flat against textured never matches.
fn flat_similarity(t: &PatchStats, w: &PatchStats, n: i128) -> f64 {
    if t.spread == 0 && w.spread == 0 {
        let diff = (t.sum - w.sum).abs() as f64 / n as f64;
        1.0 - diff / 255.0
    } else {
        0.0
    }
}

fn best_diff(window: &GrayImage, template: &GrayImage) -> f32 {
    let n = (template.width() as u64 * template.height() as u64) as f64;
    let errors = match_template(window, template, MatchTemplateMethod::SumOfSquaredErrors);
    let best = find_extremes(&errors).min_value.max(0.0) as f64;
    let rms = (best / n).sqrt();
    (1.0 - rms / 255.0).clamp(0.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    /// A frame with a deterministic texture so correlation is meaningful.
    fn textured_frame(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            let v = ((x * 37 + y * 91 + (x * y) % 13) % 251) as u8;
            Rgba([v, v, v, 255])
        })
    }

    #[test]
    fn test_exact_region_scores_one() {
        let frame = textured_frame(64, 48);
        let roi = RegionOfInterest::new(10, 8, 20, 15).unwrap();
        let template = Template::capture(&frame, &roi).unwrap();
        let result = NccScorer::new(0)
            .score(&frame, &template, &roi, Instant::now())
            .unwrap();
        assert!(result.score > 0.999, "score was {}", result.score);
    }

    #[test]
    fn test_margin_finds_shifted_match() {
        let frame = textured_frame(64, 48);
        let source = RegionOfInterest::new(13, 10, 16, 12).unwrap();
        let template = Template::capture(&frame, &source).unwrap();
        // The configured ROI is off by 3px; the margin covers it.
        let roi = RegionOfInterest::new(10, 8, 16, 12).unwrap();
        let without = NccScorer::new(0)
            .score(&frame, &template, &roi, Instant::now())
            .unwrap();
        let with = NccScorer::new(4)
            .score(&frame, &template, &roi, Instant::now())
            .unwrap();
        assert!(with.score > 0.999);
        assert!(without.score < with.score);
    }

    #[test]
    fn test_inverted_region_scores_zero() {
        let frame = textured_frame(32, 32);
        let roi = RegionOfInterest::new(0, 0, 16, 16).unwrap();
        let captured = Template::capture(&frame, &roi).unwrap();
        let inverted: Vec<u8> = captured.pixels().iter().map(|v| 255 - v).collect();
        let template = Template::from_gray_bytes(16, 16, inverted).unwrap();
        let result = NccScorer::new(0)
            .score(&frame, &template, &roi, Instant::now())
            .unwrap();
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_score_is_reproducible() {
        let frame = textured_frame(80, 60);
        let roi = RegionOfInterest::new(20, 20, 30, 20).unwrap();
        let other = textured_frame(90, 70);
        let template =
            Template::capture(&other, &RegionOfInterest::new(5, 7, 30, 20).unwrap()).unwrap();
        let at = Instant::now();
        let scorer = NccScorer::new(6);
        let a = scorer.score(&frame, &template, &roi, at).unwrap();
        let b = scorer.score(&frame, &template, &roi, at).unwrap();
        assert_eq!(a.score.to_bits(), b.score.to_bits());
    }

    #[test]
    fn test_template_larger_than_frame_is_size_mismatch() {
        let frame = RgbaImage::new(300, 300);
        let template = Template::from_gray_bytes(500, 400, vec![0; 500 * 400]).unwrap();
        let roi = RegionOfInterest::new(0, 0, 300, 300).unwrap();
        let err = NccScorer::new(0)
            .score(&frame, &template, &roi, Instant::now())
            .unwrap_err();
        assert!(matches!(
            err,
            ScoreError::SizeMismatch {
                frame_width: 300,
                template_width: 500,
                ..
            }
        ));
    }

    #[test]
    fn test_roi_outside_frame_is_size_mismatch() {
        let frame = RgbaImage::new(100, 100);
        let template = Template::from_gray_bytes(10, 10, vec![0; 100]).unwrap();
        let roi = RegionOfInterest::new(95, 95, 10, 10).unwrap();
        assert!(DiffScorer::new(0)
            .score(&frame, &template, &roi, Instant::now())
            .is_err());
    }

    #[test]
    fn test_flat_patches_compare_by_brightness() {
        let frame = RgbaImage::from_pixel(10, 10, Rgba([100, 100, 100, 255]));
        let roi = RegionOfInterest::new(0, 0, 4, 4).unwrap();
        let same = Template::from_gray_bytes(4, 4, vec![100; 16]).unwrap();
        let brighter = Template::from_gray_bytes(4, 4, vec![151; 16]).unwrap();
        let scorer = NccScorer::new(0);
        let at = Instant::now();
        assert_eq!(scorer.score(&frame, &same, &roi, at).unwrap().score, 1.0);
        let s = scorer.score(&frame, &brighter, &roi, at).unwrap().score;
        assert!((s - 0.8).abs() < 1e-6, "score was {}", s);
    }

    #[test]
    fn test_diff_scorer_identical_is_one() {
        let frame = textured_frame(40, 40);
        let roi = RegionOfInterest::new(5, 5, 10, 10).unwrap();
        let template = Template::capture(&frame, &roi).unwrap();
        let result = DiffScorer::new(2)
            .score(&frame, &template, &roi, Instant::now())
            .unwrap();
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn test_diff_scorer_reports_rms_distance() {
        let frame = RgbaImage::from_pixel(12, 12, Rgba([100, 100, 100, 255]));
        let roi = RegionOfInterest::new(2, 2, 4, 4).unwrap();
        let template = Template::from_gray_bytes(4, 4, vec![151; 16]).unwrap();
        let result = DiffScorer::new(2)
            .score(&frame, &template, &roi, Instant::now())
            .unwrap();
        assert!((result.score - 0.8).abs() < 1e-5, "score was {}", result.score);
    }

    #[test]
    fn test_exceeds_threshold() {
        let at = Instant::now();
        assert!(MatchResult { score: 0.85, at }.exceeds(85));
        assert!(!MatchResult { score: 0.849, at }.exceeds(85));
    }
}
