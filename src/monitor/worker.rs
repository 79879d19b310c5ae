//! Detection worker: captures a frame every interval and scores it.
//!
//! Runs on its own thread and only reports results; every decision is made
//! by the control thread.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::events::ControlMessage;
use crate::capture::{FrameSource, open_source};
use crate::config::{CaptureTarget, DetectionSettings};
use crate::detection::{DeathTemplate, MatchScorer, RegionOfInterest, Template, TemplateSlot, scorer_for};
use crate::error::CaptureError;

/// Longest single sleep, so a stop request is noticed quickly.
const STOP_CHECK: Duration = Duration::from_millis(50);

/// Spawns the detection worker for one monitoring run.
pub fn spawn_detection_worker(
    settings: DetectionSettings,
    slot: Arc<TemplateSlot>,
    tx: Sender<ControlMessage>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("detection".to_string())
        .spawn(move || {
            let scorer = scorer_for(settings.backend, settings.search_margin_px);
            let interval = Duration::from_millis(settings.interval_ms.max(1));
            let target = settings.capture_target.clone();
            info!(
                "Detection worker started: {:?} every {} ms on {}",
                settings.backend, settings.interval_ms, target
            );
            let mut open = || open_source(&target);
            run_detection_loop(&mut open, scorer.as_ref(), &slot, interval, &tx, &stop);
            debug!("Detection worker stopped");
        })
}

/// Runs detection passes at a fixed cadence until `stop` is set or the
/// receiver is gone.
pub fn run_detection_loop(
    open: &mut dyn FnMut() -> Result<Box<dyn FrameSource>, CaptureError>,
    scorer: &dyn MatchScorer,
    slot: &TemplateSlot,
    interval: Duration,
    tx: &Sender<ControlMessage>,
    stop: &AtomicBool,
) {
    let mut source: Option<Box<dyn FrameSource>> = None;
    let mut next_pass = Instant::now();

    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now < next_pass {
            thread::sleep((next_pass - now).min(STOP_CHECK));
            continue;
        }
        next_pass = now + interval;

        if let Some(msg) = detection_pass(&mut source, open, scorer, slot) {
            if tx.send(msg).is_err() {
                break;
            }
        }
    }
}

/// Captures and scores one frame. Returns `None` when the pass was skipped
/// because the template is being replaced.
fn detection_pass(
    source: &mut Option<Box<dyn FrameSource>>,
    open: &mut dyn FnMut() -> Result<Box<dyn FrameSource>, CaptureError>,
    scorer: &dyn MatchScorer,
    slot: &TemplateSlot,
) -> Option<ControlMessage> {
    match slot.is_loaded() {
        Ok(true) => {}
        Ok(false) => return Some(ControlMessage::NoTemplate),
        Err(_busy) => return None,
    }

    let frame = match grab(source, open) {
        Ok(frame) => frame,
        Err(e) => return Some(ControlMessage::CaptureFailed(e.to_string())),
    };
    let at = Instant::now();

    let guard = slot.begin_scoring().ok()?;
    let Some(death) = guard.template() else {
        return Some(ControlMessage::NoTemplate);
    };
    Some(match scorer.score(&frame, &death.template, &death.roi, at) {
        Ok(result) => ControlMessage::FrameScored(result),
        Err(e) => ControlMessage::ScoreFailed(e),
    })
}

/// Grabs from the open source, opening one first if needed. A failed source
/// is dropped so the next pass starts fresh.
fn grab(
    source: &mut Option<Box<dyn FrameSource>>,
    open: &mut dyn FnMut() -> Result<Box<dyn FrameSource>, CaptureError>,
) -> Result<image::RgbaImage, CaptureError> {
    if source.is_none() {
        *source = Some(open()?);
    }
    let Some(active) = source.as_mut() else {
        return Err(CaptureError::Unavailable("no capture source".to_string()));
    };
    let result = active.grab();
    if result.is_err() {
        *source = None;
    }
    result
}

/// Grabs one frame and cuts the death template out of it.
pub fn capture_template(
    source: &mut dyn FrameSource,
    roi: RegionOfInterest,
) -> Result<DeathTemplate, String> {
    let frame = source.grab().map_err(|e| e.to_string())?;
    let (width, height) = frame.dimensions();
    let template = Template::capture(&frame, &roi).map_err(|_| {
        format!(
            "region {} does not fit the captured {}x{} frame",
            roi, width, height
        )
    })?;
    Ok(DeathTemplate { roi, template })
}

/// Reads an image file and uses it, in grayscale, as the template for `roi`.
///
/// The image must fit inside the region.
pub fn load_template(path: &Path, roi: RegionOfInterest) -> Result<DeathTemplate, String> {
    let image = image::open(path).map_err(|e| format!("could not read {}: {}", path.display(), e))?;
    let gray = image.to_luma8();
    let (width, height) = gray.dimensions();
    if width > roi.width || height > roi.height {
        return Err(format!(
            "{}x{} image is larger than the region {}",
            width, height, roi
        ));
    }
    let template =
        Template::from_gray_image(gray).ok_or_else(|| format!("{} is empty", path.display()))?;
    Ok(DeathTemplate { roi, template })
}

/// Captures a template on a short-lived thread and reports the result.
pub fn spawn_template_capture(
    target: CaptureTarget,
    roi: RegionOfInterest,
    tx: Sender<ControlMessage>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("template-capture".to_string())
        .spawn(move || {
            let result = open_source(&target)
                .map_err(|e| e.to_string())
                .and_then(|mut source| capture_template(source.as_mut(), roi));
            let _ = tx.send(ControlMessage::TemplateCaptured(result));
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgba, RgbaImage};
    use std::sync::mpsc;

    /// Serves the same frame forever, counting grabs.
    struct StaticFrame {
        frame: RgbaImage,
        grabs: usize,
        fail_after: Option<usize>,
    }

    impl FrameSource for StaticFrame {
        fn grab(&mut self) -> Result<RgbaImage, CaptureError> {
            self.grabs += 1;
            if self.fail_after.is_some_and(|n| self.grabs > n) {
                return Err(CaptureError::Failed("device lost".to_string()));
            }
            Ok(self.frame.clone())
        }
    }

    fn patterned_frame() -> RgbaImage {
        RgbaImage::from_fn(64, 48, |x, y| {
            let v = ((x * 7 + y * 13) % 256) as u8;
            Rgba([v, v, v, 255])
        })
    }

    fn template_from(frame: &RgbaImage, roi: RegionOfInterest) -> DeathTemplate {
        let template = Template::capture(frame, &roi).unwrap();
        DeathTemplate { roi, template }
    }

    #[test]
    fn test_pass_scores_loaded_template() {
        let frame = patterned_frame();
        let roi = RegionOfInterest::new(10, 10, 16, 12).unwrap();
        let slot = TemplateSlot::new(Some(template_from(&frame, roi)));
        let scorer = scorer_for(crate::detection::DetectionBackend::Template, 4);
        let mut source = None;
        let mut open = || -> Result<Box<dyn FrameSource>, CaptureError> {
            Ok(Box::new(StaticFrame {
                frame: patterned_frame(),
                grabs: 0,
                fail_after: None,
            }))
        };

        match detection_pass(&mut source, &mut open, scorer.as_ref(), &slot) {
            Some(ControlMessage::FrameScored(result)) => assert!(result.score > 0.99),
            other => panic!("unexpected {:?}", other),
        }
        assert!(source.is_some());
    }

    #[test]
    fn test_pass_without_template_skips_capture() {
        let slot = TemplateSlot::new(None);
        let scorer = scorer_for(crate::detection::DetectionBackend::Template, 4);
        let mut source = None;
        let mut opened = 0;
        let mut open = || -> Result<Box<dyn FrameSource>, CaptureError> {
            opened += 1;
            Err(CaptureError::Unavailable("test".to_string()))
        };
        assert!(matches!(
            detection_pass(&mut source, &mut open, scorer.as_ref(), &slot),
            Some(ControlMessage::NoTemplate)
        ));
        assert_eq!(opened, 0);
    }

    #[test]
    fn test_pass_skipped_while_template_busy() {
        let frame = patterned_frame();
        let roi = RegionOfInterest::new(0, 0, 8, 8).unwrap();
        let slot = TemplateSlot::new(Some(template_from(&frame, roi)));
        let _held = slot.begin_scoring().unwrap();
        let scorer = scorer_for(crate::detection::DetectionBackend::Template, 0);
        let mut source = None;
        let mut open = || -> Result<Box<dyn FrameSource>, CaptureError> {
            Err(CaptureError::Unavailable("test".to_string()))
        };
        assert!(detection_pass(&mut source, &mut open, scorer.as_ref(), &slot).is_none());
    }

    #[test]
    fn test_oversized_template_reports_score_failure() {
        let big = Template::from_gray_bytes(500, 400, vec![0; 500 * 400]).unwrap();
        let slot = TemplateSlot::new(Some(DeathTemplate {
            roi: RegionOfInterest::new(0, 0, 500, 400).unwrap(),
            template: big,
        }));
        let scorer = scorer_for(crate::detection::DetectionBackend::Template, 0);
        let mut source = None;
        let mut open = || -> Result<Box<dyn FrameSource>, CaptureError> {
            Ok(Box::new(StaticFrame {
                frame: RgbaImage::new(300, 300),
                grabs: 0,
                fail_after: None,
            }))
        };
        assert!(matches!(
            detection_pass(&mut source, &mut open, scorer.as_ref(), &slot),
            Some(ControlMessage::ScoreFailed(_))
        ));
    }

    #[test]
    fn test_failed_grab_drops_source() {
        let mut source: Option<Box<dyn FrameSource>> = Some(Box::new(StaticFrame {
            frame: patterned_frame(),
            grabs: 0,
            fail_after: Some(1),
        }));
        let mut open = || -> Result<Box<dyn FrameSource>, CaptureError> {
            Err(CaptureError::TargetNotFound("game.exe".to_string()))
        };
        assert!(grab(&mut source, &mut open).is_ok());
        assert!(grab(&mut source, &mut open).is_err());
        assert!(source.is_none());
        assert!(matches!(
            grab(&mut source, &mut open),
            Err(CaptureError::TargetNotFound(_))
        ));
    }

    #[test]
    fn test_loop_stops_when_requested() {
        let (tx, rx) = mpsc::channel();
        let stop = AtomicBool::new(false);
        let slot = TemplateSlot::new(None);
        let scorer = scorer_for(crate::detection::DetectionBackend::ScreenDiff, 0);
        let mut open = || -> Result<Box<dyn FrameSource>, CaptureError> {
            Err(CaptureError::Unavailable("test".to_string()))
        };
        let stop_flag = &stop;
        let passes = thread::scope(|s| {
            let counter = s.spawn(move || {
                let mut passes = 0;
                for msg in rx.iter() {
                    if matches!(msg, ControlMessage::NoTemplate) {
                        passes += 1;
                        if passes == 3 {
                            stop_flag.store(true, Ordering::SeqCst);
                        }
                    }
                }
                passes
            });
            run_detection_loop(&mut open, scorer.as_ref(), &slot, Duration::from_millis(1), &tx, &stop);
            drop(tx);
            counter.join().unwrap()
        });
        assert!(passes >= 3);
        assert!(stop.load(Ordering::SeqCst));
    }

    #[test]
    fn test_capture_template_checks_region() {
        let mut source = StaticFrame {
            frame: patterned_frame(),
            grabs: 0,
            fail_after: None,
        };
        let ok = capture_template(&mut source, RegionOfInterest::new(4, 4, 8, 8).unwrap()).unwrap();
        assert_eq!(ok.template.width(), 8);
        let expected = image::GrayImage::from_fn(8, 8, |x, y| {
            let v = (((x + 4) * 7 + (y + 4) * 13) % 256) as u8;
            Luma([v])
        });
        assert_eq!(ok.template.pixels(), expected.as_raw().as_slice());

        let err = capture_template(&mut source, RegionOfInterest::new(60, 40, 8, 8).unwrap())
            .unwrap_err();
        assert!(err.contains("does not fit"));
    }

    #[test]
    fn test_load_template_from_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("death.png");
        RgbaImage::from_fn(6, 4, |x, y| {
            let v = (x * 40 + y) as u8;
            Rgba([v, v, v, 255])
        })
        .save(&path)
        .unwrap();

        let roi = RegionOfInterest::new(100, 50, 6, 4).unwrap();
        let loaded = load_template(&path, roi).unwrap();
        assert_eq!(loaded.roi, roi);
        assert_eq!((loaded.template.width(), loaded.template.height()), (6, 4));
        assert_eq!(&loaded.template.pixels()[..3], &[0, 40, 80]);

        let small = RegionOfInterest::new(0, 0, 5, 4).unwrap();
        assert!(load_template(&path, small).unwrap_err().contains("larger than"));
        assert!(load_template(&dir.path().join("missing.png"), roi).is_err());
    }
}
