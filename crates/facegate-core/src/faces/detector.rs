use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use facegate_config::{DetectorSettings, DETECTOR_MODEL_ENV};
use rustface::{create_detector_with_model, read_model, ImageData};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::capture::{Frame, PixelRect};
use crate::errors::{AppError, AppResult};

const SLIDE_STEP: u32 = 4;
const MIN_WINDOW: u32 = 20;
const MIN_PYRAMID_SCALE: f32 = 0.01;
const MAX_PYRAMID_SCALE: f32 = 0.99;

/// Candidate face bounding box in frame pixel coordinates.
///
/// May extend past the frame edges; call [`FaceRegion::clamp`] before extracting pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FaceRegion {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl FaceRegion {
    pub fn new(x: i64, y: i64, width: i64, height: i64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Intersect the region with a `frame_width` x `frame_height` frame.
    ///
    /// Returns `None` when nothing with positive area remains.
    pub fn clamp(&self, frame_width: u32, frame_height: u32) -> Option<PixelRect> {
        let left = self.x.max(0);
        let top = self.y.max(0);
        let right = self.x.saturating_add(self.width).min(frame_width as i64);
        let bottom = self.y.saturating_add(self.height).min(frame_height as i64);
        if right <= left || bottom <= top {
            return None;
        }
        Some(PixelRect {
            x: left as u32,
            y: top as u32,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        })
    }
}

pub trait FaceDetector {
    /// Locate candidate faces. Fails with `InvalidFrame` for malformed input.
    fn detect(&mut self, frame: &Frame) -> AppResult<Vec<FaceRegion>>;
}

/// Multi-scale cascade classifier backed by the SeetaFace funnel-structured cascade.
pub struct CascadeDetector {
    inner: Box<dyn rustface::Detector>,
    settings: DetectorSettings,
}

impl CascadeDetector {
    pub fn load(settings: &DetectorSettings) -> AppResult<Self> {
        let path = settings.model_path().ok_or(AppError::MissingModel {
            kind: "face detector",
            key: "detector.model",
            env: DETECTOR_MODEL_ENV,
        })?;
        debug!(path = %path.display(), "loading face detector model");
        Self::from_path(&path, settings)
    }

    pub fn from_path(path: &Path, settings: &DetectorSettings) -> AppResult<Self> {
        let file = File::open(path).map_err(|err| AppError::ModelLoad {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let model = read_model(BufReader::new(file)).map_err(|err| AppError::ModelLoad {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

        let mut inner = create_detector_with_model(model);
        configure(inner.as_mut(), settings);

        Ok(Self {
            inner,
            settings: settings.clone(),
        })
    }
}

/// Apply the cascade tuning to a rustface detector.
///
/// rustface panics on out-of-range tuning, so every value handed over is brought into the
/// range it accepts first.
pub(crate) fn configure(inner: &mut dyn rustface::Detector, settings: &DetectorSettings) {
    let min_window = settings.min_size.0.min(settings.min_size.1).max(MIN_WINDOW);
    let max_window = settings.max_size.0.max(settings.max_size.1).max(min_window);
    inner.set_min_face_size(min_window);
    inner.set_max_face_size(max_window);
    inner.set_pyramid_scale_factor(pyramid_scale(settings.scale_factor));
    // min_neighbors >= 1 is enforced by config validation; rustface rejects a zero threshold.
    inner.set_score_thresh(f64::from(settings.min_neighbors.max(1)));
    inner.set_slide_window_step(SLIDE_STEP, SLIDE_STEP);
}

/// Convert a growth factor between window sizes (> 1.0) into rustface's pyramid shrink factor.
pub fn pyramid_scale(scale_factor: f64) -> f32 {
    let shrink = (1.0 / scale_factor) as f32;
    let clamped = if shrink.is_finite() {
        shrink.clamp(MIN_PYRAMID_SCALE, MAX_PYRAMID_SCALE)
    } else {
        MAX_PYRAMID_SCALE
    };
    if clamped != shrink {
        warn!(
            scale_factor,
            pyramid_scale = clamped,
            "detector.scale_factor outside the cascade's supported range; clamped"
        );
    }
    clamped
}

impl FaceDetector for CascadeDetector {
    fn detect(&mut self, frame: &Frame) -> AppResult<Vec<FaceRegion>> {
        let gray = frame.to_luma()?;
        let image = ImageData::new(&gray, gray.width(), gray.height());
        let candidates = self
            .inner
            .detect(&image)
            .into_iter()
            .map(|face| {
                let bbox = face.bbox();
                FaceRegion::new(
                    bbox.x() as i64,
                    bbox.y() as i64,
                    bbox.width() as i64,
                    bbox.height() as i64,
                )
            })
            .collect::<Vec<_>>();
        trace!(candidates = candidates.len(), "cascade pass complete");
        Ok(filter_candidates(candidates, &self.settings))
    }
}

/// Keep candidates whose width and height each lie within `[min_size, max_size]`.
///
/// The cascade only bounds the square window side, so rectangular bounds are applied here.
/// The `min_neighbors` score floor is already enforced inside the cascade.
pub fn filter_candidates(
    candidates: Vec<FaceRegion>,
    settings: &DetectorSettings,
) -> Vec<FaceRegion> {
    let (min_w, min_h) = settings.min_size;
    let (max_w, max_h) = settings.max_size;

    candidates
        .into_iter()
        .filter(|region| {
            (min_w as i64..=max_w as i64).contains(&region.width)
                && (min_h as i64..=max_h as i64).contains(&region.height)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DetectorSettings {
        DetectorSettings {
            model: None,
            scale_factor: 1.2,
            min_neighbors: 6,
            min_size: (100, 100),
            max_size: (300, 300),
        }
    }

    #[test]
    fn clamp_keeps_interior_region() {
        let region = FaceRegion::new(10, 20, 30, 40);
        assert_eq!(
            region.clamp(100, 100),
            Some(PixelRect {
                x: 10,
                y: 20,
                width: 30,
                height: 40
            })
        );
    }

    #[test]
    fn clamp_trims_partially_outside_region() {
        let region = FaceRegion::new(-10, 90, 30, 40);
        assert_eq!(
            region.clamp(100, 100),
            Some(PixelRect {
                x: 0,
                y: 90,
                width: 20,
                height: 10
            })
        );
    }

    #[test]
    fn clamp_rejects_region_outside_frame() {
        assert_eq!(FaceRegion::new(120, 10, 30, 30).clamp(100, 100), None);
        assert_eq!(FaceRegion::new(-50, 10, 50, 30).clamp(100, 100), None);
    }

    #[test]
    fn clamp_rejects_degenerate_region() {
        assert_eq!(FaceRegion::new(10, 10, 0, 30).clamp(100, 100), None);
        assert_eq!(FaceRegion::new(10, 10, 20, -5).clamp(100, 100), None);
    }

    #[test]
    fn filter_enforces_size_bounds() {
        let candidates = vec![
            FaceRegion::new(0, 0, 90, 90),
            FaceRegion::new(0, 0, 150, 150),
            FaceRegion::new(0, 0, 320, 320),
            FaceRegion::new(0, 0, 150, 310),
        ];
        let kept = filter_candidates(candidates, &settings());
        assert_eq!(kept, vec![FaceRegion::new(0, 0, 150, 150)]);
    }

    /// Records tuning and rejects the same values rustface's cascade rejects.
    #[derive(Default)]
    struct StrictCascade {
        min_face: u32,
        max_face: u32,
        pyramid: f32,
        thresh: f64,
    }

    impl rustface::Detector for StrictCascade {
        fn detect(&mut self, _image: &ImageData) -> Vec<rustface::FaceInfo> {
            Vec::new()
        }
        fn set_window_size(&mut self, _wnd_size: u32) {}
        fn set_slide_window_step(&mut self, step_x: u32, step_y: u32) {
            assert!(step_x > 0 && step_y > 0);
        }
        fn set_min_face_size(&mut self, min_face_size: u32) {
            assert!(min_face_size >= 20, "Illegal min face size: {min_face_size}");
            self.min_face = min_face_size;
        }
        fn set_max_face_size(&mut self, max_face_size: u32) {
            self.max_face = max_face_size;
        }
        fn set_pyramid_scale_factor(&mut self, scale_factor: f32) {
            assert!(
                (0.01..=0.99).contains(&scale_factor),
                "Illegal scale factor: {scale_factor}"
            );
            self.pyramid = scale_factor;
        }
        fn set_score_thresh(&mut self, thresh: f64) {
            assert!(thresh > 0.0, "Illegal threshold: {thresh}");
            self.thresh = thresh;
        }
    }

    #[test]
    fn configure_maps_settings_onto_cascade() {
        let mut cascade = StrictCascade::default();
        configure(&mut cascade, &settings());
        assert_eq!(cascade.min_face, 100);
        assert_eq!(cascade.max_face, 300);
        assert!((cascade.pyramid - 1.0 / 1.2).abs() < 1e-6);
        assert_eq!(cascade.thresh, 6.0);
    }

    #[test]
    fn extreme_scale_factors_are_clamped_for_the_cascade() {
        for (scale_factor, expected) in [(1.005, 0.99), (150.0, 0.01)] {
            let mut cascade = StrictCascade::default();
            let tuned = DetectorSettings {
                scale_factor,
                ..settings()
            };
            configure(&mut cascade, &tuned);
            assert_eq!(cascade.pyramid, expected);
        }
    }

    #[test]
    fn small_windows_are_raised_to_cascade_minimum() {
        let mut cascade = StrictCascade::default();
        let tuned = DetectorSettings {
            min_size: (8, 12),
            max_size: (10, 16),
            ..settings()
        };
        configure(&mut cascade, &tuned);
        assert_eq!(cascade.min_face, 20);
        assert_eq!(cascade.max_face, 20);
    }

    #[test]
    fn bundled_model_loads_with_fine_scale_factor() {
        // Point FACEGATE_TEST_DETECTOR_MODEL at rustface's seeta_fd_frontal_v1.0.bin to run this.
        let Some(path) =
            std::env::var_os("FACEGATE_TEST_DETECTOR_MODEL").map(std::path::PathBuf::from)
        else {
            return;
        };
        let tuned = DetectorSettings {
            scale_factor: 1.005,
            ..settings()
        };
        assert!(CascadeDetector::from_path(&path, &tuned).is_ok());
    }

    #[test]
    fn missing_model_is_reported() {
        std::env::remove_var(DETECTOR_MODEL_ENV);
        let err = CascadeDetector::load(&settings()).err().unwrap();
        assert!(matches!(err, AppError::MissingModel { .. }));
    }

    #[test]
    fn unreadable_model_is_reported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("missing.bin");
        let err = CascadeDetector::from_path(&path, &settings()).err().unwrap();
        assert!(matches!(err, AppError::ModelLoad { .. }));
    }
}
