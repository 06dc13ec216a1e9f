use std::path::{Path, PathBuf};

use facegate_config::ResolvedConfig;
use serde::Serialize;
use tracing::info;

use super::detector::{CascadeDetector, FaceDetector, FaceRegion};
use super::embedder::DlibEmbedder;
use super::store::IdentityStore;
use super::verifier::{VerificationResult, Verifier};
use crate::capture::Frame;
use crate::errors::{AppError, AppResult};

/// Result of running the monitoring pipeline once against a still image.
#[derive(Debug, Clone, Serialize)]
pub struct StillVerificationOutcome {
    pub image: PathBuf,
    pub width: u32,
    pub height: u32,
    pub faces: Vec<FaceRegion>,
    /// `None` when the image did not contain exactly one face.
    pub result: Option<VerificationResult>,
}

impl StillVerificationOutcome {
    pub fn is_authorized(&self) -> bool {
        self.result
            .as_ref()
            .map_or(false, VerificationResult::is_authorized)
    }
}

pub fn run_still_verification(
    image: &Path,
    config: &ResolvedConfig,
) -> AppResult<StillVerificationOutcome> {
    let store = IdentityStore::load(&config.verifier.identity_store)?;
    let mut detector = CascadeDetector::load(&config.detector)?;
    let verifier = Verifier::new(
        config.verifier.tolerance,
        Box::new(DlibEmbedder::load(&config.verifier)?),
    );
    run_still_verification_with(image, &mut detector, &verifier, &store)
}

/// Apply the single-face gate and, when it passes, the verifier to `image`.
pub fn run_still_verification_with(
    image: &Path,
    detector: &mut dyn FaceDetector,
    verifier: &Verifier,
    store: &IdentityStore,
) -> AppResult<StillVerificationOutcome> {
    if !image.exists() {
        return Err(AppError::MissingInput {
            path: image.to_path_buf(),
        });
    }
    let rgb = image::open(image)
        .map_err(|source| AppError::ImageDecode {
            path: image.to_path_buf(),
            source,
        })?
        .to_rgb8();
    let frame = Frame::from_rgb_image(rgb);

    let faces = detector.detect(&frame)?;
    info!(image = %image.display(), faces = faces.len(), "detected faces in still image");

    let result = match faces.as_slice() {
        [single] => Some(verifier.verify(&frame, single, store)),
        _ => None,
    };

    Ok(StillVerificationOutcome {
        image: image.to_path_buf(),
        width: frame.width,
        height: frame.height,
        faces,
        result,
    })
}
