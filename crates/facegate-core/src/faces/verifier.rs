use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::detector::FaceRegion;
use super::embedder::EmbeddingModel;
use super::store::IdentityStore;
use crate::capture::Frame;

/// Outcome of checking one face region against the enrolled identities.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", content = "identity", rename_all = "snake_case")]
pub enum VerificationResult {
    Authorized(String),
    Unauthorized,
    EmbeddingExtractionFailed,
}

impl VerificationResult {
    pub fn is_authorized(&self) -> bool {
        matches!(self, VerificationResult::Authorized(_))
    }
}

pub struct Verifier {
    tolerance: f64,
    embedder: Box<dyn EmbeddingModel>,
}

impl Verifier {
    pub fn new(tolerance: f64, embedder: Box<dyn EmbeddingModel>) -> Self {
        Self {
            tolerance,
            embedder,
        }
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Embed the face inside `region` and return the first enrolled identity, in store order,
    /// whose distance is strictly below the tolerance.
    pub fn verify(
        &self,
        frame: &Frame,
        region: &FaceRegion,
        store: &IdentityStore,
    ) -> VerificationResult {
        let Some(rect) = region.clamp(frame.width, frame.height) else {
            warn!(?region, "face region has no area inside the frame");
            return VerificationResult::EmbeddingExtractionFailed;
        };

        let crop = match frame.crop_rgb(rect) {
            Ok(crop) => crop,
            Err(err) => {
                error!("failed to extract face region: {err}");
                return VerificationResult::EmbeddingExtractionFailed;
            }
        };

        let probe = match self.embedder.embed(&crop) {
            Ok(Some(probe)) => probe,
            Ok(None) => {
                warn!(?region, "no face embedding could be derived from region");
                return VerificationResult::EmbeddingExtractionFailed;
            }
            Err(err) => {
                error!("embedding model failed: {err}");
                return VerificationResult::EmbeddingExtractionFailed;
            }
        };

        if probe.len() != store.dimension() {
            error!(
                expected = store.dimension(),
                found = probe.len(),
                "probe embedding length does not match identity store"
            );
            return VerificationResult::EmbeddingExtractionFailed;
        }

        for template in store.iter() {
            let distance = euclidean_distance(&probe, &template.embedding);
            debug!(identity = %template.name, distance, "compared against template");
            if distance < self.tolerance {
                info!(
                    target: "audit",
                    identity = %template.name,
                    distance,
                    tolerance = self.tolerance,
                    "access authorized"
                );
                return VerificationResult::Authorized(template.name.clone());
            }
        }

        warn!(
            target: "audit",
            tolerance = self.tolerance,
            "unauthorized face presented"
        );
        VerificationResult::Unauthorized
    }
}

pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}
