use std::env;
use std::path::PathBuf;

use dlib_face_recognition::{
    FaceDetector as HogFaceDetector, FaceDetectorTrait, FaceEncoderNetwork, FaceEncoderTrait,
    ImageMatrix, LandmarkPredictor, LandmarkPredictorTrait,
};
use facegate_config::VerifierSettings;
use image::RgbImage;
use tracing::debug;

use crate::errors::{AppError, AppResult};

pub const LANDMARK_ENV: &str = "DLIB_LANDMARK_MODEL";
pub const ENCODER_ENV: &str = "DLIB_ENCODER_MODEL";

/// Produces one biometric embedding for an RGB face crop.
pub trait EmbeddingModel {
    /// `Ok(None)` when no face can be discerned in `face`.
    fn embed(&self, face: &RgbImage) -> AppResult<Option<Vec<f64>>>;
}

#[derive(Debug, Clone)]
pub struct FaceModelPaths {
    pub landmark: PathBuf,
    pub encoder: PathBuf,
}

impl FaceModelPaths {
    /// Configured paths first, then the dlib environment variables.
    pub fn resolve(settings: &VerifierSettings) -> AppResult<Self> {
        let landmark = settings
            .landmark_model
            .clone()
            .or_else(|| env::var(LANDMARK_ENV).ok().map(PathBuf::from))
            .ok_or(AppError::MissingModel {
                kind: "landmark predictor",
                key: "verifier.landmark_model",
                env: LANDMARK_ENV,
            })?;

        let encoder = settings
            .encoder_model
            .clone()
            .or_else(|| env::var(ENCODER_ENV).ok().map(PathBuf::from))
            .ok_or(AppError::MissingModel {
                kind: "face encoding network",
                key: "verifier.encoder_model",
                env: ENCODER_ENV,
            })?;

        Ok(Self { landmark, encoder })
    }
}

/// dlib HOG locator + 68-point landmarks + ResNet encoder (128-d embeddings).
pub struct DlibEmbedder {
    locator: HogFaceDetector,
    predictor: LandmarkPredictor,
    encoder: FaceEncoderNetwork,
    jitters: u32,
}

impl DlibEmbedder {
    pub fn load(settings: &VerifierSettings) -> AppResult<Self> {
        let models = FaceModelPaths::resolve(settings)?;
        Self::new(&models, settings.jitters)
    }

    pub fn new(models: &FaceModelPaths, jitters: u32) -> AppResult<Self> {
        debug!(path = %models.landmark.display(), "loading landmark model");
        let predictor =
            LandmarkPredictor::open(&models.landmark).map_err(|message| AppError::ModelLoad {
                path: models.landmark.clone(),
                message,
            })?;
        debug!(path = %models.encoder.display(), "loading encoder model");
        let encoder =
            FaceEncoderNetwork::open(&models.encoder).map_err(|message| AppError::ModelLoad {
                path: models.encoder.clone(),
                message,
            })?;

        Ok(Self {
            locator: HogFaceDetector::new(),
            predictor,
            encoder,
            jitters,
        })
    }

    /// Embeddings for every face located in `image`, in detection order.
    pub fn embed_all(&self, image: &RgbImage) -> Vec<Vec<f64>> {
        let matrix = ImageMatrix::from_image(image);
        let locations = self.locator.face_locations(&matrix);

        let mut landmarks = Vec::with_capacity(locations.len());
        for rect in locations.iter() {
            landmarks.push(self.predictor.face_landmarks(&matrix, rect));
        }

        self.encoder
            .get_face_encodings(&matrix, &landmarks, self.jitters)
            .iter()
            .map(|encoding| encoding.as_ref().to_vec())
            .collect()
    }
}

impl EmbeddingModel for DlibEmbedder {
    fn embed(&self, face: &RgbImage) -> AppResult<Option<Vec<f64>>> {
        Ok(self.embed_all(face).into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> VerifierSettings {
        VerifierSettings {
            identity_store: PathBuf::from("faces.json"),
            tolerance: 0.5,
            landmark_model: Some(PathBuf::from("landmark.dat")),
            encoder_model: Some(PathBuf::from("encoder.dat")),
            jitters: 1,
        }
    }

    #[test]
    fn configured_paths_take_precedence() {
        let models = FaceModelPaths::resolve(&settings()).unwrap();
        assert_eq!(models.landmark, PathBuf::from("landmark.dat"));
        assert_eq!(models.encoder, PathBuf::from("encoder.dat"));
    }

    #[test]
    fn missing_encoder_is_reported() {
        std::env::remove_var(ENCODER_ENV);
        let mut settings = settings();
        settings.encoder_model = None;
        let err = FaceModelPaths::resolve(&settings).unwrap_err();
        match err {
            AppError::MissingModel { env, .. } => assert_eq!(env, ENCODER_ENV),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
