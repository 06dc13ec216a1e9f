pub mod detector;
pub mod embedder;
pub mod enrollment;
pub mod offline;
pub mod store;
pub mod verifier;

pub use detector::{filter_candidates, CascadeDetector, FaceDetector, FaceRegion};

pub use embedder::{DlibEmbedder, EmbeddingModel, FaceModelPaths};

pub use enrollment::{
    run_enrollment, run_enrollment_with_model, EnrollmentConfig, EnrollmentOutcome,
};

pub use offline::{run_still_verification, run_still_verification_with, StillVerificationOutcome};

pub use store::{write_identity_store, IdentityStore, IdentityTemplate};

pub use verifier::{euclidean_distance, VerificationResult, Verifier};
