use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use facegate_config::VerifierSettings;
use serde::Serialize;
use tracing::{info, warn};

use super::embedder::{DlibEmbedder, EmbeddingModel};
use super::store::{write_identity_store, IdentityTemplate};
use crate::errors::{AppError, AppResult};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone)]
pub struct EnrollmentConfig {
    pub images: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentOutcome {
    pub output: PathBuf,
    pub enrolled: Vec<String>,
    pub skipped: Vec<PathBuf>,
    pub dimension: usize,
    pub generated_at: String,
    #[serde(skip)]
    pub logs: Vec<String>,
}

pub fn run_enrollment(
    config: &EnrollmentConfig,
    verifier: &VerifierSettings,
) -> AppResult<EnrollmentOutcome> {
    let embedder = DlibEmbedder::load(verifier)?;
    run_enrollment_with_model(config, &embedder)
}

/// Embed every image in `config.images` (sorted by file name) and write one identity per
/// image, named after the file stem.
pub fn run_enrollment_with_model<M: EmbeddingModel + ?Sized>(
    config: &EnrollmentConfig,
    model: &M,
) -> AppResult<EnrollmentOutcome> {
    let mut logs = Vec::new();
    let images = list_images(&config.images)?;
    logs.push(format!(
        "Found {} image(s) in {}",
        images.len(),
        config.images.display()
    ));

    let mut templates: Vec<IdentityTemplate> = Vec::new();
    let mut skipped = Vec::new();
    for path in images {
        let Some(name) = path.file_stem().map(|stem| stem.to_string_lossy().into_owned()) else {
            continue;
        };
        if templates.iter().any(|template| template.name == name) {
            warn!(image = %path.display(), identity = %name, "duplicate identity name, skipping");
            logs.push(format!("Skipped {}: duplicate name '{}'", path.display(), name));
            skipped.push(path);
            continue;
        }

        let rgb = image::open(&path)
            .map_err(|source| AppError::ImageDecode {
                path: path.clone(),
                source,
            })?
            .to_rgb8();

        match model.embed(&rgb)? {
            Some(embedding) => {
                info!(image = %path.display(), identity = %name, "enrolled face");
                logs.push(format!(
                    "Enrolled '{}' from {} ({}x{})",
                    name,
                    path.display(),
                    rgb.width(),
                    rgb.height()
                ));
                templates.push(IdentityTemplate { name, embedding });
            }
            None => {
                warn!(image = %path.display(), "no face found in image, skipping");
                logs.push(format!("Skipped {}: no face found", path.display()));
                skipped.push(path);
            }
        }
    }

    let Some(first) = templates.first() else {
        return Err(AppError::NothingEnrolled {
            path: config.images.clone(),
        });
    };
    let dimension = first.embedding.len();

    write_identity_store(&config.output, &templates)?;
    logs.push(format!(
        "Saved {} identit{} to {}",
        templates.len(),
        if templates.len() == 1 { "y" } else { "ies" },
        config.output.display()
    ));

    Ok(EnrollmentOutcome {
        output: config.output.clone(),
        enrolled: templates.into_iter().map(|template| template.name).collect(),
        skipped,
        dimension,
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        logs,
    })
}

fn list_images(dir: &Path) -> AppResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(AppError::MissingInput {
            path: dir.to_path_buf(),
        });
    }

    let mut images = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let supported = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if supported && path.is_file() {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}
