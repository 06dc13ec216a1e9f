use std::error::Error;
use std::io::{self, Write};

use facegate_core::controller::RunSummary;
use facegate_core::errors::{AppError, AppResult};
use facegate_core::faces::{EnrollmentOutcome, StillVerificationOutcome, VerificationResult};
use serde::Serialize;
use serde_json::json;

use crate::cli::OutputMode;

fn write_json<T: Serialize>(value: &T) -> AppResult<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let payload = serde_json::to_string(value)?;
    handle.write_all(payload.as_bytes())?;
    handle.write_all(b"\n")?;
    Ok(())
}

pub fn render_run_summary(summary: &RunSummary, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            println!(
                "Monitoring stopped after {} verification(s): {} authorized, {} denied, {} fault(s)",
                summary.iterations, summary.authorizations, summary.denials, summary.faults
            );
            if summary.dispatch_failures > 0 {
                println!(
                    "Unlock could not be dispatched {} time(s)",
                    summary.dispatch_failures
                );
            }
        }
        OutputMode::Json => write_json(summary)?,
    }
    Ok(())
}

pub fn render_enrollment(outcome: &EnrollmentOutcome, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            for line in &outcome.logs {
                println!("{line}");
            }
            println!(
                "Enrollment successful: {} (identities: {}, skipped: {})",
                outcome.output.display(),
                outcome.enrolled.len(),
                outcome.skipped.len()
            );
        }
        OutputMode::Json => write_json(outcome)?,
    }
    Ok(())
}

pub fn render_verification(outcome: &StillVerificationOutcome, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            println!(
                "Detected {} face(s) in {} ({}x{})",
                outcome.faces.len(),
                outcome.image.display(),
                outcome.width,
                outcome.height
            );
            println!("{}", describe_result(outcome.result.as_ref()));
        }
        OutputMode::Json => write_json(outcome)?,
    }
    Ok(())
}

pub fn describe_result(result: Option<&VerificationResult>) -> String {
    match result {
        Some(VerificationResult::Authorized(name)) => format!("Authorized: {name}"),
        Some(VerificationResult::Unauthorized) => "Unauthorized".into(),
        Some(VerificationResult::EmbeddingExtractionFailed) => {
            "No embedding could be extracted from the face region".into()
        }
        None => "Not verified: exactly one face is required".into(),
    }
}

pub fn render_error(err: &AppError, mode: OutputMode) {
    match mode {
        OutputMode::Human => {
            eprintln!("error: {}", err.human_message());
            if let Some(source) = err.source() {
                eprintln!("cause: {source}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "success": false,
                "error": err.human_message(),
            });
            println!("{payload}");
            if let Some(source) = err.source() {
                eprintln!("cause: {source}");
            }
        }
    }
}
