use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "facegate",
    about = "Face-verified door access controller",
    version
)]
pub struct Cli {
    /// Configuration file (defaults to /etc/facegate/config.toml, then /usr/local/etc/facegate/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit structured JSON to stdout instead of human-readable logs
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase verbosity (may be used multiple times)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Watch the camera and unlock the door for enrolled faces
    Run,
    /// Build the identity store from a directory of face images
    Enroll(EnrollArgs),
    /// Check a still image against the identity store
    Verify(VerifyArgs),
}

#[derive(Debug, Args)]
pub struct EnrollArgs {
    /// Directory of .jpg/.jpeg/.png images, one person per file named after them
    #[arg(long)]
    pub images: PathBuf,

    /// Output identity store (defaults to verifier.identity_store from the configuration)
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct VerifyArgs {
    /// Image containing the face to verify
    #[arg(long)]
    pub image: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl From<bool> for OutputMode {
    fn from(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

impl Cli {
    pub fn output_mode(&self) -> OutputMode {
        OutputMode::from(self.json)
    }
}
