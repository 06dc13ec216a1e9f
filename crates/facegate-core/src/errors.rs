use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::ExitCode;

use facegate_config::ConfigError;
use image::ImageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to open video device {device}: {source}")]
    DeviceOpen {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("device capability error: {0}")]
    Capability(String),

    #[error("unsupported pixel format '{0}' for selected device")]
    UnsupportedFormat(String),

    #[error("requested frame size {width}x{height} unsupported for pixel format {pixel_format}")]
    UnsupportedFrameSize {
        width: u32,
        height: u32,
        pixel_format: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed processing frame data: {0}")]
    FrameProcessing(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("input file not found or unreadable: {path}")]
    MissingInput { path: PathBuf },

    #[error("failed to decode image {path}: {source}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },

    #[error("missing {kind} model; provide {key} in the configuration or set ${env}")]
    MissingModel {
        kind: &'static str,
        key: &'static str,
        env: &'static str,
    },

    #[error("failed to load model {path}: {message}")]
    ModelLoad { path: PathBuf, message: String },

    #[error("failed to read identity store {path}: {source}")]
    IdentityStoreRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("identity store {path} is invalid: {message}")]
    InvalidIdentityStore { path: PathBuf, message: String },

    #[error("identity store {path} contains no enrolled identities")]
    EmptyIdentityStore { path: PathBuf },

    #[error("failed to write identity store {path}: {source}")]
    IdentityStoreWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no face embeddings could be derived from images in {path}")]
    NothingEnrolled { path: PathBuf },

    #[error("failed to open actuator channel {port}: {message}")]
    ActuatorOpen { port: String, message: String },

    #[error("access controller halted after unrecoverable {phase} failure")]
    ControllerFailed { phase: &'static str },

    #[error("access controller is not monitoring (state: {state})")]
    NotMonitoring { state: &'static str },

    #[error("failed to set up logging: {message}")]
    LoggingSetup { message: String },

    #[error("{context} panicked: {message}")]
    Panicked {
        context: &'static str,
        message: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AppError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            AppError::MissingInput { .. } => ExitCode::from(2),
            AppError::ImageDecode { .. } => ExitCode::from(2),
            AppError::UnsupportedFormat(_) => ExitCode::from(2),
            AppError::UnsupportedFrameSize { .. } => ExitCode::from(2),
            AppError::Capability(_) => ExitCode::from(3),
            AppError::DeviceOpen { .. } => ExitCode::from(4),
            AppError::MissingModel { .. } => ExitCode::from(2),
            AppError::ModelLoad { .. } => ExitCode::from(2),
            AppError::IdentityStoreRead { .. } => ExitCode::from(2),
            AppError::InvalidIdentityStore { .. } => ExitCode::from(2),
            AppError::EmptyIdentityStore { .. } => ExitCode::from(2),
            AppError::NothingEnrolled { .. } => ExitCode::from(2),
            AppError::Config(_) => ExitCode::from(2),
            AppError::LoggingSetup { .. } => ExitCode::from(2),
            _ => ExitCode::from(1),
        }
    }

    pub fn human_message(&self) -> String {
        self.to_string()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Controller-level classification of a failure.
///
/// Initialization paths escalate to `Fatal` once their retry bound is spent; anything raised
/// while monitoring is `Transient` and only aborts the current iteration.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("unrecoverable: {0}")]
    Fatal(#[source] AppError),
    #[error("transient: {0}")]
    Transient(#[source] AppError),
}

impl Fault {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Fault::Fatal(_))
    }

    pub fn error(&self) -> &AppError {
        match self {
            Fault::Fatal(err) | Fault::Transient(err) => err,
        }
    }

    pub fn into_error(self) -> AppError {
        match self {
            Fault::Fatal(err) | Fault::Transient(err) => err,
        }
    }
}

/// Run `f`, turning a panic into [`AppError::Panicked`].
///
/// The panic hook is left alone, so the panic is still reported on stderr.
pub(crate) fn catch_panic<F, T>(context: &'static str, f: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T>,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(AppError::Panicked {
            context,
            message: panic_message(payload.as_ref()),
        })
    })
}

/// Like [`catch_panic`], but with the panic hook silenced for the duration of `f`.
///
/// Swaps the process-wide hook, so only use it for one-off queries during device setup.
pub(crate) fn catch_unwind_silent<F, T>(context: &'static str, f: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T>,
{
    let hook = panic::take_hook();
    panic::set_hook(Box::new(|_| {}));
    let result = catch_panic(context, f);
    panic::set_hook(hook);
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".into()
    }
}
