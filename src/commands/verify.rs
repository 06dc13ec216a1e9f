use std::any::Any;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use facegate_config::ResolvedConfig;
use facegate_core::errors::AppResult;
use facegate_core::faces::{self, StillVerificationOutcome};

use crate::cli::{OutputMode, VerifyArgs};
use crate::commands::CommandHandler;
use crate::output::render_verification;

type RunFn = dyn Fn(&Path, &ResolvedConfig) -> AppResult<StillVerificationOutcome> + Send + Sync;
type RenderFn = dyn Fn(&StillVerificationOutcome, OutputMode) -> AppResult<()> + Send + Sync;

/// Exit status when the image was checked but nobody was authorized.
pub const NOT_AUTHORIZED_EXIT: u8 = 1;

pub struct VerifyHandler {
    image: PathBuf,
    config: ResolvedConfig,
    run: Box<RunFn>,
    render: Box<RenderFn>,
}

impl VerifyHandler {
    pub fn new(args: VerifyArgs, config: ResolvedConfig) -> Self {
        Self::with_dependencies(
            args,
            config,
            faces::run_still_verification,
            render_verification,
        )
    }

    pub fn with_dependencies(
        args: VerifyArgs,
        config: ResolvedConfig,
        run: impl Fn(&Path, &ResolvedConfig) -> AppResult<StillVerificationOutcome>
            + Send
            + Sync
            + 'static,
        render: impl Fn(&StillVerificationOutcome, OutputMode) -> AppResult<()>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            image: args.image,
            config,
            run: Box::new(run),
            render: Box::new(render),
        }
    }
}

impl CommandHandler for VerifyHandler {
    fn execute(&self, mode: OutputMode) -> AppResult<ExitCode> {
        let outcome = (self.run)(&self.image, &self.config)?;
        (self.render)(&outcome, mode)?;
        if outcome.is_authorized() {
            Ok(ExitCode::SUCCESS)
        } else {
            Ok(ExitCode::from(NOT_AUTHORIZED_EXIT))
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
