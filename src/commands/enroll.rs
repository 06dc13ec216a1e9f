use std::any::Any;
use std::process::ExitCode;

use facegate_config::{ResolvedConfig, VerifierSettings};
use facegate_core::errors::AppResult;
use facegate_core::faces::{self, EnrollmentConfig, EnrollmentOutcome};

use crate::cli::{EnrollArgs, OutputMode};
use crate::commands::CommandHandler;
use crate::output::render_enrollment;

type RunFn = dyn Fn(&EnrollmentConfig, &VerifierSettings) -> AppResult<EnrollmentOutcome> + Send + Sync;
type RenderFn = dyn Fn(&EnrollmentOutcome, OutputMode) -> AppResult<()> + Send + Sync;

pub struct EnrollHandler {
    config: EnrollmentConfig,
    verifier: VerifierSettings,
    run: Box<RunFn>,
    render: Box<RenderFn>,
}

impl EnrollHandler {
    pub fn new(args: EnrollArgs, config: ResolvedConfig) -> Self {
        Self::with_dependencies(args, config, faces::run_enrollment, render_enrollment)
    }

    pub fn with_dependencies(
        args: EnrollArgs,
        config: ResolvedConfig,
        run: impl Fn(&EnrollmentConfig, &VerifierSettings) -> AppResult<EnrollmentOutcome>
            + Send
            + Sync
            + 'static,
        render: impl Fn(&EnrollmentOutcome, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        let verifier = config.verifier;
        let output = args
            .output
            .unwrap_or_else(|| verifier.identity_store.clone());
        Self {
            config: EnrollmentConfig {
                images: args.images,
                output,
            },
            verifier,
            run: Box::new(run),
            render: Box::new(render),
        }
    }

    pub fn enrollment_config(&self) -> &EnrollmentConfig {
        &self.config
    }
}

impl CommandHandler for EnrollHandler {
    fn execute(&self, mode: OutputMode) -> AppResult<ExitCode> {
        let outcome = (self.run)(&self.config, &self.verifier)?;
        (self.render)(&outcome, mode)?;
        Ok(ExitCode::SUCCESS)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
