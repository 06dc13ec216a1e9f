use std::any::Any;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use facegate_config::ResolvedConfig;
use facegate_core::controller::{AccessController, RunSummary};
use facegate_core::errors::{AppResult, Fault};
use tracing::info;

use crate::cli::OutputMode;
use crate::commands::CommandHandler;
use crate::output::render_run_summary;
use crate::signals::ShutdownSignals;

type RunFn = dyn Fn(&ResolvedConfig, Arc<AtomicBool>) -> Result<RunSummary, Fault> + Send + Sync;
type RenderFn = dyn Fn(&RunSummary, OutputMode) -> AppResult<()> + Send + Sync;

pub struct RunHandler {
    config: ResolvedConfig,
    run: Box<RunFn>,
    render: Box<RenderFn>,
}

impl RunHandler {
    pub fn new(config: ResolvedConfig) -> Self {
        Self::with_dependencies(
            config,
            |config, shutdown| AccessController::from_config(config, shutdown).run(),
            render_run_summary,
        )
    }

    pub fn with_dependencies(
        config: ResolvedConfig,
        run: impl Fn(&ResolvedConfig, Arc<AtomicBool>) -> Result<RunSummary, Fault>
            + Send
            + Sync
            + 'static,
        render: impl Fn(&RunSummary, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            run: Box::new(run),
            render: Box::new(render),
        }
    }
}

impl CommandHandler for RunHandler {
    fn execute(&self, mode: OutputMode) -> AppResult<ExitCode> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let signals = ShutdownSignals::register(&shutdown)?;

        let actuator = &self.config.actuator;
        info!(
            camera = %self.config.camera.device,
            actuator = %actuator.port,
            baud_rate = actuator.baud_rate,
            door_open_secs = actuator.door_open.as_secs(),
            identity_store = %self.config.verifier.identity_store.display(),
            "starting access controller"
        );

        let result = (self.run)(&self.config, Arc::clone(&shutdown));
        drop(signals);

        match result {
            Ok(summary) => {
                (self.render)(&summary, mode)?;
                Ok(ExitCode::SUCCESS)
            }
            Err(fault) => Err(fault.into_error()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
