use std::any::Any;
use std::process::ExitCode;

use facegate_config::ResolvedConfig;
use facegate_core::errors::AppResult;

use crate::cli::{Commands, OutputMode};

pub trait CommandHandler: Send + Sync {
    fn execute(&self, mode: OutputMode) -> AppResult<ExitCode>;
    fn as_any(&self) -> &dyn Any;
}

mod enroll;
mod run;
mod verify;

pub use enroll::EnrollHandler;
pub use run::RunHandler;
pub use verify::VerifyHandler;

pub fn handler_for(command: Commands, config: ResolvedConfig) -> Box<dyn CommandHandler> {
    match command {
        Commands::Run => Box::new(RunHandler::new(config)),
        Commands::Enroll(args) => Box::new(EnrollHandler::new(args, config)),
        Commands::Verify(args) => Box::new(VerifyHandler::new(args, config)),
    }
}
