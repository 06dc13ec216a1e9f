use std::process::ExitCode;

use clap::Parser;
use facegate::cli::Cli;
use facegate::commands::handler_for;
use facegate::logging::build_logging;
use facegate::output::render_error;
use facegate_config::load_resolved_config;
use facegate_core::errors::AppError;
use tracing::info;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mode = cli.output_mode();

    let loaded = match load_resolved_config(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(err) => {
            let err = AppError::from(err);
            render_error(&err, mode);
            return err.exit_code();
        }
    };

    let logging = match build_logging(cli.verbose, &loaded.resolved.logging) {
        Ok(logging) => logging,
        Err(err) => {
            render_error(&err, mode);
            return err.exit_code();
        }
    };

    logging.scope(|| {
        match &loaded.source {
            Some(path) => info!("loaded configuration from {}", path.display()),
            None => info!("no configuration file found; using built-in defaults"),
        }

        let handler = handler_for(cli.command, loaded.resolved);
        match handler.execute(mode) {
            Ok(code) => code,
            Err(err) => {
                render_error(&err, mode);
                err.exit_code()
            }
        }
    })
}
