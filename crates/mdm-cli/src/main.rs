use mdm_core::logging;

mod cli;

use crate::cli::CliCommand;

fn main() {
    // Log file first; stderr when the state dir is unusable.
    if let Err(err) = logging::init_logging(None) {
        logging::init_logging_stderr(None);
        tracing::warn!("file logging unavailable: {err:#}");
    }

    match CliCommand::run_from_args() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("mdm error: {:#}", err);
            std::process::exit(1);
        }
    }
}
