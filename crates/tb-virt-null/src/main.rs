mod bootstrap_helpers;
mod cli_args;
mod null_backend;

use anyhow::Result;
use clap::Parser;
use tb_control::{signals, Engine, ServeOutcome};

use crate::bootstrap_helpers::init_tracing;
use crate::cli_args::Cli;
use crate::null_backend::NullBackend;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    signals::install_handlers()?;

    let config = cli.engine_config();
    let backend = NullBackend::new(
        cli.capabilities.clone(),
        cli.shared_mirror,
        config.copy_timeout_secs,
    );
    let mut engine = Engine::new(backend, config);
    let outcome = engine.serve(
        std::io::stdin(),
        std::io::stdout().lock(),
        &mut std::io::stderr(),
    );
    match outcome {
        ServeOutcome::Exit(code) => std::process::exit(code),
        ServeOutcome::Signal(signal) => {
            signals::reraise(signal);
            std::process::exit(128 + signal)
        }
    }
}
