mod app;
mod config;

use anyhow::Result;
use clap::Parser;
use utils::version;

use crate::app::Application;
use crate::config::Cli;
use crate::config::Commands;
use crate::config::RunArgs;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(run_args) => run(*run_args).await,
    }
}

async fn run(run_args: RunArgs) -> Result<()> {
    utils::logging::init();

    tracing::info!("Starting gce-autoscaler {}", &**version::VERSION);

    let app = Application::build(run_args).await?;
    app.run().await
}
