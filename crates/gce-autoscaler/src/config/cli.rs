use clap::{Parser, Subcommand};
use utils::version;

use crate::config::run::RunArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Keep the node group registry in sync with the cloud and report the cluster's nodes
    Run(Box<RunArgs>),
}
