//! Stratus CLI — declarative cloud resource graphs.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "stratus",
    version,
    about = "Declarative cloud resource graphs — typed components, wave scheduling, cross-stack references"
)]
struct Cli {
    #[command(subcommand)]
    command: stratus::cli::Commands,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(e) = stratus::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
