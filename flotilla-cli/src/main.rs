mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Launch(args) => commands::launch::execute(args, &cli.global).await,
        Commands::Check(args) => commands::check::execute(args, &cli.global),
        Commands::Plan(args) => commands::plan::execute(args, &cli.global),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
