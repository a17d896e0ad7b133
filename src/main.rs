use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use cli::{Args, Commands};
use usage_protection::config::{get_config_path, HostConfig};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => get_config_path()?,
    };

    match args.command {
        Commands::Init { force } => {
            commands::init_logging(args.verbose, "info");
            commands::init(&config_path, force)
        }
        Commands::HashPin { pin } => commands::hash_pin(&pin),
        command => {
            let config = HostConfig::load_or_default(&config_path)?;
            commands::init_logging(args.verbose, &config.logging.level);

            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(async {
                match command {
                    Commands::Run => commands::run(config).await,
                    Commands::Status { json } => commands::status(config, json).await,
                    Commands::Extend => commands::extend(config).await,
                    Commands::Unlock { pin } => commands::unlock(config, pin).await,
                    Commands::Init { .. } | Commands::HashPin { .. } => Ok(()),
                }
            })
        }
    }
}
