use std::io;

use anyhow::{Context, Result};
use clap::Parser;
use karing::cli::{self, Cli};
use karing::config::Config;
use karing::{db, observability};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()
        .context("read KARING_* environment")?
        .with_overrides(&cli.overrides());
    observability::init_tracing(&config.log_filter, config.log_json);
    observability::log_clamp_notices(&config);

    if cli.check_db || cli.command.is_some() {
        db::init_schema(&config.db_path, config.fts_enabled)
            .with_context(|| format!("initialize database {}", config.db_path.display()))?;
    }
    if cli.check_db {
        return cli::check_db(&config, &mut io::stdout().lock());
    }
    if let Some(command) = cli.command {
        return cli::run_command(&config, command, &mut io::stdout().lock());
    }

    karing::serve(config).await
}
