use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use booksync::cli::{CacheCommand, Command};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    booksync::logging::init().context("init logging")?;

    let cli = booksync::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        Command::Fingerprint(args) => {
            booksync::fingerprint::run(args).context("fingerprint")?;
        }
        Command::Cache {
            command: CacheCommand::Status(args),
        } => {
            booksync::cache::status(args).await.context("cache status")?;
        }
        Command::Cache {
            command: CacheCommand::Clean(args),
        } => {
            booksync::cache::clean(args).await.context("cache clean")?;
        }
        Command::Inspect(args) => {
            let codec = cli.source.codec()?;
            tokio::task::spawn_blocking(move || booksync::recover::inspect(args, codec))
                .await
                .context("join inspect task")?
                .context("inspect")?;
        }
        Command::Extract(args) => {
            let codec = cli.source.codec()?;
            tokio::task::spawn_blocking(move || booksync::recover::extract(args, codec))
                .await
                .context("join extract task")?
                .context("extract")?;
        }
        Command::Plan(args) => {
            let codec = cli.source.codec()?;
            booksync::resume::run(args, codec).await.context("plan")?;
        }
        Command::Export(args) => {
            let codec = cli.source.codec()?;
            booksync::export::run(args, codec).await.context("export")?;
        }
    }

    Ok(())
}
