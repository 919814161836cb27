use anyhow::Context as _;

/// Used when `RUST_LOG` is unset. HTML parsing dependencies are noisy below
/// `warn`.
const DEFAULT_DIRECTIVES: &str = "warn,booksync=info";

/// Installs a stderr `fmt` subscriber filtered by `RUST_LOG`. Stdout stays
/// reserved for command output.
pub fn init() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(DEFAULT_DIRECTIVES))
        .context("build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}
