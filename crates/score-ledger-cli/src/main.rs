use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("score_ledger=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = score_ledger_cli::Cli::parse();
    score_ledger_cli::run_cli(cli)
}
