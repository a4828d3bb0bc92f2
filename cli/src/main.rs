use clap::Parser;
use rmp_cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("rmp v{} starting", env!("CARGO_PKG_VERSION"));
    rmp_cli::run(Cli::parse()).await
}
