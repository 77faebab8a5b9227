use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sock_roulette::cli::Args;
use sock_roulette::{server, Matcher, TextModel};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sock_roulette=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.resolve()?;

    let model = Arc::new(TextModel::new(config.prefix_len)?);
    if let Some(path) = &config.seed_corpus {
        let corpus = tokio::fs::read(path).await?;
        model.trainer().feed(&corpus);
        info!(path = %path.display(), stats = ?model.stats(), "seeded model");
    }

    let matcher = Arc::new(Matcher::new(Arc::clone(&model), config.match_settings()));
    server::run(&config, matcher, model).await?;
    Ok(())
}
