use std::{env, sync::Arc};

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use bpx_grid::{Ed25519Signer, GridConfig, GridRunner};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = GridConfig::from_file(&config_path)
        .with_context(|| format!("loading grid config from {config_path}"))?;

    let secret = env::var("BPX_API_SECRET").context("BPX_API_SECRET must be set")?;
    let signer =
        Arc::new(Ed25519Signer::from_base64_secret(&secret).context("parsing BPX_API_SECRET")?);

    tracing::info!(symbol = %config.symbol, "starting grid session");
    GridRunner::new(config, signer).run().await?;
    Ok(())
}
