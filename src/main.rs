use std::process::ExitCode;

use pii_vault::{Vault, VaultConfig};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "pii-vault stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> pii_vault::Result<()> {
    let config = VaultConfig::from_env()?;
    info!(
        key = %config.kms.key_name,
        vault = %config.kms.vault_url,
        "starting pii-vault"
    );

    let vault = Vault::connect(config).await?;
    vault.ensure_schema().await?;
    info!("schema ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = vault.reconciler();
    let interval = vault.reconcile_interval();
    let sweeper = tokio::spawn(async move { reconciler.run(interval, shutdown_rx).await });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        error!(error = %e, "reconciler task failed");
    }
    vault.shutdown().await;
    Ok(())
}
