//! Multisig coordination engine entry point

mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod metrics;
mod relay;
mod tx;

use crate::chain::{BindingManager, ChainProvider, EventStream};
use crate::config::Settings;
use crate::coordination::MultisigCoordinator;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::relay::{HttpRelay, SignaturePool};
use crate::tx::TransactionSender;

use ethers::signers::LocalWallet;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let settings = Settings::load()?;
    info!(
        "Starting multisig coordinator for owner {} on chain {} ({})",
        settings.coordinator.owner_address, settings.chain.chain_id, settings.chain.name
    );

    let provider = Arc::new(ChainProvider::new(settings.chain.clone()).await?);
    let stream = Arc::new(EventStream::new(
        settings.chain.clone(),
        settings.coordinator.poll_interval_ms,
        provider.clone(),
    )?);

    let signer = load_signer(&settings)?;
    if signer.is_none() {
        warn!("No signing key configured, running read-only");
    }

    let sender = signer.map(|wallet| {
        Arc::new(TransactionSender::new(
            provider.clone(),
            wallet,
            &settings.coordinator,
        ))
    });
    let bindings = Arc::new(BindingManager::new(provider.clone()));

    let relay: Arc<dyn SignaturePool> = Arc::new(HttpRelay::new(
        settings.relay.base_url.clone(),
        settings.relay.request_timeout_ms,
    )?);

    let engine = Arc::new(MultisigCoordinator::new(
        &settings,
        provider,
        stream.clone(),
        bindings,
        relay,
        sender,
    )?);

    if settings.metrics.enabled {
        let port = settings.metrics.port;
        tokio::spawn(async move {
            metrics::serve(port).await;
        });
    }

    let api_engine = engine.clone();
    let api_host = settings.api.host.clone();
    let api_port = settings.api.port;
    tokio::spawn(async move {
        api::serve(api_engine, api_host, api_port).await;
    });

    // The engine subscribed to the stream at construction, so events the
    // stream emits before the engine task is scheduled are buffered.
    let stream_task = tokio::spawn(async move {
        if let Err(e) = stream.run().await {
            error!("Event stream stopped: {}", e);
        }
    });

    let run_engine = engine.clone();
    let engine_task = tokio::spawn(async move {
        if let Err(e) = run_engine.run().await {
            error!("Coordinator stopped: {}", e);
        }
    });

    shutdown_signal().await;
    info!("Shutdown signal received");

    engine.stop();
    let _ = engine_task.await;
    stream_task.abort();

    info!("Coordinator stopped cleanly");
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,multisig_coordinator=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the signer from the configured environment variable, if any.
fn load_signer(settings: &Settings) -> CoordinatorResult<Option<LocalWallet>> {
    let Some(env_name) = settings.wallet.private_key_env.as_deref() else {
        return Ok(None);
    };

    let key = std::env::var(env_name).map_err(|_| {
        CoordinatorError::Wallet(format!("environment variable {} not set", env_name))
    })?;

    let wallet = key
        .trim_start_matches("0x")
        .parse::<LocalWallet>()
        .map_err(|e| CoordinatorError::Wallet(format!("invalid private key: {}", e)))?;

    Ok(Some(wallet))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
