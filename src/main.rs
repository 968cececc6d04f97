//! taskmarket - HTTP Server Entry Point
//!
//! Opens the store, starts the auto-approval sweep and serves the API.

use std::sync::Arc;

use taskmarket::{
    api,
    config::Config,
    market::{BroadcastEventSink, LogNotifier, Marketplace, Notifier, SweepWorker, WebhookNotifier},
    store::create_market_store,
    task::HttpVerifier,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskmarket=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        store = ?config.store_type,
        data_dir = %config.data_dir.display(),
        "Loaded configuration"
    );

    let store = create_market_store(config.store_type, config.data_dir.clone())
        .await
        .map_err(anyhow::Error::msg)?;
    if !store.is_persistent() {
        warn!("Using the in-memory store; all balances are lost on restart");
    }

    let events = BroadcastEventSink::default();
    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => {
            info!(url = %url, "Notifications go to webhook");
            Arc::new(WebhookNotifier::new(url.clone())?)
        }
        None => Arc::new(LogNotifier),
    };

    let mut market = Marketplace::new(Arc::from(store), config.market.clone())
        .with_notifier(notifier)
        .with_events(Arc::new(events.clone()));
    match &config.verifier_url {
        Some(url) => {
            info!(url = %url, "Auto-verification enabled");
            market = market.with_verifier(Arc::new(HttpVerifier::new(
                url.clone(),
                config.market.verifier_timeout,
            )?));
        }
        None => warn!("No verifier configured; AUTO tasks wait for moderation"),
    }
    let market = Arc::new(market);

    let shutdown = CancellationToken::new();
    let sweep = if config.sweep.enabled {
        let worker = SweepWorker::new(Arc::clone(&market), config.sweep.clone());
        info!(worker = worker.worker_id(), "Starting sweep");
        Some(tokio::spawn(worker.run(shutdown.clone())))
    } else {
        info!("Sweep disabled");
        None
    };

    // Start HTTP server
    let result = api::serve(config, market, events, shutdown.clone()).await;
    shutdown.cancel();
    if let Some(handle) = sweep {
        if let Err(e) = handle.await {
            warn!("Sweep task ended abnormally: {}", e);
        }
    }
    result
}
