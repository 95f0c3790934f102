// =============================================================================
// Confluence — Main Entry Point
// =============================================================================
//
// Starts with in-memory state unless `persistence.data_dir` is configured.
// Sources without a `base_url` are served by the deterministic demo provider
// so the engine runs end to end without credentials.
// =============================================================================

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use confluence::api;
use confluence::notify::{BroadcastSink, Event, FanoutSink, NotificationSink, TracingSink};
use confluence::providers::ProviderRegistry;
use confluence::{AppState, RuntimeConfig, Stores};

const CONFIG_PATH: &str = "confluence_config.json";
const OUTCOME_POLL_SECS: u64 = 60;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Confluence — Starting Up                          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load_or_default(CONFIG_PATH);

    // Override the universe from env if available.
    if let Ok(list) = std::env::var("CONFLUENCE_UNIVERSE") {
        let universe: Vec<String> = list
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !universe.is_empty() {
            config.scan.universe = universe;
        }
    }

    info!(
        universe = ?config.scan.universe,
        strategy = ?config.optimizer.strategy,
        "Configured scan universe"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let providers = ProviderRegistry::from_config(&config)?;
    let stores = Stores::open(&config.persistence)?;

    let broadcast = Arc::new(BroadcastSink::new(EVENT_CHANNEL_CAPACITY));
    let mut events = broadcast.subscribe();
    let sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(TracingSink), broadcast];
    let sink: Arc<dyn NotificationSink> = Arc::new(FanoutSink::new(sinks));

    let state = AppState::build(config, providers, sink, stores)?;

    // ── 3. Event consumer ────────────────────────────────────────────────
    let event_state = state.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Event::ScanBatchCompleted(_)) => {
                    event_state.increment_version();
                }
                Ok(Event::InstrumentResult(_)) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event consumer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // ── 4. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr =
        std::env::var("CONFLUENCE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api::router(api_state)).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 5. Scan loop ─────────────────────────────────────────────────────
    if state.config.scan.enabled {
        let scan_state = state.clone();
        let every = state.config.scan.interval_secs.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(every));
            loop {
                interval.tick().await;
                let scan_id = scan_state.coordinator.trigger_scan(Vec::new());
                info!(scan_id = %scan_id, "scheduled scan triggered");
            }
        });
    } else {
        info!("Scheduled scans disabled; scans run on API request only");
    }

    // ── 6. Outcome resolution loop ───────────────────────────────────────
    let outcome_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(OUTCOME_POLL_SECS));
        loop {
            interval.tick().await;
            let attached = outcome_state
                .resolve_due_outcomes(chrono::Utc::now())
                .await;
            let purged = outcome_state.cache.purge_expired().await;
            if attached > 0 || purged > 0 {
                info!(attached, purged, "outcome resolution pass");
            }
        }
    });

    // ── 7. Learning loop ─────────────────────────────────────────────────
    let learn_state = state.clone();
    let every = state.config.optimizer.interval_secs.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(every));
        // The first tick fires immediately; skip it so outcomes can accrue.
        interval.tick().await;
        loop {
            interval.tick().await;
            learn_state.run_learning_cycle(chrono::Utc::now());
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    info!("Confluence shut down complete.");
    Ok(())
}
