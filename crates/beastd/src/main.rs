//! beastd: Beast ADS-B feeder relay.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use beast_core::config::BeastConfig;
use beast_core::{parse_range, IpNet, Origin};
use beast_services::{
    locator_from_config, new_session_table, AircraftJson, GeoLocator, MlatClientsFile,
    NetBirdDirectory, OriginClassifier, OverlayNetwork, PeerDirectory, SqliteStore,
    TailscaleDirectory,
};

mod listener;
mod reconciler;
mod relay;

use listener::{FeederListener, SHUTDOWN_GRACE};
use reconciler::Reconciler;
use relay::RelayContext;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = BeastConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = BeastConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        BeastConfig::default()
    });

    let listen_addr = format!("{}:{}", config.network.listen_host, config.network.listen_port);
    let upstream = format!("{}:{}", config.network.upstream_host, config.network.upstream_port);
    tracing::info!(
        listen = %listen_addr,
        upstream = %upstream,
        interval_secs = config.stats.interval_secs,
        netbird = config.netbird.enabled,
        tailscale = config.tailscale.enabled,
        geoip = config.geoip.enabled,
        "beastd starting"
    );

    // Shared state
    let store = Arc::new(
        SqliteStore::open(&config.store.db_path)
            .await
            .context("failed to open feeder store")?,
    );
    tracing::info!(path = %config.store.db_path.display(), "feeder store ready");

    let sessions = new_session_table();
    let classifier = Arc::new(build_classifier(&config));
    let geo: Arc<dyn GeoLocator> = Arc::from(locator_from_config(
        config.geoip.enabled,
        &config.geoip.db_path,
    ));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let socket = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    tracing::info!(addr = %listen_addr, "listening for feeders");

    let ctx = Arc::new(RelayContext {
        sessions: sessions.clone(),
        classifier: classifier.clone(),
        store: store.clone(),
        geo,
        upstream,
        connect_timeout: config.network.connect_timeout(),
    });
    let mut listener_task =
        tokio::spawn(FeederListener::new(socket, ctx, shutdown_tx.clone()).run());

    let mut reconciler_task = tokio::spawn(
        Reconciler::new(
            sessions.clone(),
            store,
            classifier.clone(),
            Arc::new(MlatClientsFile::new(&config.mlat.clients_path)),
            Arc::new(AircraftJson::new(&config.readsb.aircraft_path)),
            config.stats.interval(),
        )
        .run(shutdown_tx.subscribe()),
    );

    // Status HTTP endpoint
    let api_port = config.network.api_port;
    if api_port != 0 {
        let state = beast_api::ApiState {
            sessions: sessions.clone(),
            classifier: classifier.clone(),
            started_at: tokio::time::Instant::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = beast_api::serve(state, api_port).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    let listener_done = tokio::select! {
        _ = shutdown_rx.recv()     => { tracing::info!("shutting down"); false }
        r = &mut listener_task     => { tracing::error!("listener exited: {:?}", r); true }
        r = &mut reconciler_task   => { tracing::error!("reconciler exited: {:?}", r); false }
    };
    let _ = shutdown_tx.send(());

    if !listener_done {
        // The listener drains its sessions within the grace period.
        match tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(1), listener_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(r) => tracing::warn!("listener ended with {:?}", r),
            Err(_) => tracing::warn!("listener did not stop in time"),
        }
    }
    tracing::info!(live = sessions.len(), "beastd stopped");

    Ok(())
}

/// NetBird and Tailscale networks as configured. A disabled network or an
/// unparseable range is left out entirely.
fn build_classifier(config: &BeastConfig) -> OriginClassifier {
    let netbird = config
        .netbird
        .enabled
        .then(|| overlay_range(Origin::NetBird, &config.netbird.cidr))
        .flatten()
        .map(|range| {
            let directory: Option<Arc<dyn PeerDirectory>> = if config.netbird.api_token.is_empty() {
                tracing::info!("no NetBird API token, classifying by range only");
                None
            } else {
                match NetBirdDirectory::new(&config.netbird.api_url, &config.netbird.api_token) {
                    Ok(d) => Some(Arc::new(d) as Arc<dyn PeerDirectory>),
                    Err(e) => {
                        tracing::warn!(error = %e, "NetBird directory disabled");
                        None
                    }
                }
            };
            OverlayNetwork::new(Origin::NetBird, range, directory)
        });

    let tailscale = config
        .tailscale
        .enabled
        .then(|| overlay_range(Origin::Tailscale, &config.tailscale.cidr))
        .flatten()
        .map(|range| {
            let directory = match TailscaleDirectory::new(&config.tailscale.api_socket) {
                Ok(d) => Some(Arc::new(d) as Arc<dyn PeerDirectory>),
                Err(e) => {
                    tracing::warn!(error = %e, "Tailscale directory disabled");
                    None
                }
            };
            OverlayNetwork::new(Origin::Tailscale, range, directory)
        });

    OriginClassifier::new(netbird, tailscale)
}

fn overlay_range(network: Origin, cidr: &str) -> Option<IpNet> {
    match parse_range(cidr) {
        Ok(range) => Some(range),
        Err(e) => {
            tracing::warn!(network = %network, cidr, error = %e, "invalid overlay range, network disabled");
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
