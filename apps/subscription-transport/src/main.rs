//! Subscription Transport Demo Binary
//!
//! Subscribes to one upstream GraphQL subscription and prints every
//! delivered message until the upstream completes or the process is
//! signalled.
//!
//! # Usage
//!
//! ```bash
//! UPSTREAM_URL=ws://localhost:4000/graphql \
//! UPSTREAM_QUERY='subscription { tick }' \
//! cargo run --bin subscription-transport
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `UPSTREAM_URL`: Upstream GraphQL endpoint
//! - `UPSTREAM_QUERY`: Subscription document
//!
//! ## Optional
//! - `UPSTREAM_VARIABLES`: JSON variables
//! - `UPSTREAM_OPERATION_NAME`: Operation name
//! - `UPSTREAM_USE_SSE`: Use Server-Sent Events (default: false)
//! - `UPSTREAM_SSE_POST`: Use POST for SSE (default: false)
//! - `UPSTREAM_WS_SUBPROTOCOL`: graphql-ws | graphql-transport-ws | auto (default: auto)
//! - `SUBSCRIPTION_ACK_TIMEOUT_MS`: Handshake bound (default: 30000)
//! - `SUBSCRIPTION_LIVENESS_INTERVAL_MS`: Liveness sweep interval (default: 1000)
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: true)
//! - `RUST_LOG`: Log filter (default: subscription_transport=info)

use std::sync::Arc;

use anyhow::Context;
use subscription_transport::{
    ChannelUpdater, CloseKind, RequestScope, SubscriptionClient, SubscriptionEvent,
    TransportSettings, UpstreamSettings, init_metrics, init_telemetry,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Capacity of the demo subscriber's event channel.
const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv_from_ancestors();

    let _telemetry_guard = init_telemetry().context("failed to initialize telemetry")?;

    tracing::info!("Starting subscription transport demo");

    let metrics_handle = init_metrics().context("failed to initialize metrics")?;

    let settings = TransportSettings::from_env();
    let upstream = UpstreamSettings::from_env().context("invalid upstream configuration")?;
    tracing::info!(
        url = %upstream.url,
        use_sse = upstream.use_sse,
        sub_protocol = %upstream.ws_sub_protocol,
        ack_timeout_ms = settings.ack_timeout.as_millis(),
        "Configuration loaded"
    );

    let engine = CancellationToken::new();
    let client = SubscriptionClient::builder(engine.clone())
        .with_websocket()
        .with_streaming_client(reqwest::Client::new())
        .with_settings(settings)
        .build();

    let scope = RequestScope::new(CancellationToken::new(), reqwest::header::HeaderMap::new());
    let (updater, mut events) = ChannelUpdater::channel(EVENT_BUFFER);

    client
        .subscribe(&scope, upstream.to_options(), Arc::new(updater))
        .await
        .context("subscribe failed")?;

    let shutdown = tokio::spawn(await_shutdown(scope.cancel.clone()));

    while let Some(event) = events.recv().await {
        match event {
            SubscriptionEvent::Update(payload) => println!("{payload}"),
            SubscriptionEvent::Closed(kind) => {
                match kind {
                    CloseKind::Failed => tracing::warn!("Subscription failed"),
                    kind => tracing::info!(kind = kind.as_str(), "Subscription closed"),
                }
                break;
            }
        }
    }

    engine.cancel();
    shutdown.abort();
    tracing::debug!(metrics = %metrics_handle.render(), "Final metrics");
    tracing::info!(stats = ?client.stats(), "Shutdown complete");
    Ok(())
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for Ctrl+C or SIGTERM, then end the subscriber's scope.
///
/// The handler unsubscribes upstream at its next liveness tick and closes
/// the subscriber, which ends the event loop in `main`.
async fn await_shutdown(scope: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    scope.cancel();
}
