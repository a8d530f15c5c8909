mod app;
mod config;
mod directory;
mod markers;
mod placement;
mod routes;
mod state;
mod viewport;

use tokio::signal;
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let Some(event_id) = config::event_id() else {
        tracing::error!("EVENT_ID is required to run fairmap-server");
        return;
    };
    let directory_url = config::directory_url();
    tracing::info!(%event_id, %directory_url, "Starting placement session");

    let state = AppState::new(directory_url, event_id);
    warm_session(&state).await;

    let app = app::build_app(state);

    let addr = format!("0.0.0.0:{}", config::server_port());
    tracing::info!("Fairmap server listening on {addr}");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, %addr, "failed to bind TCP listener");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "server failed");
    }

    tracing::info!("Server shut down gracefully");
}

/// Best-effort startup warm: saved viewport, known clubs, current markers.
/// Every failure degrades to the empty default and is retryable through the
/// API (reload, refresh), so none of them is fatal here.
async fn warm_session(state: &AppState) {
    match directory::fetch_event_location(&state.http_client, &state.directory_url, &state.event_id)
        .await
    {
        Ok(saved) => {
            state.viewport.write().await.apply_saved(&saved);
            tracing::info!("Initialized viewport from saved event location");
        }
        Err(e) => {
            tracing::warn!("Failed to fetch saved event location, using defaults: {e}");
        }
    }

    match directory::fetch_unplaced_clubs(&state.http_client, &state.directory_url, &state.event_id)
        .await
    {
        Ok(clubs) => {
            let count = clubs.len();
            state.placement.write().await.set_known_clubs(clubs);
            tracing::info!("Loaded {count} unplaced clubs");
        }
        Err(e) => {
            tracing::warn!("Failed to fetch unplaced clubs: {e}");
        }
    }

    match directory::fetch_placed_clubs(&state.http_client, &state.directory_url, &state.event_id)
        .await
    {
        Ok(placed) => {
            if let Some((markers, skipped)) = state.publish_marker_snapshot(&placed).await {
                if skipped > 0 {
                    tracing::warn!(skipped, "placed-club response carried entries without coordinates");
                }
                tracing::info!("Initialized {markers} markers");
            }
        }
        Err(e) => {
            tracing::warn!("Failed to fetch placed clubs, marker layer starts stale: {e}");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
