//! REST API Server
//!
//! Binds the REST router and serves it until shutdown is requested.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::rest::RestRouter;
use crate::topology::Registry;
use crate::volume::VolumeManager;

/// Run the REST API server
///
/// Blocks until the listener fails or `shutdown` is cancelled. In-flight
/// requests are drained before the call returns.
pub async fn run_rest_server(
    addr: SocketAddr,
    manager: Arc<VolumeManager>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = RestRouter::new(manager, registry);
    let app = router.build();

    info!("REST API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("REST server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

    Ok(())
}
