//! API Server
//!
//! Serves the REST API until shut down, either through [`ApiServer::shutdown`]
//! or by cancelling the gateway's cancellation token.

use crate::controlplane::Gateway;
use crate::error::{Error, Result};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::rest::RestRouter;

/// Default REST bind address
pub const DEFAULT_API_ADDR: &str = "0.0.0.0:8080";

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

pub struct ApiServer {
    config: ApiServerConfig,
    gateway: Gateway,
    cancel: CancellationToken,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, gateway: Gateway, cancel: CancellationToken) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            gateway,
            cancel,
            shutdown_tx,
        }
    }

    /// Run the API server until shutdown
    pub async fn run(&self) -> Result<()> {
        let app = RestRouter::new(self.gateway.clone())
            .build()
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

        let listener = tokio::net::TcpListener::bind(self.config.rest_addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        info!("REST API listening on {}", self.config.rest_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let cancel = self.cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_rx.recv() => {}
                    _ = cancel.cancelled() => {}
                }
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::BackendFactory;
    use crate::controlplane::WaitConfig;
    use std::sync::Arc;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 8080);
        assert_eq!(config.rest_addr, DEFAULT_API_ADDR.parse().unwrap());
    }

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let gateway = Gateway::new(BackendFactory::in_memory(), WaitConfig::default(), cancel.clone());
        let server = Arc::new(ApiServer::new(
            ApiServerConfig {
                rest_addr: "127.0.0.1:0".parse().unwrap(),
            },
            gateway,
            cancel.clone(),
        ));

        let handle = tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        cancel.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let cancel = CancellationToken::new();
        let gateway = Gateway::new(BackendFactory::in_memory(), WaitConfig::default(), cancel.clone());
        let server = Arc::new(ApiServer::new(
            ApiServerConfig {
                rest_addr: "127.0.0.1:0".parse().unwrap(),
            },
            gateway,
            cancel.clone(),
        ));

        let handle = tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        // the receiver subscribes inside run; keep signalling until it exits
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                server.shutdown();
                if handle.is_finished() {
                    break handle.await;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
        .unwrap();
        assert!(result.is_ok());
        assert!(!cancel.is_cancelled());
    }
}
