//! Control Plane
//!
//! The lifecycle reconciler with its status aggregation and condition
//! waiting, the collaborator backends, and the REST API on top.

pub mod api;
pub mod backends;
pub mod reconciler;
pub mod status;
pub mod wait;

pub use api::*;
pub use backends::*;
pub use reconciler::*;
pub use status::*;
pub use wait::*;

use crate::endpoints::{IscsiTarget, NfsExport, NvmeSubsystem};
use crate::error::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Runtime configuration of the gateway
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub linstor: LinstorConfig,
    pub wait: WaitConfig,
    /// Run against a simulated in-process cluster
    pub standalone: bool,
}

/// One reconciler per endpoint type, sharing the same collaborators
#[derive(Clone)]
pub struct Gateway {
    pub iscsi: Reconciler<IscsiTarget>,
    pub nfs: Reconciler<NfsExport>,
    pub nvmeof: Reconciler<NvmeSubsystem>,
}

impl Gateway {
    pub fn new(backends: Backends, wait: WaitConfig, cancel: CancellationToken) -> Self {
        Self {
            iscsi: Reconciler::new(
                backends.storage.clone(),
                backends.store.clone(),
                wait,
                cancel.clone(),
            ),
            nfs: Reconciler::new(
                backends.storage.clone(),
                backends.store.clone(),
                wait,
                cancel.clone(),
            ),
            nvmeof: Reconciler::new(backends.storage, backends.store, wait, cancel),
        }
    }

    /// Build the gateway from configuration, connecting to the controller
    pub async fn connect(config: &GatewayConfig, cancel: CancellationToken) -> Result<Self> {
        config.wait.validate()?;
        let backends = if config.standalone {
            info!("Running standalone against a simulated cluster");
            BackendFactory::in_memory()
        } else {
            BackendFactory::linstor(&config.linstor).await?
        };
        Ok(Self::new(backends, config.wait, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[tokio::test]
    async fn test_standalone_gateway_shares_state() {
        let config = GatewayConfig {
            standalone: true,
            wait: WaitConfig {
                timeout: Duration::from_millis(500),
                interval: Duration::from_millis(5),
            },
            ..GatewayConfig::default()
        };
        let gateway = Gateway::connect(&config, CancellationToken::new()).await.unwrap();

        let export = NfsExport::new(
            "export1",
            "192.168.1.5/24".parse().unwrap(),
            vec![crate::domain::model::VolumeConfig::new(1, 1024 * 1024)],
        );
        gateway.nfs.create(export).await.unwrap();

        assert_eq!(gateway.nfs.list().await.unwrap().len(), 1);
        assert!(gateway.iscsi.list().await.unwrap().is_empty());
        assert!(gateway.nvmeof.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_rejects_zero_poll_interval() {
        let config = GatewayConfig {
            standalone: true,
            wait: WaitConfig {
                timeout: Duration::from_secs(30),
                interval: Duration::ZERO,
            },
            ..GatewayConfig::default()
        };
        let result = Gateway::connect(&config, CancellationToken::new()).await;
        assert_matches!(result.err(), Some(Error::Configuration(ref msg)) if msg.contains("poll interval"));
    }
}
