//! HA Storage Gateway
//!
//! Manages highly available iSCSI targets, NFS exports and NVMe-oF subsystems
//! on top of a replicated block storage cluster. Each endpoint is a storage
//! resource plus a promoter configuration that tells the HA daemon which
//! service agents to run on the node where the resource is promoted.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                       CLI  /  REST API (/api/v2/...)                        │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  iSCSI Target   │  │   NFS Export    │  │     NVMe-oF Subsystem       │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           └────────────────────┼─────────────────────────┘                  │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │ Lifecycle Reconciler  │                                │
//! │                    │ status · waiter       │                                │
//! │                    └───────────┬───────────┘                                │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │  ┌─────────────────────────────┴┐  ┌─────────────────────────────────────┐  │
//! │  │   Storage Controller Client  │  │        HA Config Store              │  │
//! │  │   (LINSTOR REST)             │  │   (promoter TOML, attach/detach)    │  │
//! │  └──────────────────────────────┘  └─────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Reconciler, status aggregation, waiting, backends, REST API
//! - [`endpoints`]: The three endpoint types and their promoter translation
//! - [`promoter`]: Promoter configuration documents and resource agents
//! - [`domain`]: Core value types and collaborator ports
//! - [`error`]: Error types and handling

pub mod controlplane;
pub mod domain;
pub mod endpoints;
pub mod error;
pub mod promoter;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, BackendFactory, Backends, ConditionWaiter, Gateway,
    GatewayConfig, LinstorConfig, Reconciler, WaitConfig,
};

pub use domain::model::{
    ResourceState, ResourceStatus, ServiceIp, ServiceState, VolumeConfig, VolumeStatus,
};

pub use domain::ports::{HaConfigStore, StorageClient};

pub use endpoints::{Endpoint, Iqn, IscsiTarget, NfsExport, Nqn, NvmeSubsystem};

pub use error::{Error, ErrorKind, Result};

pub use promoter::{PromoterConfig, ResourceAgent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
