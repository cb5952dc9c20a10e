//! Synology CSI Driver Library
//!
//! Kubernetes CSI driver that provisions iSCSI LUNs and SMB/NFS shares on
//! Synology arrays through the DSM WebAPI and attaches them on worker nodes.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - Array session management and the volume provisioning engine
//! - The node staging engine, multipath reconciliation and host operations

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod locks;
pub mod metrics;
pub mod multipath;
pub mod naming;
pub mod node;
pub mod platform;
pub mod provisioner;
pub mod publish;
pub mod session;
pub mod staging;
pub mod types;

pub use config::DriverConfig;
pub use controller::ControllerService;
pub use error::{DriverError, DriverResult};
pub use identity::IdentityService;
pub use node::NodeService;
pub use provisioner::Provisioner;
pub use session::ArraySessionManager;
pub use staging::StagingEngine;
