//! Synology DSM Array Client Library
//!
//! Typed client layer for Synology storage arrays. The driver talks to
//! arrays only through the [`ArrayClient`] trait; this crate provides:
//! - `client`: the trait itself
//! - `types`: the typed object model (LUNs, shares, targets, snapshots)
//! - `error`: the closed error taxonomy of the remote API
//! - `webapi`: the DSM WebAPI implementation over HTTP(S)
//! - `memory`: an in-memory array for tests (feature `test-util`)

pub mod client;
pub mod error;
mod iscsi;
mod share;
pub mod types;
pub mod webapi;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use client::ArrayClient;
pub use error::{DsmError, Result};
pub use types::{
    ArrayCapabilities, CloneSource, Credentials, IscsiTarget, LunSpec, LunType, ObjectKind,
    Session, ShareSpec, SnapshotInfo, SnapshotSpec, StorageObject, StoragePool, TargetSpec,
};
pub use webapi::DsmClient;

#[cfg(any(test, feature = "test-util"))]
pub use memory::InMemoryArray;
