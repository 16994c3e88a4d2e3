//! # libccm: ClusterConfigMap volumes for RK8s nodes
//!
//! `libccm` implements a node-local [Container Storage Interface][csi] plugin
//! that exposes `ClusterConfigMap` bundles as read-only bind-mounted volumes.
//! A publish fetches the bundle, writes one file per key under the plugin's
//! storage directory, records checksums in a per-volume metadata file, and
//! bind-mounts the data directory at the Pod's target path.  An unpublish
//! unmounts and sweeps data and metadata that no mount references any more.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Requests, capabilities, the persisted [`VolumeRecord`]. |
//! | [`error`] | [`CcmError`] for engine failures, [`Status`] for callers. |
//! | [`config`] | Storage layout and defaults. |
//! | [`metrics`] | [`Metrics`] capability with log and counter sinks. |
//! | [`metadata`] | Crash-safe `metadata.json` per volume. |
//! | [`source`] | [`ConfigSource`]: Kubernetes API and in-memory bundles. |
//! | [`populate`] | Bundle → files + SHA-512 digests. |
//! | [`mount`] | [`MountSubsystem`] adapters and idempotent [`MountManager`]. |
//! | [`lock`] | Per-volume lock table. |
//! | [`reconcile`] | Two-phase orphan sweep. |
//! | [`coordinator`] | Publish / unpublish orchestration. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`node`] | [`CsiNode`] trait: publish, unpublish, node info. |
//! | [`message`] | [`CsiMessage`] protocol envelope. |
//! | [`transport`] | Unix socket client/server. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod lock;
pub mod message;
pub mod metadata;
pub mod metrics;
pub mod mount;
pub mod node;
pub mod populate;
pub mod reconcile;
pub mod source;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use config::Config;
pub use coordinator::Coordinator;
pub use error::{CcmError, Code, Status};
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use metrics::{CounterMetrics, LogMetrics, Metrics};
pub use mount::{MountManager, MountSubsystem};
pub use node::CsiNode;
pub use reconcile::SweepReport;
pub use source::ConfigSource;
pub use transport::{CsiClient, CsiServer};
pub use types::*;
