//! Config bundle sources.
//!
//! A [`ConfigSource`] resolves a bundle name to its key/value content.  The
//! live adapter is [`KubeConfigSource`], which reads `ClusterConfigMap`
//! objects from the Kubernetes API; [`MemorySource`] serves fixed bundles and
//! stands in for it in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::CcmError;

pub mod kube;
pub mod memory;

pub use kube::KubeConfigSource;
pub use memory::MemorySource;

/// Bundle content: file name to file content.
pub type Bundle = BTreeMap<String, String>;

/// Source of named configuration bundles.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch the bundle called `name`.
    ///
    /// Returns [`CcmError::SourceNotFound`] when no such bundle exists and
    /// [`CcmError::SourceFetch`] for any other failure.
    async fn fetch_by_name(&self, name: &str) -> Result<Bundle, CcmError>;
}
