//! In-memory bundle source.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{Bundle, ConfigSource};
use crate::error::CcmError;

/// Serves bundles registered with [`MemorySource::insert`].
#[derive(Debug, Default)]
pub struct MemorySource {
    bundles: Mutex<HashMap<String, Bundle>>,
    unavailable: Mutex<Option<String>>,
    fetches: AtomicUsize,
}

impl MemorySource {
    /// Create a source with no bundles.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`MemorySource::insert`].
    pub fn with_bundle<K, V>(self, name: &str, entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.insert(name, entries);
        self
    }

    /// Register or replace the bundle called `name`.
    pub fn insert<K, V>(&self, name: &str, entries: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        let bundle = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.bundles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), bundle);
    }

    /// Make every fetch fail with `reason` until cleared with `None`.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        *self.unavailable.lock().unwrap_or_else(PoisonError::into_inner) =
            reason.map(str::to_owned);
    }

    /// Number of fetches served or attempted so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for MemorySource {
    async fn fetch_by_name(&self, name: &str) -> Result<Bundle, CcmError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self
            .unavailable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(CcmError::SourceFetch {
                name: name.to_owned(),
                reason,
            });
        }
        self.bundles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| CcmError::SourceNotFound(name.to_owned()))
    }
}
