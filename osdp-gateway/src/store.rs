//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Persistence seam. The gateway does not care how configuration and event
//! history are stored; it talks to a [`GatewayStore`] and lets the backing
//! repository pick its format. [`MemoryStore`] is the in-crate
//! implementation used by tests and by deployments that keep configuration
//! in the daemon's own config file.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::events::{CardReadEvent, PinReadEvent};
use crate::feedback::FeedbackConfig;
use crate::reader::{PluginMapping, ReaderConfig, ReaderId, SecureKey, SecurityMode};
use crate::GatewayError;

type Result<T> = core::result::Result<T, GatewayError>;

/// Aggregate pipeline result in its stored form: the success flag, the
/// human readable message and the encoded per-plugin result string
/// (`name:Status:error` triples joined by `|`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOutcome {
    /// Aggregate success.
    pub success: bool,
    /// Human readable summary.
    pub message: String,
    /// Encoded per-plugin results.
    pub plugin_results: String,
}

/// Required repository operations. Every method is fallible; the storage
/// format is the repository's concern, not the core's.
#[async_trait]
pub trait GatewayStore: Send + Sync {
    /// Insert or replace a reader configuration.
    async fn save_reader(&self, config: &ReaderConfig) -> Result<()>;
    /// All reader configurations.
    async fn load_readers(&self) -> Result<Vec<ReaderConfig>>;
    /// One reader configuration.
    async fn load_reader(&self, id: ReaderId) -> Result<Option<ReaderConfig>>;
    /// Remove a reader and its mappings.
    async fn delete_reader(&self, id: ReaderId) -> Result<()>;

    /// Replace the singleton feedback configuration.
    async fn save_feedback(&self, config: &FeedbackConfig) -> Result<()>;
    /// The singleton feedback configuration, if one was ever saved.
    async fn load_feedback(&self) -> Result<Option<FeedbackConfig>>;

    /// Mappings of one reader, unordered.
    async fn mappings_for_reader(&self, reader: ReaderId) -> Result<Vec<PluginMapping>>;
    /// Mappings referencing one plugin, across readers.
    async fn mappings_for_plugin(&self, plugin_id: &str) -> Result<Vec<PluginMapping>>;
    /// Replace the full mapping set of one reader.
    async fn set_mappings(&self, reader: ReaderId, mappings: &[PluginMapping]) -> Result<()>;
    /// Update a single mapping in place (matched by reader and plugin id).
    async fn update_mapping(&self, mapping: &PluginMapping) -> Result<()>;
    /// Remove all mappings of one reader.
    async fn delete_mappings(&self, reader: ReaderId) -> Result<()>;

    /// Append one processed card event.
    async fn append_card_event(&self, event: &CardReadEvent, outcome: &StoredOutcome)
        -> Result<()>;
    /// Append one processed PIN event.
    async fn append_pin_event(&self, event: &PinReadEvent, outcome: &StoredOutcome) -> Result<()>;

    /// Atomically update a reader's security mode and key.
    async fn update_security(
        &self,
        reader: ReaderId,
        mode: SecurityMode,
        key: Option<SecureKey>,
    ) -> Result<()>;
}

impl std::fmt::Debug for dyn GatewayStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayStore").finish()
    }
}

#[derive(Default)]
struct MemoryStoreInner {
    readers: HashMap<ReaderId, ReaderConfig>,
    feedback: Option<FeedbackConfig>,
    card_events: Vec<(CardReadEvent, StoredOutcome)>,
    pin_events: Vec<(PinReadEvent, StoredOutcome)>,
}

/// In-memory [`GatewayStore`]. Mappings live inside their owning reader
/// record, matching the ownership rule of the data model.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    /// Fresh empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of appended card events. Test observability.
    pub fn card_event_count(&self) -> usize {
        self.inner.lock().card_events.len()
    }

    /// Number of appended PIN events. Test observability.
    pub fn pin_event_count(&self) -> usize {
        self.inner.lock().pin_events.len()
    }

    /// Snapshot of appended card events.
    pub fn card_events(&self) -> Vec<(CardReadEvent, StoredOutcome)> {
        self.inner.lock().card_events.clone()
    }

    /// Snapshot of appended PIN events.
    pub fn pin_events(&self) -> Vec<(PinReadEvent, StoredOutcome)> {
        self.inner.lock().pin_events.clone()
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn save_reader(&self, config: &ReaderConfig) -> Result<()> {
        self.inner
            .lock()
            .readers
            .insert(config.id, config.clone());
        Ok(())
    }

    async fn load_readers(&self) -> Result<Vec<ReaderConfig>> {
        let mut readers: Vec<_> = self.inner.lock().readers.values().cloned().collect();
        readers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(readers)
    }

    async fn load_reader(&self, id: ReaderId) -> Result<Option<ReaderConfig>> {
        Ok(self.inner.lock().readers.get(&id).cloned())
    }

    async fn delete_reader(&self, id: ReaderId) -> Result<()> {
        self.inner.lock().readers.remove(&id);
        Ok(())
    }

    async fn save_feedback(&self, config: &FeedbackConfig) -> Result<()> {
        self.inner.lock().feedback = Some(config.clone());
        Ok(())
    }

    async fn load_feedback(&self) -> Result<Option<FeedbackConfig>> {
        Ok(self.inner.lock().feedback.clone())
    }

    async fn mappings_for_reader(&self, reader: ReaderId) -> Result<Vec<PluginMapping>> {
        Ok(self
            .inner
            .lock()
            .readers
            .get(&reader)
            .map(|r| r.mappings.clone())
            .unwrap_or_default())
    }

    async fn mappings_for_plugin(&self, plugin_id: &str) -> Result<Vec<PluginMapping>> {
        Ok(self
            .inner
            .lock()
            .readers
            .values()
            .flat_map(|r| r.mappings.iter())
            .filter(|m| m.plugin_id == plugin_id)
            .cloned()
            .collect())
    }

    async fn set_mappings(&self, reader: ReaderId, mappings: &[PluginMapping]) -> Result<()> {
        let mut inner = self.inner.lock();
        let config = inner
            .readers
            .get_mut(&reader)
            .ok_or_else(|| GatewayError::Storage(format!("unknown reader {reader}")))?;
        config.mappings = mappings.to_vec();
        config.updated_at = Utc::now();
        Ok(())
    }

    async fn update_mapping(&self, mapping: &PluginMapping) -> Result<()> {
        let mut inner = self.inner.lock();
        let config = inner
            .readers
            .get_mut(&mapping.reader_id)
            .ok_or_else(|| GatewayError::Storage(format!("unknown reader {}", mapping.reader_id)))?;
        let slot = config
            .mappings
            .iter_mut()
            .find(|m| m.plugin_id == mapping.plugin_id)
            .ok_or_else(|| {
                GatewayError::Storage(format!("no mapping for plugin {}", mapping.plugin_id))
            })?;
        *slot = mapping.clone();
        config.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_mappings(&self, reader: ReaderId) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(config) = inner.readers.get_mut(&reader) {
            config.mappings.clear();
            config.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn append_card_event(
        &self,
        event: &CardReadEvent,
        outcome: &StoredOutcome,
    ) -> Result<()> {
        self.inner
            .lock()
            .card_events
            .push((event.clone(), outcome.clone()));
        Ok(())
    }

    async fn append_pin_event(&self, event: &PinReadEvent, outcome: &StoredOutcome) -> Result<()> {
        self.inner
            .lock()
            .pin_events
            .push((event.clone(), outcome.clone()));
        Ok(())
    }

    async fn update_security(
        &self,
        reader: ReaderId,
        mode: SecurityMode,
        key: Option<SecureKey>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let config = inner
            .readers
            .get_mut(&reader)
            .ok_or_else(|| GatewayError::Storage(format!("unknown reader {reader}")))?;
        config.security_mode = mode;
        config.secure_key = key;
        config.updated_at = Utc::now();
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryStore")
            .field("readers", &inner.readers.len())
            .field("card_events", &inner.card_events.len())
            .field("pin_events", &inner.pin_events.len())
            .finish()
    }
}
