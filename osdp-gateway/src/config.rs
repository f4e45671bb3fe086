//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Configuration and security services: reader CRUD with bus-rule
//! enforcement, plugin mapping management, secure key selection and
//! generation, and the JSON export/import of the whole configuration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::feedback::{FeedbackConfig, FeedbackConfigService};
use crate::notify::{ConfigChange, Notification, Notifier};
use crate::reader::{
    validate_mappings, PluginMapping, ReaderConfig, ReaderId, SecureKey, SecurityMode,
};
use crate::store::GatewayStore;
use crate::GatewayError;

type Result<T> = core::result::Result<T, GatewayError>;

/// OSDP SCBK-D, the well-known default secure channel base key used while a
/// device is in install mode.
pub const DEFAULT_INSTALLATION_KEY: [u8; 16] = [
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E,
    0x3F,
];

/// CRUD over reader configurations. Writes are serialized and validated
/// against both the per-reader invariants and the cross-reader bus rules
/// before anything touches the repository; a rejected operation never
/// mutates persistent state.
pub struct ReaderConfigService {
    store: Arc<dyn GatewayStore>,
    notifier: Arc<dyn Notifier>,
    mappings: Arc<MappingService>,
    write_lock: tokio::sync::Mutex<()>,
}

impl ReaderConfigService {
    /// Create the service. Reader writes carry their mappings, so the
    /// mapping cache is invalidated on every mutation here.
    pub fn new(
        store: Arc<dyn GatewayStore>,
        notifier: Arc<dyn Notifier>,
        mappings: Arc<MappingService>,
    ) -> Self {
        Self {
            store,
            notifier,
            mappings,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Cross-reader bus rules: among enabled readers sharing a serial port,
    /// baud rates must match and addresses must be unique.
    async fn check_bus_rules(&self, candidate: &ReaderConfig) -> Result<()> {
        if !candidate.enabled {
            return Ok(());
        }
        for other in self.store.load_readers().await? {
            if other.id == candidate.id || !other.enabled || other.port != candidate.port {
                continue;
            }
            if other.baud_rate != candidate.baud_rate {
                return Err(GatewayError::Config(format!(
                    "baud rate {} conflicts with reader {} at {} on {}",
                    candidate.baud_rate, other.name, other.baud_rate, candidate.port
                )));
            }
            if other.address == candidate.address {
                return Err(GatewayError::Config(format!(
                    "address {} on {} is already taken by reader {}",
                    candidate.address, candidate.port, other.name
                )));
            }
        }
        Ok(())
    }

    /// Persist a new reader.
    pub async fn create(&self, config: ReaderConfig) -> Result<ReaderConfig> {
        let _guard = self.write_lock.lock().await;
        config.validate()?;
        if self.store.load_reader(config.id).await?.is_some() {
            return Err(GatewayError::Config(format!(
                "reader {} already exists",
                config.id
            )));
        }
        self.check_bus_rules(&config).await?;
        self.store.save_reader(&config).await?;
        self.mappings.invalidate(config.id);
        let _ = self.notifier.broadcast(Notification::ReaderConfigChanged {
            reader_id: config.id,
            change: ConfigChange::Created,
        });
        Ok(config)
    }

    /// Replace an existing reader.
    pub async fn update(&self, mut config: ReaderConfig) -> Result<ReaderConfig> {
        let _guard = self.write_lock.lock().await;
        config.validate()?;
        let existing = self
            .store
            .load_reader(config.id)
            .await?
            .ok_or_else(|| GatewayError::Config(format!("unknown reader {}", config.id)))?;
        self.check_bus_rules(&config).await?;
        config.created_at = existing.created_at;
        config.updated_at = Utc::now();
        self.store.save_reader(&config).await?;
        self.mappings.invalidate(config.id);
        let _ = self.notifier.broadcast(Notification::ReaderConfigChanged {
            reader_id: config.id,
            change: ConfigChange::Updated,
        });
        Ok(config)
    }

    /// Create the reader if it is new, replace it otherwise. Used by
    /// configuration import.
    pub async fn upsert(&self, config: ReaderConfig) -> Result<ReaderConfig> {
        if self.store.load_reader(config.id).await?.is_some() {
            self.update(config).await
        } else {
            self.create(config).await
        }
    }

    /// Delete a reader and everything it owns.
    pub async fn delete(&self, id: ReaderId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.delete_reader(id).await?;
        self.mappings.invalidate(id);
        let _ = self.notifier.broadcast(Notification::ReaderConfigChanged {
            reader_id: id,
            change: ConfigChange::Deleted,
        });
        Ok(())
    }

    /// Point-in-time snapshot of one reader.
    pub async fn get(&self, id: ReaderId) -> Result<Option<ReaderConfig>> {
        self.store.load_reader(id).await
    }

    /// Point-in-time snapshot of all readers.
    pub async fn list(&self) -> Result<Vec<ReaderConfig>> {
        self.store.load_readers().await
    }
}

impl std::fmt::Debug for ReaderConfigService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderConfigService").finish()
    }
}

/// Plugin mapping management with a per-reader cache; the pipeline resolves
/// chains on every event, the repository only on change.
pub struct MappingService {
    store: Arc<dyn GatewayStore>,
    cache: RwLock<HashMap<ReaderId, Arc<Vec<PluginMapping>>>>,
}

impl MappingService {
    /// Create the service.
    pub fn new(store: Arc<dyn GatewayStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn load_cached(&self, reader: ReaderId) -> Result<Arc<Vec<PluginMapping>>> {
        if let Some(cached) = self.cache.read().get(&reader).cloned() {
            return Ok(cached);
        }
        let mappings = Arc::new(self.store.mappings_for_reader(reader).await?);
        self.cache.write().insert(reader, Arc::clone(&mappings));
        Ok(mappings)
    }

    /// All mappings of a reader, unordered and regardless of enabled state.
    pub async fn list(&self, reader: ReaderId) -> Result<Vec<PluginMapping>> {
        Ok(self.load_cached(reader).await?.as_ref().clone())
    }

    /// The enabled mappings of a reader in ascending execution order; what
    /// the pipeline actually runs.
    pub async fn enabled_ordered(&self, reader: ReaderId) -> Result<Vec<PluginMapping>> {
        let mut mappings: Vec<PluginMapping> = self
            .load_cached(reader)
            .await?
            .iter()
            .filter(|m| m.enabled)
            .cloned()
            .collect();
        mappings.sort_by_key(|m| m.order);
        Ok(mappings)
    }

    /// Replace a reader's mapping set.
    pub async fn set(&self, reader: ReaderId, mut mappings: Vec<PluginMapping>) -> Result<()> {
        for m in &mut mappings {
            m.reader_id = reader;
        }
        validate_mappings(&mappings)?;
        self.store.set_mappings(reader, &mappings).await?;
        self.invalidate(reader);
        Ok(())
    }

    /// Enable or disable one mapping.
    pub async fn set_enabled(&self, reader: ReaderId, plugin_id: &str, enabled: bool) -> Result<()> {
        let mappings = self.load_cached(reader).await?;
        let mut mapping = mappings
            .iter()
            .find(|m| m.plugin_id == plugin_id)
            .cloned()
            .ok_or_else(|| {
                GatewayError::Config(format!("reader has no mapping for plugin {plugin_id}"))
            })?;
        mapping.enabled = enabled;
        self.store.update_mapping(&mapping).await?;
        self.invalidate(reader);
        Ok(())
    }

    /// Move one plugin to a new 1-based chain position; the rest of the
    /// chain is renumbered sequentially around it.
    pub async fn reorder(&self, reader: ReaderId, plugin_id: &str, new_order: u32) -> Result<()> {
        if new_order == 0 {
            return Err(GatewayError::Config(
                "execution orders are 1-based".into(),
            ));
        }
        let mut mappings = self.load_cached(reader).await?.as_ref().clone();
        mappings.sort_by_key(|m| m.order);
        let index = mappings
            .iter()
            .position(|m| m.plugin_id == plugin_id)
            .ok_or_else(|| {
                GatewayError::Config(format!("reader has no mapping for plugin {plugin_id}"))
            })?;
        let target = mappings.remove(index);
        let insert_at = (new_order as usize - 1).min(mappings.len());
        mappings.insert(insert_at, target);
        for (i, m) in mappings.iter_mut().enumerate() {
            m.order = i as u32 + 1;
        }
        self.store.set_mappings(reader, &mappings).await?;
        self.invalidate(reader);
        Ok(())
    }

    /// Copy one reader's mapping set onto another, replacing what was
    /// there. Returns the number of mappings copied.
    pub async fn copy(&self, from: ReaderId, to: ReaderId) -> Result<usize> {
        let mappings = self.store.mappings_for_reader(from).await?;
        let count = mappings.len();
        self.set(to, mappings).await?;
        Ok(count)
    }

    /// Readers that map a given plugin.
    pub async fn readers_using(&self, plugin_id: &str) -> Result<Vec<ReaderId>> {
        let mut readers: Vec<ReaderId> = self
            .store
            .mappings_for_plugin(plugin_id)
            .await?
            .into_iter()
            .map(|m| m.reader_id)
            .collect();
        readers.sort();
        readers.dedup();
        Ok(readers)
    }

    /// Drop one reader's cache entry.
    pub fn invalidate(&self, reader: ReaderId) {
        self.cache.write().remove(&reader);
    }

    /// Drop the whole cache.
    pub fn invalidate_all(&self) {
        self.cache.write().clear();
    }
}

impl std::fmt::Debug for MappingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingService")
            .field("cached", &self.cache.read().len())
            .finish()
    }
}

/// Secure channel key policy.
#[derive(Debug, Default)]
pub struct SecurityService;

impl SecurityService {
    /// Create the service.
    pub fn new() -> Self {
        Self
    }

    /// The key a device must be registered with for a given mode:
    /// `ClearText` has none, `Install` uses the well-known base key, and
    /// `Secure` requires the stored per-device key.
    pub fn security_key(
        &self,
        mode: SecurityMode,
        stored: Option<SecureKey>,
    ) -> Result<Option<SecureKey>> {
        match mode {
            SecurityMode::ClearText => Ok(None),
            SecurityMode::Install => Ok(Some(self.default_installation_key())),
            SecurityMode::Secure => stored.map(Some).ok_or_else(|| {
                GatewayError::Config("Secure mode requires a stored key".into())
            }),
        }
    }

    /// 16 bytes from the OS CSPRNG.
    pub fn generate_random_key(&self) -> SecureKey {
        let mut key = [0u8; 16];
        rand::thread_rng().fill(&mut key);
        SecureKey::new(key)
    }

    /// The well-known install-mode base key (SCBK-D).
    pub fn default_installation_key(&self) -> SecureKey {
        SecureKey::new(DEFAULT_INSTALLATION_KEY)
    }
}

/// Atomic security posture writes, used by the device session after a
/// successful key installation.
pub struct SecurityUpdateService {
    store: Arc<dyn GatewayStore>,
    notifier: Arc<dyn Notifier>,
}

impl SecurityUpdateService {
    /// Create the service.
    pub fn new(store: Arc<dyn GatewayStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Write `(mode, key)` for a reader in one repository operation.
    pub async fn update(
        &self,
        reader: ReaderId,
        mode: SecurityMode,
        key: Option<SecureKey>,
    ) -> Result<()> {
        if mode == SecurityMode::Secure && key.is_none() {
            return Err(GatewayError::Config(
                "Secure mode requires a stored key".into(),
            ));
        }
        self.store.update_security(reader, mode, key).await?;
        let _ = self.notifier.broadcast(Notification::ReaderConfigChanged {
            reader_id: reader,
            change: ConfigChange::SecurityUpdated,
        });
        Ok(())
    }
}

impl std::fmt::Debug for SecurityUpdateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityUpdateService").finish()
    }
}

/// Version tag written into configuration exports.
pub const EXPORT_VERSION: u32 = 1;

/// Identity block of an export.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    /// Producing system name.
    pub name: String,
    /// Producing system version.
    pub version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

/// The configuration export document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    /// Format version.
    pub export_version: u32,
    /// When the export was produced.
    pub exported_at: DateTime<Utc>,
    /// Producing system.
    pub system_info: SystemInfo,
    /// All readers with their mappings.
    pub readers: Vec<ReaderConfig>,
    /// The singleton feedback configuration.
    pub feedback: FeedbackConfig,
}

/// Reject documents that could not have come from a consistent
/// configuration: duplicate reader names, duplicate addresses on a port,
/// duplicate execution orders within a reader, and invalid feedback.
pub fn validate_export(doc: &ExportDocument) -> Result<()> {
    let mut names = HashSet::new();
    let mut addresses = HashSet::new();
    for reader in &doc.readers {
        reader.validate()?;
        if !names.insert(reader.name.clone()) {
            return Err(GatewayError::Config(format!(
                "duplicate reader name: {}",
                reader.name
            )));
        }
        if !addresses.insert((reader.port.clone(), reader.address)) {
            return Err(GatewayError::Config(format!(
                "duplicate address {} on {}",
                reader.address, reader.port
            )));
        }
    }
    doc.feedback.validate()
}

/// Produce the export JSON.
pub async fn export_configuration(
    readers: &ReaderConfigService,
    feedback: &FeedbackConfigService,
) -> Result<String> {
    let doc = ExportDocument {
        export_version: EXPORT_VERSION,
        exported_at: Utc::now(),
        system_info: SystemInfo::default(),
        readers: readers.list().await?,
        feedback: feedback.get().await?,
    };
    serde_json::to_string_pretty(&doc)
        .map_err(|e| GatewayError::Export(format!("cannot serialize export: {e}")))
}

/// Parse and validate an export document.
pub fn parse_export(json: &str) -> Result<ExportDocument> {
    let doc: ExportDocument = serde_json::from_str(json)
        .map_err(|e| GatewayError::Export(format!("unparseable export document: {e}")))?;
    if doc.export_version > EXPORT_VERSION {
        return Err(GatewayError::Export(format!(
            "unsupported export version {}",
            doc.export_version
        )));
    }
    validate_export(&doc)?;
    Ok(doc)
}

/// What an import did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImportSummary {
    /// Readers created or replaced.
    pub readers: usize,
}

/// Apply an export document: upsert every reader, replace the feedback
/// configuration.
pub async fn import_configuration(
    json: &str,
    readers: &ReaderConfigService,
    feedback: &FeedbackConfigService,
) -> Result<ImportSummary> {
    let doc = parse_export(json)?;
    let count = doc.readers.len();
    for reader in doc.readers {
        readers.upsert(reader).await?;
    }
    feedback.set(doc.feedback).await?;
    Ok(ImportSummary { readers: count })
}
