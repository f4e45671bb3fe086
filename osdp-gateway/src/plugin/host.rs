//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! The plugin host: discovery, lifetime and per-reader lookup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use libloading::Library;
use parking_lot::{Mutex, RwLock};

use crate::config::MappingService;
use crate::plugin::{loader, Plugin, PluginLogger, PLUGIN_API_VERSION};
use crate::reader::{PluginMapping, ReaderId};
use crate::GatewayError;

type Result<T> = core::result::Result<T, GatewayError>;

/// Descriptive snapshot of a loaded plugin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginInfo {
    /// Stable id.
    pub id: String,
    /// Name.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Description.
    pub description: String,
}

/// Owns every loaded plugin as a long-lived singleton and resolves the
/// ordered plugin chain of a reader.
///
/// Artifact handles are kept alive for the host's whole lifetime, including
/// across [`reload`](Self::reload): an unloaded `Library` would invalidate
/// code some pipeline might still be executing, so old handles are retired
/// instead of dropped.
pub struct PluginHost {
    mappings: Arc<MappingService>,
    plugin_dir: Option<PathBuf>,
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
    libraries: Mutex<Vec<Library>>,
    retired: Mutex<Vec<Library>>,
}

impl PluginHost {
    /// Create a host. `plugin_dir` is scanned by
    /// [`discover`](Self::discover); `None` means only statically
    /// registered plugins exist.
    pub fn new(mappings: Arc<MappingService>, plugin_dir: Option<PathBuf>) -> Self {
        Self {
            mappings,
            plugin_dir,
            plugins: RwLock::new(HashMap::new()),
            libraries: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Register an already-instantiated plugin (built-ins, tests).
    /// Initializes it and refuses duplicate ids.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let id = plugin.id().to_owned();
        if id.trim().is_empty() {
            return Err(GatewayError::Plugin("plugin id must not be empty".into()));
        }
        if self.plugins.read().contains_key(&id) {
            return Err(GatewayError::Plugin(format!(
                "plugin {id} is already registered"
            )));
        }
        plugin.initialize()?;
        log::info!("plugin {} v{} registered", plugin.id(), plugin.version());
        self.plugins.write().insert(id, plugin);
        Ok(())
    }

    /// Scan the plugin directory and instantiate everything loadable.
    /// Returns the number of plugins added. Artifacts that fail to load,
    /// carry the wrong API version or collide on id are skipped with a
    /// warning; one bad artifact never stops the scan.
    pub fn discover(&self) -> Result<usize> {
        let Some(dir) = self.plugin_dir.clone() else {
            return Ok(0);
        };
        let mut added = 0;
        for path in loader::scan(&dir)? {
            let (library, declaration) = match unsafe { loader::load(&path) } {
                Ok(loaded) => loaded,
                Err(e) => {
                    log::warn!("skipping {}: {e}", path.display());
                    continue;
                }
            };
            if declaration.api_version != PLUGIN_API_VERSION {
                log::warn!(
                    "skipping {}: plugin API v{} does not match host v{}",
                    path.display(),
                    declaration.api_version,
                    PLUGIN_API_VERSION
                );
                continue;
            }
            let plugin: Box<dyn Plugin> = if let Some(ctor) = declaration.create_with_logger {
                ctor(&PluginLogger::host())
            } else if let Some(ctor) = declaration.create {
                ctor()
            } else {
                log::warn!("skipping {}: declaration has no constructor", path.display());
                continue;
            };
            match self.register(Arc::from(plugin)) {
                Ok(()) => {
                    self.libraries.lock().push(library);
                    added += 1;
                }
                Err(e) => log::warn!("skipping {}: {e}", path.display()),
            }
        }
        Ok(added)
    }

    /// Shut everything down, evict both caches and rescan the directory.
    pub fn reload(&self) -> Result<usize> {
        let plugins: Vec<Arc<dyn Plugin>> = self.plugins.write().drain().map(|(_, p)| p).collect();
        for plugin in plugins {
            plugin.shutdown();
        }
        self.retired.lock().append(&mut self.libraries.lock());
        self.discover()
    }

    /// Best-effort unload of one plugin: shut it down and drop the host's
    /// handle. Callers still holding the instance keep a working object;
    /// the artifact itself stays mapped.
    pub fn unload(&self, id: &str) -> Result<()> {
        let plugin = self
            .plugins
            .write()
            .remove(id)
            .ok_or_else(|| GatewayError::Plugin(format!("no plugin with id {id}")))?;
        plugin.shutdown();
        log::info!("plugin {id} unloaded");
        Ok(())
    }

    /// Look a plugin up by id.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.read().get(id).cloned()
    }

    /// Descriptive list of loaded plugins, sorted by id.
    pub fn list(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> = self
            .plugins
            .read()
            .values()
            .map(|p| PluginInfo {
                id: p.id().to_owned(),
                name: p.name().to_owned(),
                version: p.version().to_owned(),
                description: p.description().to_owned(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// The enabled plugin chain of a reader, in ascending execution order.
    /// Mappings referencing a plugin the host does not have are skipped and
    /// logged, per the chain's fail-open rule.
    pub async fn plugins_for_reader(
        &self,
        reader: ReaderId,
    ) -> Result<Vec<(PluginMapping, Arc<dyn Plugin>)>> {
        let mappings = self.mappings.enabled_ordered(reader).await?;
        let mut chain = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            match self.get(&mapping.plugin_id) {
                Some(plugin) => chain.push((mapping, plugin)),
                None => log::warn!(
                    "reader {reader}: mapped plugin {} is not loaded, skipping",
                    mapping.plugin_id
                ),
            }
        }
        Ok(chain)
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("plugins", &self.plugins.read().len())
            .field("plugin_dir", &self.plugin_dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginVerdict;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct NamedPlugin(&'static str);

    #[async_trait]
    impl Plugin for NamedPlugin {
        fn id(&self) -> &str {
            self.0
        }
        fn name(&self) -> &str {
            self.0
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn handles_card_reads(&self) -> bool {
            true
        }
        async fn process_card_read(
            &self,
            _event: &crate::events::CardReadEvent,
        ) -> PluginVerdict {
            PluginVerdict::Allow
        }
    }

    fn host() -> PluginHost {
        let store = MemoryStore::new();
        PluginHost::new(Arc::new(MappingService::new(store)), None)
    }

    #[test]
    fn register_rejects_duplicate_ids() {
        let host = host();
        host.register(Arc::new(NamedPlugin("p1"))).unwrap();
        assert!(host.register(Arc::new(NamedPlugin("p1"))).is_err());
        assert_eq!(host.list().len(), 1);
    }

    #[test]
    fn unload_removes_instance() {
        let host = host();
        host.register(Arc::new(NamedPlugin("p1"))).unwrap();
        host.unload("p1").unwrap();
        assert!(host.get("p1").is_none());
        assert!(host.unload("p1").is_err());
    }

    #[test]
    fn list_is_sorted_by_id() {
        let host = host();
        host.register(Arc::new(NamedPlugin("zeta"))).unwrap();
        host.register(Arc::new(NamedPlugin("alpha"))).unwrap();
        let ids: Vec<_> = host.list().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[test]
    fn discover_without_directory_is_a_no_op() {
        assert_eq!(host().discover().unwrap(), 0);
    }
}
