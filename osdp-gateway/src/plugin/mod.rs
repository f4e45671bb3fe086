//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! The plugin contract. Plugins carry the business logic the gateway
//! deliberately does not have: they look at decoded card and PIN events and
//! vote. A plugin is compiled as a `cdylib` exporting a single registration
//! static (see [`PluginDeclaration`]); the host loads it once and keeps the
//! instance alive as a shared singleton, so implementations must tolerate
//! concurrent calls from different readers' pipelines.

mod host;
mod loader;

pub use host::{PluginHost, PluginInfo};

use async_trait::async_trait;

use crate::events::{CardReadEvent, PinReadEvent};
use crate::GatewayError;

type Result<T> = core::result::Result<T, GatewayError>;

/// ABI compatibility tag carried by every plugin artifact. Bumped whenever
/// the [`Plugin`] trait or the event types change shape.
pub const PLUGIN_API_VERSION: u32 = 1;

/// Name of the registration symbol a plugin artifact must export.
pub const PLUGIN_DECLARATION_SYMBOL: &[u8] = b"gateway_plugin_declaration\0";

/// A plugin's vote on one event. Exceptions-as-control-flow are deliberately
/// absent: a denial and an internal failure are distinct, explicit variants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PluginVerdict {
    /// The plugin approves the event.
    Allow,
    /// The plugin examined the event and rejected it.
    Deny(String),
    /// The plugin could not process the event.
    Error(String),
}

impl PluginVerdict {
    /// Whether this verdict counts as success for the aggregate result.
    pub fn is_allow(&self) -> bool {
        matches!(self, PluginVerdict::Allow)
    }

    /// The denial or error text, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            PluginVerdict::Allow => None,
            PluginVerdict::Deny(msg) | PluginVerdict::Error(msg) => Some(msg),
        }
    }
}

/// What every plugin exposes. A plugin may handle card reads, PIN reads or
/// both; the default processing methods report "not supported" so an
/// implementation only overrides what it advertises.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable identity; what reader mappings reference.
    fn id(&self) -> &str;
    /// Human readable name.
    fn name(&self) -> &str;
    /// Version string.
    fn version(&self) -> &str;
    /// One-line description.
    fn description(&self) -> &str {
        ""
    }

    /// Whether [`process_card_read`](Self::process_card_read) is meaningful.
    fn handles_card_reads(&self) -> bool {
        false
    }

    /// Whether [`process_pin_read`](Self::process_pin_read) is meaningful.
    fn handles_pin_reads(&self) -> bool {
        false
    }

    /// Called once after instantiation, before any event is delivered.
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Called when the host unloads the plugin. Best-effort; a plugin that
    /// holds no external state can ignore it.
    fn shutdown(&self) {}

    /// Vote on a card read.
    async fn process_card_read(&self, _event: &CardReadEvent) -> PluginVerdict {
        PluginVerdict::Error("card reads not supported".into())
    }

    /// Vote on a completed PIN entry.
    async fn process_pin_read(&self, _event: &PinReadEvent) -> PluginVerdict {
        PluginVerdict::Error("PIN reads not supported".into())
    }
}

impl std::fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.id())
            .field("version", &self.version())
            .finish()
    }
}

/// Logging hand-off for dynamically loaded plugins. A `cdylib` has its own
/// copy of the `log` crate's globals, so the host passes its logger across
/// and the plugin installs it into its own copy.
pub struct PluginLogger {
    /// The host's logger.
    pub logger: &'static dyn log::Log,
    /// The host's level filter.
    pub level: log::LevelFilter,
}

impl PluginLogger {
    /// Snapshot the host side.
    pub fn host() -> Self {
        Self {
            logger: log::logger(),
            level: log::max_level(),
        }
    }

    /// Install into the calling library's `log` globals. Call this first
    /// thing in a plugin constructor.
    pub fn install(&self) {
        let _ = log::set_logger(self.logger);
        log::set_max_level(self.level);
    }
}

impl std::fmt::Debug for PluginLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLogger")
            .field("level", &self.level)
            .finish()
    }
}

/// The registration record a plugin artifact exports under
/// [`PLUGIN_DECLARATION_SYMBOL`]. The host prefers the logger-taking
/// constructor and falls back to the plain one.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PluginDeclaration {
    /// Must equal the host's [`PLUGIN_API_VERSION`].
    pub api_version: u32,
    /// Constructor receiving the host's logging hand-off.
    pub create_with_logger: Option<fn(&PluginLogger) -> Box<dyn Plugin>>,
    /// Plain constructor.
    pub create: Option<fn() -> Box<dyn Plugin>>,
}

/// Declare a plugin entry point inside a `cdylib` crate.
///
/// ```ignore
/// osdp_gateway::declare_plugin!(MyPlugin::create, MyPlugin::create_with_logger);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($create:expr) => {
        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static gateway_plugin_declaration: $crate::plugin::PluginDeclaration =
            $crate::plugin::PluginDeclaration {
                api_version: $crate::plugin::PLUGIN_API_VERSION,
                create_with_logger: None,
                create: Some($create),
            };
    };
    ($create:expr, $create_with_logger:expr) => {
        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static gateway_plugin_declaration: $crate::plugin::PluginDeclaration =
            $crate::plugin::PluginDeclaration {
                api_version: $crate::plugin::PLUGIN_API_VERSION,
                create_with_logger: Some($create_with_logger),
                create: Some($create),
            };
    };
}
