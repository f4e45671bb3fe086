//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Daemon configuration: a TOML file describing the readers, their plugin
//! chains and the gateway tunables.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context};
use osdp_gateway::{
    BaudRate, GatewayOptions, PinPolicy, ReaderConfig, ReaderConfigBuilder, SecureKey,
    SecurityMode, TraceSettings,
};
use serde::Deserialize;

type Result<T> = anyhow::Result<T, anyhow::Error>;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReaderEntry {
    pub name: String,
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    #[serde(default = "default_address")]
    pub address: u8,
    #[serde(default = "default_security_mode")]
    pub security_mode: String,
    /// 32 hex digits; required when `security_mode = "Secure"`.
    pub secure_key: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub plugins: Vec<String>,
}

fn default_baud() -> u32 {
    9600
}

fn default_address() -> u8 {
    1
}

fn default_security_mode() -> String {
    "ClearText".to_owned()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PinEntry {
    pub max_length: Option<usize>,
    pub inter_digit_timeout_secs: Option<u64>,
    pub overall_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub plugin_dir: Option<PathBuf>,
    pub runtime_dir: Option<PathBuf>,
    #[serde(default)]
    pub trace: Option<TraceSettings>,
    #[serde(default)]
    pub pin: PinEntry,
    #[serde(default)]
    pub readers: Vec<ReaderEntry>,
}

fn default_log_level() -> String {
    "INFO".to_owned()
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("config {} does not exist!", path.display());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let config: DaemonConfig =
            toml::from_str(&text).with_context(|| format!("cannot parse {}", path.display()))?;
        Ok(config)
    }

    pub fn log_level(&self) -> log::LevelFilter {
        match self.log_level.as_str() {
            "ERROR" => log::LevelFilter::Error,
            "WARN" => log::LevelFilter::Warn,
            "INFO" => log::LevelFilter::Info,
            "DEBUG" => log::LevelFilter::Debug,
            "TRACE" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Off,
        }
    }

    /// Where pid files and other runtime droppings live.
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir.clone().unwrap_or_else(|| {
            dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("osdpgwd")
        })
    }

    pub fn gateway_options(&self) -> GatewayOptions {
        let mut pin = PinPolicy::default();
        if let Some(max_length) = self.pin.max_length {
            pin.max_length = max_length;
        }
        if let Some(secs) = self.pin.inter_digit_timeout_secs {
            pin.inter_digit_timeout = std::time::Duration::from_secs(secs);
        }
        if let Some(secs) = self.pin.overall_timeout_secs {
            pin.overall_timeout = std::time::Duration::from_secs(secs);
        }
        GatewayOptions {
            plugin_dir: self.plugin_dir.clone(),
            trace: self.trace.clone().unwrap_or_default(),
            pin,
            ..GatewayOptions::default()
        }
    }

    /// Typed reader configurations, validated the same way the service
    /// validates them.
    pub fn reader_configs(&self) -> Result<Vec<ReaderConfig>> {
        let mut configs = Vec::with_capacity(self.readers.len());
        for entry in &self.readers {
            let mode = SecurityMode::from_str(&entry.security_mode)
                .with_context(|| format!("reader {}", entry.name))?;
            let mut builder = ReaderConfigBuilder::new()
                .name(&entry.name)?
                .port(&entry.port)?
                .baud_rate(BaudRate::try_from(entry.baud_rate)?)
                .address(entry.address)?
                .security_mode(mode)
                .enabled(entry.enabled);
            if let Some(key) = &entry.secure_key {
                builder = builder.secure_key(
                    SecureKey::from_hex(key).with_context(|| format!("reader {}", entry.name))?,
                );
            }
            for plugin in &entry.plugins {
                builder = builder.plugin(plugin);
            }
            let config = builder.build()?;
            configs.push(config);
        }
        Ok(configs)
    }
}

/// One line per configured reader, for startup logging.
pub fn describe(configs: &[ReaderConfig]) -> String {
    let mut out = String::new();
    for config in configs {
        out.push_str(&format!(
            "  {} on {} @{} ({}, {} plugin(s))\n",
            config.name,
            config.port,
            config.address,
            config.security_mode,
            config.mappings.len()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use osdp_gateway::PluginMapping;

    #[test]
    fn minimal_config_parses() {
        let config: DaemonConfig = toml::from_str(
            r#"
            log_level = "DEBUG"

            [[readers]]
            name = "front"
            port = "/dev/ttyUSB0"
            plugins = ["allow-list"]
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level(), log::LevelFilter::Debug);
        let readers = config.reader_configs().unwrap();
        assert_eq!(readers.len(), 1);
        assert_eq!(readers[0].baud_rate.as_u32(), 9600);
        assert_eq!(readers[0].address.as_u8(), 1);
        assert_eq!(readers[0].mappings.len(), 1);
    }

    #[test]
    fn secure_reader_requires_key() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [[readers]]
            name = "vault"
            port = "/dev/ttyUSB0"
            security_mode = "Secure"
            "#,
        )
        .unwrap();
        assert!(config.reader_configs().is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: core::result::Result<DaemonConfig, _> = toml::from_str(
            r#"
            poll_interval_ms = 50
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn mapping_owner_matches_reader() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [[readers]]
            name = "front"
            port = "COM3"
            plugins = ["a", "b"]
            "#,
        )
        .unwrap();
        let readers = config.reader_configs().unwrap();
        let mappings: &[PluginMapping] = &readers[0].mappings;
        assert!(mappings.iter().all(|m| m.reader_id == readers[0].id));
        assert_eq!(mappings[1].order, 2);
    }
}
