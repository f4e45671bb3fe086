//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Reader configuration model. A reader is the unit of configuration of the
//! gateway: one physical OSDP peripheral device on an RS-485 bus, together
//! with its security material and the ordered plugin chain that processes
//! events it produces.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::GatewayError;

type Result<T> = core::result::Result<T, GatewayError>;

/// Stable 128-bit reader identity. Assigned once when a reader is first
/// configured and never changes afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReaderId(Uuid);

impl ReaderId {
    /// Mint a fresh random reader id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReaderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ReaderId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(Uuid::parse_str(s).map_err(|_| {
            GatewayError::Config(format!("invalid reader id: {s}"))
        })?))
    }
}

/// RS-485 line rate. OSDP allows a handful of standard rates; everything
/// else is rejected at configuration time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum BaudRate {
    /// 9600 bits per second; the OSDP mandated default.
    B9600,
    /// 19200 bits per second.
    B19200,
    /// 38400 bits per second.
    B38400,
    /// 57600 bits per second.
    B57600,
    /// 115200 bits per second.
    B115200,
}

impl BaudRate {
    /// The rate as the plain number a serial transport wants.
    pub fn as_u32(&self) -> u32 {
        match self {
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115200,
        }
    }
}

impl Default for BaudRate {
    fn default() -> Self {
        BaudRate::B9600
    }
}

impl From<BaudRate> for u32 {
    fn from(value: BaudRate) -> Self {
        value.as_u32()
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = GatewayError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            9600 => Ok(BaudRate::B9600),
            19200 => Ok(BaudRate::B19200),
            38400 => Ok(BaudRate::B38400),
            57600 => Ok(BaudRate::B57600),
            115200 => Ok(BaudRate::B115200),
            _ => Err(GatewayError::Config(format!("invalid baud rate: {value}"))),
        }
    }
}

impl FromStr for BaudRate {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        let value: u32 = s
            .parse()
            .map_err(|_| GatewayError::Config(format!("invalid baud rate: {s}")))?;
        Self::try_from(value)
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// 7-bit OSDP device address. 0x7F is the broadcast address and cannot be
/// assigned to a reader; valid unicast addresses are 0..=127 with 1 as the
/// configuration default (0 is reserved for broadcast use on some panels).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub struct OsdpAddress(u8);

impl OsdpAddress {
    /// Validate and wrap a raw address.
    pub fn new(address: u8) -> Result<Self> {
        if address > 127 {
            return Err(GatewayError::Config(format!(
                "invalid OSDP address: {address}"
            )));
        }
        Ok(Self(address))
    }

    /// The raw 7-bit address.
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

impl Default for OsdpAddress {
    fn default() -> Self {
        Self(1)
    }
}

impl From<OsdpAddress> for u8 {
    fn from(value: OsdpAddress) -> Self {
        value.0
    }
}

impl TryFrom<u8> for OsdpAddress {
    type Error = GatewayError;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl fmt::Display for OsdpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Secure channel posture of a reader.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityMode {
    /// No secure channel; plain OSDP with CRC only.
    #[default]
    ClearText,
    /// Bring the device up with the well-known base key and install a
    /// random per-device key on first contact.
    Install,
    /// Secure channel with the stored per-device key.
    Secure,
}

impl FromStr for SecurityMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ClearText" | "clear-text" | "clear" => Ok(SecurityMode::ClearText),
            "Install" | "install" => Ok(SecurityMode::Install),
            "Secure" | "secure" => Ok(SecurityMode::Secure),
            _ => Err(GatewayError::Config(format!("invalid security mode: {s}"))),
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecurityMode::ClearText => "ClearText",
            SecurityMode::Install => "Install",
            SecurityMode::Secure => "Secure",
        };
        f.write_str(s)
    }
}

/// 16-byte OSDP secure channel base key (SCBK). The key material is kept out
/// of `Debug` output and log lines; only the hex form ever leaves this type,
/// and only on explicit request.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SecureKey([u8; 16]);

impl SecureKey {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Render the key as 32 lowercase hex digits.
    pub fn to_hex(&self) -> String {
        use core::fmt::Write;
        let mut s = String::with_capacity(32);
        for b in &self.0 {
            write!(&mut s, "{b:02x}").unwrap();
        }
        s
    }

    /// Parse a key from 32 hex digits.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 32 {
            return Err(GatewayError::Config(format!(
                "secure key must be 32 hex digits, got {}",
                s.len()
            )));
        }
        let mut key = [0u8; 16];
        for (i, out) in key.iter_mut().enumerate() {
            *out = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| GatewayError::Config("secure key is not valid hex".into()))?;
        }
        Ok(Self(key))
    }
}

impl fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecureKey(..)")
    }
}

impl From<SecureKey> for String {
    fn from(value: SecureKey) -> Self {
        value.to_hex()
    }
}

impl TryFrom<String> for SecureKey {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(&value)
    }
}

/// Association of one plugin to one reader, with a 1-based execution order
/// unique within that reader.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMapping {
    /// Owning reader.
    pub reader_id: ReaderId,
    /// Opaque plugin identity as reported by the plugin itself.
    pub plugin_id: String,
    /// 1-based position in the reader's plugin chain.
    pub order: u32,
    /// Disabled mappings are kept but never executed.
    pub enabled: bool,
}

impl PluginMapping {
    /// New enabled mapping at the given chain position.
    pub fn new(reader_id: ReaderId, plugin_id: &str, order: u32) -> Self {
        Self {
            reader_id,
            plugin_id: plugin_id.to_owned(),
            order,
            enabled: true,
        }
    }
}

/// Validate a mapping set for one reader: non-empty plugin ids and strictly
/// positive, unique execution orders.
pub fn validate_mappings(mappings: &[PluginMapping]) -> Result<()> {
    let mut orders = BTreeSet::new();
    for m in mappings {
        if m.plugin_id.trim().is_empty() {
            return Err(GatewayError::Config("plugin id must not be empty".into()));
        }
        if m.order == 0 {
            return Err(GatewayError::Config(format!(
                "plugin {} has order 0; execution orders are 1-based",
                m.plugin_id
            )));
        }
        if !orders.insert(m.order) {
            return Err(GatewayError::Config(format!(
                "duplicate plugin execution order {}",
                m.order
            )));
        }
    }
    Ok(())
}

/// Persistent configuration of one reader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Stable identity.
    pub id: ReaderId,
    /// Human readable name; shows up in logs, traces and notifications.
    pub name: String,
    /// Serial port the reader's bus hangs off, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    /// Line rate shared by every reader on the same port.
    pub baud_rate: BaudRate,
    /// OSDP device address, unique per bus.
    pub address: OsdpAddress,
    /// Secure channel posture.
    pub security_mode: SecurityMode,
    /// Per-device secure channel key; required when `security_mode` is
    /// [`SecurityMode::Secure`].
    pub secure_key: Option<SecureKey>,
    /// Disabled readers are kept in configuration but never polled.
    pub enabled: bool,
    /// Ordered plugin chain.
    pub mappings: Vec<PluginMapping>,
    /// First persisted.
    pub created_at: DateTime<Utc>,
    /// Last modified.
    pub updated_at: DateTime<Utc>,
}

impl ReaderConfig {
    /// Validate the reader in isolation (cross-reader rules live in the
    /// configuration service and the bus manager).
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::Config("reader name must not be empty".into()));
        }
        if self.port.trim().is_empty() {
            return Err(GatewayError::Config(format!(
                "reader {} has no serial port",
                self.name
            )));
        }
        if self.security_mode == SecurityMode::Secure && self.secure_key.is_none() {
            return Err(GatewayError::Config(format!(
                "reader {} is in Secure mode but has no key",
                self.name
            )));
        }
        validate_mappings(&self.mappings)
    }
}

/// Builder for [`ReaderConfig`]. Setters validate eagerly so a bad value is
/// reported at the call site that supplied it.
#[derive(Debug, Default)]
pub struct ReaderConfigBuilder {
    name: Option<String>,
    port: Option<String>,
    baud_rate: BaudRate,
    address: OsdpAddress,
    security_mode: SecurityMode,
    secure_key: Option<SecureKey>,
    enabled: bool,
    mappings: Vec<PluginMapping>,
}

impl ReaderConfigBuilder {
    /// Create a builder; the reader starts enabled, ClearText, address 1.
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Set the reader name.
    pub fn name(mut self, name: &str) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(GatewayError::Config("reader name must not be empty".into()));
        }
        self.name = Some(name.to_owned());
        Ok(self)
    }

    /// Set the serial port.
    pub fn port(mut self, port: &str) -> Result<Self> {
        if port.trim().is_empty() {
            return Err(GatewayError::Config("serial port must not be empty".into()));
        }
        self.port = Some(port.to_owned());
        Ok(self)
    }

    /// Set the line rate.
    pub fn baud_rate(mut self, baud_rate: BaudRate) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the OSDP address.
    pub fn address(mut self, address: u8) -> Result<Self> {
        self.address = OsdpAddress::new(address)?;
        Ok(self)
    }

    /// Set the security mode.
    pub fn security_mode(mut self, mode: SecurityMode) -> Self {
        self.security_mode = mode;
        self
    }

    /// Set the secure channel key.
    pub fn secure_key(mut self, key: SecureKey) -> Self {
        self.secure_key = Some(key);
        self
    }

    /// Enable or disable the reader.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Append a plugin mapping; order defaults to the next free position.
    pub fn plugin(mut self, plugin_id: &str) -> Self {
        let order = self.mappings.len() as u32 + 1;
        self.mappings.push(PluginMapping {
            reader_id: ReaderId(Uuid::nil()),
            plugin_id: plugin_id.to_owned(),
            order,
            enabled: true,
        });
        self
    }

    /// Finalize; assigns a fresh id and stamps both timestamps.
    pub fn build(self) -> Result<ReaderConfig> {
        let id = ReaderId::new();
        let now = Utc::now();
        let mut mappings = self.mappings;
        for m in &mut mappings {
            m.reader_id = id;
        }
        let config = ReaderConfig {
            id,
            name: self
                .name
                .ok_or_else(|| GatewayError::Config("reader name must not be empty".into()))?,
            port: self
                .port
                .ok_or_else(|| GatewayError::Config("serial port must not be empty".into()))?,
            baud_rate: self.baud_rate,
            address: self.address,
            security_mode: self.security_mode,
            secure_key: self.secure_key,
            enabled: self.enabled,
            mappings,
            created_at: now,
            updated_at: now,
        };
        config.validate()?;
        Ok(config)
    }
}
