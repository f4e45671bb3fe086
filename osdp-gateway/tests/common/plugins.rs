//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Scripted plugins for pipeline tests.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use osdp_gateway::{CardReadEvent, PinReadEvent, Plugin, PluginVerdict};
use parking_lot::Mutex;

/// Approves exactly the card numbers it was given; denies everything else
/// with "Plugin denied access".
pub struct AllowListPlugin {
    id: String,
    allowed: HashSet<String>,
}

#[allow(dead_code)]
impl AllowListPlugin {
    pub fn new(id: &str, allowed: &[&str]) -> Self {
        Self {
            id: id.to_owned(),
            allowed: allowed.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

#[async_trait]
impl Plugin for AllowListPlugin {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.id
    }
    fn version(&self) -> &str {
        "1.0.0"
    }
    fn handles_card_reads(&self) -> bool {
        true
    }
    async fn process_card_read(&self, event: &CardReadEvent) -> PluginVerdict {
        if self.allowed.contains(&event.card_number) {
            PluginVerdict::Allow
        } else {
            PluginVerdict::Deny("Plugin denied access".to_owned())
        }
    }
}

/// Fails every event with a fixed error.
pub struct FailingPlugin {
    id: String,
    error: String,
}

#[allow(dead_code)]
impl FailingPlugin {
    pub fn new(id: &str, error: &str) -> Self {
        Self {
            id: id.to_owned(),
            error: error.to_owned(),
        }
    }
}

#[async_trait]
impl Plugin for FailingPlugin {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.id
    }
    fn version(&self) -> &str {
        "1.0.0"
    }
    fn handles_card_reads(&self) -> bool {
        true
    }
    fn handles_pin_reads(&self) -> bool {
        true
    }
    async fn process_card_read(&self, _event: &CardReadEvent) -> PluginVerdict {
        PluginVerdict::Error(self.error.clone())
    }
    async fn process_pin_read(&self, _event: &PinReadEvent) -> PluginVerdict {
        PluginVerdict::Error(self.error.clone())
    }
}

/// Panics on every event; the pipeline must contain it.
pub struct PanicPlugin {
    id: String,
    message: &'static str,
}

#[allow(dead_code)]
impl PanicPlugin {
    pub fn new(id: &str, message: &'static str) -> Self {
        Self {
            id: id.to_owned(),
            message,
        }
    }
}

#[async_trait]
impl Plugin for PanicPlugin {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.id
    }
    fn version(&self) -> &str {
        "1.0.0"
    }
    fn handles_card_reads(&self) -> bool {
        true
    }
    async fn process_card_read(&self, _event: &CardReadEvent) -> PluginVerdict {
        panic!("{}", self.message);
    }
}

/// Approves everything and records what it saw, optionally after a delay.
pub struct RecordingPlugin {
    id: String,
    delay: Duration,
    seen: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl RecordingPlugin {
    pub fn new(id: &str) -> Self {
        Self::with_delay(id, Duration::ZERO)
    }

    pub fn with_delay(id: &str, delay: Duration) -> Self {
        Self {
            id: id.to_owned(),
            delay,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.id
    }
    fn version(&self) -> &str {
        "1.0.0"
    }
    fn handles_card_reads(&self) -> bool {
        true
    }
    fn handles_pin_reads(&self) -> bool {
        true
    }
    async fn process_card_read(&self, event: &CardReadEvent) -> PluginVerdict {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.seen.lock().push(event.card_number.clone());
        PluginVerdict::Allow
    }
    async fn process_pin_read(&self, event: &PinReadEvent) -> PluginVerdict {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.seen.lock().push(event.digits.clone());
        PluginVerdict::Allow
    }
}

/// Approves one exact PIN.
pub struct PinCheckPlugin {
    id: String,
    expected: String,
}

#[allow(dead_code)]
impl PinCheckPlugin {
    pub fn new(id: &str, expected: &str) -> Self {
        Self {
            id: id.to_owned(),
            expected: expected.to_owned(),
        }
    }
}

#[async_trait]
impl Plugin for PinCheckPlugin {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.id
    }
    fn version(&self) -> &str {
        "1.0.0"
    }
    fn handles_pin_reads(&self) -> bool {
        true
    }
    async fn process_pin_read(&self, event: &PinReadEvent) -> PluginVerdict {
        if event.digits == self.expected {
            PluginVerdict::Allow
        } else {
            PluginVerdict::Deny("wrong PIN".to_owned())
        }
    }
}
