//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use osdp_gateway::{
    decode_plugin_results, CardReadEvent, CodecCommand, CodecLedColor, FeedbackConfig,
    GatewayError, GatewayStore, LedCommand, MemoryStore, Notification, PinReadEvent,
    PluginMapping, ReaderConfig, ReaderId, SecureKey, SecurityMode, StoredOutcome,
};

use common::plugins::{AllowListPlugin, PanicPlugin, RecordingPlugin};
use common::{reader_config, recv_until, Harness};

/// 12345678 as a 26-bit Wiegand payload.
const CARD_12345678: (&[u8], usize) = (&[0x2F, 0x18, 0x53, 0x80], 26);
/// 99999999 as a 32-bit Wiegand payload.
const CARD_99999999: (&[u8], usize) = (&[0x05, 0xF5, 0xE0, 0xFF], 32);

async fn started_reader(harness: &Harness, config: ReaderConfig) -> ReaderConfig {
    let created = harness.gateway.readers().create(config).await.unwrap();
    harness.gateway.start().await.unwrap();
    harness.codec.go_online(&created.port, created.address.as_u8());
    created
}

#[tokio::test]
async fn authorized_card_on_single_plugin() {
    let harness = Harness::new();
    harness
        .gateway
        .plugins()
        .register(Arc::new(AllowListPlugin::new("P", &["12345678"])))
        .unwrap();
    let mut notifications = harness.subscribe();
    let reader = started_reader(&harness, reader_config("R1", "COM3", 1, &["P"])).await;

    harness
        .codec
        .present_card("COM3", 1, CARD_12345678.0, CARD_12345678.1);

    let (event, outcome) = recv_until(&mut notifications, |n| match n {
        Notification::CardEvent { event, outcome } => Some((event, outcome)),
        _ => None,
    })
    .await;

    assert_eq!(event.reader_id, reader.id);
    assert_eq!(event.card_number, "12345678");
    assert_eq!(event.bit_count, 26);
    assert!(outcome.success);
    assert_eq!(outcome.plugin_results, "P:Success");
    assert_eq!(harness.store.card_event_count(), 1);

    // Success feedback reached the device: green 1 s, one beep, text.
    let commands = harness.codec.commands_for(1);
    assert!(commands.iter().any(|c| matches!(
        c,
        CodecCommand::Led(LedCommand {
            color: CodecLedColor::Green,
            duration_ms: 1000,
            permanent: false,
        })
    )));
    assert!(commands
        .iter()
        .any(|c| matches!(c, CodecCommand::Buzzer(b) if b.count == 1)));
    assert!(commands
        .iter()
        .any(|c| matches!(c, CodecCommand::Text(t) if t.text == "ACCESS GRANTED")));
}

#[tokio::test]
async fn unauthorized_card_gets_failure_feedback() {
    let harness = Harness::new();
    harness
        .gateway
        .plugins()
        .register(Arc::new(AllowListPlugin::new("P", &["12345678"])))
        .unwrap();
    let reader = started_reader(&harness, reader_config("R1", "COM3", 1, &["P"])).await;

    let event = CardReadEvent::from_wire(reader.id, CARD_99999999.0, CARD_99999999.1);
    assert_eq!(event.card_number, "99999999");
    let outcome = harness.gateway.process_card(event).await;

    assert!(!outcome.success);
    assert_eq!(outcome.plugin_results.len(), 1);
    assert!(!outcome.plugin_results[0].success);
    assert_eq!(
        outcome.plugin_results[0].error.as_deref(),
        Some("Plugin denied access")
    );
    assert_eq!(outcome.feedback.led_duration_ms, 2000);
    assert_eq!(outcome.feedback.beep_count, 3);
    assert_eq!(outcome.feedback.display_text.as_deref(), Some("ACCESS DENIED"));
    assert!(outcome.persisted);
    assert!(outcome.feedback_sent);

    let persisted = harness.store.card_events();
    assert_eq!(persisted.len(), 1);
    assert!(!persisted[0].1.success);
}

#[tokio::test]
async fn panicking_plugin_is_contained_and_chain_continues() {
    let harness = Harness::new();
    let first = Arc::new(RecordingPlugin::new("P1"));
    harness.gateway.plugins().register(first.clone()).unwrap();
    harness
        .gateway
        .plugins()
        .register(Arc::new(PanicPlugin::new("P2", "db unreachable")))
        .unwrap();
    let reader = started_reader(&harness, reader_config("R2", "COM3", 1, &["P1", "P2"])).await;

    let event = CardReadEvent::from_wire(reader.id, &[0xAB, 0xCD, 0xEF, 0x10], 32);
    let outcome = harness.gateway.process_card(event).await;

    // The pipeline returned normally with both results in chain order.
    assert!(!outcome.success);
    assert_eq!(outcome.plugin_results.len(), 2);
    assert!(outcome.plugin_results[0].success);
    assert_eq!(outcome.plugin_results[0].plugin_name, "P1");
    assert!(!outcome.plugin_results[1].success);
    assert_eq!(
        outcome.plugin_results[1].error.as_deref(),
        Some("db unreachable")
    );
    assert_eq!(outcome.feedback.beep_count, 3);
    assert_eq!(first.seen().len(), 1);

    // The stored encoding round-trips with the error text intact.
    let stored = harness.store.card_events();
    let decoded = decode_plugin_results(&stored[0].1.plugin_results);
    assert_eq!(decoded[1].error.as_deref(), Some("db unreachable"));
}

#[tokio::test]
async fn empty_chain_is_a_failure_but_still_persists_and_notifies() {
    let harness = Harness::new();
    let mut notifications = harness.subscribe();
    let reader = started_reader(&harness, reader_config("R1", "COM3", 1, &[])).await;

    let event = CardReadEvent::from_wire(reader.id, &[0xFF], 8);
    let outcome = harness.gateway.process_card(event).await;

    assert!(!outcome.success);
    assert_eq!(outcome.message, "no plugins configured for reader");
    assert!(outcome.plugin_results.is_empty());
    assert!(outcome.persisted);
    assert_eq!(harness.store.card_event_count(), 1);

    let stored = recv_until(&mut notifications, |n| match n {
        Notification::CardEvent { outcome, .. } => Some(outcome),
        _ => None,
    })
    .await;
    assert_eq!(stored.message, "no plugins configured for reader");
}

#[tokio::test]
async fn disabled_mapping_is_skipped() {
    let harness = Harness::new();
    harness
        .gateway
        .plugins()
        .register(Arc::new(AllowListPlugin::new("P", &["1"])))
        .unwrap();
    let skipped = Arc::new(RecordingPlugin::new("skipped"));
    harness.gateway.plugins().register(skipped.clone()).unwrap();

    let mut config = reader_config("R1", "COM3", 1, &["P", "skipped"]);
    config.mappings[1].enabled = false;
    let reader = started_reader(&harness, config).await;

    let event = CardReadEvent::from_wire(reader.id, &[0x80], 1);
    let outcome = harness.gateway.process_card(event).await;
    assert!(outcome.success);
    assert_eq!(outcome.plugin_results.len(), 1);
    assert!(skipped.seen().is_empty());
}

/// Store wrapper whose event appends always fail; everything else
/// delegates.
struct FlakyStore {
    inner: Arc<MemoryStore>,
}

#[async_trait]
impl GatewayStore for FlakyStore {
    async fn save_reader(&self, config: &ReaderConfig) -> Result<(), GatewayError> {
        self.inner.save_reader(config).await
    }
    async fn load_readers(&self) -> Result<Vec<ReaderConfig>, GatewayError> {
        self.inner.load_readers().await
    }
    async fn load_reader(&self, id: ReaderId) -> Result<Option<ReaderConfig>, GatewayError> {
        self.inner.load_reader(id).await
    }
    async fn delete_reader(&self, id: ReaderId) -> Result<(), GatewayError> {
        self.inner.delete_reader(id).await
    }
    async fn save_feedback(&self, config: &FeedbackConfig) -> Result<(), GatewayError> {
        self.inner.save_feedback(config).await
    }
    async fn load_feedback(&self) -> Result<Option<FeedbackConfig>, GatewayError> {
        self.inner.load_feedback().await
    }
    async fn mappings_for_reader(
        &self,
        reader: ReaderId,
    ) -> Result<Vec<PluginMapping>, GatewayError> {
        self.inner.mappings_for_reader(reader).await
    }
    async fn mappings_for_plugin(
        &self,
        plugin_id: &str,
    ) -> Result<Vec<PluginMapping>, GatewayError> {
        self.inner.mappings_for_plugin(plugin_id).await
    }
    async fn set_mappings(
        &self,
        reader: ReaderId,
        mappings: &[PluginMapping],
    ) -> Result<(), GatewayError> {
        self.inner.set_mappings(reader, mappings).await
    }
    async fn update_mapping(&self, mapping: &PluginMapping) -> Result<(), GatewayError> {
        self.inner.update_mapping(mapping).await
    }
    async fn delete_mappings(&self, reader: ReaderId) -> Result<(), GatewayError> {
        self.inner.delete_mappings(reader).await
    }
    async fn append_card_event(
        &self,
        _event: &CardReadEvent,
        _outcome: &StoredOutcome,
    ) -> Result<(), GatewayError> {
        Err(GatewayError::Storage("database offline".into()))
    }
    async fn append_pin_event(
        &self,
        _event: &PinReadEvent,
        _outcome: &StoredOutcome,
    ) -> Result<(), GatewayError> {
        Err(GatewayError::Storage("database offline".into()))
    }
    async fn update_security(
        &self,
        reader: ReaderId,
        mode: SecurityMode,
        key: Option<SecureKey>,
    ) -> Result<(), GatewayError> {
        self.inner.update_security(reader, mode, key).await
    }
}

#[tokio::test]
async fn persistence_failure_does_not_fail_the_pipeline() {
    common::setup();
    let codec = common::memory_codec::MemoryCodec::new();
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
    });
    let notifier = Arc::new(osdp_gateway::ChannelNotifier::new(64));
    let gateway = osdp_gateway::Gateway::new(
        codec.clone(),
        store.clone(),
        notifier.clone(),
        osdp_gateway::GatewayOptions::default(),
    );
    gateway
        .plugins()
        .register(Arc::new(AllowListPlugin::new("P", &["1"])))
        .unwrap();
    let reader = gateway
        .readers()
        .create(reader_config("R1", "COM3", 1, &["P"]))
        .await
        .unwrap();
    gateway.start().await.unwrap();
    codec.go_online("COM3", 1);

    let mut notifications = notifier.subscribe();
    let event = CardReadEvent::from_wire(reader.id, &[0x80], 1);
    let outcome = gateway.process_card(event).await;

    assert!(outcome.success, "plugin verdict must be unaffected");
    assert!(!outcome.persisted);
    assert!(outcome.feedback_sent);
    // The notification still goes out.
    recv_until(&mut notifications, |n| match n {
        Notification::CardEvent { .. } => Some(()),
        _ => None,
    })
    .await;
}

#[tokio::test]
async fn feedback_failure_does_not_fail_the_pipeline() {
    let harness = Harness::new();
    harness
        .gateway
        .plugins()
        .register(Arc::new(AllowListPlugin::new("P", &["1"])))
        .unwrap();
    let reader = started_reader(&harness, reader_config("R1", "COM3", 1, &["P"])).await;
    harness.codec.set_fail_sends(true);

    let event = CardReadEvent::from_wire(reader.id, &[0x80], 1);
    let outcome = harness.gateway.process_card(event).await;
    assert!(outcome.success);
    assert!(!outcome.feedback_sent);
    assert!(outcome.persisted);
}

#[tokio::test]
async fn events_of_one_reader_run_in_arrival_order() {
    let harness = Harness::new();
    let recorder = Arc::new(RecordingPlugin::new("rec"));
    harness.gateway.plugins().register(recorder.clone()).unwrap();
    let mut notifications = harness.subscribe();
    started_reader(&harness, reader_config("R1", "COM3", 1, &["rec"])).await;

    // 1, 2, 3 as 8-bit payloads, in order.
    for value in [0x01u8, 0x02, 0x03] {
        harness.codec.present_card("COM3", 1, &[value], 8);
    }
    for _ in 0..3 {
        recv_until(&mut notifications, |n| match n {
            Notification::CardEvent { .. } => Some(()),
            _ => None,
        })
        .await;
    }
    assert_eq!(recorder.seen(), vec!["1", "2", "3"]);
}

#[tokio::test]
async fn readers_process_concurrently() {
    let harness = Harness::new();
    let slow = Arc::new(RecordingPlugin::with_delay(
        "slow",
        Duration::from_millis(1000),
    ));
    let fast = Arc::new(RecordingPlugin::new("fast"));
    harness.gateway.plugins().register(slow.clone()).unwrap();
    harness.gateway.plugins().register(fast.clone()).unwrap();
    let mut notifications = harness.subscribe();

    harness
        .gateway
        .readers()
        .create(reader_config("A", "COM3", 1, &["slow"]))
        .await
        .unwrap();
    harness
        .gateway
        .readers()
        .create(reader_config("B", "COM3", 2, &["fast"]))
        .await
        .unwrap();
    harness.gateway.start().await.unwrap();
    harness.codec.go_online("COM3", 1);
    harness.codec.go_online("COM3", 2);

    // A's slow pipeline starts first; B's must not wait behind it.
    harness.codec.present_card("COM3", 1, &[0x01], 8);
    harness.codec.present_card("COM3", 2, &[0x02], 8);

    let first = recv_until(&mut notifications, |n| match n {
        Notification::CardEvent { event, .. } => Some(event.card_number),
        _ => None,
    })
    .await;
    assert_eq!(first, "2", "the fast reader must finish first");
}
