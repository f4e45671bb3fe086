//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! A complete gateway wired over a scripted in-memory codec: one reader,
//! one allow-list plugin, one card presentation. Run it to watch an event
//! travel the whole pipeline without any hardware attached.

use std::sync::Arc;

use async_trait::async_trait;
use osdp_gateway::{
    BaudRate, BusId, CardReadEvent, ChannelNotifier, CodecCommand, CodecEvent, DeviceSpec,
    Gateway, GatewayError, GatewayOptions, MemoryStore, Notification, OsdpAddress, OsdpCodec,
    Plugin, PluginVerdict, ReaderConfigBuilder,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// A codec with no wire behind it; the example scripts its events.
struct ScriptedCodec {
    events_tx: mpsc::UnboundedSender<CodecEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<CodecEvent>>>,
}

impl ScriptedCodec {
    fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }
}

#[async_trait]
impl OsdpCodec for ScriptedCodec {
    async fn open_bus(&self, port: &str, baud_rate: BaudRate) -> Result<BusId, GatewayError> {
        log::info!("opening {port} at {baud_rate}");
        Ok(BusId(0))
    }

    async fn close_bus(&self, _bus: BusId) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn register_device(&self, bus: BusId, spec: DeviceSpec) -> Result<(), GatewayError> {
        log::info!("registered {} at address {}", spec.name, spec.address);
        // The scripted device answers polls right away.
        let _ = self.events_tx.send(CodecEvent::StatusChange {
            bus,
            address: spec.address.as_u8(),
            online: true,
        });
        Ok(())
    }

    async fn unregister_device(
        &self,
        _bus: BusId,
        _address: OsdpAddress,
    ) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn is_online(&self, _bus: BusId, _address: OsdpAddress) -> bool {
        true
    }

    async fn send(
        &self,
        _bus: BusId,
        address: OsdpAddress,
        command: CodecCommand,
    ) -> Result<(), GatewayError> {
        log::info!("-> PD {address}: {command:?}");
        Ok(())
    }

    fn events(&self) -> mpsc::UnboundedReceiver<CodecEvent> {
        self.events_rx.lock().take().expect("events already taken")
    }
}

/// Allows one hard-coded card number.
struct DemoPlugin;

#[async_trait]
impl Plugin for DemoPlugin {
    fn id(&self) -> &str {
        "demo-allow-list"
    }
    fn name(&self) -> &str {
        "demo-allow-list"
    }
    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }
    fn handles_card_reads(&self) -> bool {
        true
    }
    async fn process_card_read(&self, event: &CardReadEvent) -> PluginVerdict {
        if event.card_number == "12345678" {
            PluginVerdict::Allow
        } else {
            PluginVerdict::Deny("card is not on the list".into())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), GatewayError> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .init();

    let codec = ScriptedCodec::new();
    let notifier = Arc::new(ChannelNotifier::new(16));
    let gateway = Gateway::new(
        codec.clone(),
        MemoryStore::new(),
        notifier.clone(),
        GatewayOptions::default(),
    );
    gateway.plugins().register(Arc::new(DemoPlugin))?;

    let reader = ReaderConfigBuilder::new()
        .name("front door")?
        .port("/dev/ttyUSB0")?
        .address(1)?
        .plugin("demo-allow-list")
        .build()?;
    gateway.readers().create(reader).await?;

    let mut notifications = notifier.subscribe();
    gateway.start().await?;

    // 12345678 as a 26-bit Wiegand payload.
    let _ = codec.events_tx.send(CodecEvent::CardData {
        bus: BusId(0),
        address: 1,
        data: vec![0x2F, 0x18, 0x53, 0x80],
        bit_count: 26,
        format: None,
    });

    while let Ok(notification) = notifications.recv().await {
        if let Notification::CardEvent { event, outcome } = notification {
            println!(
                "card {} on '{}' -> {} ({})",
                event.card_number,
                event.reader_id,
                if outcome.success { "granted" } else { "denied" },
                outcome.message
            );
            break;
        }
    }

    gateway.stop().await
}
