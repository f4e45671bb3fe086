//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

pub mod memory_codec;
pub mod plugins;

use std::sync::Arc;
use std::time::Duration;

use osdp_gateway::{
    ChannelNotifier, Gateway, GatewayOptions, MemoryStore, Notification, ReaderConfig,
    ReaderConfigBuilder, TraceSettings,
};
use tokio::sync::broadcast;

use self::memory_codec::MemoryCodec;

#[allow(dead_code)]
pub fn setup() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

/// A fully wired gateway over the in-memory collaborators.
#[allow(dead_code)]
pub struct Harness {
    pub codec: Arc<MemoryCodec>,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<ChannelNotifier>,
    pub gateway: Gateway,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self::with_options(GatewayOptions::default())
    }

    pub fn with_tracing() -> Self {
        Self::with_options(GatewayOptions {
            trace: TraceSettings {
                enabled: true,
                ..TraceSettings::default()
            },
            ..GatewayOptions::default()
        })
    }

    pub fn with_options(options: GatewayOptions) -> Self {
        setup();
        let codec = MemoryCodec::new();
        let store = MemoryStore::new();
        let notifier = Arc::new(ChannelNotifier::new(256));
        let gateway = Gateway::new(
            codec.clone(),
            store.clone(),
            notifier.clone(),
            options,
        );
        Self {
            codec,
            store,
            notifier,
            gateway,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }
}

/// An enabled reader on `port` with the given plugin chain.
#[allow(dead_code)]
pub fn reader_config(name: &str, port: &str, address: u8, plugins: &[&str]) -> ReaderConfig {
    let mut builder = ReaderConfigBuilder::new()
        .name(name)
        .unwrap()
        .port(port)
        .unwrap()
        .address(address)
        .unwrap();
    for plugin in plugins {
        builder = builder.plugin(plugin);
    }
    builder.build().unwrap()
}

/// Receive notifications until `pick` matches, with a 5 second deadline.
#[allow(dead_code)]
pub async fn recv_until<T>(
    rx: &mut broadcast::Receiver<Notification>,
    mut pick: impl FnMut(Notification) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let notification = rx.recv().await.expect("notification stream closed");
            if let Some(found) = pick(notification) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}
