//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! # OSDP Gateway
//!
//! An industrial gateway core that bridges OSDP (Open Supervised Device
//! Protocol) card readers to host-defined business logic. The gateway acts
//! as the Control Panel on one or more RS-485 buses: it polls the
//! peripheral devices configured on each bus, lifts credential reads and
//! PIN entries off the wire, runs them through the ordered plugin chain of
//! the originating reader, and drives LED/buzzer/text feedback back to the
//! device. Every processed event is persisted and broadcast; a packet trace
//! subsystem captures raw frames for diagnostics.
//!
//! The OSDP wire protocol itself (framing, CRC, secure channel crypto per
//! IEC 60839-11-5) is not implemented here. The core talks to a codec
//! library through the narrow [`OsdpCodec`] trait; the `osdpgwd` daemon
//! binds it to LibOSDP over a serial port, and tests bind it to an
//! in-memory codec.
//!
//! ## Getting started
//!
//! Assemble a [`Gateway`] from its three collaborators (a codec, a
//! repository implementing [`GatewayStore`], and a notification sink
//! implementing [`Notifier`]), then configure readers through its services
//! and call [`Gateway::start`]:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use osdp_gateway::*;
//! # async fn example(codec: Arc<dyn OsdpCodec>) -> Result<(), GatewayError> {
//! let store = MemoryStore::new();
//! let notifier = Arc::new(ChannelNotifier::new(64));
//! let gateway = Gateway::new(codec, store, notifier, GatewayOptions::default());
//!
//! let reader = ReaderConfigBuilder::new()
//!     .name("front door")?
//!     .port("/dev/ttyUSB0")?
//!     .address(1)?
//!     .plugin("allow-list")
//!     .build()?;
//! gateway.readers().create(reader).await?;
//! gateway.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Events then flow on their own: card reads and completed PINs are
//! processed in arrival order per reader (concurrently across readers),
//! feedback is selected from the configured success/failure records, and
//! the outcome is persisted and handed to the notifier.

#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

mod bus;
mod card;
mod codec;
mod config;
mod device;
mod events;
mod feedback;
mod gateway;
mod notify;
mod pin;
mod pipeline;
pub mod plugin;
mod reader;
mod store;
mod trace;

// Re-export for convenience
pub use bus::BusManager;
pub use card::{bits_string, wiegand_to_decimal};
pub use codec::*;
pub use config::{
    export_configuration, import_configuration, parse_export, validate_export, ExportDocument,
    ImportSummary, MappingService, ReaderConfigService, SecurityService, SecurityUpdateService,
    SystemInfo, DEFAULT_INSTALLATION_KEY, EXPORT_VERSION,
};
pub use device::{DeviceSession, DeviceState, DeviceStatus};
pub use events::*;
pub use feedback::*;
pub use gateway::{Gateway, GatewayOptions};
pub use notify::*;
pub use pin::{PinCollector, PinPolicy};
pub use pipeline::{
    decode_plugin_results, encode_plugin_results, EventPipeline, FeedbackSink, PipelineCounters,
    PipelineEvent, PipelineJob, PipelineOutcome, PipelineRouter, PluginOutcome,
};
pub use plugin::{Plugin, PluginHost, PluginInfo, PluginVerdict};
pub use reader::*;
pub use store::{GatewayStore, MemoryStore, StoredOutcome};
pub use trace::{
    export_osdpcap, export_text, ExportBlob, IngestOutcome, LimitMode, PacketTraceEntry,
    PacketTraceStore, TraceSettings, TraceStatistics, DEFAULT_RING_CAPACITY,
};

use thiserror::Error;

/// Gateway public errors, one variant per failure class.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Invalid or conflicting configuration. Surfaced synchronously;
    /// persistent state is never mutated by a rejected operation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serial port or device registration failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// OSDP protocol failure, e.g. a rejected secure channel key.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Repository failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Plugin loading or lifecycle failure.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Configuration export/import failure.
    #[error("export error: {0}")]
    Export(String),

    /// Operation requires a running gateway.
    #[error("gateway is not running")]
    NotRunning,

    /// Operation raced a shutdown.
    #[error("gateway is shutting down")]
    Stopped,
}
