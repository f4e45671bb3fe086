//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Notification fan-out. The gateway reports everything it does through a
//! single fire-and-forget [`Notifier::broadcast`] call; whatever sits on the
//! other side (a real-time hub, a message bus, a log file) is an external
//! collaborator. Broadcast failures never affect event processing.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::events::{CardReadEvent, PinReadEvent, StatusChangeEvent};
use crate::reader::ReaderId;
use crate::store::StoredOutcome;
use crate::trace::TraceStatistics;
use crate::GatewayError;

type Result<T> = core::result::Result<T, GatewayError>;

/// What changed about a reader's configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigChange {
    /// Reader created.
    Created,
    /// Reader updated (including mapping changes).
    Updated,
    /// Reader deleted.
    Deleted,
    /// Security mode or key changed.
    SecurityUpdated,
}

/// Gateway-wide counters for the statistics notification.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayStatistics {
    /// Card events processed since start.
    pub card_events: u64,
    /// PIN events processed since start.
    pub pin_events: u64,
    /// Events whose aggregate result was failure.
    pub failed_events: u64,
    /// Packet trace statistics snapshot.
    pub trace: TraceStatistics,
    /// Optional annotation, e.g. the memory-guard stop message.
    pub message: Option<String>,
}

/// Notification payloads handed to the collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Notification {
    /// A card event finished processing.
    CardEvent {
        /// The event.
        event: CardReadEvent,
        /// Aggregate outcome in stored form.
        outcome: StoredOutcome,
    },
    /// A PIN event finished processing.
    PinEvent {
        /// The event.
        event: PinReadEvent,
        /// Aggregate outcome in stored form.
        outcome: StoredOutcome,
    },
    /// A reader went online or offline.
    ReaderStatus(StatusChangeEvent),
    /// A reader's configuration changed.
    ReaderConfigChanged {
        /// Affected reader.
        reader_id: ReaderId,
        /// What changed.
        change: ConfigChange,
    },
    /// Aggregated statistics.
    Statistics(GatewayStatistics),
}

/// The notification collaborator seam. `broadcast` is fire-and-forget: the
/// pipeline logs a returned error and moves on.
pub trait Notifier: Send + Sync {
    /// Hand one notification to the collaborator.
    fn broadcast(&self, notification: Notification) -> Result<()>;
}

impl std::fmt::Debug for dyn Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish()
    }
}

/// Notifier that drops everything. Useful when no collaborator is attached.
#[derive(Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn broadcast(&self, _notification: Notification) -> Result<()> {
        Ok(())
    }
}

/// Notifier backed by a tokio broadcast channel, for in-process consumers
/// (the daemon's status surface, tests).
#[derive(Debug)]
pub struct ChannelNotifier {
    tx: broadcast::Sender<Notification>,
}

impl ChannelNotifier {
    /// Create a notifier with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the notification stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Notifier for ChannelNotifier {
    fn broadcast(&self, notification: Notification) -> Result<()> {
        // A send error just means nobody is listening right now; that is
        // not a failure of the gateway.
        let _ = self.tx.send(notification);
        Ok(())
    }
}
