//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Domain events lifted off the wire. Device sessions translate decoded OSDP
//! replies into these types; the pipeline, PIN collector and notification
//! fan-out only ever see this layer, never raw frames.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::card;
use crate::reader::ReaderId;

/// A raw Wiegand card read reported by a reader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CardReadEvent {
    /// Originating reader.
    pub reader_id: ReaderId,
    /// When the reply was received.
    pub at: DateTime<Utc>,
    /// Number of bits in the Wiegand payload.
    pub bit_count: usize,
    /// The payload as a decimal number (big-endian, no parity stripping).
    pub card_number: String,
    /// The payload as a `0`/`1` string, for diagnostics and plugins that
    /// decode proprietary formats themselves.
    pub raw_bits: String,
    /// Free-form metadata plugins may attach or consume.
    pub extra: HashMap<String, String>,
}

impl CardReadEvent {
    /// Build an event from the wire representation: `bit_count` bits packed
    /// MSB-first into `data`.
    pub fn from_wire(reader_id: ReaderId, data: &[u8], bit_count: usize) -> Self {
        Self {
            reader_id,
            at: Utc::now(),
            bit_count,
            card_number: card::wiegand_to_decimal(data, bit_count),
            raw_bits: card::bits_string(data, bit_count),
            extra: HashMap::new(),
        }
    }
}

/// One keypad digit, as delivered by the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinDigitEvent {
    /// Originating reader.
    pub reader_id: ReaderId,
    /// When the digit arrived.
    pub at: DateTime<Utc>,
    /// The digit character (`0`..`9`, `*`, `#`).
    pub digit: char,
    /// Monotonically increasing per-reader sequence number.
    pub sequence: u64,
}

/// Why a PIN collection completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinCompletionReason {
    /// The terminator key was pressed with a non-empty buffer.
    Submitted,
    /// No digit arrived within the inter-digit window, or the collection
    /// exceeded its overall deadline.
    TimedOut,
    /// The buffer reached the configured maximum length.
    MaxLengthReached,
    /// The cancel key was pressed.
    Cancelled,
}

impl std::fmt::Display for PinCompletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PinCompletionReason::Submitted => "Submitted",
            PinCompletionReason::TimedOut => "TimedOut",
            PinCompletionReason::MaxLengthReached => "MaxLengthReached",
            PinCompletionReason::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// A completed PIN entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinReadEvent {
    /// Originating reader.
    pub reader_id: ReaderId,
    /// When the collection completed.
    pub at: DateTime<Utc>,
    /// The collected digits. May be empty for a cancelled collection.
    pub digits: String,
    /// Completion reason.
    pub reason: PinCompletionReason,
}

/// Online/offline (and informational) state change of a reader.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChangeEvent {
    /// Affected reader.
    pub reader_id: ReaderId,
    /// Reader name at the time of the change.
    pub reader_name: String,
    /// Whether the device is answering polls.
    pub online: bool,
    /// Optional human readable detail, e.g. a secure channel installation
    /// note or a transport failure.
    pub message: Option<String>,
}

/// Everything the bus layer reports upwards, in arrival order.
#[derive(Clone, Debug)]
pub enum GatewayEvent {
    /// A card was presented.
    CardRead(CardReadEvent),
    /// A keypad digit was pressed.
    PinDigit(PinDigitEvent),
    /// A reader changed state.
    StatusChanged(StatusChangeEvent),
    /// Packet tracing stopped itself (memory guard).
    TraceStopped {
        /// Why tracing stopped.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_event_from_wire_decodes_number_and_bits() {
        let reader = ReaderId::new();
        // 26 bits, value 0b10_1111000110000101001110 padded at the top.
        let ev = CardReadEvent::from_wire(reader, &[0xBC, 0x61, 0x4E, 0x80], 26);
        assert_eq!(ev.bit_count, 26);
        assert_eq!(ev.raw_bits.len(), 26);
        assert_eq!(ev.card_number, card::wiegand_to_decimal(&[0xBC, 0x61, 0x4E, 0x80], 26));
        assert!(ev.extra.is_empty());
    }
}
