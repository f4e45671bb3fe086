//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! The transport seam. OSDP framing, CRC and secure channel crypto live in
//! an external codec library (LibOSDP in production); the gateway consumes
//! it through the narrow [`OsdpCodec`] trait defined here, the same way
//! LibOSDP itself abstracts the physical medium behind its `Channel` trait.
//! Test builds plug an in-memory codec in; nothing in the core ever touches
//! a serial port or parses a frame.

use core::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::feedback::LedColor;
use crate::reader::{BaudRate, OsdpAddress, SecureKey};
use crate::GatewayError;

type Result<T> = core::result::Result<T, GatewayError>;

/// OSDP POLL command code, the CP-side half of the protocol heartbeat.
pub const CMD_POLL: u8 = 0x60;
/// OSDP ACK reply code, the PD-side half of the protocol heartbeat.
pub const REPLY_ACK: u8 = 0x40;

/// Opaque handle for one open bus connection (one serial port).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusId(pub u32);

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus-{}", self.0)
    }
}

/// Description of one peripheral device for codec registration.
#[derive(Clone, Debug)]
pub struct DeviceSpec {
    /// Reader name, for codec-side logging.
    pub name: String,
    /// OSDP address on the bus.
    pub address: OsdpAddress,
    /// CRC-16 instead of the weaker checksum byte. Always on for this
    /// gateway; SIA 2.2 wire compatibility requires it.
    pub use_crc: bool,
    /// Secure channel base key. `None` brings the device up in the clear.
    pub secure_channel_key: Option<SecureKey>,
}

/// LED colors a codec can actually drive. The domain [`LedColor`] space is
/// wider; anything the codec does not know collapses to red.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecLedColor {
    /// Red.
    Red,
    /// Green.
    Green,
    /// Blue.
    Blue,
    /// Amber.
    Amber,
}

impl From<LedColor> for CodecLedColor {
    fn from(color: LedColor) -> Self {
        match color {
            LedColor::Green => CodecLedColor::Green,
            LedColor::Blue => CodecLedColor::Blue,
            LedColor::Amber => CodecLedColor::Amber,
            // Off is expressed by a zero duration, never as a color.
            LedColor::Red | LedColor::Off => CodecLedColor::Red,
        }
    }
}

/// LED primitive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedCommand {
    /// Color to show.
    pub color: CodecLedColor,
    /// On-time in milliseconds; ignored when `permanent` is set.
    pub duration_ms: u32,
    /// Permanent (holds until replaced) instead of timed.
    pub permanent: bool,
}

/// Buzzer primitive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuzzerCommand {
    /// Number of beeps.
    pub count: u8,
    /// On-time per beep, milliseconds.
    pub on_time_ms: u16,
    /// Off-time between beeps, milliseconds.
    pub off_time_ms: u16,
}

/// Text display primitive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextCommand {
    /// Text to show, at most 16 characters.
    pub text: String,
    /// How long to show it, milliseconds; 0 holds until replaced.
    pub duration_ms: u32,
}

/// Commands the gateway issues to a peripheral device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodecCommand {
    /// Drive the reader LED.
    Led(LedCommand),
    /// Drive the reader buzzer.
    Buzzer(BuzzerCommand),
    /// Show text on the reader display.
    Text(TextCommand),
    /// Install a new secure channel key (osdp_KEYSET).
    KeySet(SecureKey),
}

/// Direction of a captured frame, seen from the control panel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketDirection {
    /// CP to PD.
    Outgoing,
    /// PD to CP.
    Incoming,
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PacketDirection::Outgoing => "Outgoing",
            PacketDirection::Incoming => "Incoming",
        })
    }
}

/// One captured frame, as reported by the codec. The codec already decoded
/// the frame, so the capture carries the command/reply code and sequence
/// alongside the raw bytes; the gateway never re-parses.
#[derive(Clone, Debug)]
pub struct RawPacket {
    /// Bus the frame was seen on.
    pub bus: BusId,
    /// Device address in the frame header.
    pub address: u8,
    /// Direction.
    pub direction: PacketDirection,
    /// Command code (outgoing) or reply code (incoming).
    pub code: u8,
    /// OSDP sequence number (0..=3).
    pub sequence: u8,
    /// Frame traveled inside a secure channel wrapper.
    pub secure: bool,
    /// Frame passed CRC and structural checks.
    pub valid: bool,
    /// Decode error, when `valid` is false.
    pub error: Option<String>,
    /// Raw frame bytes.
    pub payload: Vec<u8>,
    /// Capture timestamp.
    pub at: DateTime<Utc>,
}

/// Events the codec pushes up to the gateway, in wire order per bus.
#[derive(Clone, Debug)]
pub enum CodecEvent {
    /// Raw card data reply.
    CardData {
        /// Bus the reply arrived on.
        bus: BusId,
        /// Device address.
        address: u8,
        /// Wiegand payload, MSB of the first byte first.
        data: Vec<u8>,
        /// Number of valid bits in `data`.
        bit_count: usize,
        /// Format code from the reply, when the reader supplied one.
        format: Option<u8>,
    },
    /// Keypad reply carrying one digit.
    KeyPress {
        /// Bus the reply arrived on.
        bus: BusId,
        /// Device address.
        address: u8,
        /// ASCII digit (`0`..`9`, `*`, `#`).
        digit: u8,
    },
    /// A device started or stopped answering polls.
    StatusChange {
        /// Bus of the device.
        bus: BusId,
        /// Device address.
        address: u8,
        /// New online state.
        online: bool,
    },
    /// A frame was captured (packet tracing).
    Packet(RawPacket),
}

/// The capability set the gateway requires from an OSDP codec. One
/// implementation wraps LibOSDP's control panel; tests use an in-memory
/// codec that scripts events.
///
/// Poll cadence is the codec's own business; the gateway neither configures
/// nor observes it.
#[async_trait]
pub trait OsdpCodec: Send + Sync {
    /// Open a bus connection on a serial port. One connection per distinct
    /// port; opening an already-open port is an error.
    async fn open_bus(&self, port: &str, baud_rate: BaudRate) -> Result<BusId>;

    /// Close a bus and release the serial handle.
    async fn close_bus(&self, bus: BusId) -> Result<()>;

    /// Register a device on an open bus and start polling it.
    async fn register_device(&self, bus: BusId, spec: DeviceSpec) -> Result<()>;

    /// Stop polling a device and forget it.
    async fn unregister_device(&self, bus: BusId, address: OsdpAddress) -> Result<()>;

    /// Whether the device currently answers polls.
    async fn is_online(&self, bus: BusId, address: OsdpAddress) -> bool;

    /// Send a command to a device.
    async fn send(&self, bus: BusId, address: OsdpAddress, command: CodecCommand) -> Result<()>;

    /// Take the codec event stream. Events for a single bus are delivered
    /// in wire order. May be called once; the codec hands out its only
    /// receiver.
    fn events(&self) -> mpsc::UnboundedReceiver<CodecEvent>;
}

impl fmt::Debug for dyn OsdpCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsdpCodec").finish()
    }
}
