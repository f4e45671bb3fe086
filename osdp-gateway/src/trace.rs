//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Packet trace capture. Every frame the codec sees can be recorded into a
//! bounded per-reader ring for diagnostics: filtering happens on retrieval
//! (so the statistics always reflect what was actually stored), memory use
//! is accounted and guarded, and the capture can be exported either as an
//! opaque `.osdpcap` blob or as a parsed text dump.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{PacketDirection, RawPacket, CMD_POLL, REPLY_ACK};
use crate::reader::ReaderId;
use crate::GatewayError;

type Result<T> = core::result::Result<T, GatewayError>;

/// Default per-reader ring capacity.
pub const DEFAULT_RING_CAPACITY: usize = 500;

/// How the store bounds its capture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitMode {
    /// Bound by packet counts only.
    #[default]
    Size,
    /// Bound by entry age only.
    Time,
    /// Bound by both.
    Hybrid,
}

/// Capture settings. Persisted per client session as an opaque JSON blob;
/// the store itself only ever sees the typed form. Fields missing from a
/// blob fall back to their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceSettings {
    /// Master switch.
    pub enabled: bool,
    /// Bounding strategy.
    pub limit_mode: LimitMode,
    /// Ring capacity per reader.
    pub max_packets_per_reader: usize,
    /// Total stored packets across readers.
    pub max_packets_total: usize,
    /// Maximum entry age for [`LimitMode::Time`] and [`LimitMode::Hybrid`].
    pub max_age_minutes: u32,
    /// Suppress POLL commands (0x60) on retrieval.
    pub filter_poll_commands: bool,
    /// Suppress ACK replies (0x40) on retrieval.
    pub filter_ack_commands: bool,
    /// Memory budget for the whole capture.
    pub memory_limit_mb: usize,
    /// Stop tracing globally when the memory budget is exceeded.
    pub auto_stop_on_memory_limit: bool,
    /// Keep raw frame bytes; when off only the decoded header survives.
    pub capture_raw_data: bool,
    /// Keep decoded detail (code names) in text exports.
    pub parse_details: bool,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            limit_mode: LimitMode::Size,
            max_packets_per_reader: DEFAULT_RING_CAPACITY,
            max_packets_total: 5000,
            max_age_minutes: 60,
            filter_poll_commands: false,
            filter_ack_commands: false,
            memory_limit_mb: 64,
            auto_stop_on_memory_limit: true,
            capture_raw_data: true,
            parse_details: true,
        }
    }
}

impl TraceSettings {
    /// Serialize to the opaque blob form.
    pub fn to_blob(&self) -> String {
        serde_json::to_string(self).expect("trace settings serialize")
    }

    /// Parse the opaque blob form.
    pub fn from_blob(blob: &str) -> Result<Self> {
        serde_json::from_str(blob)
            .map_err(|e| GatewayError::Config(format!("invalid trace settings: {e}")))
    }
}

/// One captured frame, annotated with reader identity and spacing.
#[derive(Clone, Debug)]
pub struct PacketTraceEntry {
    /// Monotonic capture id.
    pub id: u64,
    /// Capture timestamp.
    pub at: DateTime<Utc>,
    /// Milliseconds since the previous entry of the same reader.
    pub interval_ms: u64,
    /// Direction.
    pub direction: PacketDirection,
    /// Owning reader.
    pub reader_id: ReaderId,
    /// Reader name at capture time.
    pub reader_name: String,
    /// OSDP address.
    pub address: u8,
    /// Raw frame bytes (empty when raw capture is off).
    pub payload: Vec<u8>,
    /// Command or reply code.
    pub code: u8,
    /// OSDP sequence number.
    pub sequence: u8,
    /// Frame used the secure channel.
    pub secure: bool,
    /// Frame decoded cleanly.
    pub valid: bool,
    /// Decode error, if any.
    pub error: Option<String>,
    /// Secure channel session the frame belonged to, when known.
    pub session_id: Option<Uuid>,
}

impl PacketTraceEntry {
    fn estimated_size(&self) -> usize {
        // Struct overhead plus the owned buffers; close enough for the
        // memory guard.
        160 + self.payload.len() + self.reader_name.len()
            + self.error.as_ref().map_or(0, String::len)
    }

    /// Whether the current filter settings suppress this entry.
    pub fn filtered_by(&self, settings: &TraceSettings) -> bool {
        (settings.filter_poll_commands
            && self.direction == PacketDirection::Outgoing
            && self.code == CMD_POLL)
            || (settings.filter_ack_commands
                && self.direction == PacketDirection::Incoming
                && self.code == REPLY_ACK)
    }

    /// Short decoded name of the frame, e.g. `POLL` or `RAW`.
    pub fn describe(&self) -> &'static str {
        match self.direction {
            PacketDirection::Outgoing => match self.code {
                0x60 => "POLL",
                0x61 => "ID",
                0x62 => "CAP",
                0x64 => "LSTAT",
                0x69 => "LED",
                0x6A => "BUZ",
                0x6B => "TEXT",
                0x75 => "KEYSET",
                0x76 => "CHLNG",
                0x77 => "SCRYPT",
                _ => "CMD",
            },
            PacketDirection::Incoming => match self.code {
                0x40 => "ACK",
                0x41 => "NAK",
                0x45 => "PDID",
                0x46 => "PDCAP",
                0x48 => "LSTATR",
                0x50 => "RAW",
                0x53 => "KEYPAD",
                0x76 => "CCRYPT",
                0x78 => "RMAC_I",
                _ => "REPLY",
            },
        }
    }
}

/// Statistics snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceStatistics {
    /// Packets currently stored.
    pub total_packets: usize,
    /// Stored packets the current filter settings would suppress.
    pub filtered_packets: usize,
    /// Stored packets per reader.
    pub per_reader: HashMap<ReaderId, usize>,
    /// Estimated memory in use by the capture, bytes.
    pub memory_bytes: usize,
    /// When tracing started, if it is (or was) running.
    pub started_at: Option<DateTime<Utc>>,
    /// Seconds tracing has been running.
    pub duration_secs: u64,
    /// Outgoing packets with a paired reply, as a share of all outgoing.
    pub reply_percentage: f64,
}

/// What [`PacketTraceStore::ingest`] did with a packet.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Entry stored.
    Stored,
    /// Tracing is off; packet dropped.
    Disabled,
    /// Storing this packet tripped the memory guard; tracing stopped.
    AutoStopped(String),
}

#[derive(Default)]
struct Ring {
    entries: VecDeque<PacketTraceEntry>,
    bytes: usize,
}

impl Ring {
    fn push(&mut self, entry: PacketTraceEntry, capacity: usize) -> usize {
        let mut freed = 0;
        self.bytes += entry.estimated_size();
        self.entries.push_back(entry);
        while self.entries.len() > capacity {
            if let Some(old) = self.entries.pop_front() {
                let size = old.estimated_size();
                self.bytes -= size;
                freed += size;
            }
        }
        freed
    }

    fn prune_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut freed = 0;
        while let Some(front) = self.entries.front() {
            if front.at >= cutoff {
                break;
            }
            let old = self.entries.pop_front().unwrap();
            let size = old.estimated_size();
            self.bytes -= size;
            freed += size;
        }
        freed
    }
}

/// Bounded in-memory packet capture: one ring per reader, multi-reader /
/// single-writer discipline per ring, thread-safe throughout (it may be
/// queried during shutdown).
pub struct PacketTraceStore {
    settings: RwLock<TraceSettings>,
    rings: RwLock<HashMap<ReaderId, Arc<RwLock<Ring>>>>,
    next_id: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
    stop_reason: Mutex<Option<String>>,
}

impl PacketTraceStore {
    /// Create a store with the given settings.
    pub fn new(settings: TraceSettings) -> Self {
        let started_at = settings.enabled.then(Utc::now);
        Self {
            settings: RwLock::new(settings),
            rings: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            started_at: Mutex::new(started_at),
            stop_reason: Mutex::new(None),
        }
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> TraceSettings {
        self.settings.read().clone()
    }

    /// Replace the settings. Turning tracing on resets the start time and
    /// clears a previous auto-stop reason.
    pub fn update_settings(&self, settings: TraceSettings) {
        let was_enabled = {
            let mut guard = self.settings.write();
            let was = guard.enabled;
            *guard = settings;
            was
        };
        let now_enabled = self.settings.read().enabled;
        if now_enabled && !was_enabled {
            *self.started_at.lock() = Some(Utc::now());
            *self.stop_reason.lock() = None;
        }
    }

    /// Start tracing.
    pub fn enable(&self) {
        let mut settings = self.settings();
        settings.enabled = true;
        self.update_settings(settings);
    }

    /// Stop tracing. Stored entries stay queryable.
    pub fn disable(&self) {
        let mut settings = self.settings();
        settings.enabled = false;
        self.update_settings(settings);
    }

    /// Why tracing auto-stopped, if it did.
    pub fn stop_reason(&self) -> Option<String> {
        self.stop_reason.lock().clone()
    }

    /// Record one captured frame for a reader.
    pub fn ingest(
        &self,
        reader_id: ReaderId,
        reader_name: &str,
        packet: &RawPacket,
        session_id: Option<Uuid>,
    ) -> IngestOutcome {
        let settings = self.settings();
        if !settings.enabled {
            return IngestOutcome::Disabled;
        }

        let ring = {
            let rings = self.rings.read();
            rings.get(&reader_id).cloned()
        };
        let ring = match ring {
            Some(ring) => ring,
            None => self
                .rings
                .write()
                .entry(reader_id)
                .or_insert_with(|| Arc::new(RwLock::new(Ring::default())))
                .clone(),
        };

        let entry = {
            let guard = ring.read();
            let interval_ms = guard
                .entries
                .back()
                .map(|prev| {
                    (packet.at - prev.at).num_milliseconds().max(0) as u64
                })
                .unwrap_or(0);
            PacketTraceEntry {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                at: packet.at,
                interval_ms,
                direction: packet.direction,
                reader_id,
                reader_name: reader_name.to_owned(),
                address: packet.address,
                payload: if settings.capture_raw_data {
                    packet.payload.clone()
                } else {
                    Vec::new()
                },
                code: packet.code,
                sequence: packet.sequence,
                secure: packet.secure,
                valid: packet.valid,
                error: packet.error.clone(),
                session_id,
            }
        };

        {
            let mut guard = ring.write();
            guard.push(entry, settings.max_packets_per_reader);
            if matches!(settings.limit_mode, LimitMode::Time | LimitMode::Hybrid) {
                let cutoff = Utc::now() - chrono::Duration::minutes(settings.max_age_minutes as i64);
                guard.prune_older_than(cutoff);
            }
        }

        self.enforce_total_limit(&settings);

        let memory = self.memory_bytes();
        if memory > settings.memory_limit_mb * 1024 * 1024 && settings.auto_stop_on_memory_limit {
            let message = format!(
                "packet tracing stopped: memory use {} bytes exceeds limit of {} MB",
                memory, settings.memory_limit_mb
            );
            log::warn!("{message}");
            self.disable();
            *self.stop_reason.lock() = Some(message.clone());
            return IngestOutcome::AutoStopped(message);
        }
        IngestOutcome::Stored
    }

    // Evict oldest entries across rings until the global count fits. Rings
    // are few (one per reader), so scanning fronts is cheap.
    fn enforce_total_limit(&self, settings: &TraceSettings) {
        if !matches!(settings.limit_mode, LimitMode::Size | LimitMode::Hybrid) {
            return;
        }
        loop {
            let rings = self.rings.read();
            let total: usize = rings.values().map(|r| r.read().entries.len()).sum();
            if total <= settings.max_packets_total {
                return;
            }
            let oldest = rings
                .values()
                .filter_map(|r| r.read().entries.front().map(|e| (e.at, Arc::clone(r))))
                .min_by_key(|(at, _)| *at);
            drop(rings);
            match oldest {
                Some((_, ring)) => {
                    let mut guard = ring.write();
                    if let Some(old) = guard.entries.pop_front() {
                        guard.bytes -= old.estimated_size();
                    }
                }
                None => return,
            }
        }
    }

    /// Entries of one reader, newest first. `apply_filters` suppresses POLL
    /// and ACK packets per the current settings.
    pub fn entries_for_reader(
        &self,
        reader_id: ReaderId,
        apply_filters: bool,
    ) -> Vec<PacketTraceEntry> {
        let settings = self.settings();
        let ring = self.rings.read().get(&reader_id).cloned();
        let mut entries: Vec<_> = match ring {
            Some(ring) => ring.read().entries.iter().cloned().collect(),
            None => Vec::new(),
        };
        if apply_filters {
            entries.retain(|e| !e.filtered_by(&settings));
        }
        entries.reverse();
        entries
    }

    /// Entries across all readers ordered by descending timestamp.
    pub fn entries(&self, apply_filters: bool) -> Vec<PacketTraceEntry> {
        let settings = self.settings();
        let rings = self.rings.read();
        let mut entries: Vec<_> = rings
            .values()
            .flat_map(|r| r.read().entries.iter().cloned().collect::<Vec<_>>())
            .collect();
        drop(rings);
        if apply_filters {
            entries.retain(|e| !e.filtered_by(&settings));
        }
        entries.sort_by(|a, b| b.at.cmp(&a.at).then(b.id.cmp(&a.id)));
        entries
    }

    /// Estimated memory in use by all rings.
    pub fn memory_bytes(&self) -> usize {
        self.rings
            .read()
            .values()
            .map(|r| r.read().bytes)
            .sum()
    }

    /// Statistics snapshot under the current settings.
    pub fn statistics(&self) -> TraceStatistics {
        let settings = self.settings();
        let rings = self.rings.read();

        let mut total = 0usize;
        let mut filtered = 0usize;
        let mut per_reader = HashMap::new();
        let mut outgoing = 0usize;
        let mut replied = 0usize;

        for (reader, ring) in rings.iter() {
            let guard = ring.read();
            total += guard.entries.len();
            per_reader.insert(*reader, guard.entries.len());
            filtered += guard
                .entries
                .iter()
                .filter(|e| e.filtered_by(&settings))
                .count();

            // Pair each outgoing packet with the next incoming one carrying
            // the same sequence number.
            let entries: Vec<_> = guard.entries.iter().collect();
            for (i, e) in entries.iter().enumerate() {
                if e.direction != PacketDirection::Outgoing {
                    continue;
                }
                outgoing += 1;
                if entries[i + 1..]
                    .iter()
                    .any(|r| r.direction == PacketDirection::Incoming && r.sequence == e.sequence)
                {
                    replied += 1;
                }
            }
        }
        drop(rings);

        let started_at = *self.started_at.lock();
        TraceStatistics {
            total_packets: total,
            filtered_packets: filtered,
            per_reader,
            memory_bytes: self.memory_bytes(),
            started_at,
            duration_secs: started_at
                .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
                .unwrap_or(0),
            reply_percentage: if outgoing == 0 {
                0.0
            } else {
                replied as f64 * 100.0 / outgoing as f64
            },
        }
    }

    /// Drop everything captured so far.
    pub fn clear(&self) {
        self.rings.write().clear();
    }

    /// Drop one reader's capture.
    pub fn clear_reader(&self, reader_id: ReaderId) {
        self.rings.write().remove(&reader_id);
    }
}

impl std::fmt::Debug for PacketTraceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketTraceStore")
            .field("enabled", &self.settings.read().enabled)
            .field("readers", &self.rings.read().len())
            .finish()
    }
}

/// An exported capture: bytes plus the content type metadata a transport
/// needs to serve it.
#[derive(Clone, Debug)]
pub struct ExportBlob {
    /// File contents.
    pub data: Vec<u8>,
    /// MIME type.
    pub mime: &'static str,
    /// File extension including the dot.
    pub extension: &'static str,
}

/// OSDPCAP file magic.
const OSDPCAP_MAGIC: &[u8; 8] = b"OSDPCAP1";

/// Export entries as an opaque OSDPCAP blob: magic, record count, then one
/// length-prefixed record per entry.
pub fn export_osdpcap<'a, I>(packets: I) -> ExportBlob
where
    I: IntoIterator<Item = &'a PacketTraceEntry>,
{
    let mut data = Vec::new();
    data.extend_from_slice(OSDPCAP_MAGIC);
    let count_pos = data.len();
    data.extend_from_slice(&0u32.to_be_bytes());
    let mut count = 0u32;
    for entry in packets {
        data.extend_from_slice(&entry.at.timestamp_micros().to_be_bytes());
        data.push(match entry.direction {
            PacketDirection::Outgoing => 0,
            PacketDirection::Incoming => 1,
        });
        data.push(entry.address);
        data.push(entry.code);
        data.push(entry.sequence);
        data.push(u8::from(entry.secure) | (u8::from(entry.valid) << 1));
        data.extend_from_slice(&(entry.payload.len() as u32).to_be_bytes());
        data.extend_from_slice(&entry.payload);
        count += 1;
    }
    data[count_pos..count_pos + 4].copy_from_slice(&count.to_be_bytes());
    ExportBlob {
        data,
        mime: "application/octet-stream",
        extension: ".osdpcap",
    }
}

/// Export entries as a human readable dump, one line per packet.
pub fn export_text<'a, I>(packets: I, parse_details: bool) -> ExportBlob
where
    I: IntoIterator<Item = &'a PacketTraceEntry>,
{
    use std::fmt::Write;
    let mut out = String::new();
    for entry in packets {
        let detail = if parse_details {
            entry.describe()
        } else {
            "-"
        };
        let _ = write!(
            out,
            "{} {:>8} {:9} addr={:<3} seq={} code=0x{:02X} {:7}",
            entry.at.format("%Y-%m-%d %H:%M:%S%.3f"),
            format!("+{}ms", entry.interval_ms),
            entry.direction.to_string(),
            entry.address,
            entry.sequence,
            entry.code,
            detail,
        );
        if entry.secure {
            out.push_str(" secure");
        }
        if !entry.valid {
            let _ = write!(
                out,
                " INVALID({})",
                entry.error.as_deref().unwrap_or("unknown")
            );
        }
        if !entry.payload.is_empty() {
            out.push(' ');
            for b in &entry.payload {
                let _ = write!(out, "{b:02x}");
            }
        }
        out.push('\n');
    }
    ExportBlob {
        data: out.into_bytes(),
        mime: "text/plain",
        extension: ".txt",
    }
}
