//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! PIN collection. Keypad replies arrive one digit at a time; this module
//! assembles them into completed PINs per reader, with terminator, cancel,
//! length and timeout rules. Nothing is retained past completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::events::{PinCompletionReason, PinDigitEvent, PinReadEvent};
use crate::reader::ReaderId;

/// Completion rules for PIN collection.
#[derive(Clone, Debug)]
pub struct PinPolicy {
    /// Key that submits the buffer.
    pub terminator: char,
    /// Key that abandons the buffer.
    pub cancel: char,
    /// Length at which the buffer completes on its own.
    pub max_length: usize,
    /// Silence after the last digit that completes the buffer.
    pub inter_digit_timeout: Duration,
    /// Deadline for the whole collection, from the first digit.
    pub overall_timeout: Duration,
}

impl Default for PinPolicy {
    fn default() -> Self {
        Self {
            terminator: '#',
            cancel: '*',
            max_length: 8,
            inter_digit_timeout: Duration::from_secs(10),
            overall_timeout: Duration::from_secs(30),
        }
    }
}

/// How often the timeout sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct Collection {
    digits: String,
    started_at: Instant,
    last_digit_at: Instant,
}

/// Per-reader digit assembly.
pub struct PinCollector {
    policy: PinPolicy,
    active: Mutex<HashMap<ReaderId, Collection>>,
}

impl PinCollector {
    /// Create a collector with the given policy.
    pub fn new(policy: PinPolicy) -> Self {
        Self {
            policy,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn complete(reader_id: ReaderId, digits: String, reason: PinCompletionReason) -> PinReadEvent {
        PinReadEvent {
            reader_id,
            at: Utc::now(),
            digits,
            reason,
        }
    }

    /// Feed one digit. Returns the completed PIN when this digit finishes a
    /// collection.
    pub fn push(&self, event: &PinDigitEvent) -> Option<PinReadEvent> {
        let mut active = self.active.lock();
        let reader = event.reader_id;

        if event.digit == self.policy.cancel {
            let digits = active.remove(&reader).map(|c| c.digits).unwrap_or_default();
            return Some(Self::complete(reader, digits, PinCompletionReason::Cancelled));
        }

        if event.digit == self.policy.terminator {
            // A terminator with nothing collected is noise.
            let collection = active.remove(&reader)?;
            return Some(Self::complete(
                reader,
                collection.digits,
                PinCompletionReason::Submitted,
            ));
        }

        let now = Instant::now();
        let collection = active.entry(reader).or_insert_with(|| Collection {
            digits: String::new(),
            started_at: now,
            last_digit_at: now,
        });
        collection.digits.push(event.digit);
        collection.last_digit_at = now;

        if collection.digits.len() >= self.policy.max_length {
            let collection = active.remove(&reader).unwrap();
            return Some(Self::complete(
                reader,
                collection.digits,
                PinCompletionReason::MaxLengthReached,
            ));
        }
        None
    }

    /// Complete every collection that has timed out as of `now`.
    pub fn expire_at(&self, now: Instant) -> Vec<PinReadEvent> {
        let mut active = self.active.lock();
        let policy = &self.policy;
        let expired: Vec<ReaderId> = active
            .iter()
            .filter(|(_, c)| {
                now.duration_since(c.last_digit_at) >= policy.inter_digit_timeout
                    || now.duration_since(c.started_at) >= policy.overall_timeout
            })
            .map(|(reader, _)| *reader)
            .collect();
        expired
            .into_iter()
            .map(|reader| {
                let collection = active.remove(&reader).unwrap();
                Self::complete(reader, collection.digits, PinCompletionReason::TimedOut)
            })
            .collect()
    }

    /// Administrative: drop one reader's buffer without emitting anything.
    pub fn clear(&self, reader: ReaderId) -> bool {
        self.active.lock().remove(&reader).is_some()
    }

    /// Administrative: the digits collected so far for a reader.
    pub fn current(&self, reader: ReaderId) -> Option<String> {
        self.active.lock().get(&reader).map(|c| c.digits.clone())
    }

    /// Drop every buffer. Used on shutdown; buffered digits are discarded,
    /// never flushed as events.
    pub fn clear_all(&self) {
        self.active.lock().clear();
    }

    /// Drive the timeout sweep until cancelled. Completions go out on
    /// `completed`; cancellation discards all buffers.
    pub async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        completed: mpsc::UnboundedSender<PinReadEvent>,
    ) {
        let mut tick = interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.clear_all();
                    return;
                }
                _ = tick.tick() => {
                    for event in self.expire_at(Instant::now()) {
                        log::debug!(
                            "reader {}: PIN collection timed out after {} digit(s)",
                            event.reader_id,
                            event.digits.len()
                        );
                        if completed.send(event).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for PinCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinCollector")
            .field("active", &self.active.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digit(reader: ReaderId, digit: char, sequence: u64) -> PinDigitEvent {
        PinDigitEvent {
            reader_id: reader,
            at: Utc::now(),
            digit,
            sequence,
        }
    }

    fn feed(collector: &PinCollector, reader: ReaderId, digits: &str) -> Option<PinReadEvent> {
        let mut last = None;
        for (i, d) in digits.chars().enumerate() {
            last = collector.push(&digit(reader, d, i as u64));
        }
        last
    }

    #[test]
    fn submit_on_terminator() {
        let collector = PinCollector::new(PinPolicy::default());
        let reader = ReaderId::new();
        let done = feed(&collector, reader, "1234#").unwrap();
        assert_eq!(done.digits, "1234");
        assert_eq!(done.reason, PinCompletionReason::Submitted);
        assert!(collector.current(reader).is_none());
    }

    #[test]
    fn terminator_with_empty_buffer_is_ignored() {
        let collector = PinCollector::new(PinPolicy::default());
        let reader = ReaderId::new();
        assert!(collector.push(&digit(reader, '#', 0)).is_none());
    }

    #[test]
    fn cancel_clears_buffer() {
        let collector = PinCollector::new(PinPolicy::default());
        let reader = ReaderId::new();
        let done = feed(&collector, reader, "12*").unwrap();
        assert_eq!(done.reason, PinCompletionReason::Cancelled);
        assert_eq!(done.digits, "12");
        assert!(collector.current(reader).is_none());
    }

    #[test]
    fn max_length_completes() {
        let collector = PinCollector::new(PinPolicy::default());
        let reader = ReaderId::new();
        let done = feed(&collector, reader, "12345678").unwrap();
        assert_eq!(done.reason, PinCompletionReason::MaxLengthReached);
        assert_eq!(done.digits, "12345678");
    }

    #[test]
    fn readers_do_not_share_buffers() {
        let collector = PinCollector::new(PinPolicy::default());
        let r1 = ReaderId::new();
        let r2 = ReaderId::new();
        feed(&collector, r1, "11");
        feed(&collector, r2, "22");
        assert_eq!(collector.current(r1).as_deref(), Some("11"));
        assert_eq!(collector.current(r2).as_deref(), Some("22"));
    }

    #[tokio::test(start_paused = true)]
    async fn inter_digit_timeout_completes() {
        let collector = PinCollector::new(PinPolicy::default());
        let reader = ReaderId::new();
        feed(&collector, reader, "99");
        tokio::time::advance(Duration::from_secs(11)).await;
        let expired = collector.expire_at(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].digits, "99");
        assert_eq!(expired[0].reason, PinCompletionReason::TimedOut);
        assert!(collector.current(reader).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_bounds_slow_typing() {
        let policy = PinPolicy {
            max_length: 64,
            ..PinPolicy::default()
        };
        let collector = PinCollector::new(policy);
        let reader = ReaderId::new();
        // Keep typing just inside the inter-digit window.
        for i in 0..4u64 {
            collector.push(&digit(reader, '5', i));
            tokio::time::advance(Duration::from_secs(9)).await;
        }
        // 36s since start: overall deadline passed even though the last
        // digit is recent.
        let expired = collector.expire_at(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].reason, PinCompletionReason::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn no_timeout_before_window() {
        let collector = PinCollector::new(PinPolicy::default());
        let reader = ReaderId::new();
        feed(&collector, reader, "42");
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(collector.expire_at(Instant::now()).is_empty());
        assert_eq!(collector.current(reader).as_deref(), Some("42"));
    }

    #[test]
    fn clear_discards_without_event() {
        let collector = PinCollector::new(PinPolicy::default());
        let reader = ReaderId::new();
        feed(&collector, reader, "777");
        assert!(collector.clear(reader));
        assert!(!collector.clear(reader));
        assert!(collector.current(reader).is_none());
    }
}
