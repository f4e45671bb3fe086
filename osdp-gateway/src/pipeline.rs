//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! The event pipeline: plugin chain, feedback selection, persistence,
//! feedback delivery and notification fan-out, in that order, with one
//! failure policy per step. Card and PIN events run through the same
//! generic machinery; [`PipelineRouter`] serializes events per reader while
//! letting distinct readers proceed concurrently.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{CardReadEvent, PinReadEvent};
use crate::feedback::{FeedbackConfigService, ReaderFeedback};
use crate::notify::{Notification, Notifier};
use crate::plugin::{Plugin, PluginHost, PluginVerdict};
use crate::reader::ReaderId;
use crate::store::{GatewayStore, StoredOutcome};
use crate::GatewayError;

type Result<T> = core::result::Result<T, GatewayError>;

/// Result of one plugin in the chain, in chain order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginOutcome {
    /// Plugin id from the mapping.
    pub plugin_id: String,
    /// Plugin name at execution time.
    pub plugin_name: String,
    /// Whether the plugin approved the event.
    pub success: bool,
    /// Denial or error text.
    pub error: Option<String>,
}

/// Aggregate result of one pipeline run.
#[derive(Clone, Debug)]
pub struct PipelineOutcome {
    /// True iff at least one plugin ran and all of them approved.
    pub success: bool,
    /// Human readable summary.
    pub message: String,
    /// Per-plugin results in chain order.
    pub plugin_results: Vec<PluginOutcome>,
    /// The feedback that was resolved for this outcome.
    pub feedback: ReaderFeedback,
    /// Whether the event record was written.
    pub persisted: bool,
    /// Whether feedback delivery succeeded.
    pub feedback_sent: bool,
}

/// Encode per-plugin results for storage: `name:Status` or
/// `name:Status:error` triples joined by `|`.
pub fn encode_plugin_results(results: &[PluginOutcome]) -> String {
    results
        .iter()
        .map(|r| {
            let status = if r.success { "Success" } else { "Failed" };
            match &r.error {
                Some(error) => format!("{}:{}:{}", r.plugin_name, status, error),
                None => format!("{}:{}", r.plugin_name, status),
            }
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// Decode the stored form. Tolerates missing error text and error text
/// containing `:`. The storage format only carries names, so the decoded
/// `plugin_id` equals the name.
pub fn decode_plugin_results(encoded: &str) -> Vec<PluginOutcome> {
    if encoded.is_empty() {
        return Vec::new();
    }
    encoded
        .split('|')
        .map(|part| {
            let mut fields = part.splitn(3, ':');
            let name = fields.next().unwrap_or_default().to_owned();
            let status = fields.next().unwrap_or_default();
            let error = fields.next().map(str::to_owned);
            PluginOutcome {
                plugin_id: name.clone(),
                plugin_name: name,
                success: status == "Success",
                error,
            }
        })
        .collect()
}

/// Counters behind the statistics notification.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    card_events: AtomicU64,
    pin_events: AtomicU64,
    failed_events: AtomicU64,
}

impl PipelineCounters {
    /// (card, pin, failed) snapshot.
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.card_events.load(Ordering::Relaxed),
            self.pin_events.load(Ordering::Relaxed),
            self.failed_events.load(Ordering::Relaxed),
        )
    }
}

/// Where resolved feedback is delivered. Implemented by the bus manager;
/// tests substitute a recorder.
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    /// Deliver feedback to a reader.
    async fn send_feedback(&self, reader: ReaderId, feedback: &ReaderFeedback) -> Result<()>;
}

/// One event kind's bindings into the generic pipeline.
#[async_trait]
pub trait PipelineEvent: Clone + Send + Sync + 'static {
    /// Tag for log lines ("card", "pin").
    const KIND: &'static str;

    /// Originating reader.
    fn reader_id(&self) -> ReaderId;

    /// Invoke the matching plugin operation.
    async fn invoke(&self, plugin: &dyn Plugin) -> PluginVerdict;

    /// Append the event record.
    async fn persist(&self, store: &dyn GatewayStore, outcome: &StoredOutcome) -> Result<()>;

    /// Build the fan-out notification.
    fn notification(&self, outcome: &StoredOutcome) -> Notification;

    /// Bump the right counter.
    fn count(counters: &PipelineCounters);
}

#[async_trait]
impl PipelineEvent for CardReadEvent {
    const KIND: &'static str = "card";

    fn reader_id(&self) -> ReaderId {
        self.reader_id
    }

    async fn invoke(&self, plugin: &dyn Plugin) -> PluginVerdict {
        plugin.process_card_read(self).await
    }

    async fn persist(&self, store: &dyn GatewayStore, outcome: &StoredOutcome) -> Result<()> {
        store.append_card_event(self, outcome).await
    }

    fn notification(&self, outcome: &StoredOutcome) -> Notification {
        Notification::CardEvent {
            event: self.clone(),
            outcome: outcome.clone(),
        }
    }

    fn count(counters: &PipelineCounters) {
        counters.card_events.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl PipelineEvent for PinReadEvent {
    const KIND: &'static str = "pin";

    fn reader_id(&self) -> ReaderId {
        self.reader_id
    }

    async fn invoke(&self, plugin: &dyn Plugin) -> PluginVerdict {
        plugin.process_pin_read(self).await
    }

    async fn persist(&self, store: &dyn GatewayStore, outcome: &StoredOutcome) -> Result<()> {
        store.append_pin_event(self, outcome).await
    }

    fn notification(&self, outcome: &StoredOutcome) -> Notification {
        Notification::PinEvent {
            event: self.clone(),
            outcome: outcome.clone(),
        }
    }

    fn count(counters: &PipelineCounters) {
        counters.pin_events.fetch_add(1, Ordering::Relaxed);
    }
}

/// The generic pipeline for one event kind.
pub struct EventPipeline<E: PipelineEvent> {
    plugins: Arc<PluginHost>,
    feedback: Arc<FeedbackConfigService>,
    store: Arc<dyn GatewayStore>,
    sink: Arc<dyn FeedbackSink>,
    notifier: Arc<dyn Notifier>,
    counters: Arc<PipelineCounters>,
    _kind: PhantomData<fn(E)>,
}

impl<E: PipelineEvent> EventPipeline<E> {
    /// Wire a pipeline.
    pub fn new(
        plugins: Arc<PluginHost>,
        feedback: Arc<FeedbackConfigService>,
        store: Arc<dyn GatewayStore>,
        sink: Arc<dyn FeedbackSink>,
        notifier: Arc<dyn Notifier>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            plugins,
            feedback,
            store,
            sink,
            notifier,
            counters,
            _kind: PhantomData,
        }
    }

    // Run the plugin in its own task so a panic is contained as a per-plugin
    // error instead of tearing the pipeline down.
    async fn invoke_contained(&self, event: &E, plugin: Arc<dyn Plugin>) -> PluginVerdict {
        let event = event.clone();
        let handle = tokio::spawn(async move { event.invoke(plugin.as_ref()).await });
        match handle.await {
            Ok(verdict) => verdict,
            Err(join) if join.is_panic() => {
                let panic = join.into_panic();
                let text = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                PluginVerdict::Error(text)
            }
            Err(_) => PluginVerdict::Error("plugin task cancelled".to_owned()),
        }
    }

    /// Process one event through all five steps. Never fails: every outcome
    /// (including "nothing configured") is persisted, fed back and
    /// broadcast as far as the collaborators allow.
    pub async fn process(&self, event: E) -> PipelineOutcome {
        let reader = event.reader_id();

        // Step 1: plugin chain, in mapping order. A failing plugin does not
        // stop the chain; it does fail the aggregate.
        let chain = match self.plugins.plugins_for_reader(reader).await {
            Ok(chain) => chain,
            Err(e) => {
                log::error!("reader {reader}: cannot resolve plugin chain: {e}");
                Vec::new()
            }
        };
        let mut plugin_results = Vec::with_capacity(chain.len());
        for (mapping, plugin) in &chain {
            let verdict = self.invoke_contained(&event, Arc::clone(plugin)).await;
            if let Some(msg) = verdict.message() {
                log::debug!(
                    "reader {reader}: plugin {} rejected {} event: {msg}",
                    mapping.plugin_id,
                    E::KIND
                );
            }
            plugin_results.push(PluginOutcome {
                plugin_id: mapping.plugin_id.clone(),
                plugin_name: plugin.name().to_owned(),
                success: verdict.is_allow(),
                error: verdict.message().map(str::to_owned),
            });
        }
        let success = !plugin_results.is_empty() && plugin_results.iter().all(|r| r.success);
        let message = if plugin_results.is_empty() {
            "no plugins configured for reader".to_owned()
        } else if success {
            format!(
                "{} event approved by {} plugin(s)",
                E::KIND,
                plugin_results.len()
            )
        } else {
            plugin_results
                .iter()
                .find_map(|r| if r.success { None } else { r.error.clone() })
                .unwrap_or_else(|| "access denied".to_owned())
        };

        // Step 2: feedback selection, falling back to built-ins when the
        // feedback store cannot be read.
        let feedback = match self.feedback.get().await {
            Ok(config) => {
                if success {
                    config.success
                } else {
                    config.failure
                }
            }
            Err(e) => {
                log::warn!("feedback configuration unavailable, using built-in default: {e}");
                if success {
                    ReaderFeedback::fallback_success()
                } else {
                    ReaderFeedback::fallback_failure()
                }
            }
        };

        // Step 3: persistence. Failure is recorded, never propagated.
        let stored = StoredOutcome {
            success,
            message: message.clone(),
            plugin_results: encode_plugin_results(&plugin_results),
        };
        let persisted = match event.persist(self.store.as_ref(), &stored).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("reader {reader}: failed to persist {} event: {e}", E::KIND);
                false
            }
        };

        // Step 4: feedback delivery. Same policy as persistence.
        let feedback_sent = match self.sink.send_feedback(reader, &feedback).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("reader {reader}: failed to deliver feedback: {e}");
                false
            }
        };

        // Step 5: notification fan-out, fire-and-forget.
        if let Err(e) = self.notifier.broadcast(event.notification(&stored)) {
            log::warn!("notification broadcast failed: {e}");
        }

        E::count(&self.counters);
        if !success {
            self.counters.failed_events.fetch_add(1, Ordering::Relaxed);
        }

        PipelineOutcome {
            success,
            message,
            plugin_results,
            feedback,
            persisted,
            feedback_sent,
        }
    }
}

impl<E: PipelineEvent> std::fmt::Debug for EventPipeline<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPipeline").field("kind", &E::KIND).finish()
    }
}

/// A unit of pipeline work.
#[derive(Clone, Debug)]
pub enum PipelineJob {
    /// Process a card read.
    Card(CardReadEvent),
    /// Process a completed PIN.
    Pin(PinReadEvent),
}

impl PipelineJob {
    fn reader_id(&self) -> ReaderId {
        match self {
            PipelineJob::Card(ev) => ev.reader_id,
            PipelineJob::Pin(ev) => ev.reader_id,
        }
    }
}

struct Worker {
    tx: mpsc::Sender<PipelineJob>,
    handle: JoinHandle<()>,
}

/// Routes jobs to one worker task per reader: FIFO within a reader,
/// concurrent across readers.
pub struct PipelineRouter {
    card: Arc<EventPipeline<CardReadEvent>>,
    pin: Arc<EventPipeline<PinReadEvent>>,
    workers: Mutex<HashMap<ReaderId, Worker>>,
    cancel: CancellationToken,
}

/// Queue depth per reader before dispatch applies backpressure.
const WORKER_QUEUE_DEPTH: usize = 64;

impl PipelineRouter {
    /// Create a router over the two pipelines.
    pub fn new(
        card: Arc<EventPipeline<CardReadEvent>>,
        pin: Arc<EventPipeline<PinReadEvent>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            card,
            pin,
            workers: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    fn spawn_worker(&self, reader: ReaderId) -> Worker {
        let (tx, mut rx) = mpsc::channel::<PipelineJob>(WORKER_QUEUE_DEPTH);
        let card = Arc::clone(&self.card);
        let pin = Arc::clone(&self.pin);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(PipelineJob::Card(event)) => {
                            card.process(event).await;
                        }
                        Some(PipelineJob::Pin(event)) => {
                            pin.process(event).await;
                        }
                        None => break,
                    },
                }
            }
            log::debug!("pipeline worker for reader {reader} stopped");
        });
        Worker { tx, handle }
    }

    /// Enqueue a job on its reader's worker, creating the worker on first
    /// use. Applies backpressure when a reader's queue is full, which keeps
    /// arrival order intact.
    pub async fn dispatch(&self, job: PipelineJob) {
        let reader = job.reader_id();
        if self.cancel.is_cancelled() {
            log::debug!("router stopped, dropping {job:?}");
            return;
        }
        let tx = {
            let mut workers = self.workers.lock();
            workers
                .entry(reader)
                .or_insert_with(|| self.spawn_worker(reader))
                .tx
                .clone()
        };
        if tx.send(job).await.is_err() {
            log::warn!("pipeline worker for reader {reader} is gone");
        }
    }

    /// Stop all workers: the in-flight job of each reader completes (or is
    /// aborted at the grace deadline), queued jobs are dropped.
    pub async fn stop(&self, grace: Duration) {
        self.cancel.cancel();
        let workers: Vec<Worker> = {
            let mut map = self.workers.lock();
            map.drain().map(|(_, w)| w).collect()
        };
        for worker in workers {
            drop(worker.tx);
            if tokio::time::timeout(grace, worker.handle)
                .await
                .is_err()
            {
                log::warn!("pipeline worker did not stop within the grace period");
            }
        }
    }
}

impl std::fmt::Debug for PipelineRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRouter")
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}
