//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! The gateway owner object. Everything with state hangs off [`Gateway`]:
//! the bus manager, the plugin host, the PIN collector, the packet trace
//! store, both pipelines and the configuration services. There are no
//! ambient singletons; collaborators receive handles.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::BusManager;
use crate::codec::OsdpCodec;
use crate::config::{
    export_configuration, import_configuration, ImportSummary, MappingService,
    ReaderConfigService, SecurityService, SecurityUpdateService,
};
use crate::events::{CardReadEvent, GatewayEvent, PinReadEvent};
use crate::feedback::FeedbackConfigService;
use crate::notify::{GatewayStatistics, Notification, Notifier};
use crate::pin::{PinCollector, PinPolicy};
use crate::pipeline::{
    EventPipeline, PipelineCounters, PipelineJob, PipelineOutcome, PipelineRouter,
};
use crate::plugin::PluginHost;
use crate::store::GatewayStore;
use crate::trace::{PacketTraceStore, TraceSettings};
use crate::GatewayError;

type Result<T> = core::result::Result<T, GatewayError>;

/// Tunables for a gateway instance.
#[derive(Clone, Debug)]
pub struct GatewayOptions {
    /// Directory scanned for plugin artifacts; `None` disables discovery.
    pub plugin_dir: Option<PathBuf>,
    /// Initial packet trace settings.
    pub trace: TraceSettings,
    /// PIN collection rules.
    pub pin: PinPolicy,
    /// How long `stop` waits for in-flight work.
    pub grace: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            plugin_dir: None,
            trace: TraceSettings::default(),
            pin: PinPolicy::default(),
            grace: Duration::from_secs(5),
        }
    }
}

type RouterSlot = Arc<Mutex<Option<Arc<PipelineRouter>>>>;

/// The assembled gateway.
pub struct Gateway {
    bus: Arc<BusManager>,
    plugins: Arc<PluginHost>,
    pin: Arc<PinCollector>,
    trace: Arc<PacketTraceStore>,
    readers: Arc<ReaderConfigService>,
    mappings: Arc<MappingService>,
    feedback: Arc<FeedbackConfigService>,
    security: Arc<SecurityService>,
    security_update: Arc<SecurityUpdateService>,
    notifier: Arc<dyn Notifier>,
    counters: Arc<PipelineCounters>,
    card_pipeline: Arc<EventPipeline<CardReadEvent>>,
    pin_pipeline: Arc<EventPipeline<PinReadEvent>>,
    router: RouterSlot,
    options: GatewayOptions,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<GatewayEvent>>>,
    dispatcher_started: AtomicBool,
    discovered: AtomicBool,
    run_token: Mutex<CancellationToken>,
    run_tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Gateway {
    /// Assemble a gateway over its three external collaborators.
    pub fn new(
        codec: Arc<dyn OsdpCodec>,
        store: Arc<dyn GatewayStore>,
        notifier: Arc<dyn Notifier>,
        options: GatewayOptions,
    ) -> Self {
        let security = Arc::new(SecurityService::new());
        let security_update = Arc::new(SecurityUpdateService::new(
            Arc::clone(&store),
            Arc::clone(&notifier),
        ));
        let feedback = Arc::new(FeedbackConfigService::new(Arc::clone(&store)));
        let trace = Arc::new(PacketTraceStore::new(options.trace.clone()));
        let mappings = Arc::new(MappingService::new(Arc::clone(&store)));
        let readers = Arc::new(ReaderConfigService::new(
            Arc::clone(&store),
            Arc::clone(&notifier),
            Arc::clone(&mappings),
        ));
        let plugins = Arc::new(PluginHost::new(
            Arc::clone(&mappings),
            options.plugin_dir.clone(),
        ));
        let (bus, events_rx) = BusManager::new(
            codec,
            Arc::clone(&security),
            Arc::clone(&security_update),
            Arc::clone(&feedback),
            Arc::clone(&trace),
        );
        let bus = Arc::new(bus);
        let counters = Arc::new(PipelineCounters::default());
        let card_pipeline = Arc::new(EventPipeline::new(
            Arc::clone(&plugins),
            Arc::clone(&feedback),
            Arc::clone(&store),
            Arc::clone(&bus) as _,
            Arc::clone(&notifier),
            Arc::clone(&counters),
        ));
        let pin_pipeline = Arc::new(EventPipeline::new(
            Arc::clone(&plugins),
            Arc::clone(&feedback),
            Arc::clone(&store),
            Arc::clone(&bus) as _,
            Arc::clone(&notifier),
            Arc::clone(&counters),
        ));
        Self {
            bus,
            plugins,
            pin: Arc::new(PinCollector::new(options.pin.clone())),
            trace,
            readers,
            mappings,
            feedback,
            security,
            security_update,
            notifier,
            counters,
            card_pipeline,
            pin_pipeline,
            router: Arc::new(Mutex::new(None)),
            options,
            events_rx: Mutex::new(Some(events_rx)),
            dispatcher_started: AtomicBool::new(false),
            discovered: AtomicBool::new(false),
            run_token: Mutex::new(CancellationToken::new()),
            run_tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Whether the gateway is between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bring everything up: plugin discovery, bus polling, one device per
    /// enabled reader, the pipeline router and the PIN timeout sweep.
    /// Idempotent. A reader that cannot be brought up is reported through
    /// status events and skipped; the rest of the gateway still starts.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if !self.discovered.swap(true, Ordering::AcqRel) {
            match self.plugins.discover() {
                Ok(count) if count > 0 => log::info!("loaded {count} plugin(s)"),
                Ok(_) => {}
                Err(e) => log::error!("plugin discovery failed: {e}"),
            }
        }

        let token = CancellationToken::new();
        *self.run_token.lock() = token.clone();

        *self.router.lock() = Some(Arc::new(PipelineRouter::new(
            Arc::clone(&self.card_pipeline),
            Arc::clone(&self.pin_pipeline),
            token.child_token(),
        )));

        if !self.dispatcher_started.swap(true, Ordering::AcqRel) {
            let rx = self
                .events_rx
                .lock()
                .take()
                .expect("gateway event stream already taken");
            tokio::spawn(dispatch_events(
                rx,
                Arc::clone(&self.router),
                Arc::clone(&self.pin),
                Arc::clone(&self.notifier),
                Arc::clone(&self.counters),
                Arc::clone(&self.trace),
            ));
        }

        // PIN timeout sweep and its completion forwarder, per run.
        let (pin_tx, mut pin_rx) = mpsc::unbounded_channel();
        self.run_tasks.lock().push(tokio::spawn(
            Arc::clone(&self.pin).run(token.child_token(), pin_tx),
        ));
        let router = Arc::clone(&self.router);
        self.run_tasks.lock().push(tokio::spawn(async move {
            while let Some(event) = pin_rx.recv().await {
                let current = router.lock().clone();
                if let Some(router) = current {
                    router.dispatch(PipelineJob::Pin(event)).await;
                }
            }
        }));

        self.bus.start().await?;

        for config in self.readers.list().await? {
            if !config.enabled {
                continue;
            }
            let name = config.name.clone();
            if let Err(e) = self.bus.add_device(config).await {
                log::error!("reader {name} not started: {e}");
            }
        }
        log::info!("gateway started");
        Ok(())
    }

    /// Wind everything down within the grace period: polling stops, the
    /// per-reader pipelines drain, PIN buffers are discarded. The packet
    /// trace store stays queryable. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.run_token.lock().cancel();

        self.bus.stop(self.options.grace).await?;

        let router = self.router.lock().take();
        if let Some(router) = router {
            router.stop(self.options.grace).await;
        }

        let tasks: Vec<JoinHandle<()>> = self.run_tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(self.options.grace, task).await.is_err() {
                log::warn!("gateway task did not stop within the grace period");
            }
        }
        log::info!("gateway stopped");
        Ok(())
    }

    /// Process a card event inline, bypassing the router queue. Admin and
    /// test surface; live traffic goes through the event stream.
    pub async fn process_card(&self, event: CardReadEvent) -> PipelineOutcome {
        self.card_pipeline.process(event).await
    }

    /// Process a PIN event inline. See [`process_card`](Self::process_card).
    pub async fn process_pin(&self, event: PinReadEvent) -> PipelineOutcome {
        self.pin_pipeline.process(event).await
    }

    /// Bus control surface.
    pub fn bus(&self) -> &Arc<BusManager> {
        &self.bus
    }

    /// Plugin host.
    pub fn plugins(&self) -> &Arc<PluginHost> {
        &self.plugins
    }

    /// PIN collector admin surface (`clear`, `current`).
    pub fn pin_collector(&self) -> &Arc<PinCollector> {
        &self.pin
    }

    /// Packet trace store.
    pub fn trace(&self) -> &Arc<PacketTraceStore> {
        &self.trace
    }

    /// Reader configuration service.
    pub fn readers(&self) -> &Arc<ReaderConfigService> {
        &self.readers
    }

    /// Plugin mapping service.
    pub fn mappings(&self) -> &Arc<MappingService> {
        &self.mappings
    }

    /// Feedback configuration service.
    pub fn feedback(&self) -> &Arc<FeedbackConfigService> {
        &self.feedback
    }

    /// Security key policy service.
    pub fn security(&self) -> &Arc<SecurityService> {
        &self.security
    }

    /// Security posture update service.
    pub fn security_update(&self) -> &Arc<SecurityUpdateService> {
        &self.security_update
    }

    /// Current aggregate statistics.
    pub fn statistics(&self) -> GatewayStatistics {
        let (card_events, pin_events, failed_events) = self.counters.snapshot();
        GatewayStatistics {
            card_events,
            pin_events,
            failed_events,
            trace: self.trace.statistics(),
            message: self.trace.stop_reason(),
        }
    }

    /// Broadcast the current statistics.
    pub fn publish_statistics(&self) {
        let _ = self
            .notifier
            .broadcast(Notification::Statistics(self.statistics()));
    }

    /// Export the full configuration as JSON.
    pub async fn export_config(&self) -> Result<String> {
        export_configuration(&self.readers, &self.feedback).await
    }

    /// Import a configuration export.
    pub async fn import_config(&self, json: &str) -> Result<ImportSummary> {
        import_configuration(json, &self.readers, &self.feedback).await
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("running", &self.is_running())
            .finish()
    }
}

// Routes bus events for the gateway's whole lifetime: card reads and
// completed PINs to the per-reader pipeline workers, digits to the
// collector, status changes and trace stops to the notifier.
async fn dispatch_events(
    mut rx: mpsc::UnboundedReceiver<GatewayEvent>,
    router: RouterSlot,
    pin: Arc<PinCollector>,
    notifier: Arc<dyn Notifier>,
    counters: Arc<PipelineCounters>,
    trace: Arc<PacketTraceStore>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            GatewayEvent::CardRead(card) => {
                let current = router.lock().clone();
                if let Some(router) = current {
                    router.dispatch(PipelineJob::Card(card)).await;
                }
            }
            GatewayEvent::PinDigit(digit) => {
                if let Some(done) = pin.push(&digit) {
                    let current = router.lock().clone();
                    if let Some(router) = current {
                        router.dispatch(PipelineJob::Pin(done)).await;
                    }
                }
            }
            GatewayEvent::StatusChanged(status) => {
                log::info!(
                    "reader {} is {}{}",
                    status.reader_name,
                    if status.online { "online" } else { "offline" },
                    status
                        .message
                        .as_deref()
                        .map(|m| format!(" ({m})"))
                        .unwrap_or_default()
                );
                if notifier
                    .broadcast(Notification::ReaderStatus(status))
                    .is_err()
                {
                    log::warn!("reader status notification failed");
                }
            }
            GatewayEvent::TraceStopped { message } => {
                let (card_events, pin_events, failed_events) = counters.snapshot();
                let _ = notifier.broadcast(Notification::Statistics(GatewayStatistics {
                    card_events,
                    pin_events,
                    failed_events,
                    trace: trace.statistics(),
                    message: Some(message),
                }));
            }
        }
    }
    log::debug!("gateway event stream closed, dispatcher exiting");
}
