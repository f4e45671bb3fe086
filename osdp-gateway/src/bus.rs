//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! The bus manager: one codec connection per distinct serial port, all
//! device sessions multiplexed on top, and the pump that turns codec events
//! into domain events. Device sessions exist only between `start` and
//! `stop`; configuration outlives them in the repository.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::codec::{BusId, CodecCommand, CodecEvent, DeviceSpec, OsdpCodec};
use crate::config::{SecurityService, SecurityUpdateService};
use crate::device::{DeviceSession, DeviceStatus};
use crate::events::GatewayEvent;
use crate::feedback::{FeedbackConfigService, IdleStateFeedback, ReaderFeedback, IDLE_HEARTBEAT_SECS};
use crate::pipeline::FeedbackSink;
use crate::reader::{ReaderConfig, ReaderId, SecurityMode};
use crate::trace::{IngestOutcome, PacketTraceStore};
use crate::GatewayError;

type Result<T> = core::result::Result<T, GatewayError>;

/// How long a secure channel key installation may take before it is
/// abandoned (and re-armed for the next online transition).
const INSTALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle window: a reader with no activity for this long gets heartbeats.
const IDLE_WINDOW: Duration = Duration::from_secs(IDLE_HEARTBEAT_SECS);

/// State of one opened (or failed) bus.
#[derive(Clone, Debug)]
enum BusState {
    Open(BusId),
    /// The serial port could not be opened. Terminal for this run;
    /// surfaced through status events for every reader on the port.
    Failed(String),
}

struct BusEntry {
    state: BusState,
    devices: HashSet<ReaderId>,
}

struct BusManagerInner {
    codec: Arc<dyn OsdpCodec>,
    security: Arc<SecurityService>,
    security_update: Arc<SecurityUpdateService>,
    feedback_config: Arc<FeedbackConfigService>,
    trace: Arc<PacketTraceStore>,
    events_tx: mpsc::UnboundedSender<GatewayEvent>,
    buses: Mutex<HashMap<String, BusEntry>>,
    sessions: RwLock<HashMap<ReaderId, Arc<DeviceSession>>>,
    by_address: RwLock<HashMap<(BusId, u8), ReaderId>>,
    running: AtomicBool,
}

/// Owns every bus and every device session. The control surface is
/// `start` / `stop` / `add_device` / `remove_device` / `device(s)`; events
/// flow out of the channel handed back by [`BusManager::new`].
pub struct BusManager {
    inner: Arc<BusManagerInner>,
    // Serializes the control surface; never held across event handling.
    admin: tokio::sync::Mutex<()>,
    run_token: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pump_started: AtomicBool,
    codec_events: Mutex<Option<mpsc::UnboundedReceiver<CodecEvent>>>,
}

impl BusManager {
    /// Create a manager over a codec. The returned receiver carries every
    /// [`GatewayEvent`] the buses produce.
    pub fn new(
        codec: Arc<dyn OsdpCodec>,
        security: Arc<SecurityService>,
        security_update: Arc<SecurityUpdateService>,
        feedback_config: Arc<FeedbackConfigService>,
        trace: Arc<PacketTraceStore>,
    ) -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let codec_events = codec.events();
        let manager = Self {
            inner: Arc::new(BusManagerInner {
                codec,
                security,
                security_update,
                feedback_config,
                trace,
                events_tx,
                buses: Mutex::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
                by_address: RwLock::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
            admin: tokio::sync::Mutex::new(()),
            run_token: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
            pump_started: AtomicBool::new(false),
            codec_events: Mutex::new(Some(codec_events)),
        };
        (manager, events_rx)
    }

    /// Whether the manager is between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Begin operation. Idempotent. Devices are added afterwards with
    /// [`add_device`](Self::add_device).
    pub async fn start(&self) -> Result<()> {
        let _guard = self.admin.lock().await;
        if self.is_running() {
            return Ok(());
        }
        let token = CancellationToken::new();
        *self.run_token.lock() = token.clone();
        self.inner.running.store(true, Ordering::Release);

        if !self.pump_started.swap(true, Ordering::AcqRel) {
            let rx = self
                .codec_events
                .lock()
                .take()
                .expect("codec event stream already taken");
            let inner = Arc::clone(&self.inner);
            // The pump outlives stop/start cycles; it gates on `running`.
            tokio::spawn(pump(inner, rx));
        }

        let inner = Arc::clone(&self.inner);
        self.tasks
            .lock()
            .push(tokio::spawn(heartbeat(inner, token)));
        log::info!("bus manager started");
        Ok(())
    }

    /// Cease operation: detach every session, close every bus, stop the
    /// heartbeat. Idempotent; completes within the grace period.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        let _guard = self.admin.lock().await;
        if !self.is_running() {
            return Ok(());
        }
        self.inner.running.store(false, Ordering::Release);
        self.run_token.lock().cancel();

        let sessions: Vec<Arc<DeviceSession>> =
            self.inner.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            if let Some(status) = session.detach() {
                let _ = self
                    .inner
                    .events_tx
                    .send(GatewayEvent::StatusChanged(status));
            }
        }
        self.inner.by_address.write().clear();

        let buses: Vec<(String, BusEntry)> = self.inner.buses.lock().drain().collect();
        for (port, entry) in buses {
            if let BusState::Open(id) = entry.state {
                if let Err(e) = self.inner.codec.close_bus(id).await {
                    log::warn!("closing bus on {port}: {e}");
                }
            }
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(grace, task).await.is_err() {
                log::warn!("bus task did not stop within the grace period");
            }
        }
        log::info!("bus manager stopped");
        Ok(())
    }

    /// Validate a reader against the live sessions and bring its device up
    /// on the right bus. Rejections carry the violated rule; nothing is
    /// created on rejection.
    pub async fn add_device(&self, config: ReaderConfig) -> Result<()> {
        let _guard = self.admin.lock().await;
        if !self.is_running() {
            return Err(GatewayError::NotRunning);
        }
        // Key selection first: Secure mode with no stored key keeps the
        // device down and surfaces a status error, not just a rejection.
        let key = match self
            .inner
            .security
            .security_key(config.security_mode, config.secure_key)
        {
            Ok(key) => key,
            Err(e) => {
                let _ = self
                    .inner
                    .events_tx
                    .send(GatewayEvent::StatusChanged(crate::events::StatusChangeEvent {
                        reader_id: config.id,
                        reader_name: config.name.clone(),
                        online: false,
                        message: Some(e.to_string()),
                    }));
                return Err(e);
            }
        };
        config.validate()?;
        if !config.enabled {
            return Err(GatewayError::Config(format!(
                "reader {} is disabled",
                config.name
            )));
        }
        if self.inner.sessions.read().contains_key(&config.id) {
            return Err(GatewayError::Config(format!(
                "reader {} already has a session",
                config.name
            )));
        }

        // Bus sharing rules against live sessions on the same port.
        for session in self.inner.sessions.read().values() {
            let other = session.config();
            if other.port != config.port {
                continue;
            }
            if other.baud_rate != config.baud_rate {
                return Err(GatewayError::Config(format!(
                    "baud rate {} conflicts with reader {} at {} on {}",
                    config.baud_rate, other.name, other.baud_rate, config.port
                )));
            }
            if other.address == config.address {
                return Err(GatewayError::Config(format!(
                    "address {} on {} is already taken by reader {}",
                    config.address, config.port, other.name
                )));
            }
        }

        let bus = self.ensure_bus(&config).await?;
        let spec = DeviceSpec {
            name: config.name.clone(),
            address: config.address,
            use_crc: true,
            secure_channel_key: key,
        };
        self.inner.codec.register_device(bus, spec).await.map_err(|e| {
            let _ = self
                .inner
                .events_tx
                .send(GatewayEvent::StatusChanged(crate::events::StatusChangeEvent {
                    reader_id: config.id,
                    reader_name: config.name.clone(),
                    online: false,
                    message: Some(format!("device registration failed: {e}")),
                }));
            e
        })?;

        let session = Arc::new(DeviceSession::new(
            config.clone(),
            bus,
            Arc::clone(&self.inner.codec),
        ));
        session.mark_registered();
        self.inner
            .by_address
            .write()
            .insert((bus, config.address.as_u8()), config.id);
        self.inner.sessions.write().insert(config.id, session);
        if let Some(entry) = self.inner.buses.lock().get_mut(&config.port) {
            entry.devices.insert(config.id);
        }
        log::info!(
            "reader {} registered on {} address {}",
            config.name,
            config.port,
            config.address
        );
        Ok(())
    }

    /// Stop polling a device, emit its offline status and drop the
    /// session. Closes the bus when the last device leaves it.
    pub async fn remove_device(&self, id: ReaderId) -> Result<()> {
        let _guard = self.admin.lock().await;
        let session = self
            .inner
            .sessions
            .write()
            .remove(&id)
            .ok_or_else(|| GatewayError::Config(format!("no session for reader {id}")))?;
        let config = session.config();
        self.inner
            .by_address
            .write()
            .remove(&(session.bus(), config.address.as_u8()));
        if let Err(e) = self
            .inner
            .codec
            .unregister_device(session.bus(), config.address)
            .await
        {
            log::warn!("unregistering reader {}: {e}", config.name);
        }
        if let Some(status) = session.detach() {
            let _ = self
                .inner
                .events_tx
                .send(GatewayEvent::StatusChanged(status));
        }

        let close = {
            let mut buses = self.inner.buses.lock();
            match buses.get_mut(&config.port) {
                Some(entry) => {
                    entry.devices.remove(&id);
                    if entry.devices.is_empty() {
                        let state = entry.state.clone();
                        buses.remove(&config.port);
                        match state {
                            BusState::Open(bus) => Some(bus),
                            BusState::Failed(_) => None,
                        }
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(bus) = close {
            if let Err(e) = self.inner.codec.close_bus(bus).await {
                log::warn!("closing bus on {}: {e}", config.port);
            }
        }
        log::info!("reader {} removed", config.name);
        Ok(())
    }

    /// Status of one device session.
    pub fn device(&self, id: ReaderId) -> Option<DeviceStatus> {
        self.inner.sessions.read().get(&id).map(|s| s.status())
    }

    /// Status of every device session, sorted by name.
    pub fn devices(&self) -> Vec<DeviceStatus> {
        let mut all: Vec<DeviceStatus> = self
            .inner
            .sessions
            .read()
            .values()
            .map(|s| s.status())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    // Open the port's bus on first use. A port that failed to open stays
    // failed for this run; every subsequent add on it reports the failure.
    async fn ensure_bus(&self, config: &ReaderConfig) -> Result<BusId> {
        let existing = self.inner.buses.lock().get(&config.port).map(|e| e.state.clone());
        match existing {
            Some(BusState::Open(id)) => Ok(id),
            Some(BusState::Failed(reason)) => Err(GatewayError::Transport(format!(
                "bus on {} previously failed: {reason}",
                config.port
            ))),
            None => {
                match self
                    .inner
                    .codec
                    .open_bus(&config.port, config.baud_rate)
                    .await
                {
                    Ok(id) => {
                        self.inner.buses.lock().insert(
                            config.port.clone(),
                            BusEntry {
                                state: BusState::Open(id),
                                devices: HashSet::new(),
                            },
                        );
                        log::info!("opened {} at {}", config.port, config.baud_rate);
                        Ok(id)
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        self.inner.buses.lock().insert(
                            config.port.clone(),
                            BusEntry {
                                state: BusState::Failed(reason.clone()),
                                devices: HashSet::new(),
                            },
                        );
                        let _ = self.inner.events_tx.send(GatewayEvent::StatusChanged(
                            crate::events::StatusChangeEvent {
                                reader_id: config.id,
                                reader_name: config.name.clone(),
                                online: false,
                                message: Some(format!(
                                    "cannot open {}: {reason}",
                                    config.port
                                )),
                            },
                        ));
                        Err(e)
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl FeedbackSink for BusManager {
    async fn send_feedback(&self, reader: ReaderId, feedback: &ReaderFeedback) -> Result<()> {
        let session = self
            .inner
            .sessions
            .read()
            .get(&reader)
            .cloned()
            .ok_or_else(|| GatewayError::Transport(format!("no session for reader {reader}")))?;
        session.send_feedback(feedback).await
    }
}

impl std::fmt::Debug for BusManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusManager")
            .field("running", &self.is_running())
            .field("buses", &self.inner.buses.lock().len())
            .field("sessions", &self.inner.sessions.read().len())
            .finish()
    }
}

impl BusManagerInner {
    fn session_by_address(&self, bus: BusId, address: u8) -> Option<Arc<DeviceSession>> {
        let id = *self.by_address.read().get(&(bus, address))?;
        self.sessions.read().get(&id).cloned()
    }
}

// Consumes the codec event stream for the manager's whole lifetime. When
// the manager is stopped, events are drained and dropped so a restart does
// not replay stale traffic.
async fn pump(inner: Arc<BusManagerInner>, mut rx: mpsc::UnboundedReceiver<CodecEvent>) {
    while let Some(event) = rx.recv().await {
        if !inner.running.load(Ordering::Acquire) {
            continue;
        }
        match event {
            CodecEvent::CardData {
                bus,
                address,
                data,
                bit_count,
                format,
            } => {
                let Some(session) = inner.session_by_address(bus, address) else {
                    log::debug!("card data from unknown device {bus}/{address}");
                    continue;
                };
                let mut card = session.handle_card_reply(&data, bit_count);
                if let Some(format) = format {
                    card.extra
                        .insert("format_code".to_owned(), format.to_string());
                }
                let _ = inner.events_tx.send(GatewayEvent::CardRead(card));
            }
            CodecEvent::KeyPress { bus, address, digit } => {
                let Some(session) = inner.session_by_address(bus, address) else {
                    continue;
                };
                let pin = session.handle_key_press(digit);
                let _ = inner.events_tx.send(GatewayEvent::PinDigit(pin));
            }
            CodecEvent::StatusChange { bus, address, online } => {
                let Some(session) = inner.session_by_address(bus, address) else {
                    continue;
                };
                let Some(status) = session.set_online(online) else {
                    continue;
                };
                let _ = inner
                    .events_tx
                    .send(GatewayEvent::StatusChanged(status));
                if online {
                    on_device_online(&inner, &session).await;
                }
            }
            CodecEvent::Packet(packet) => {
                let Some(session) = inner.session_by_address(packet.bus, packet.address) else {
                    continue;
                };
                let config = session.config();
                if let IngestOutcome::AutoStopped(message) =
                    inner
                        .trace
                        .ingest(config.id, &config.name, &packet, None)
                {
                    let _ = inner.events_tx.send(GatewayEvent::TraceStopped { message });
                }
            }
        }
    }
    log::debug!("codec event stream closed, pump exiting");
}

async fn on_device_online(inner: &Arc<BusManagerInner>, session: &Arc<DeviceSession>) {
    // Idle permanent color, best effort.
    match inner.feedback_config.get().await {
        Ok(config) => {
            if let Err(e) = session.apply_idle_state(&config.idle).await {
                log::warn!(
                    "reader {}: cannot apply idle LED state: {e}",
                    session.config().name
                );
            }
        }
        Err(e) => log::warn!("idle feedback unavailable: {e}"),
    }
    // Pending secure channel installation.
    if session.begin_install() {
        let inner = Arc::clone(inner);
        let session = Arc::clone(session);
        tokio::spawn(async move { install_key(inner, session).await });
    }
}

// Random key installation for a device that came online in install mode.
// Exactly one key is generated and one KEYSET issued per attempt; the new
// key is persisted before the session flips to Secure.
async fn install_key(inner: Arc<BusManagerInner>, session: Arc<DeviceSession>) {
    let config = session.config();
    let key = inner.security.generate_random_key();
    let send = inner.codec.send(
        session.bus(),
        config.address,
        CodecCommand::KeySet(key),
    );
    match tokio::time::timeout(INSTALL_TIMEOUT, send).await {
        Ok(Ok(())) => {
            if let Err(e) = inner
                .security_update
                .update(config.id, SecurityMode::Secure, Some(key))
                .await
            {
                log::error!(
                    "reader {}: new key accepted but could not be persisted: {e}",
                    config.name
                );
                session.abort_install();
                return;
            }
            session.complete_install(key);
            log::info!("reader {}: secure channel key installed", config.name);
            let _ = inner.events_tx.send(GatewayEvent::StatusChanged(
                crate::events::StatusChangeEvent {
                    reader_id: config.id,
                    reader_name: config.name.clone(),
                    online: true,
                    message: Some(
                        "secure channel key installed; device is now in Secure mode".to_owned(),
                    ),
                },
            ));
        }
        Ok(Err(e)) => {
            log::warn!(
                "reader {}: secure channel installation failed: {e}",
                config.name
            );
            session.abort_install();
            let _ = inner.events_tx.send(GatewayEvent::StatusChanged(
                crate::events::StatusChangeEvent {
                    reader_id: config.id,
                    reader_name: config.name.clone(),
                    online: true,
                    message: Some(format!("secure channel installation failed: {e}")),
                },
            ));
        }
        Err(_) => {
            log::warn!(
                "reader {}: secure channel installation timed out",
                config.name
            );
            session.abort_install();
        }
    }
}

// Flashes the heartbeat color on every online, idle device every five
// seconds.
async fn heartbeat(inner: Arc<BusManagerInner>, cancel: CancellationToken) {
    let mut tick = interval(Duration::from_secs(IDLE_HEARTBEAT_SECS));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {}
        }
        let idle: IdleStateFeedback = match inner.feedback_config.get().await {
            Ok(config) => config.idle,
            Err(_) => IdleStateFeedback::default(),
        };
        let sessions: Vec<Arc<DeviceSession>> =
            inner.sessions.read().values().cloned().collect();
        for session in sessions {
            if session.is_idle(IDLE_WINDOW) {
                if let Err(e) = session.send_heartbeat(&idle).await {
                    log::debug!(
                        "reader {}: heartbeat not delivered: {e}",
                        session.config().name
                    );
                }
            }
        }
    }
}
