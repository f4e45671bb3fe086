//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! The production [`OsdpCodec`]: LibOSDP's control panel driven over serial
//! channels. Each open bus runs one worker thread that owns the
//! `ControlPanel` context, refreshes it every 50 ms, forwards commands from
//! the gateway, diffs the online mask into status events and bridges PD
//! events into the codec event stream.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use libosdp::{ControlPanelBuilder, OsdpEvent, PdInfoBuilder};
use osdp_gateway::{
    BaudRate, BusId, CodecCommand, CodecEvent, DeviceSpec, GatewayError, OsdpAddress, OsdpCodec,
    PacketDirection, RawPacket,
};
use tokio::sync::mpsc;

use crate::serial_channel::SerialChannel;

type Result<T> = core::result::Result<T, GatewayError>;

/// LibOSDP wants a refresh at least every 50 ms.
const REFRESH_INTERVAL: Duration = Duration::from_millis(25);
/// How often the worker re-reads the online mask.
const ONLINE_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Outgoing command codes for the synthesized packet captures.
const CMD_LED: u8 = 0x69;
const CMD_BUZ: u8 = 0x6A;
const CMD_TEXT: u8 = 0x6B;
const CMD_KEYSET: u8 = 0x75;
/// Incoming reply codes for the synthesized packet captures.
const REPLY_RAW: u8 = 0x50;
const REPLY_KEYPAD: u8 = 0x53;

enum WorkerRequest {
    Send {
        address: u8,
        command: CodecCommand,
        reply: std_mpsc::Sender<core::result::Result<(), String>>,
    },
}

struct Worker {
    requests: std_mpsc::Sender<WorkerRequest>,
    stop: Arc<AtomicBool>,
    online: Arc<Mutex<HashSet<u8>>>,
    handle: thread::JoinHandle<()>,
}

struct BusRuntime {
    port: String,
    baud: u32,
    devices: Vec<DeviceSpec>,
    worker: Option<Worker>,
}

#[derive(Default)]
struct AdapterState {
    next_bus: u32,
    buses: HashMap<u32, BusRuntime>,
}

/// The LibOSDP-backed codec.
pub struct LibOsdpCodec {
    state: Mutex<AdapterState>,
    events_tx: mpsc::UnboundedSender<CodecEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<CodecEvent>>>,
}

impl LibOsdpCodec {
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(AdapterState::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    fn stop_worker(worker: Worker) {
        worker.stop.store(true, Ordering::Release);
        let _ = worker.handle.join();
    }

    // (Re)start the worker thread of one bus with its current device set.
    fn restart_worker(&self, bus: u32, runtime: &mut BusRuntime) -> Result<()> {
        if let Some(worker) = runtime.worker.take() {
            Self::stop_worker(worker);
        }
        if runtime.devices.is_empty() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let online = Arc::new(Mutex::new(HashSet::new()));
        let (requests_tx, requests_rx) = std_mpsc::channel();
        let params = WorkerParams {
            bus: BusId(bus),
            port: runtime.port.clone(),
            baud: runtime.baud,
            devices: runtime.devices.clone(),
            events_tx: self.events_tx.clone(),
            stop: Arc::clone(&stop),
            online: Arc::clone(&online),
        };
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("osdp-bus-{bus}"))
            .spawn(move || bus_worker(params, requests_rx, ready_tx))
            .map_err(|e| GatewayError::Transport(format!("cannot spawn bus worker: {e}")))?;
        // The worker reports whether the channel and CP context came up.
        match ready_rx.recv() {
            Ok(Ok(())) => {
                runtime.worker = Some(Worker {
                    requests: requests_tx,
                    stop,
                    online,
                    handle,
                });
                Ok(())
            }
            Ok(Err(reason)) => {
                let _ = handle.join();
                Err(GatewayError::Transport(reason))
            }
            Err(_) => {
                let _ = handle.join();
                Err(GatewayError::Transport("bus worker died during setup".into()))
            }
        }
    }
}

#[async_trait]
impl OsdpCodec for LibOsdpCodec {
    async fn open_bus(&self, port: &str, baud_rate: BaudRate) -> Result<BusId> {
        let mut state = self.state.lock().unwrap();
        if state.buses.values().any(|b| b.port == port) {
            return Err(GatewayError::Transport(format!("{port} is already open")));
        }
        // Probe the port now so a missing adapter fails at open time, not
        // at first registration.
        SerialChannel::open(port, baud_rate.as_u32())
            .map_err(|e| GatewayError::Transport(format!("cannot open {port}: {e}")))?;
        let id = state.next_bus;
        state.next_bus += 1;
        state.buses.insert(
            id,
            BusRuntime {
                port: port.to_owned(),
                baud: baud_rate.as_u32(),
                devices: Vec::new(),
                worker: None,
            },
        );
        Ok(BusId(id))
    }

    async fn close_bus(&self, bus: BusId) -> Result<()> {
        let runtime = self.state.lock().unwrap().buses.remove(&bus.0);
        match runtime {
            Some(mut runtime) => {
                if let Some(worker) = runtime.worker.take() {
                    Self::stop_worker(worker);
                }
                Ok(())
            }
            None => Err(GatewayError::Transport(format!("unknown {bus}"))),
        }
    }

    async fn register_device(&self, bus: BusId, spec: DeviceSpec) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let runtime = state
            .buses
            .get_mut(&bus.0)
            .ok_or_else(|| GatewayError::Transport(format!("unknown {bus}")))?;
        if runtime
            .devices
            .iter()
            .any(|d| d.address == spec.address)
        {
            return Err(GatewayError::Transport(format!(
                "address {} already registered on {bus}",
                spec.address
            )));
        }
        runtime.devices.push(spec);
        self.restart_worker(bus.0, runtime)
    }

    async fn unregister_device(&self, bus: BusId, address: OsdpAddress) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let runtime = state
            .buses
            .get_mut(&bus.0)
            .ok_or_else(|| GatewayError::Transport(format!("unknown {bus}")))?;
        runtime.devices.retain(|d| d.address != address);
        self.restart_worker(bus.0, runtime)
    }

    async fn is_online(&self, bus: BusId, address: OsdpAddress) -> bool {
        let state = self.state.lock().unwrap();
        state
            .buses
            .get(&bus.0)
            .and_then(|b| b.worker.as_ref())
            .map(|w| w.online.lock().unwrap().contains(&address.as_u8()))
            .unwrap_or(false)
    }

    async fn send(&self, bus: BusId, address: OsdpAddress, command: CodecCommand) -> Result<()> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        {
            let state = self.state.lock().unwrap();
            let worker = state
                .buses
                .get(&bus.0)
                .and_then(|b| b.worker.as_ref())
                .ok_or_else(|| GatewayError::Transport(format!("no devices on {bus}")))?;
            worker
                .requests
                .send(WorkerRequest::Send {
                    address: address.as_u8(),
                    command,
                    reply: reply_tx,
                })
                .map_err(|_| GatewayError::Transport("bus worker is gone".into()))?;
        }
        let outcome = tokio::task::spawn_blocking(move || {
            reply_rx.recv_timeout(Duration::from_secs(5))
        })
        .await
        .map_err(|e| GatewayError::Transport(format!("send task failed: {e}")))?;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(GatewayError::Transport(reason)),
            Err(_) => Err(GatewayError::Transport("bus worker did not answer".into())),
        }
    }

    fn events(&self) -> mpsc::UnboundedReceiver<CodecEvent> {
        self.events_rx
            .lock()
            .unwrap()
            .take()
            .expect("event stream already taken")
    }
}

impl std::fmt::Debug for LibOsdpCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibOsdpCodec")
            .field("buses", &self.state.lock().unwrap().buses.len())
            .finish()
    }
}

struct WorkerParams {
    bus: BusId,
    port: String,
    baud: u32,
    devices: Vec<DeviceSpec>,
    events_tx: mpsc::UnboundedSender<CodecEvent>,
    stop: Arc<AtomicBool>,
    online: Arc<Mutex<HashSet<u8>>>,
}

fn synth_packet(
    bus: BusId,
    address: u8,
    direction: PacketDirection,
    code: u8,
    secure: bool,
) -> CodecEvent {
    CodecEvent::Packet(RawPacket {
        bus,
        address,
        direction,
        code,
        sequence: 0,
        secure,
        valid: true,
        error: None,
        payload: Vec::new(),
        at: Utc::now(),
    })
}

fn command_code(command: &CodecCommand) -> u8 {
    match command {
        CodecCommand::Led(_) => CMD_LED,
        CodecCommand::Buzzer(_) => CMD_BUZ,
        CodecCommand::Text(_) => CMD_TEXT,
        CodecCommand::KeySet(_) => CMD_KEYSET,
    }
}

fn into_osdp_command(command: CodecCommand) -> libosdp::OsdpCommand {
    use libosdp::{
        OsdpCommand, OsdpCommandBuzzer, OsdpCommandKeyset, OsdpCommandLed, OsdpCommandText,
        OsdpLedColor, OsdpLedParams,
    };
    match command {
        CodecCommand::Led(led) => {
            let color = match led.color {
                osdp_gateway::CodecLedColor::Red => OsdpLedColor::Red,
                osdp_gateway::CodecLedColor::Green => OsdpLedColor::Green,
                osdp_gateway::CodecLedColor::Blue => OsdpLedColor::Blue,
                osdp_gateway::CodecLedColor::Amber => OsdpLedColor::Amber,
            };
            let params = OsdpLedParams {
                control_code: 2,
                on_count: 10,
                off_count: 0,
                on_color: color,
                off_color: OsdpLedColor::None,
                // LED timers tick in 100 ms units.
                timer_count: (led.duration_ms / 100).min(u16::MAX as u32) as u16,
            };
            let mut cmd = OsdpCommandLed {
                reader: 0,
                led_number: 0,
                ..Default::default()
            };
            if led.permanent {
                cmd.permanent = params;
            } else {
                cmd.temporary = params;
            }
            OsdpCommand::Led(cmd)
        }
        CodecCommand::Buzzer(buzzer) => OsdpCommand::Buzzer(OsdpCommandBuzzer {
            reader: 0,
            control_code: 2,
            // Buzzer timers tick in 100 ms units.
            on_count: (buzzer.on_time_ms / 100).max(1).min(u8::MAX as u16) as u8,
            off_count: (buzzer.off_time_ms / 100).min(u8::MAX as u16) as u8,
            rep_count: buzzer.count,
        }),
        CodecCommand::Text(text) => OsdpCommand::Text(OsdpCommandText {
            reader: 0,
            control_code: 1,
            temp_time: (text.duration_ms / 1000).min(u8::MAX as u32) as u8,
            offset_row: 0,
            offset_col: 0,
            data: text.text.into_bytes(),
        }),
        CodecCommand::KeySet(key) => OsdpCommand::KeySet(OsdpCommandKeyset {
            key_type: 1,
            data: key.as_bytes().to_vec(),
        }),
    }
}

// The bus worker: owns the ControlPanel context for one serial port.
fn bus_worker(
    params: WorkerParams,
    requests: std_mpsc::Receiver<WorkerRequest>,
    ready: std_mpsc::Sender<core::result::Result<(), String>>,
) {
    let WorkerParams {
        bus,
        port,
        baud,
        devices,
        events_tx,
        stop,
        online,
    } = params;

    let channel = match SerialChannel::open(&port, baud) {
        Ok(channel) => channel,
        Err(e) => {
            let _ = ready.send(Err(format!("cannot open {port}: {e}")));
            return;
        }
    };

    // Device index in the PdInfo vector is LibOSDP's PD handle; keep the
    // index <-> address mapping alongside.
    let addresses: Vec<u8> = devices.iter().map(|d| d.address.as_u8()).collect();
    let mut pd_infos = Vec::with_capacity(devices.len());
    for spec in &devices {
        let info = PdInfoBuilder::new()
            .name(&spec.name)
            .and_then(|b| b.address(spec.address.as_u8() as i32))
            .and_then(|b| b.baud_rate(baud as i32));
        let info = match info {
            Ok(builder) => match spec.secure_channel_key {
                Some(key) => builder.secure_channel_key(*key.as_bytes()),
                None => builder,
            },
            Err(e) => {
                let _ = ready.send(Err(format!("bad device spec: {e}")));
                return;
            }
        };
        pd_infos.push(info);
    }
    let mut cp = match ControlPanelBuilder::new()
        .add_channel(Box::new(channel), pd_infos)
        .build()
    {
        Ok(cp) => cp,
        Err(e) => {
            let _ = ready.send(Err(format!("control panel setup failed: {e}")));
            return;
        }
    };

    {
        let events_tx = events_tx.clone();
        let addresses = addresses.clone();
        cp.set_event_callback(move |pd, event| {
            let Some(&address) = addresses.get(pd as usize) else {
                return 0;
            };
            match event {
                OsdpEvent::CardRead(card) => {
                    let bit_count = if card.length > 0 {
                        card.length
                    } else {
                        card.data.len() * 8
                    };
                    let _ = events_tx.send(synth_packet(
                        bus,
                        address,
                        PacketDirection::Incoming,
                        REPLY_RAW,
                        false,
                    ));
                    let _ = events_tx.send(CodecEvent::CardData {
                        bus,
                        address,
                        data: card.data.clone(),
                        bit_count,
                        format: None,
                    });
                }
                OsdpEvent::KeyPress(keys) => {
                    let _ = events_tx.send(synth_packet(
                        bus,
                        address,
                        PacketDirection::Incoming,
                        REPLY_KEYPAD,
                        false,
                    ));
                    for digit in keys.data.iter().copied() {
                        let _ = events_tx.send(CodecEvent::KeyPress { bus, address, digit });
                    }
                }
                _ => {}
            }
            0
        });
    }

    let _ = ready.send(Ok(()));
    log::info!("bus worker for {port} up with {} device(s)", addresses.len());

    let mut last_online_poll = Instant::now() - ONLINE_POLL_INTERVAL;
    while !stop.load(Ordering::Acquire) {
        cp.refresh();

        while let Ok(request) = requests.try_recv() {
            match request {
                WorkerRequest::Send {
                    address,
                    command,
                    reply,
                } => {
                    let result = match addresses.iter().position(|a| *a == address) {
                        Some(pd) => {
                            let code = command_code(&command);
                            let sent = cp
                                .send_command(pd as i32, into_osdp_command(command))
                                .map_err(|e| e.to_string());
                            if sent.is_ok() {
                                let _ = events_tx.send(synth_packet(
                                    bus,
                                    address,
                                    PacketDirection::Outgoing,
                                    code,
                                    false,
                                ));
                            }
                            sent
                        }
                        None => Err(format!("no device at address {address}")),
                    };
                    let _ = reply.send(result);
                }
            }
        }

        if last_online_poll.elapsed() >= ONLINE_POLL_INTERVAL {
            last_online_poll = Instant::now();
            let mut mask = online.lock().unwrap();
            for (pd, address) in addresses.iter().enumerate() {
                let now_online = cp.is_online(pd as i32);
                let was_online = mask.contains(address);
                if now_online != was_online {
                    if now_online {
                        mask.insert(*address);
                    } else {
                        mask.remove(address);
                    }
                    let _ = events_tx.send(CodecEvent::StatusChange {
                        bus,
                        address: *address,
                        online: now_online,
                    });
                }
            }
        }

        thread::sleep(REFRESH_INTERVAL);
    }
    log::info!("bus worker for {port} stopped");
}
