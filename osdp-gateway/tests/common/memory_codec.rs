//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! An in-memory OSDP codec suitable for testing: registration is recorded,
//! commands are captured, and tests script the event stream (card reads,
//! key presses, status changes, packet captures) by hand.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use osdp_gateway::{
    BaudRate, BusId, CodecCommand, CodecEvent, DeviceSpec, GatewayError, OsdpAddress, OsdpCodec,
    PacketDirection, RawPacket, SecureKey,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Default)]
struct State {
    next_bus: u32,
    buses: HashMap<String, BusId>,
    devices: HashMap<(BusId, u8), DeviceSpec>,
    sent: Vec<(BusId, u8, CodecCommand)>,
    online: HashSet<(BusId, u8)>,
    fail_ports: HashSet<String>,
    fail_sends: bool,
}

pub struct MemoryCodec {
    state: Mutex<State>,
    events_tx: mpsc::UnboundedSender<CodecEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<CodecEvent>>>,
}

#[allow(dead_code)]
impl MemoryCodec {
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(State::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Make `open_bus` fail for a port, as a missing or busy serial device
    /// would.
    pub fn fail_port(&self, port: &str) {
        self.state.lock().fail_ports.insert(port.to_owned());
    }

    /// Make every subsequent `send` fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    pub fn bus_for(&self, port: &str) -> Option<BusId> {
        self.state.lock().buses.get(port).copied()
    }

    pub fn registered_key(&self, port: &str, address: u8) -> Option<Option<SecureKey>> {
        let state = self.state.lock();
        let bus = *state.buses.get(port)?;
        state
            .devices
            .get(&(bus, address))
            .map(|spec| spec.secure_channel_key)
    }

    pub fn is_registered(&self, port: &str, address: u8) -> bool {
        self.registered_key(port, address).is_some()
    }

    /// Every command sent so far, in order.
    pub fn sent_commands(&self) -> Vec<(BusId, u8, CodecCommand)> {
        self.state.lock().sent.clone()
    }

    /// Commands sent to one address.
    pub fn commands_for(&self, address: u8) -> Vec<CodecCommand> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(_, a, _)| *a == address)
            .map(|(_, _, c)| c.clone())
            .collect()
    }

    /// Keys installed on one address via KEYSET, in order.
    pub fn installed_keys(&self, address: u8) -> Vec<SecureKey> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|(_, a, c)| match c {
                CodecCommand::KeySet(key) if *a == address => Some(*key),
                _ => None,
            })
            .collect()
    }

    fn bus(&self, port: &str) -> BusId {
        self.bus_for(port).expect("bus not open")
    }

    /// Simulate the device answering polls.
    pub fn go_online(&self, port: &str, address: u8) {
        let bus = self.bus(port);
        self.state.lock().online.insert((bus, address));
        let _ = self.events_tx.send(CodecEvent::StatusChange {
            bus,
            address,
            online: true,
        });
    }

    /// Simulate a poll timeout.
    pub fn go_offline(&self, port: &str, address: u8) {
        let bus = self.bus(port);
        self.state.lock().online.remove(&(bus, address));
        let _ = self.events_tx.send(CodecEvent::StatusChange {
            bus,
            address,
            online: false,
        });
    }

    /// Simulate a raw card data reply.
    pub fn present_card(&self, port: &str, address: u8, data: &[u8], bit_count: usize) {
        let bus = self.bus(port);
        let _ = self.events_tx.send(CodecEvent::CardData {
            bus,
            address,
            data: data.to_vec(),
            bit_count,
            format: None,
        });
    }

    /// Simulate one keypad digit.
    pub fn press_key(&self, port: &str, address: u8, digit: char) {
        let bus = self.bus(port);
        let _ = self.events_tx.send(CodecEvent::KeyPress {
            bus,
            address,
            digit: digit as u8,
        });
    }

    /// Simulate a captured frame.
    pub fn emit_packet(
        &self,
        port: &str,
        address: u8,
        direction: PacketDirection,
        code: u8,
        sequence: u8,
    ) {
        let bus = self.bus(port);
        let _ = self.events_tx.send(CodecEvent::Packet(RawPacket {
            bus,
            address,
            direction,
            code,
            sequence,
            secure: false,
            valid: true,
            error: None,
            payload: vec![0x53, address, 0x08, 0x00, code],
            at: Utc::now(),
        }));
    }
}

#[async_trait]
impl OsdpCodec for MemoryCodec {
    async fn open_bus(&self, port: &str, _baud_rate: BaudRate) -> Result<BusId, GatewayError> {
        let mut state = self.state.lock();
        if state.fail_ports.contains(port) {
            return Err(GatewayError::Transport(format!("cannot open {port}")));
        }
        if state.buses.contains_key(port) {
            return Err(GatewayError::Transport(format!("{port} is already open")));
        }
        let id = BusId(state.next_bus);
        state.next_bus += 1;
        state.buses.insert(port.to_owned(), id);
        Ok(id)
    }

    async fn close_bus(&self, bus: BusId) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        state.buses.retain(|_, id| *id != bus);
        state.devices.retain(|(b, _), _| *b != bus);
        state.online.retain(|(b, _)| *b != bus);
        Ok(())
    }

    async fn register_device(&self, bus: BusId, spec: DeviceSpec) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        let key = (bus, spec.address.as_u8());
        if state.devices.contains_key(&key) {
            return Err(GatewayError::Transport(format!(
                "address {} already registered",
                spec.address
            )));
        }
        state.devices.insert(key, spec);
        Ok(())
    }

    async fn unregister_device(&self, bus: BusId, address: OsdpAddress) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        state.devices.remove(&(bus, address.as_u8()));
        state.online.remove(&(bus, address.as_u8()));
        Ok(())
    }

    async fn is_online(&self, bus: BusId, address: OsdpAddress) -> bool {
        self.state.lock().online.contains(&(bus, address.as_u8()))
    }

    async fn send(
        &self,
        bus: BusId,
        address: OsdpAddress,
        command: CodecCommand,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(GatewayError::Transport("send failed".into()));
        }
        if !state.devices.contains_key(&(bus, address.as_u8())) {
            return Err(GatewayError::Transport(format!(
                "no device at {bus}/{address}"
            )));
        }
        state.sent.push((bus, address.as_u8(), command));
        Ok(())
    }

    fn events(&self) -> mpsc::UnboundedReceiver<CodecEvent> {
        self.events_rx
            .lock()
            .take()
            .expect("event stream already taken")
    }
}
