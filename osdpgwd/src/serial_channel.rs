//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! OSDP serial channel: a [`libosdp::Channel`] over an RS-485 adapter.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::time::Duration;

use libosdp::ChannelError;

type Result<T> = anyhow::Result<T, anyhow::Error>;

/// LibOSDP channel backed by a serial port. Reads are non-blocking-ish: a
/// short timeout keeps the refresh loop honest on a quiet bus.
pub struct SerialChannel {
    id: i32,
    port: Box<dyn serialport::SerialPort>,
}

pub fn str_to_channel_id(key: &str) -> i32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let mut id: u64 = hasher.finish();
    id = (id >> 32) ^ id & 0xffffffff;
    id as i32
}

impl SerialChannel {
    /// Open `path` at `baud_rate`, 8N1 (the OSDP line discipline).
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(10))
            .open()?;
        Ok(Self {
            id: str_to_channel_id(path),
            port,
        })
    }
}

impl std::fmt::Debug for SerialChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialChannel").field("id", &self.id).finish()
    }
}

impl libosdp::Channel for SerialChannel {
    fn get_id(&self) -> i32 {
        self.id
    }

    fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, ChannelError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(ChannelError::WouldBlock),
            Err(e) => Err(ChannelError::from(e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> core::result::Result<usize, ChannelError> {
        self.port.write(buf).map_err(ChannelError::from)
    }

    fn flush(&mut self) -> core::result::Result<(), ChannelError> {
        self.port.flush().map_err(ChannelError::from)
    }
}
