//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! One peripheral device on its bus: online/offline state machine, security
//! sub-state, conversion of decoded replies into domain events, and
//! feedback delivery. Sessions are owned exclusively by the bus manager and
//! hold only a non-owning codec handle back to their bus.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::codec::{
    BusId, BuzzerCommand, CodecCommand, LedCommand, OsdpCodec, TextCommand,
};
use crate::events::{CardReadEvent, PinDigitEvent, StatusChangeEvent};
use crate::feedback::{FeedbackKind, IdleStateFeedback, LedColor, ReaderFeedback, MAX_DISPLAY_TEXT};
use crate::reader::{ReaderConfig, SecureKey, SecurityMode};
use crate::GatewayError;

type Result<T> = core::result::Result<T, GatewayError>;

/// Beep cadence used when translating a beep count into the buzzer
/// primitive.
const BEEP_ON_MS: u16 = 200;
const BEEP_OFF_MS: u16 = 200;

/// Heartbeat flash length.
const HEARTBEAT_FLASH_MS: u32 = 300;

/// Lifecycle of a device session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// Session exists but is not registered with the codec yet.
    Created,
    /// Registered with the codec; polling, no ACK observed yet.
    Registered,
    /// Answering polls.
    Online,
    /// Removed from its bus (or the bus stopped). Terminal.
    Detached,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DeviceState::Created => "Created",
            DeviceState::Registered => "Registered",
            DeviceState::Online => "Online",
            DeviceState::Detached => "Detached",
        })
    }
}

/// Security sub-state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SecurityState {
    ClearText,
    /// Brought up on the default base key; a random key will be installed
    /// on first contact.
    InstallArmed,
    Secure,
}

/// Point-in-time view of a session, for the control surface.
#[derive(Clone, Debug)]
pub struct DeviceStatus {
    /// Reader identity.
    pub reader_id: crate::reader::ReaderId,
    /// Reader name.
    pub name: String,
    /// Serial port of the bus.
    pub port: String,
    /// OSDP address.
    pub address: crate::reader::OsdpAddress,
    /// Lifecycle state.
    pub state: DeviceState,
    /// Convenience flag: `state == Online`.
    pub online: bool,
    /// Effective security mode.
    pub security_mode: SecurityMode,
}

/// One reader's live session.
pub struct DeviceSession {
    config: ReaderConfig,
    bus: BusId,
    codec: Arc<dyn OsdpCodec>,
    state: Mutex<DeviceState>,
    security: Mutex<SecurityState>,
    pin_sequence: AtomicU64,
    last_activity: Mutex<Instant>,
    installing: AtomicBool,
}

impl DeviceSession {
    /// Create a session for a validated reader configuration.
    pub fn new(config: ReaderConfig, bus: BusId, codec: Arc<dyn OsdpCodec>) -> Self {
        let security = match config.security_mode {
            SecurityMode::ClearText => SecurityState::ClearText,
            SecurityMode::Install => SecurityState::InstallArmed,
            SecurityMode::Secure => SecurityState::Secure,
        };
        Self {
            config,
            bus,
            codec,
            state: Mutex::new(DeviceState::Created),
            security: Mutex::new(security),
            pin_sequence: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            installing: AtomicBool::new(false),
        }
    }

    /// The configuration this session was created from.
    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Bus the session lives on.
    pub fn bus(&self) -> BusId {
        self.bus
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    /// Effective security mode, reflecting a completed installation.
    pub fn security_mode(&self) -> SecurityMode {
        match *self.security.lock() {
            SecurityState::ClearText => SecurityMode::ClearText,
            SecurityState::InstallArmed => SecurityMode::Install,
            SecurityState::Secure => SecurityMode::Secure,
        }
    }

    /// Status snapshot.
    pub fn status(&self) -> DeviceStatus {
        let state = self.state();
        DeviceStatus {
            reader_id: self.config.id,
            name: self.config.name.clone(),
            port: self.config.port.clone(),
            address: self.config.address,
            state,
            online: state == DeviceState::Online,
            security_mode: self.security_mode(),
        }
    }

    fn status_event(&self, online: bool, message: Option<String>) -> StatusChangeEvent {
        StatusChangeEvent {
            reader_id: self.config.id,
            reader_name: self.config.name.clone(),
            online,
            message,
        }
    }

    /// Codec registration done; the device is being polled.
    pub fn mark_registered(&self) {
        let mut state = self.state.lock();
        if *state == DeviceState::Created {
            *state = DeviceState::Registered;
        }
    }

    /// Apply an observed online/offline change. Returns the status event to
    /// publish when the observation is an actual transition.
    pub fn set_online(&self, online: bool) -> Option<StatusChangeEvent> {
        let mut state = self.state.lock();
        match (*state, online) {
            (DeviceState::Registered, true) => {
                *state = DeviceState::Online;
                *self.last_activity.lock() = Instant::now();
                Some(self.status_event(true, None))
            }
            (DeviceState::Online, false) => {
                // Poll timeout; keep polling for recovery.
                *state = DeviceState::Registered;
                Some(self.status_event(false, None))
            }
            _ => None,
        }
    }

    /// Tear the session down. Returns the offline status event when the
    /// device was online.
    pub fn detach(&self) -> Option<StatusChangeEvent> {
        let mut state = self.state.lock();
        let was_online = *state == DeviceState::Online;
        *state = DeviceState::Detached;
        was_online.then(|| self.status_event(false, None))
    }

    /// Whether this session still has a random-key installation pending.
    pub fn install_pending(&self) -> bool {
        *self.security.lock() == SecurityState::InstallArmed
    }

    /// Claim the installation slot. At most one caller wins until
    /// [`abort_install`](Self::abort_install) or
    /// [`complete_install`](Self::complete_install).
    pub fn begin_install(&self) -> bool {
        self.install_pending()
            && self
                .installing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Installation failed; stay armed for the next opportunity.
    pub fn abort_install(&self) {
        self.installing.store(false, Ordering::Release);
    }

    /// Installation succeeded and the new key is persisted.
    pub fn complete_install(&self, _key: SecureKey) {
        *self.security.lock() = SecurityState::Secure;
        self.installing.store(false, Ordering::Release);
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Whether the reader has been quiet for at least `window`.
    pub fn is_idle(&self, window: Duration) -> bool {
        self.state() == DeviceState::Online
            && self.last_activity.lock().elapsed() >= window
    }

    /// Build the card event for a raw card data reply.
    pub fn handle_card_reply(&self, data: &[u8], bit_count: usize) -> CardReadEvent {
        self.touch();
        log::debug!(
            "reader {}: card reply, {bit_count} bit(s)",
            self.config.name
        );
        CardReadEvent::from_wire(self.config.id, data, bit_count)
    }

    /// Build the digit event for a keypad reply.
    pub fn handle_key_press(&self, digit: u8) -> PinDigitEvent {
        self.touch();
        PinDigitEvent {
            reader_id: self.config.id,
            at: Utc::now(),
            digit: digit as char,
            sequence: self.pin_sequence.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    /// Deliver feedback: LED, then buzzer, then text, each only when the
    /// record asks for it. Succeeds only if every issued primitive
    /// succeeds.
    pub async fn send_feedback(&self, feedback: &ReaderFeedback) -> Result<()> {
        if feedback.kind == FeedbackKind::None {
            return Ok(());
        }
        let address = self.config.address;
        if feedback.led_color != LedColor::Off && feedback.led_duration_ms > 0 {
            self.codec
                .send(
                    self.bus,
                    address,
                    CodecCommand::Led(LedCommand {
                        color: feedback.led_color.into(),
                        duration_ms: feedback.led_duration_ms,
                        permanent: false,
                    }),
                )
                .await?;
        }
        if feedback.beep_count > 0 {
            self.codec
                .send(
                    self.bus,
                    address,
                    CodecCommand::Buzzer(BuzzerCommand {
                        count: feedback.beep_count,
                        on_time_ms: BEEP_ON_MS,
                        off_time_ms: BEEP_OFF_MS,
                    }),
                )
                .await?;
        }
        if let Some(text) = &feedback.display_text {
            if !text.is_empty() {
                let text: String = text.chars().take(MAX_DISPLAY_TEXT).collect();
                self.codec
                    .send(
                        self.bus,
                        address,
                        CodecCommand::Text(TextCommand {
                            text,
                            duration_ms: feedback.led_duration_ms,
                        }),
                    )
                    .await?;
            }
        }
        self.touch();
        Ok(())
    }

    /// Hold the idle permanent LED color. Called when the device comes
    /// online.
    pub async fn apply_idle_state(&self, idle: &IdleStateFeedback) -> Result<()> {
        if idle.permanent_color == LedColor::Off {
            return Ok(());
        }
        self.codec
            .send(
                self.bus,
                self.config.address,
                CodecCommand::Led(LedCommand {
                    color: idle.permanent_color.into(),
                    duration_ms: 0,
                    permanent: true,
                }),
            )
            .await
    }

    /// Flash the heartbeat color. Deliberately does not count as activity,
    /// so an idle reader stays idle.
    pub async fn send_heartbeat(&self, idle: &IdleStateFeedback) -> Result<()> {
        if idle.heartbeat_color == LedColor::Off {
            return Ok(());
        }
        self.codec
            .send(
                self.bus,
                self.config.address,
                CodecCommand::Led(LedCommand {
                    color: idle.heartbeat_color.into(),
                    duration_ms: HEARTBEAT_FLASH_MS,
                    permanent: false,
                }),
            )
            .await
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("reader", &self.config.name)
            .field("address", &self.config.address)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::ReaderConfigBuilder;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use tokio::sync::mpsc;

    /// Codec stub that records sends.
    #[derive(Default)]
    struct RecordingCodec {
        sent: PlMutex<Vec<CodecCommand>>,
        fail_sends: AtomicBool,
    }

    #[async_trait]
    impl OsdpCodec for RecordingCodec {
        async fn open_bus(
            &self,
            _port: &str,
            _baud: crate::reader::BaudRate,
        ) -> Result<BusId> {
            Ok(BusId(0))
        }
        async fn close_bus(&self, _bus: BusId) -> Result<()> {
            Ok(())
        }
        async fn register_device(
            &self,
            _bus: BusId,
            _spec: crate::codec::DeviceSpec,
        ) -> Result<()> {
            Ok(())
        }
        async fn unregister_device(
            &self,
            _bus: BusId,
            _address: crate::reader::OsdpAddress,
        ) -> Result<()> {
            Ok(())
        }
        async fn is_online(&self, _bus: BusId, _address: crate::reader::OsdpAddress) -> bool {
            false
        }
        async fn send(
            &self,
            _bus: BusId,
            _address: crate::reader::OsdpAddress,
            command: CodecCommand,
        ) -> Result<()> {
            if self.fail_sends.load(Ordering::Relaxed) {
                return Err(GatewayError::Transport("send failed".into()));
            }
            self.sent.lock().push(command);
            Ok(())
        }
        fn events(&self) -> mpsc::UnboundedReceiver<crate::codec::CodecEvent> {
            mpsc::unbounded_channel().1
        }
    }

    fn session_with(codec: Arc<RecordingCodec>) -> DeviceSession {
        let config = ReaderConfigBuilder::new()
            .name("door")
            .unwrap()
            .port("/dev/ttyUSB0")
            .unwrap()
            .build()
            .unwrap();
        DeviceSession::new(config, BusId(0), codec)
    }

    #[test]
    fn state_machine_transitions() {
        let session = session_with(Arc::new(RecordingCodec::default()));
        assert_eq!(session.state(), DeviceState::Created);
        // Not registered yet: an online observation is ignored.
        assert!(session.set_online(true).is_none());

        session.mark_registered();
        let up = session.set_online(true).unwrap();
        assert!(up.online);
        assert_eq!(session.state(), DeviceState::Online);
        // Repeated online observations are not transitions.
        assert!(session.set_online(true).is_none());

        let down = session.set_online(false).unwrap();
        assert!(!down.online);
        assert_eq!(session.state(), DeviceState::Registered);

        session.set_online(true).unwrap();
        let detached = session.detach().unwrap();
        assert!(!detached.online);
        assert_eq!(session.state(), DeviceState::Detached);
    }

    #[test]
    fn detach_when_offline_is_silent() {
        let session = session_with(Arc::new(RecordingCodec::default()));
        session.mark_registered();
        assert!(session.detach().is_none());
    }

    #[test]
    fn pin_sequence_is_monotonic() {
        let session = session_with(Arc::new(RecordingCodec::default()));
        let a = session.handle_key_press(b'1');
        let b = session.handle_key_press(b'2');
        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
        assert_eq!(a.digit, '1');
    }

    #[tokio::test]
    async fn feedback_issues_all_three_primitives() {
        let codec = Arc::new(RecordingCodec::default());
        let session = session_with(Arc::clone(&codec));
        let feedback = ReaderFeedback {
            kind: FeedbackKind::Success,
            led_color: LedColor::Green,
            led_duration_ms: 1000,
            beep_count: 1,
            display_text: Some("ACCESS GRANTED".into()),
        };
        session.send_feedback(&feedback).await.unwrap();
        let sent = codec.sent.lock();
        assert_eq!(sent.len(), 3);
        assert!(matches!(
            &sent[0],
            CodecCommand::Led(LedCommand {
                color: crate::codec::CodecLedColor::Green,
                duration_ms: 1000,
                permanent: false,
            })
        ));
        assert!(matches!(&sent[1], CodecCommand::Buzzer(b) if b.count == 1));
        assert!(matches!(&sent[2], CodecCommand::Text(t) if t.text == "ACCESS GRANTED"));
    }

    #[tokio::test]
    async fn feedback_skips_unrequested_primitives() {
        let codec = Arc::new(RecordingCodec::default());
        let session = session_with(Arc::clone(&codec));
        let feedback = ReaderFeedback {
            kind: FeedbackKind::Failure,
            led_color: LedColor::Off,
            led_duration_ms: 0,
            beep_count: 2,
            display_text: None,
        };
        session.send_feedback(&feedback).await.unwrap();
        let sent = codec.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], CodecCommand::Buzzer(_)));
    }

    #[tokio::test]
    async fn feedback_failure_propagates() {
        let codec = Arc::new(RecordingCodec::default());
        codec.fail_sends.store(true, Ordering::Relaxed);
        let session = session_with(Arc::clone(&codec));
        let result = session.send_feedback(&ReaderFeedback::fallback_failure()).await;
        assert!(result.is_err());
    }

    #[test]
    fn install_slot_is_exclusive() {
        let config = ReaderConfigBuilder::new()
            .name("door")
            .unwrap()
            .port("p")
            .unwrap()
            .security_mode(SecurityMode::Install)
            .build()
            .unwrap();
        let session = DeviceSession::new(config, BusId(0), Arc::new(RecordingCodec::default()));
        assert!(session.install_pending());
        assert!(session.begin_install());
        assert!(!session.begin_install());
        session.abort_install();
        assert!(session.begin_install());
        session.complete_install(SecureKey::new([1; 16]));
        assert_eq!(session.security_mode(), SecurityMode::Secure);
        assert!(!session.begin_install());
    }
}
