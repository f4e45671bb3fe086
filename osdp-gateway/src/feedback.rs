//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Reader feedback: what a reader shows and sounds after an event has been
//! processed, plus the idle-state LED behavior while nothing is happening.

use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::store::GatewayStore;
use crate::GatewayError;

type Result<T> = core::result::Result<T, GatewayError>;

/// Maximum display text length an OSDP text command can carry on a single
/// row of a 16x2 reader display.
pub const MAX_DISPLAY_TEXT: usize = 16;

/// Domain LED colors. Not every reader has every color; the codec maps
/// unknown colors to red.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedColor {
    /// LED off.
    #[default]
    Off,
    /// Red.
    Red,
    /// Green.
    Green,
    /// Amber.
    Amber,
    /// Blue.
    Blue,
}

impl FromStr for LedColor {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Off" | "off" => Ok(LedColor::Off),
            "Red" | "red" => Ok(LedColor::Red),
            "Green" | "green" => Ok(LedColor::Green),
            "Amber" | "amber" => Ok(LedColor::Amber),
            "Blue" | "blue" => Ok(LedColor::Blue),
            _ => Err(GatewayError::Config(format!("invalid LED color: {s}"))),
        }
    }
}

/// What kind of feedback a [`ReaderFeedback`] record represents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedbackKind {
    /// Do nothing.
    None,
    /// Configured reaction to a successful event.
    #[default]
    Success,
    /// Configured reaction to a failed event.
    Failure,
    /// Ad-hoc feedback issued by an administrator.
    Custom,
}

/// One feedback command for a reader: LED, buzzer and display text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderFeedback {
    /// Feedback kind.
    pub kind: FeedbackKind,
    /// LED color; [`LedColor::Off`] suppresses the LED command.
    pub led_color: LedColor,
    /// How long the LED stays on, in milliseconds.
    pub led_duration_ms: u32,
    /// Number of beeps; 0 suppresses the buzzer command.
    pub beep_count: u8,
    /// Text to show on the reader display, at most [`MAX_DISPLAY_TEXT`]
    /// characters; `None` suppresses the text command.
    pub display_text: Option<String>,
}

impl ReaderFeedback {
    /// Feedback that does nothing at all.
    pub fn none() -> Self {
        Self {
            kind: FeedbackKind::None,
            led_color: LedColor::Off,
            led_duration_ms: 0,
            beep_count: 0,
            display_text: None,
        }
    }

    /// Built-in success fallback: green for a second, one beep. Used when
    /// the feedback store cannot be read.
    pub fn fallback_success() -> Self {
        Self {
            kind: FeedbackKind::Success,
            led_color: LedColor::Green,
            led_duration_ms: 1000,
            beep_count: 1,
            display_text: None,
        }
    }

    /// Built-in failure fallback: red for two seconds, three beeps.
    pub fn fallback_failure() -> Self {
        Self {
            kind: FeedbackKind::Failure,
            led_color: LedColor::Red,
            led_duration_ms: 2000,
            beep_count: 3,
            display_text: None,
        }
    }

    /// Validate duration and text limits.
    pub fn validate(&self) -> Result<()> {
        if self.led_color != LedColor::Off && self.led_duration_ms == 0 {
            return Err(GatewayError::Config(
                "LED duration must be positive when the LED is lit".into(),
            ));
        }
        if let Some(text) = &self.display_text {
            if text.chars().count() > MAX_DISPLAY_TEXT {
                return Err(GatewayError::Config(format!(
                    "display text exceeds {MAX_DISPLAY_TEXT} characters"
                )));
            }
        }
        Ok(())
    }
}

/// LED behavior of an online reader that is not processing anything: a
/// permanent color, plus a heartbeat color flashed every five seconds so an
/// operator can see at a glance that the reader is being polled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleStateFeedback {
    /// Color the LED holds while idle.
    pub permanent_color: LedColor,
    /// Color flashed briefly on each heartbeat.
    pub heartbeat_color: LedColor,
}

impl Default for IdleStateFeedback {
    fn default() -> Self {
        Self {
            permanent_color: LedColor::Red,
            heartbeat_color: LedColor::Amber,
        }
    }
}

/// Interval between idle heartbeat flashes.
pub const IDLE_HEARTBEAT_SECS: u64 = 5;

/// The singleton feedback configuration: one success record, one failure
/// record, one idle-state record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Applied when the plugin chain approves an event.
    pub success: ReaderFeedback,
    /// Applied when the plugin chain rejects or fails.
    pub failure: ReaderFeedback,
    /// Idle LED behavior.
    pub idle: IdleStateFeedback,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            success: ReaderFeedback {
                display_text: Some("ACCESS GRANTED".into()),
                ..ReaderFeedback::fallback_success()
            },
            failure: ReaderFeedback {
                display_text: Some("ACCESS DENIED".into()),
                ..ReaderFeedback::fallback_failure()
            },
            idle: IdleStateFeedback::default(),
        }
    }
}

impl FeedbackConfig {
    /// Validate all three records.
    pub fn validate(&self) -> Result<()> {
        self.success.validate()?;
        self.failure.validate()?;
        Ok(())
    }
}

/// Repository-backed accessor for the singleton [`FeedbackConfig`], with a
/// small cache so the pipeline does not hit storage per event.
pub struct FeedbackConfigService {
    store: Arc<dyn GatewayStore>,
    cache: RwLock<Option<FeedbackConfig>>,
}

impl FeedbackConfigService {
    /// Create a service over the given repository.
    pub fn new(store: Arc<dyn GatewayStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
        }
    }

    /// Current configuration. Falls back to [`FeedbackConfig::default`] when
    /// nothing has been stored yet; storage errors propagate so the caller
    /// can decide on its own fallback.
    pub async fn get(&self) -> Result<FeedbackConfig> {
        if let Some(config) = self.cache.read().clone() {
            return Ok(config);
        }
        let config = self.store.load_feedback().await?.unwrap_or_default();
        *self.cache.write() = Some(config.clone());
        Ok(config)
    }

    /// Replace the configuration.
    pub async fn set(&self, config: FeedbackConfig) -> Result<()> {
        config.validate()?;
        self.store.save_feedback(&config).await?;
        *self.cache.write() = Some(config);
        Ok(())
    }

    /// Drop the cache; the next [`get`](Self::get) reloads from storage.
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }
}

impl std::fmt::Debug for FeedbackConfigService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackConfigService").finish()
    }
}
