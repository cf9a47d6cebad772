//! Switch Feed
//!
//! The switch-side collaborator: a stream of debounced switch transitions in
//! real time order. The core consumes [`SwitchFeed`]; concrete feeds here are
//! a tokio channel (tests, embedding) and a line reader (stdin bench use).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use crate::core_types::{SwitchId, Timestamp};

/// One debounced switch transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchEvent {
    pub switch: SwitchId,
    pub active: bool,
    pub timestamp: Timestamp,
}

impl SwitchEvent {
    pub fn new(switch: impl Into<SwitchId>, active: bool, timestamp: Timestamp) -> Self {
        Self {
            switch: switch.into(),
            active,
            timestamp,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SwitchFeedError {
    #[error("Switch channel closed, dropped {0:?}")]
    Closed(SwitchEvent),
}

impl SwitchFeedError {
    pub fn code(&self) -> &'static str {
        match self {
            SwitchFeedError::Closed(_) => "SWITCH_FEED_CLOSED",
        }
    }
}

/// Source of switch events. `None` means the feed has ended.
#[async_trait]
pub trait SwitchFeed: Send {
    async fn next_event(&mut self) -> Option<SwitchEvent>;
}

// ============================================================================
// Channel feed
// ============================================================================

/// Sender side of a channel feed
#[derive(Clone)]
pub struct SwitchSender {
    tx: mpsc::Sender<SwitchEvent>,
}

impl SwitchSender {
    /// Hand one transition to the machine; the event comes back if the
    /// feed is gone
    pub async fn send(&self, event: SwitchEvent) -> Result<(), SwitchFeedError> {
        self.tx
            .send(event)
            .await
            .map_err(|e| SwitchFeedError::Closed(e.0))
    }
}

/// Receiver side of a channel feed
pub struct ChannelSwitchFeed {
    rx: mpsc::Receiver<SwitchEvent>,
}

#[async_trait]
impl SwitchFeed for ChannelSwitchFeed {
    async fn next_event(&mut self) -> Option<SwitchEvent> {
        self.rx.recv().await
    }
}

/// Create a new switch channel pair
pub fn switch_channel(buffer: usize) -> (SwitchSender, ChannelSwitchFeed) {
    let (tx, rx) = mpsc::channel(buffer);
    (SwitchSender { tx }, ChannelSwitchFeed { rx })
}

// ============================================================================
// Line feed
// ============================================================================

/// Milliseconds since the machine started
#[derive(Debug, Clone, Copy)]
pub struct MachineClock {
    start: Instant,
}

impl MachineClock {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> Timestamp {
        self.start.elapsed().as_millis() as Timestamp
    }

    /// Wall instant of machine time `at`
    pub fn instant_at(&self, at: Timestamp) -> Instant {
        self.start + std::time::Duration::from_millis(at)
    }
}

/// Parse `<switch> <1|0|on|off|active|inactive>`
pub fn parse_switch_line(line: &str, timestamp: Timestamp) -> Option<SwitchEvent> {
    let mut parts = line.split_whitespace();
    let switch = parts.next()?;
    let active = match parts.next()?.to_ascii_lowercase().as_str() {
        "1" | "on" | "active" => true,
        "0" | "off" | "inactive" => false,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(SwitchEvent::new(switch, active, timestamp))
}

/// Switch events typed one per line, stamped with the machine clock
pub struct LineSwitchFeed<R> {
    lines: Lines<R>,
    clock: MachineClock,
}

impl<R: AsyncBufRead + Unpin> LineSwitchFeed<R> {
    pub fn new(reader: R, clock: MachineClock) -> Self {
        Self {
            lines: reader.lines(),
            clock,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> SwitchFeed for LineSwitchFeed<R> {
    async fn next_event(&mut self) -> Option<SwitchEvent> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "Switch input failed");
                    return None;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match parse_switch_line(trimmed, self.clock.now_ms()) {
                Some(event) => return Some(event),
                None => warn!(line = trimmed, "Ignoring malformed switch line"),
            }
        }
    }
}
