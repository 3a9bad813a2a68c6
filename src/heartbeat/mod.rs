use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::transport::{Broadcaster, TransportError};
use crate::wire::codec::{CodecError, WireCodec};

pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_INTERVAL_MS: u64 = 5_000;

#[derive(Debug)]
pub enum HeartbeatError {
    InvalidInterval { provided_ms: u64 },
    Encode(CodecError),
    Publish(TransportError),
}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval { provided_ms } => write!(
                f,
                "heartbeat interval must be between {MIN_INTERVAL_MS}ms and {MAX_INTERVAL_MS}ms, got {provided_ms}ms"
            ),
            Self::Encode(source) => write!(f, "failed to encode heartbeat frame: {source}"),
            Self::Publish(source) => write!(f, "failed to publish heartbeat: {source}"),
        }
    }
}

impl std::error::Error for HeartbeatError {}

pub fn validate_interval(interval_ms: u64) -> Result<Duration, HeartbeatError> {
    if (MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms) {
        Ok(Duration::from_millis(interval_ms))
    } else {
        Err(HeartbeatError::InvalidInterval {
            provided_ms: interval_ms,
        })
    }
}

/// Next-fire bookkeeping. `next_at` is always computed as `now + interval`.
#[derive(Clone, Copy, Debug)]
pub struct HeartbeatSchedule {
    interval: Duration,
    next_at: Instant,
}

impl HeartbeatSchedule {
    pub fn starting_at(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next_at: now + interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_at(&self) -> Instant {
        self.next_at
    }

    pub fn time_until_due(&self, now: Instant) -> Duration {
        self.next_at.saturating_duration_since(now)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_at
    }

    pub fn reschedule(&mut self, now: Instant) {
        self.next_at = now + self.interval;
    }
}

pub struct HeartbeatPublisher {
    pub initiated_at: DateTime<Utc>,
    broadcaster: Box<dyn Broadcaster>,
    codec: WireCodec,
    schedule: HeartbeatSchedule,
    sequence: u64,
}

impl HeartbeatPublisher {
    pub fn new(
        broadcaster: Box<dyn Broadcaster>,
        codec: WireCodec,
        interval: Duration,
    ) -> Result<Self, HeartbeatError> {
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        let interval = validate_interval(interval_ms)?;

        Ok(Self {
            initiated_at: Utc::now(),
            broadcaster,
            codec,
            schedule: HeartbeatSchedule::starting_at(interval, Instant::now()),
            sequence: 0,
        })
    }

    pub fn schedule(&self) -> &HeartbeatSchedule {
        &self.schedule
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.broadcaster.local_addr()
    }

    pub fn time_until_due(&self) -> Duration {
        self.schedule.time_until_due(Instant::now())
    }

    pub fn publish_if_due(&mut self) -> Result<bool, HeartbeatError> {
        if !self.schedule.is_due(Instant::now()) {
            return Ok(false);
        }
        self.publish()?;
        Ok(true)
    }

    /// Emits one frame and restarts the interval, even if the send fails.
    pub fn publish(&mut self) -> Result<usize, HeartbeatError> {
        self.schedule.reschedule(Instant::now());

        let body = self
            .codec
            .encode_heartbeat(self.sequence, Utc::now())
            .map_err(HeartbeatError::Encode)?;
        self.sequence += 1;

        self.broadcaster
            .publish(&body)
            .map_err(HeartbeatError::Publish)
    }

    pub fn initial_metadata_payload(&self) -> Value {
        json!({
            "initiated_at": self.initiated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "interval_ms": self.schedule.interval().as_millis() as u64,
            "address": self.local_addr().map(|addr| addr.to_string())
        })
    }

    pub fn shutdown(&mut self) {
        self.broadcaster.shutdown();
    }
}

impl fmt::Debug for HeartbeatPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatPublisher")
            .field("schedule", &self.schedule)
            .field("sequence", &self.sequence)
            .finish()
    }
}
