//! # Recording Schedule
//!
//! The recording-rate state machine of a session. While idle the session
//! waits for commands only; while recording it also owns a tick schedule and
//! samples the data source once per tick.
//!
//! ## Catch-up
//!
//! A session that wakes up late does not skip ticks. Every tick that fell due
//! since the last one is sampled, in order, before the session waits again:
//! with a 100 ms period and a 350 ms delay, three samples are taken and the
//! next tick lands 50 ms in the future.

use tokio::time::{Duration, Instant};

/// Recording rates the server is willing to grant, in Hz.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimits {
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

impl RateLimits {
    /// Recording is offered only when the maximum rate is positive.
    pub fn can_stream(&self) -> bool {
        self.max > 0.0
    }

    /// Clamp a client-requested rate into `[min, max]`.
    ///
    /// A non-finite request falls back to the default rate, itself clamped.
    pub fn clamp(&self, requested: f64) -> f64 {
        let requested = if requested.is_finite() {
            requested
        } else {
            self.default
        };
        if requested < self.min {
            self.min
        } else if requested > self.max {
            self.max
        } else {
            requested
        }
    }
}

/// Tick schedule for one recording run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecordingSchedule {
    period: Duration,
    next: Option<Instant>,
}

impl RecordingSchedule {
    /// `None` unless `rate` is positive and yields a representable period.
    ///
    /// The first tick is due immediately.
    pub fn new(rate: f64) -> Option<Self> {
        if !(rate > 0.0) {
            return None;
        }
        let period = Duration::try_from_secs_f64(1.0 / rate).ok()?;
        if period.is_zero() {
            return None;
        }
        Some(RecordingSchedule {
            period,
            next: None,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// The next scheduled tick, `None` until the first one has been taken.
    pub fn next_tick(&self) -> Option<Instant> {
        self.next
    }

    /// Take one due tick, if any, and move the schedule forward by a period.
    ///
    /// Call repeatedly until it returns `None` to replay every missed tick.
    pub fn take_due(&mut self, now: Instant) -> Option<Instant> {
        let due = *self.next.get_or_insert(now);
        if due > now {
            return None;
        }
        self.next = Some(due + self.period);
        Some(due)
    }

    /// Take every due tick and return how many there were.
    pub fn take_all_due(&mut self, now: Instant) -> usize {
        std::iter::from_fn(|| self.take_due(now)).count()
    }
}

/// Whether a session is sampling on its own.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum RecordState {
    #[default]
    Idle,
    Recording(RecordingSchedule),
}

impl RecordState {
    pub fn is_recording(&self) -> bool {
        matches!(self, RecordState::Recording(_))
    }
}
