//! # Mocap Server Core Library
//!
//! This library provides the building blocks of a single-client data-acquisition
//! server. A client connects, asks what the server can do, and then either polls
//! for channel values or asks the server to sample at a fixed rate while it
//! keeps issuing commands.
//!
//! ## Design Philosophy
//!
//! ### One Client, One Thread
//! - **Cooperative loop**: a session waits on exactly two event sources, the
//!   client socket and the next recording tick, and reacts to whichever fires
//!   first
//! - **No shared state**: all mutable state lives in an explicit
//!   [`server::ServerContext`] handed to the session, never in globals
//! - **Synchronous decode**: once a command is dispatched, reading and decoding
//!   a record never suspends
//!
//! ### Last-Good-Sample Semantics
//! A record that runs short of tokens is not an error. Channels that could be
//! filled are updated, the rest keep their previous values. A client polling a
//! slow data source therefore sees repeated, stable snapshots rather than zeros.
//!
//! ### Data Flow
//! 1. **Schedule**: the session decides whether a sample is due ([`schedule`])
//! 2. **Read**: the record reader supplies the last complete line ([`source`])
//! 3. **Decode**: the frame decoder fills channel values in order ([`frame`])
//! 4. **Reply**: a `data` command returns the current snapshot ([`protocol`])
//!
//! ## Core Types
//!
//! - [`Channel`]: a named, fixed-dimension numeric signal and its current value
//! - [`ChannelSnapshot`]: the wire view of one channel's current value
//! - [`Frame`]: the snapshot of every channel with its capture time

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Module declarations
pub mod channels;
pub mod config;
pub mod frame;
pub mod protocol;
pub mod schedule;
pub mod server;
pub mod session;
pub mod source;

/// A named numeric signal sampled once per record.
///
/// The dimension is fixed at creation. `samples` always holds exactly
/// `dimension` values and is overwritten in place on every successful decode.
///
/// # Example
/// ```
/// use mocap_server_lib::Channel;
///
/// let pos = Channel::new("hip_pos", 3);
/// assert_eq!(pos.dimension(), 3);
/// assert_eq!(pos.samples(), &[0.0, 0.0, 0.0]);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Channel {
    name: String,
    samples: Vec<f32>,
}

impl Channel {
    /// Create a channel with all samples zeroed.
    ///
    /// A dimension of zero is bumped to one; the registry parser rejects zero
    /// before it gets here.
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Channel {
            name: name.into(),
            samples: vec![0.0; dimension.max(1)],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Overwrite the current sample vector.
    ///
    /// `values` must have exactly `dimension` entries; the decoder guarantees
    /// this, so a mismatch is a programming error and leaves the channel as is.
    pub fn set_samples(&mut self, values: &[f32]) {
        debug_assert_eq!(values.len(), self.samples.len());
        if values.len() == self.samples.len() {
            self.samples.copy_from_slice(values);
        }
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            name: self.name.clone(),
            values: self.samples.clone(),
        }
    }
}

/// The wire view of one channel's current value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub name: String,
    pub values: Vec<f32>,
}

/// The current value of every channel, in registry order.
///
/// `captured_at` is the time of the last read cycle, whether or not that cycle
/// produced a new record.
///
/// # Example
/// ```
/// use mocap_server_lib::{ChannelSnapshot, Frame};
///
/// let frame = Frame {
///     captured_at: None,
///     channels: vec![ChannelSnapshot { name: "root".into(), values: vec![1.0, 2.0, 3.0] }],
/// };
/// assert_eq!(frame.channels[0].values.len(), 3);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// When the values were last refreshed from the data source
    pub captured_at: Option<DateTime<Utc>>,
    /// One entry per channel, in registry order
    pub channels: Vec<ChannelSnapshot>,
}
