//! # Channel Registry
//!
//! The ordered list of channels the server publishes. It is parsed once from
//! a plain-text configuration and kept for the lifetime of the process; only
//! the sample values change afterwards.
//!
//! ## Configuration format
//!
//! One channel per line, a name followed by a dimension or a usage keyword:
//!
//! ```text
//! # name       dimension
//! hip_pos      position
//! hip_rot      rotation
//! glove        5
//! ```
//!
//! Usage keywords map to fixed dimensions: `position`, `rotation` and `scale`
//! are 3, `quaternion` is 4, `value` and `scalar` are 1.

use crate::{Channel, Frame};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

/// Reasons a registry could not be built.
///
/// None of these are fatal on their own: the caller may retry later, and a
/// client asking for data without a registry gets a protocol error.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("missing channel config")]
    Missing,

    #[error("channel config declares no channels")]
    Empty,

    #[error("channel config IO: {0}")]
    Io(#[from] io::Error),

    #[error("channel config line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// Ordered, fixed-shape collection of channels.
#[derive(Clone, Debug, PartialEq)]
pub struct Registry {
    channels: Vec<Channel>,
    captured_at: Option<DateTime<Utc>>,
}

impl Registry {
    /// Build a registry from an already-open configuration stream.
    ///
    /// `None` means the configuration could not be opened.
    pub fn load<R: BufRead>(source: Option<R>) -> Result<Self, RegistryError> {
        let source = source.ok_or(RegistryError::Missing)?;
        let mut channels = Vec::new();
        let mut seen = HashSet::new();

        for (index, line) in source.lines().enumerate() {
            let line = line?;
            let content = line.split('#').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }

            let mut fields = content.split_whitespace();
            let (Some(name), Some(kind), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(RegistryError::Parse {
                    line: index + 1,
                    reason: format!("expected `<name> <dimension>`, got `{content}`"),
                });
            };

            let dimension = parse_dimension(kind).ok_or_else(|| RegistryError::Parse {
                line: index + 1,
                reason: format!("invalid dimension `{kind}` for channel `{name}`"),
            })?;

            if !seen.insert(name.to_string()) {
                return Err(RegistryError::Parse {
                    line: index + 1,
                    reason: format!("duplicate channel `{name}`"),
                });
            }
            channels.push(Channel::new(name, dimension));
        }

        if channels.is_empty() {
            return Err(RegistryError::Empty);
        }
        log::info!("Loaded {} channels", channels.len());
        Ok(Registry {
            channels,
            captured_at: None,
        })
    }

    /// Open and parse the configuration file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        log::debug!("Reading channel config {}", path.display());
        Self::load(file)
    }

    pub fn from_channels(channels: Vec<Channel>) -> Self {
        Registry {
            channels,
            captured_at: None,
        }
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut [Channel] {
        &mut self.channels
    }

    /// Total number of values in one record.
    pub fn record_width(&self) -> usize {
        self.channels.iter().map(Channel::dimension).sum()
    }

    /// Record the time of the last read cycle.
    pub fn mark_captured(&mut self, at: DateTime<Utc>) {
        self.captured_at = Some(at);
    }

    /// Current values of every channel, in registry order.
    pub fn snapshot(&self) -> Frame {
        Frame {
            captured_at: self.captured_at,
            channels: self.channels.iter().map(Channel::snapshot).collect(),
        }
    }
}

fn parse_dimension(token: &str) -> Option<usize> {
    match token.to_ascii_lowercase().as_str() {
        "position" | "rotation" | "scale" => Some(3),
        "quaternion" => Some(4),
        "value" | "scalar" => Some(1),
        other => other.parse::<usize>().ok().filter(|&d| d >= 1),
    }
}
