//! # Protocol Codec
//!
//! Commands and replies travel as one JSON object per line. Commands are
//! tagged by `"command"`, replies by `"reply"`:
//!
//! ```text
//! -> {"command":"info"}
//! <- {"reply":"info","min_rate":1.0,"max_rate":300.0,"default_rate":60.0,...}
//! -> {"command":"start_record","rate":10.0,"size":600}
//! <- {"reply":"record_started","rate":10.0,"size":600}
//! ```
//!
//! A line that does not parse, or names a command the server does not know,
//! decodes as [`Command::Unknown`] so the session can answer with a protocol
//! error and carry on.

use crate::Frame;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

/// Longest command line accepted, newline included.
pub const MAX_COMMAND_LEN: u64 = 64 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("client IO: {0}")]
    Io(#[from] io::Error),

    #[error("reply encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Commands a client can send.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Quit,
    Authorize {
        #[serde(default)]
        user: String,
        #[serde(default)]
        host: String,
        #[serde(default)]
        realhost: String,
    },
    Init,
    Version,
    Info,
    Data,
    StartRecord {
        /// Requested rate in Hz; the default rate when absent
        #[serde(default)]
        rate: Option<f64>,
        /// Requested recording buffer size, echoed back
        #[serde(default)]
        size: u64,
    },
    StopRecord,
    #[serde(other)]
    Unknown,
}

/// What arrived on the connection.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    Command(Command),
    /// An empty line, ignored
    Blank,
    /// The client closed its end
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

/// One channel's shape as advertised by `info`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub dimension: usize,
}

/// Recording capabilities reported by `info`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub min_rate: f64,
    pub max_rate: f64,
    pub default_rate: f64,
    /// Recording buffer size the server accepts, 0 when recording is off
    pub buffer_size: u32,
    pub can_stream: bool,
    pub channels: Vec<ChannelInfo>,
}

/// Replies the server sends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Authorized {
        granted: bool,
    },
    Initialized {
        server: String,
    },
    Version {
        server: String,
        version: String,
        description: String,
    },
    Info(CapabilityInfo),
    Data(Frame),
    RecordStarted {
        rate: f64,
        size: u64,
    },
    RecordStopped,
    Error {
        severity: Severity,
        context: String,
        message: String,
    },
}

/// A client connection speaking the line protocol over any byte stream.
pub struct Connection<S> {
    stream: BufStream<S>,
    line: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S) -> Self {
        Connection {
            stream: BufStream::new(stream),
            line: Vec::new(),
        }
    }

    /// Wait until input is available or the client has closed.
    ///
    /// Cancel safe: nothing is consumed, so it can race a timer in
    /// `tokio::select!`.
    pub async fn readable(&mut self) -> Result<(), ProtocolError> {
        self.stream.fill_buf().await?;
        Ok(())
    }

    /// Read exactly one command line.
    pub async fn receive(&mut self) -> Result<Incoming, ProtocolError> {
        self.line.clear();
        let read = (&mut self.stream)
            .take(MAX_COMMAND_LEN)
            .read_until(b'\n', &mut self.line)
            .await?;
        if read == 0 {
            return Ok(Incoming::Closed);
        }
        if self.line.iter().all(u8::is_ascii_whitespace) {
            return Ok(Incoming::Blank);
        }

        let command = serde_json::from_slice(&self.line).unwrap_or_else(|e| {
            log::debug!(
                "Unparsable command line {:?}: {}",
                String::from_utf8_lossy(&self.line).trim_end(),
                e
            );
            Command::Unknown
        });
        Ok(Incoming::Command(command))
    }

    pub async fn send(&mut self, reply: &Reply) -> Result<(), ProtocolError> {
        let mut encoded = serde_json::to_vec(reply)?;
        encoded.push(b'\n');
        self.stream.write_all(&encoded).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn send_error(
        &mut self,
        severity: Severity,
        context: &str,
        message: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.send(&Reply::Error {
            severity,
            context: context.to_string(),
            message: message.into(),
        })
        .await
    }
}
