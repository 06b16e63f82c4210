//! # Server Lifecycle
//!
//! Owns everything that outlives a single session: the configuration, the
//! channel registry and the record reader. Sessions borrow it mutably, one at
//! a time.
//!
//! ## Invocation Modes
//!
//! - **Single-shot** ([`serve_single`]): serve one already-connected client,
//!   typically on stdin/stdout when started from inetd, then return
//! - **Standing server** ([`serve_forever`]): listen on a Unix socket or TCP
//!   address and serve clients one after another; a failed session is logged
//!   and the next client is accepted, unless the failure is process-fatal

use crate::channels::{Registry, RegistryError};
use crate::config::ServerConfig;
use crate::frame;
use crate::protocol::{CapabilityInfo, ChannelInfo};
use crate::schedule::RateLimits;
use crate::session::{Session, SessionError, SessionStats};
use crate::source::{RecordReader, SourceError};
use crate::Frame;
use chrono::Utc;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("cannot listen on {endpoint}: {source}")]
    Bind { endpoint: String, source: io::Error },

    #[error("accept failed: {0}")]
    Accept(io::Error),

    #[error("unix sockets are not supported on this platform")]
    Unsupported,

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Process-scoped server state shared by consecutive sessions.
pub struct ServerContext {
    config: ServerConfig,
    registry: Option<Registry>,
    reader: RecordReader,
}

impl ServerContext {
    /// Open the data source and try to load the channel registry.
    ///
    /// A missing registry is only logged here; it is retried when a client
    /// asks for info or data.
    pub fn new(config: ServerConfig) -> Result<Self, SourceError> {
        let reader = RecordReader::open(
            &config.data_path,
            config.buffer_size,
            config.read_policy(),
        )?;
        let registry = match Registry::open(config.channel_config_path()) {
            Ok(registry) => Some(registry),
            Err(e) => {
                log::warn!(
                    "Channel config {} not loaded: {}",
                    config.channel_config_path().display(),
                    e
                );
                None
            }
        };
        Ok(Self::with_parts(config, registry, reader))
    }

    pub fn with_parts(
        config: ServerConfig,
        registry: Option<Registry>,
        reader: RecordReader,
    ) -> Self {
        ServerContext {
            config,
            registry,
            reader,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn limits(&self) -> RateLimits {
        RateLimits {
            min: self.config.min_rate,
            max: self.config.max_rate,
            default: self.config.default_rate,
        }
    }

    /// Build the registry if it is not there yet.
    pub fn ensure_registry(&mut self) -> Result<&mut Registry, RegistryError> {
        if self.registry.is_none() {
            self.registry = Some(Registry::open(self.config.channel_config_path())?);
        }
        self.registry.as_mut().ok_or(RegistryError::Missing)
    }

    /// Run one read cycle and decode the last complete record.
    ///
    /// Returns the number of channels filled; zero without a registry.
    pub fn sample(&mut self) -> Result<usize, SourceError> {
        self.reader.read_frame()?;
        let Some(registry) = self.registry.as_mut() else {
            return Ok(0);
        };
        let filled = frame::decode(self.reader.record(), registry);
        registry.mark_captured(Utc::now());
        Ok(filled)
    }

    /// Whether a complete record has ever been read.
    pub fn has_record(&self) -> bool {
        !self.reader.record().is_empty()
    }

    pub fn snapshot(&self) -> Option<Frame> {
        self.registry.as_ref().map(Registry::snapshot)
    }

    pub fn capabilities(&self) -> CapabilityInfo {
        let limits = self.limits();
        CapabilityInfo {
            min_rate: limits.min,
            max_rate: limits.max,
            default_rate: limits.default,
            buffer_size: if limits.can_stream() { u32::MAX } else { 0 },
            can_stream: limits.can_stream(),
            channels: self
                .registry
                .iter()
                .flat_map(|registry| registry.channels())
                .map(|channel| ChannelInfo {
                    name: channel.name().to_string(),
                    dimension: channel.dimension(),
                })
                .collect(),
        }
    }
}

/// Where a standing server listens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl Endpoint {
    /// A name that parses as a socket address is TCP, anything else a socket path.
    pub fn parse(name: &str) -> Self {
        match name.parse::<SocketAddr>() {
            Ok(addr) => Endpoint::Tcp(addr),
            Err(_) => Endpoint::Unix(PathBuf::from(name)),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Serve exactly one connected client.
pub async fn serve_single<S>(ctx: &mut ServerContext, stream: S) -> Result<SessionStats, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    log::info!("Serving single client");
    let stats = Session::new(ctx, stream).run().await?;
    log_session_end(&stats);
    Ok(stats)
}

/// Accept and serve clients one at a time until a process-fatal error.
pub async fn serve_forever(ctx: &mut ServerContext) -> Result<(), ServerError> {
    let endpoint = Endpoint::parse(&ctx.config().server_name);
    match &endpoint {
        Endpoint::Tcp(addr) => {
            let listener = TcpListener::bind(*addr)
                .await
                .map_err(|source| ServerError::Bind {
                    endpoint: endpoint.to_string(),
                    source,
                })?;
            log::info!("Listening on {}", endpoint);
            loop {
                let (stream, peer) = listener.accept().await.map_err(ServerError::Accept)?;
                log::info!("Client connected from {}", peer);
                serve_client(ctx, stream).await?;
            }
        }
        Endpoint::Unix(path) => serve_unix(ctx, path, &endpoint).await,
    }
}

#[cfg(unix)]
async fn serve_unix(
    ctx: &mut ServerContext,
    path: &std::path::Path,
    endpoint: &Endpoint,
) -> Result<(), ServerError> {
    use std::os::unix::fs::FileTypeExt;
    use tokio::net::UnixListener;

    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_socket() {
            log::debug!("Removing stale socket {}", path.display());
            if let Err(e) = std::fs::remove_file(path) {
                log::debug!("Could not remove stale socket {}: {}", path.display(), e);
            }
        }
    }

    let listener = UnixListener::bind(path).map_err(|source| ServerError::Bind {
        endpoint: endpoint.to_string(),
        source,
    })?;
    log::info!("Listening on {}", endpoint);
    loop {
        let (stream, _) = listener.accept().await.map_err(ServerError::Accept)?;
        log::info!("Client connected on {}", path.display());
        serve_client(ctx, stream).await?;
    }
}

#[cfg(not(unix))]
async fn serve_unix(
    _ctx: &mut ServerContext,
    _path: &std::path::Path,
    _endpoint: &Endpoint,
) -> Result<(), ServerError> {
    Err(ServerError::Unsupported)
}

/// Run one session; only process-fatal failures propagate.
async fn serve_client<S>(ctx: &mut ServerContext, stream: S) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match Session::new(ctx, stream).run().await {
        Ok(stats) => {
            log_session_end(&stats);
            Ok(())
        }
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(e) => {
            log::error!("Session ended with error: {}", e);
            Ok(())
        }
    }
}

fn log_session_end(stats: &SessionStats) {
    log::info!(
        "Session ended: {} commands, {} samples ({} on schedule)",
        stats.commands,
        stats.samples,
        stats.ticks
    );
}
