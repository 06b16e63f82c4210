//! # Session Command Loop
//!
//! The event loop for one client connection. Each iteration:
//!
//! 1. **Catch up**: while recording, sample once for every tick that is due
//! 2. **Wait**: block until the client sends something or the next tick is
//!    due, whichever comes first (indefinitely while idle)
//! 3. **Dispatch**: read exactly one command and answer it
//!
//! Ticks win ties, so every due sample is taken before the next command is
//! handled. The loop ends on `quit`, when the client closes the connection,
//! or when a command handler fails in a way the session cannot recover from.

use crate::config::PROGRAM_NAME;
use crate::protocol::{Command, Connection, Incoming, ProtocolError, Reply, Severity};
use crate::schedule::{RecordState, RecordingSchedule};
use crate::server::ServerContext;
use crate::source::SourceError;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{sleep_until, Instant};

/// Reported to clients asking for data when no channel registry could be built.
pub const MISSING_CONFIG: &str = "Missing or empty config file";

/// Failures that end a session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// Whether the whole process must stop, not just this session.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Source(e) => e.is_fatal(),
            SessionError::Protocol(_) => false,
        }
    }
}

/// Counters kept for one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Commands dispatched, unknown ones included
    pub commands: u64,
    /// Read cycles run, on request or on schedule
    pub samples: u64,
    /// Read cycles run on the recording schedule
    pub ticks: u64,
}

enum Flow {
    Continue,
    Quit,
}

/// One client session over `S`.
pub struct Session<'a, S> {
    ctx: &'a mut ServerContext,
    conn: Connection<S>,
    state: RecordState,
    stats: SessionStats,
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin> Session<'a, S> {
    pub fn new(ctx: &'a mut ServerContext, stream: S) -> Self {
        Session {
            ctx,
            conn: Connection::new(stream),
            state: RecordState::Idle,
            stats: SessionStats::default(),
        }
    }

    /// Serve the client until it quits or the session fails.
    pub async fn run(mut self) -> Result<SessionStats, SessionError> {
        loop {
            let deadline = self.catch_up().await?;

            let ready = match deadline {
                None => {
                    self.conn.readable().await?;
                    true
                }
                Some(at) => tokio::select! {
                    biased;
                    _ = sleep_until(at) => false,
                    readable = self.conn.readable() => {
                        readable?;
                        true
                    }
                },
            };
            if !ready {
                continue;
            }

            let command = match self.conn.receive().await? {
                Incoming::Command(command) => command,
                Incoming::Blank => continue,
                Incoming::Closed => {
                    log::info!("Client closed the connection");
                    return Ok(self.stats);
                }
            };

            // Ticks that fell due while the rest of the line arrived come first
            self.catch_up().await?;

            self.stats.commands += 1;
            if let Flow::Quit = self.dispatch(command).await? {
                return Ok(self.stats);
            }
        }
    }

    /// Sample every due tick and return when the next one is due.
    async fn catch_up(&mut self) -> Result<Option<Instant>, SessionError> {
        let RecordState::Recording(mut schedule) = self.state else {
            return Ok(None);
        };

        let now = Instant::now();
        let mut taken = 0;
        while schedule.take_due(now).is_some() {
            self.sample().await?;
            taken += 1;
        }
        if taken > 1 {
            log::debug!("Caught up {} recording ticks", taken);
        }
        self.stats.ticks += taken;
        self.state = RecordState::Recording(schedule);
        Ok(schedule.next_tick())
    }

    /// Run one read cycle. Plain read errors are reported to the client and
    /// the session goes on; anything else ends it.
    async fn sample(&mut self) -> Result<(), SessionError> {
        self.stats.samples += 1;
        match self.ctx.sample() {
            Ok(_) => Ok(()),
            Err(e) if !e.is_fatal() => {
                log::warn!("Data source read failed: {}", e);
                self.conn
                    .send_error(Severity::Warning, "data source", e.to_string())
                    .await?;
                Ok(())
            }
            Err(e) => {
                log::error!("{}", e);
                if let Err(send) = self
                    .conn
                    .send_error(Severity::Fatal, PROGRAM_NAME, e.to_string())
                    .await
                {
                    log::debug!("Could not report fatal error to client: {}", send);
                }
                Err(e.into())
            }
        }
    }

    async fn dispatch(&mut self, command: Command) -> Result<Flow, SessionError> {
        log::debug!("Dispatching {:?}", command);
        match command {
            Command::Quit => return Ok(Flow::Quit),

            Command::Authorize {
                user,
                host,
                realhost,
            } => {
                log::info!("Granting access to {}@{} ({})", user, host, realhost);
                self.conn.send(&Reply::Authorized { granted: true }).await?;
            }

            Command::Init => {
                self.conn
                    .send(&Reply::Initialized {
                        server: PROGRAM_NAME.to_string(),
                    })
                    .await?;
            }

            Command::Version => {
                let version = env!("CARGO_PKG_VERSION");
                self.conn
                    .send(&Reply::Version {
                        server: PROGRAM_NAME.to_string(),
                        version: version.to_string(),
                        description: format!("Mocap channel server - v{version}"),
                    })
                    .await?;
            }

            Command::Info => {
                if let Err(e) = self.ctx.ensure_registry() {
                    log::warn!("No channel registry: {}", e);
                    self.conn
                        .send_error(Severity::Error, PROGRAM_NAME, MISSING_CONFIG)
                        .await?;
                }
                let info = self.ctx.capabilities();
                self.conn.send(&Reply::Info(info)).await?;
            }

            Command::Data => self.send_data().await?,

            Command::StartRecord { rate, size } => self.start_recording(rate, size).await?,

            Command::StopRecord => {
                if self.state.is_recording() {
                    log::info!("Recording stopped after {} ticks", self.stats.ticks);
                }
                self.state = RecordState::Idle;
                self.conn.send(&Reply::RecordStopped).await?;
            }

            Command::Unknown => {
                log::warn!("Unknown server command");
                self.conn
                    .send_error(Severity::Error, PROGRAM_NAME, "Unknown server command.")
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn send_data(&mut self) -> Result<(), SessionError> {
        if let Err(e) = self.ctx.ensure_registry() {
            log::warn!("Data requested without a channel registry: {}", e);
            self.conn
                .send_error(Severity::Error, PROGRAM_NAME, MISSING_CONFIG)
                .await?;
            return Ok(());
        }

        // While recording the schedule keeps the values fresh
        if !self.state.is_recording() {
            self.sample().await?;
        }

        if !self.ctx.has_record() {
            self.conn
                .send_error(Severity::Warning, "data", "No data record available yet")
                .await?;
            return Ok(());
        }

        match self.ctx.snapshot() {
            Some(frame) => self.conn.send(&Reply::Data(frame)).await?,
            None => {
                self.conn
                    .send_error(Severity::Error, PROGRAM_NAME, MISSING_CONFIG)
                    .await?
            }
        }
        Ok(())
    }

    async fn start_recording(&mut self, requested: Option<f64>, size: u64) -> Result<(), SessionError> {
        let limits = self.ctx.limits();
        if !limits.can_stream() {
            self.conn
                .send_error(
                    Severity::Error,
                    "start_record",
                    "Recording is not supported by this server",
                )
                .await?;
            return Ok(());
        }

        let rate = limits.clamp(requested.unwrap_or(limits.default));
        let Some(schedule) = RecordingSchedule::new(rate) else {
            self.conn
                .send_error(
                    Severity::Error,
                    "start_record",
                    format!("Invalid recording rate {rate}"),
                )
                .await?;
            return Ok(());
        };

        self.conn.send(&Reply::RecordStarted { rate, size }).await?;
        log::info!(
            "Recording at {} Hz (requested {:?}), buffer size {}",
            rate,
            requested,
            size
        );
        self.state = RecordState::Recording(schedule);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Registry;
    use crate::config::{ReadPolicy, Reposition, ServerConfig};
    use crate::source::RecordReader;
    use crate::Channel;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    struct Client {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        write: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, line: &str) {
            self.write.write_all(line.as_bytes()).await.unwrap();
            self.write.write_all(b"\n").await.unwrap();
        }

        async fn send_raw(&mut self, bytes: &str) {
            self.write.write_all(bytes.as_bytes()).await.unwrap();
        }

        async fn reply(&mut self) -> Reply {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    fn context(data: &NamedTempFile, registry: Option<Registry>) -> ServerContext {
        context_with_channels(data, registry, "/nonexistent/rig.cfg")
    }

    fn context_with_channels(
        data: &NamedTempFile,
        registry: Option<Registry>,
        channel_config: &str,
    ) -> ServerContext {
        let policy = ReadPolicy {
            reposition: Reposition::Rewind,
            read_next: true,
        };
        let reader = RecordReader::open(data.path(), 64, policy).unwrap();
        let config = ServerConfig {
            channel_config: channel_config.to_string(),
            ..Default::default()
        };
        ServerContext::with_parts(config, registry, reader)
    }

    fn pos_rot() -> Registry {
        Registry::from_channels(vec![Channel::new("pos", 3), Channel::new("rot", 3)])
    }

    fn data_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn connect() -> (DuplexStream, Client) {
        let (server, client) = duplex(4096);
        let (read, write) = tokio::io::split(client);
        let client = Client {
            lines: BufReader::new(read).lines(),
            write,
        };
        (server, client)
    }

    #[tokio::test]
    async fn test_data_returns_snapshot() {
        let data = data_file("1 2 3 4 5 6\n");
        let mut ctx = context(&data, Some(pos_rot()));
        let (server, mut client) = connect();

        let client_task = async move {
            client.send(r#"{"command":"data"}"#).await;
            let reply = client.reply().await;
            client.send(r#"{"command":"quit"}"#).await;
            reply
        };
        let (stats, reply) = tokio::join!(Session::new(&mut ctx, server).run(), client_task);

        let Reply::Data(frame) = reply else {
            panic!("expected data, got {reply:?}");
        };
        assert_eq!(frame.channels[1].values, vec![4.0, 5.0, 6.0]);
        assert!(frame.captured_at.is_some());
        assert_eq!(stats.unwrap().commands, 2);
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_session_open() {
        let data = data_file("1 2 3 4 5 6\n");
        let mut ctx = context(&data, Some(pos_rot()));
        let (server, mut client) = connect();

        let client_task = async move {
            client.send(r#"{"command":"self_destruct"}"#).await;
            let first = client.reply().await;
            client.send(r#"{"command":"init"}"#).await;
            let second = client.reply().await;
            client.send(r#"{"command":"quit"}"#).await;
            (first, second)
        };
        let (stats, (first, second)) =
            tokio::join!(Session::new(&mut ctx, server).run(), client_task);

        assert!(matches!(
            first,
            Reply::Error {
                severity: Severity::Error,
                ..
            }
        ));
        assert!(matches!(second, Reply::Initialized { .. }));
        assert!(stats.is_ok());
    }

    #[tokio::test]
    async fn test_data_without_registry_is_protocol_error() {
        let data = data_file("1 2 3\n");
        let mut ctx = context(&data, None);
        let (server, mut client) = connect();

        let client_task = async move {
            client.send(r#"{"command":"data"}"#).await;
            let reply = client.reply().await;
            client.send(r#"{"command":"quit"}"#).await;
            reply
        };
        let (stats, reply) = tokio::join!(Session::new(&mut ctx, server).run(), client_task);

        match reply {
            Reply::Error { message, .. } => assert_eq!(message, MISSING_CONFIG),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(stats.is_ok());
    }

    #[tokio::test]
    async fn test_info_loads_registry_lazily() {
        let data = data_file("1 2 3\n");
        let mut cfg = NamedTempFile::new().unwrap();
        writeln!(cfg, "root position").unwrap();

        let mut ctx = context_with_channels(&data, None, cfg.path().to_str().unwrap());
        let (server, mut client) = connect();

        let client_task = async move {
            client.send(r#"{"command":"info"}"#).await;
            let reply = client.reply().await;
            client.send(r#"{"command":"quit"}"#).await;
            reply
        };
        let (_, reply) = tokio::join!(Session::new(&mut ctx, server).run(), client_task);

        let Reply::Info(info) = reply else {
            panic!("expected info, got {reply:?}");
        };
        assert_eq!(info.min_rate, 1.0);
        assert_eq!(info.max_rate, 300.0);
        assert!(info.can_stream);
        assert_eq!(info.channels[0].name, "root");
    }

    #[tokio::test]
    async fn test_client_close_ends_session_cleanly() {
        let data = data_file("1 2 3\n");
        let mut ctx = context(&data, Some(pos_rot()));
        let (server, client) = connect();
        drop(client);

        let stats = Session::new(&mut ctx, server).run().await.unwrap();
        assert_eq!(stats.commands, 0);
    }

    #[tokio::test]
    async fn test_authorize_is_granted() {
        let data = data_file("1 2 3 4 5 6\n");
        let mut ctx = context(&data, Some(pos_rot()));
        let (server, mut client) = connect();

        let client_task = async move {
            client
                .send(r#"{"command":"authorize","user":"ana","host":"rig","realhost":"rig.lab"}"#)
                .await;
            let full = client.reply().await;
            client.send(r#"{"command":"authorize"}"#).await;
            let bare = client.reply().await;
            client.send(r#"{"command":"quit"}"#).await;
            (full, bare)
        };
        let (stats, (full, bare)) = tokio::join!(Session::new(&mut ctx, server).run(), client_task);

        assert_eq!(full, Reply::Authorized { granted: true });
        assert_eq!(bare, Reply::Authorized { granted: true });
        assert_eq!(stats.unwrap().commands, 3);
    }

    #[tokio::test]
    async fn test_version_reports_package_version() {
        let data = data_file("1 2 3 4 5 6\n");
        let mut ctx = context(&data, Some(pos_rot()));
        let (server, mut client) = connect();

        let client_task = async move {
            client.send(r#"{"command":"version"}"#).await;
            let reply = client.reply().await;
            client.send(r#"{"command":"quit"}"#).await;
            reply
        };
        let (_, reply) = tokio::join!(Session::new(&mut ctx, server).run(), client_task);

        let version = env!("CARGO_PKG_VERSION");
        assert_eq!(
            reply,
            Reply::Version {
                server: "mocap-server".to_string(),
                version: version.to_string(),
                description: format!("Mocap channel server - v{version}"),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_due_during_split_command_run_first() {
        let data = data_file("1 1 1 1 1 1\n2 2 2 2 2 2\n3 3 3 3 3 3\n4 4 4 4 4 4\n");
        let policy = ReadPolicy {
            reposition: Reposition::Forward,
            read_next: true,
        };
        let reader = RecordReader::open(data.path(), 64, policy).unwrap();
        let mut ctx = ServerContext::with_parts(ServerConfig::default(), Some(pos_rot()), reader);
        let (server, mut client) = connect();

        let client_task = async move {
            client.send(r#"{"command":"start_record","rate":10}"#).await;
            client.reply().await;
            // Half a command, then the rest after two more ticks are due
            client.send_raw(r#"{"command":"#).await;
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            client.send(r#""data"}"#).await;
            let reply = client.reply().await;
            client.send(r#"{"command":"quit"}"#).await;
            reply
        };
        let (stats, reply) = tokio::join!(Session::new(&mut ctx, server).run(), client_task);

        let Reply::Data(frame) = reply else {
            panic!("expected data, got {reply:?}");
        };
        assert_eq!(frame.channels[0].values, vec![3.0, 3.0, 3.0]);
        assert_eq!(stats.unwrap().ticks, 3);
    }

    #[tokio::test]
    async fn test_start_record_clamps_rate() {
        let data = data_file("1 2 3 4 5 6\n");
        let mut ctx = context(&data, Some(pos_rot()));
        let (server, mut client) = connect();

        let client_task = async move {
            client
                .send(r#"{"command":"start_record","rate":0.1,"size":10}"#)
                .await;
            let low = client.reply().await;
            client
                .send(r#"{"command":"start_record","rate":5000,"size":10}"#)
                .await;
            let high = client.reply().await;
            client.send(r#"{"command":"stop_record"}"#).await;
            let stopped = client.reply().await;
            client.send(r#"{"command":"quit"}"#).await;
            (low, high, stopped)
        };
        let (_, (low, high, stopped)) =
            tokio::join!(Session::new(&mut ctx, server).run(), client_task);

        assert_eq!(low, Reply::RecordStarted { rate: 1.0, size: 10 });
        assert_eq!(high, Reply::RecordStarted { rate: 300.0, size: 10 });
        assert_eq!(stopped, Reply::RecordStopped);
    }

    #[tokio::test]
    async fn test_overflow_ends_session_as_fatal() {
        let data = data_file("1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25\n");
        let mut ctx = context(&data, Some(pos_rot()));
        let (server, mut client) = connect();

        let client_task = async move {
            client.send(r#"{"command":"data"}"#).await;
            client.reply().await
        };
        let (result, reply) = tokio::join!(Session::new(&mut ctx, server).run(), client_task);

        let err = result.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            SessionError::Source(SourceError::Overflow { capacity: 64 })
        ));
        assert!(matches!(
            reply,
            Reply::Error {
                severity: Severity::Fatal,
                ..
            }
        ));
    }
}
