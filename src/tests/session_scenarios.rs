//! # End-to-End Session Scenarios
//!
//! These tests drive full sessions through an in-memory client connection
//! and check what a real client would observe. Time-dependent scenarios run
//! on tokio's paused clock, so they are deterministic and finish instantly.

use mocap_server_lib::channels::Registry;
use mocap_server_lib::config::{ReadPolicy, Reposition, ServerConfig};
use mocap_server_lib::protocol::Reply;
use mocap_server_lib::server::ServerContext;
use mocap_server_lib::session::Session;
use mocap_server_lib::source::RecordReader;
use mocap_server_lib::Channel;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{
    duplex, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, ReadHalf,
    WriteHalf,
};

/// Minimal protocol client used by the scenarios.
struct TestClient<S> {
    lines: Lines<BufReader<ReadHalf<S>>>,
    write: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite> TestClient<S> {
    fn new(stream: S) -> Self {
        let (read, write) = tokio::io::split(stream);
        TestClient {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn send(&mut self, line: &str) {
        self.write.write_all(line.as_bytes()).await.unwrap();
        self.write.write_all(b"\n").await.unwrap();
    }

    async fn request(&mut self, line: &str) -> Reply {
        self.send(line).await;
        let reply = self.lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&reply).unwrap()
    }
}

fn data_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn context(data: &NamedTempFile, policy: ReadPolicy) -> ServerContext {
    let registry = Registry::from_channels(vec![Channel::new("pos", 3), Channel::new("rot", 3)]);
    let reader = RecordReader::open(data.path(), 256, policy).unwrap();
    let config = ServerConfig {
        channel_config: "/nonexistent/rig.cfg".into(),
        ..Default::default()
    };
    ServerContext::with_parts(config, Some(registry), reader)
}

/// Connect → init → info → record at 10 Hz for one second → stop → quit.
///
/// Roughly ten samples are taken on schedule; the tick landing exactly on
/// the one-second mark may or may not be counted.
#[tokio::test(start_paused = true)]
async fn recording_session_end_to_end() {
    let data = data_file("1 2 3 4 5 6\n");
    let policy = ReadPolicy {
        reposition: Reposition::Rewind,
        read_next: true,
    };
    let mut ctx = context(&data, policy);
    let (server, client) = duplex(64 * 1024);
    let mut client = TestClient::new(client);

    let client_task = async move {
        let init = client.request(r#"{"command":"init"}"#).await;
        assert!(matches!(init, Reply::Initialized { .. }));

        let Reply::Info(info) = client.request(r#"{"command":"info"}"#).await else {
            panic!("expected capability info");
        };
        assert_eq!(
            (info.min_rate, info.max_rate, info.default_rate, info.can_stream),
            (1.0, 300.0, 60.0, true)
        );

        let started = client
            .request(r#"{"command":"start_record","rate":10,"size":100}"#)
            .await;
        assert_eq!(
            started,
            Reply::RecordStarted {
                rate: 10.0,
                size: 100
            }
        );

        tokio::time::sleep(Duration::from_secs(1)).await;

        let stopped = client.request(r#"{"command":"stop_record"}"#).await;
        assert_eq!(stopped, Reply::RecordStopped);
        client.send(r#"{"command":"quit"}"#).await;
    };

    let (stats, ()) = tokio::join!(Session::new(&mut ctx, server).run(), client_task);
    let stats = stats.unwrap();

    assert!(
        (10..=11).contains(&stats.ticks),
        "expected about 10 samples in one second at 10 Hz, got {}",
        stats.ticks
    );
    assert_eq!(stats.commands, 5);
}

/// Data requested while recording returns the scheduled samples without
/// an extra read.
#[tokio::test(start_paused = true)]
async fn data_while_recording_uses_scheduled_samples() {
    let data = data_file("1 1 1 1 1 1\n2 2 2 2 2 2\n3 3 3 3 3 3\n");
    let policy = ReadPolicy {
        reposition: Reposition::Forward,
        read_next: true,
    };
    let mut ctx = context(&data, policy);
    let (server, client) = duplex(64 * 1024);
    let mut client = TestClient::new(client);

    let client_task = async move {
        client
            .request(r#"{"command":"start_record","rate":10}"#)
            .await;
        // First tick is immediate, the second lands at 100 ms
        tokio::time::sleep(Duration::from_millis(150)).await;
        let reply = client.request(r#"{"command":"data"}"#).await;
        client.send(r#"{"command":"quit"}"#).await;
        reply
    };

    let (stats, reply) = tokio::join!(Session::new(&mut ctx, server).run(), client_task);
    let stats = stats.unwrap();

    let Reply::Data(frame) = reply else {
        panic!("expected data, got {reply:?}");
    };
    assert_eq!(frame.channels[0].values, vec![2.0, 2.0, 2.0]);
    assert_eq!(stats.samples, stats.ticks);
}

/// A static file read without repositioning keeps serving its last record.
#[tokio::test]
async fn static_source_repeats_last_snapshot() {
    let data = data_file("1 2 3 4 5 6\n7 8 9 10 11 12\n");
    let policy = ReadPolicy {
        reposition: Reposition::Forward,
        read_next: false,
    };
    let mut ctx = context(&data, policy);
    let (server, client) = duplex(64 * 1024);
    let mut client = TestClient::new(client);

    let client_task = async move {
        let first = client.request(r#"{"command":"data"}"#).await;
        let second = client.request(r#"{"command":"data"}"#).await;
        client.send(r#"{"command":"quit"}"#).await;
        (first, second)
    };

    let (stats, (first, second)) = tokio::join!(Session::new(&mut ctx, server).run(), client_task);
    assert!(stats.is_ok());

    let (Reply::Data(first), Reply::Data(second)) = (first, second) else {
        panic!("expected two data replies");
    };
    assert_eq!(first.channels, second.channels);
    assert_eq!(first.channels[1].values, vec![10.0, 11.0, 12.0]);
}

/// A standing server keeps accepting clients after one quits.
#[cfg(unix)]
#[tokio::test]
async fn standing_server_serves_clients_in_turn() {
    use mocap_server_lib::server::serve_forever;
    use tokio::net::UnixStream;

    let data = data_file("1 2 3 4 5 6\n");
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("mocap.sock");

    let registry = Registry::from_channels(vec![Channel::new("pos", 3)]);
    let reader = RecordReader::open(
        data.path(),
        256,
        ReadPolicy {
            reposition: Reposition::Rewind,
            read_next: true,
        },
    )
    .unwrap();
    let config = ServerConfig {
        server_name: socket.to_str().unwrap().to_string(),
        ..Default::default()
    };
    let mut ctx = ServerContext::with_parts(config, Some(registry), reader);

    let clients = async {
        for _ in 0..2 {
            let stream = loop {
                match UnixStream::connect(&socket).await {
                    Ok(stream) => break stream,
                    Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            };
            let mut client = TestClient::new(stream);
            let Reply::Data(frame) = client.request(r#"{"command":"data"}"#).await else {
                panic!("expected data");
            };
            assert_eq!(frame.channels[0].values, vec![1.0, 2.0, 3.0]);
            client.send(r#"{"command":"quit"}"#).await;
        }
    };

    tokio::select! {
        result = serve_forever(&mut ctx) => panic!("server stopped: {result:?}"),
        () = clients => {}
    }
}
