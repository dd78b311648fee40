//! Socket protocol tests.

use std::path::Path;
use std::sync::Arc;

use lvmsnap::server::{self, ErrorCode, Payload, Response};
use lvmsnap::volume::MemoryDriver;
use lvmsnap::{Kind, Snapshotter, SnapshotterConfig};
use lvmsnap_common::VolumeName;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send_raw(&mut self, line: &str) -> Response {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        let reply = self.lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    async fn send(&mut self, request: Value) -> Response {
        self.send_raw(&request.to_string()).await
    }
}

struct Daemon {
    _dir: tempfile::TempDir,
    socket: std::path::PathBuf,
    stop: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
    snapshotter: Arc<Snapshotter<MemoryDriver>>,
}

fn start() -> Daemon {
    let dir = tempfile::tempdir().unwrap();
    let config = SnapshotterConfig::new("vg0", "pool0")
        .unwrap()
        .with_root_path(dir.path().join("scratch"))
        .with_metadata_mount(dir.path().join("meta"));
    let driver = MemoryDriver::new(dir.path().join("volumes"), VolumeName::new("pool0").unwrap());
    let snapshotter = Arc::new(Snapshotter::with_driver(config, driver).unwrap());

    let socket = dir.path().join("lvmsnap.sock");
    let listener = tokio::net::UnixListener::bind(&socket).unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server::serve(listener, Arc::clone(&snapshotter), async move {
        let _ = stopped.await;
    }));

    Daemon {
        _dir: dir,
        socket,
        stop,
        task,
        snapshotter,
    }
}

fn mounts(response: Response) -> Vec<lvmsnap::Mount> {
    match response {
        Response::Ok {
            result: Some(Payload::Mounts(mounts)),
        } => mounts,
        other => panic!("expected mounts, got {other:?}"),
    }
}

fn error_code(response: &Response) -> Option<ErrorCode> {
    match response {
        Response::Error { code, .. } => Some(*code),
        Response::Ok { .. } => None,
    }
}

#[tokio::test]
async fn test_full_lifecycle_over_socket() {
    let daemon = start();
    let mut client = Client::connect(&daemon.socket).await;

    let layer = mounts(client.send(json!({"op": "prepare", "key": "layer1"})).await);
    assert_eq!(layer[0].source, "/dev/vg0/1");
    assert!(layer[0].options.is_empty());

    let reply = client
        .send(json!({"op": "commit", "name": "base", "key": "layer1"}))
        .await;
    assert_eq!(reply, Response::empty());

    match client.send(json!({"op": "stat", "key": "base"})).await {
        Response::Ok {
            result: Some(Payload::Info(info)),
        } => assert_eq!(info.kind, Kind::Committed),
        other => panic!("unexpected {other:?}"),
    }

    let view = mounts(
        client
            .send(json!({"op": "view", "key": "view1", "parent": "base"}))
            .await,
    );
    assert_eq!(view[0].options, vec!["ro".to_string()]);
    assert_ne!(view[0].source, layer[0].source);

    match client.send(json!({"op": "walk"})).await {
        Response::Ok {
            result: Some(Payload::Infos(infos)),
        } => assert_eq!(infos.len(), 2),
        other => panic!("unexpected {other:?}"),
    }

    let reply = client.send(json!({"op": "remove", "key": "view1"})).await;
    assert_eq!(reply, Response::empty());
}

#[tokio::test]
async fn test_errors_carry_codes() {
    let daemon = start();
    let mut client = Client::connect(&daemon.socket).await;

    let reply = client.send(json!({"op": "stat", "key": "missing"})).await;
    assert_eq!(error_code(&reply), Some(ErrorCode::NotFound));

    client.send(json!({"op": "prepare", "key": "layer1"})).await;
    let reply = client.send(json!({"op": "prepare", "key": "layer1"})).await;
    assert_eq!(error_code(&reply), Some(ErrorCode::AlreadyExists));

    let reply = client
        .send(json!({"op": "update", "key": "layer1", "field_paths": ["kind"]}))
        .await;
    assert_eq!(error_code(&reply), Some(ErrorCode::InvalidArgument));

    let reply = client.send_raw("{not json").await;
    assert_eq!(error_code(&reply), Some(ErrorCode::InvalidArgument));

    // The connection stays usable after a malformed line
    let reply = client.send(json!({"op": "usage", "key": "layer1"})).await;
    assert!(matches!(
        reply,
        Response::Ok {
            result: Some(Payload::Usage(_))
        }
    ));
}

#[tokio::test]
async fn test_update_labels_over_socket() {
    let daemon = start();
    let mut client = Client::connect(&daemon.socket).await;
    client
        .send(json!({"op": "prepare", "key": "layer1", "labels": {"a": "1"}}))
        .await;

    let reply = client
        .send(json!({
            "op": "update",
            "key": "layer1",
            "labels": {"b": "2"},
            "field_paths": ["labels.b"]
        }))
        .await;
    match reply {
        Response::Ok {
            result: Some(Payload::Info(info)),
        } => {
            assert_eq!(info.labels.get("a").map(String::as_str), Some("1"));
            assert_eq!(info.labels.get("b").map(String::as_str), Some("2"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_shutdown_releases_the_snapshotter() {
    let daemon = start();
    let mut client = Client::connect(&daemon.socket).await;
    client.send(json!({"op": "prepare", "key": "layer1"})).await;

    daemon.stop.send(()).unwrap();
    daemon.task.await.unwrap().unwrap();

    // Every connection task is gone, so the daemon holds the last reference
    let snapshotter = Arc::try_unwrap(daemon.snapshotter).unwrap();
    assert_eq!(snapshotter.stat("layer1").unwrap().kind, Kind::Active);
    snapshotter.close().unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_idle_connections() {
    let daemon = start();
    let mut idle = Client::connect(&daemon.socket).await;
    let mut busy = Client::connect(&daemon.socket).await;
    busy.send(json!({"op": "prepare", "key": "layer1"})).await;

    daemon.stop.send(()).unwrap();
    daemon.task.await.unwrap().unwrap();

    // Both connections see end-of-stream instead of hanging
    assert!(idle.lines.next_line().await.unwrap().is_none());
    assert!(busy.lines.next_line().await.unwrap().is_none());
    assert!(UnixStream::connect(&daemon.socket).await.is_err());
}
