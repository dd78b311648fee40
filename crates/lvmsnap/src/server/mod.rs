//! Unix socket server.
//!
//! Each connection carries newline-delimited JSON requests, answered in
//! order. Requests run on the blocking pool since every operation shells out
//! or touches the metadata database.

mod handler;
pub mod protocol;

use std::future::Future;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

pub use handler::handle;
pub use protocol::{ErrorCode, Payload, Request, Response};

use crate::snapshotter::Snapshotter;
use crate::volume::VolumeDriver;

/// Accept connections until `shutdown` resolves, then wait for requests
/// already running to finish.
///
/// Connections stop reading new requests once shutdown starts.
///
/// # Errors
///
/// Currently never fails; accept errors are logged and skipped.
pub async fn serve<D, F>(
    listener: UnixListener,
    snapshotter: Arc<Snapshotter<D>>,
    shutdown: F,
) -> io::Result<()>
where
    D: VolumeDriver + 'static,
    F: Future<Output = ()>,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tracing::debug!("Accepted connection");
                    connections.spawn(connection(stream, Arc::clone(&snapshotter), stop_rx.clone()));
                }
                Err(err) => tracing::warn!(error = %err, "Failed to accept connection"),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = joined {
                    tracing::warn!(error = %err, "Connection task failed");
                }
            }
        }
    }

    drop(listener);
    stop_tx.send_replace(true);
    tracing::info!(
        connections = connections.len(),
        "Stopped accepting; waiting for in-flight requests"
    );
    while let Some(joined) = connections.join_next().await {
        if let Err(err) = joined {
            tracing::warn!(error = %err, "Connection task failed");
        }
    }
    Ok(())
}

async fn connection<D: VolumeDriver + 'static>(
    stream: UnixStream,
    snapshotter: Arc<Snapshotter<D>>,
    mut stop: watch::Receiver<bool>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = stop.changed() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(error = %err, "Connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => run(Arc::clone(&snapshotter), request).await,
            Err(err) => Response::failure(
                ErrorCode::InvalidArgument,
                format!("malformed request: {err}"),
            ),
        };

        let mut encoded = match serde_json::to_vec(&response) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(error = %err, "Failed to encode response");
                break;
            }
        };
        encoded.push(b'\n');
        if let Err(err) = writer.write_all(&encoded).await {
            tracing::debug!(error = %err, "Connection write failed");
            break;
        }
    }
}

async fn run<D: VolumeDriver + 'static>(
    snapshotter: Arc<Snapshotter<D>>,
    request: Request,
) -> Response {
    match tokio::task::spawn_blocking(move || handle(&snapshotter, request)).await {
        Ok(response) => response,
        Err(err) => Response::failure(ErrorCode::Internal, format!("request handler failed: {err}")),
    }
}
