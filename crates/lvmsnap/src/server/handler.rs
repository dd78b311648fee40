//! Maps requests onto snapshotter operations.

use lvmsnap_common::SnapResult;

use super::protocol::{Payload, Request, Response};
use crate::snapshotter::Snapshotter;
use crate::types::SnapshotOptions;
use crate::volume::VolumeDriver;

/// Run one request to completion. Blocks on volume and store I/O.
pub fn handle<D: VolumeDriver>(snapshotter: &Snapshotter<D>, request: Request) -> Response {
    let op = op_name(&request);
    match dispatch(snapshotter, request) {
        Ok(Some(payload)) => Response::ok(payload),
        Ok(None) => Response::empty(),
        Err(err) => {
            tracing::debug!(op, error = %err, "Request failed");
            Response::from(&err)
        }
    }
}

fn dispatch<D: VolumeDriver>(
    snapshotter: &Snapshotter<D>,
    request: Request,
) -> SnapResult<Option<Payload>> {
    let payload = match request {
        Request::Stat { key } => Payload::Info(snapshotter.stat(&key)?),
        Request::Update {
            key,
            labels,
            field_paths,
        } => {
            let mut info = snapshotter.stat(&key)?;
            info.labels = labels;
            Payload::Info(snapshotter.update(&info, &field_paths)?)
        }
        Request::Usage { key } => Payload::Usage(snapshotter.usage(&key)?),
        Request::Mounts { key } => Payload::Mounts(snapshotter.mounts(&key)?),
        Request::Prepare {
            key,
            parent,
            labels,
        } => Payload::Mounts(snapshotter.prepare(&key, &parent, &SnapshotOptions { labels })?),
        Request::View {
            key,
            parent,
            labels,
        } => Payload::Mounts(snapshotter.view(&key, &parent, &SnapshotOptions { labels })?),
        Request::Commit { name, key, labels } => {
            snapshotter.commit(&name, &key, &SnapshotOptions { labels })?;
            return Ok(None);
        }
        Request::Remove { key } => {
            snapshotter.remove(&key)?;
            return Ok(None);
        }
        Request::Walk => {
            let mut infos = Vec::new();
            snapshotter.walk(|info| {
                infos.push(info.clone());
                Ok(())
            })?;
            Payload::Infos(infos)
        }
    };
    Ok(Some(payload))
}

const fn op_name(request: &Request) -> &'static str {
    match request {
        Request::Stat { .. } => "stat",
        Request::Update { .. } => "update",
        Request::Usage { .. } => "usage",
        Request::Mounts { .. } => "mounts",
        Request::Prepare { .. } => "prepare",
        Request::View { .. } => "view",
        Request::Commit { .. } => "commit",
        Request::Remove { .. } => "remove",
        Request::Walk => "walk",
    }
}
