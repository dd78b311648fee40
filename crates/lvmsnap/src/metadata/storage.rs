//! Snapshot records inside a metadata [`Transaction`].
//!
//! Keys are unique, ids are allocated by the store and double as logical
//! volume names, and a snapshot can only have a committed parent. A record
//! with children cannot be removed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use lvmsnap_common::{SnapError, SnapResult, VolumeName};
use rusqlite::{OptionalExtension, Row, params};

use super::{Transaction, from_rusqlite};
use crate::types::{Info, Kind, Snapshot, SnapshotOptions, Usage};

const SELECT_RECORD: &str = "
SELECT s.id, s.key, s.kind, p.key, s.labels, s.created_at, s.updated_at, s.size, s.inodes, s.parent_id
FROM snapshots s LEFT JOIN snapshots p ON p.id = s.parent_id";

/// A snapshot row with its parent's key resolved.
#[derive(Debug)]
struct Record {
    id: i64,
    info: Info,
    usage: Usage,
    parent_id: Option<i64>,
}

struct RawRecord {
    id: i64,
    key: String,
    kind: String,
    parent: Option<String>,
    labels: String,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    size: i64,
    inodes: i64,
    parent_id: Option<i64>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            key: row.get(1)?,
            kind: row.get(2)?,
            parent: row.get(3)?,
            labels: row.get(4)?,
            created: row.get(5)?,
            updated: row.get(6)?,
            size: row.get(7)?,
            inodes: row.get(8)?,
            parent_id: row.get(9)?,
        })
    }

    fn into_record(self) -> SnapResult<Record> {
        Ok(Record {
            id: self.id,
            info: Info {
                name: self.key,
                parent: self.parent,
                kind: self.kind.parse()?,
                labels: serde_json::from_str(&self.labels)?,
                created: self.created,
                updated: self.updated,
            },
            usage: Usage {
                size: self.size,
                inodes: self.inodes,
            },
            parent_id: self.parent_id,
        })
    }
}

fn volume_name(id: i64) -> SnapResult<VolumeName> {
    VolumeName::new(id.to_string())
}

fn not_found(key: &str) -> SnapError {
    SnapError::NotFound {
        what: format!("snapshot {key:?}"),
    }
}

fn find(tx: &Transaction<'_>, key: &str) -> SnapResult<Option<Record>> {
    tx.conn()
        .query_row(
            &format!("{SELECT_RECORD} WHERE s.key = ?1"),
            [key],
            RawRecord::from_row,
        )
        .optional()
        .map_err(from_rusqlite)?
        .map(RawRecord::into_record)
        .transpose()
}

fn load(tx: &Transaction<'_>, key: &str) -> SnapResult<Record> {
    find(tx, key)?.ok_or_else(|| not_found(key))
}

fn key_exists(tx: &Transaction<'_>, key: &str) -> SnapResult<bool> {
    tx.conn()
        .query_row("SELECT 1 FROM snapshots WHERE key = ?1", [key], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
        .map_err(from_rusqlite)
}

/// Ancestor ids starting at `first`, nearest first.
fn ancestors(tx: &Transaction<'_>, first: Option<i64>) -> SnapResult<Vec<VolumeName>> {
    let mut stmt = tx
        .conn()
        .prepare_cached("SELECT parent_id FROM snapshots WHERE id = ?1")
        .map_err(from_rusqlite)?;

    let mut chain = Vec::new();
    let mut next = first;
    while let Some(id) = next {
        chain.push(volume_name(id)?);
        next = stmt
            .query_row([id], |row| row.get(0))
            .map_err(from_rusqlite)?;
    }
    Ok(chain)
}

fn labels_json(labels: &BTreeMap<String, String>) -> SnapResult<String> {
    Ok(serde_json::to_string(labels)?)
}

/// Create an active or view record under `key`, optionally on top of the
/// committed snapshot `parent` (empty for none).
///
/// # Errors
///
/// - [`SnapError::AlreadyExists`] if `key` is taken
/// - [`SnapError::NotFound`] if `parent` does not exist
/// - [`SnapError::FailedPrecondition`] if `parent` is not committed
pub fn create_snapshot(
    tx: &Transaction<'_>,
    kind: Kind,
    key: &str,
    parent: &str,
    opts: &SnapshotOptions,
) -> SnapResult<Snapshot> {
    tx.require_writable()?;
    if kind == Kind::Committed {
        return Err(SnapError::InvalidArgument {
            message: "snapshots are created active or view, not committed".to_string(),
        });
    }
    if key.is_empty() {
        return Err(SnapError::InvalidArgument {
            message: "snapshot key must not be empty".to_string(),
        });
    }
    if key_exists(tx, key)? {
        return Err(SnapError::AlreadyExists {
            what: format!("snapshot {key:?}"),
        });
    }

    let parent_id = if parent.is_empty() {
        None
    } else {
        let record = find(tx, parent)?.ok_or_else(|| SnapError::NotFound {
            what: format!("parent snapshot {parent:?}"),
        })?;
        if record.info.kind != Kind::Committed {
            return Err(SnapError::FailedPrecondition {
                message: format!("parent {parent:?} is not committed"),
            });
        }
        Some(record.id)
    };

    let now = Utc::now();
    tx.conn()
        .execute(
            "INSERT INTO snapshots (key, kind, parent_id, labels, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![key, kind.as_str(), parent_id, labels_json(&opts.labels)?, now],
        )
        .map_err(from_rusqlite)?;
    let id = tx.conn().last_insert_rowid();

    tracing::debug!(key, %kind, id, ?parent_id, "Created snapshot record");
    Ok(Snapshot {
        id: volume_name(id)?,
        kind,
        parent_ids: ancestors(tx, parent_id)?,
    })
}

/// Id, info and recorded usage of `key`.
///
/// # Errors
///
/// Returns [`SnapError::NotFound`] if `key` does not exist.
pub fn get_info(tx: &Transaction<'_>, key: &str) -> SnapResult<(VolumeName, Info, Usage)> {
    let record = load(tx, key)?;
    Ok((volume_name(record.id)?, record.info, record.usage))
}

/// Internal view of `key`.
///
/// # Errors
///
/// Returns [`SnapError::NotFound`] if `key` does not exist.
pub fn get_snapshot(tx: &Transaction<'_>, key: &str) -> SnapResult<Snapshot> {
    let record = load(tx, key)?;
    Ok(Snapshot {
        id: volume_name(record.id)?,
        kind: record.info.kind,
        parent_ids: ancestors(tx, record.parent_id)?,
    })
}

/// Apply the fields of `info` named by `field_paths` to its record.
///
/// Only labels are mutable: `labels` replaces every label, `labels.<k>`
/// sets or (when absent from `info`) removes one. No paths means `labels`.
///
/// # Errors
///
/// - [`SnapError::NotFound`] if the record does not exist
/// - [`SnapError::InvalidArgument`] for any other field path
pub fn update_info(tx: &Transaction<'_>, info: &Info, field_paths: &[String]) -> SnapResult<Info> {
    tx.require_writable()?;
    let mut record = load(tx, &info.name)?;

    if field_paths.is_empty() {
        record.info.labels.clone_from(&info.labels);
    }
    for path in field_paths {
        if path == "labels" {
            record.info.labels.clone_from(&info.labels);
        } else if let Some(label) = path.strip_prefix("labels.") {
            match info.labels.get(label) {
                Some(value) => {
                    record.info.labels.insert(label.to_string(), value.clone());
                }
                None => {
                    record.info.labels.remove(label);
                }
            }
        } else {
            return Err(SnapError::InvalidArgument {
                message: format!("cannot update {path:?} field on snapshot {:?}", info.name),
            });
        }
    }

    record.info.updated = Utc::now();
    tx.conn()
        .execute(
            "UPDATE snapshots SET labels = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                labels_json(&record.info.labels)?,
                record.info.updated,
                record.id
            ],
        )
        .map_err(from_rusqlite)?;

    Ok(record.info)
}

/// Turn the active snapshot `key` into the committed snapshot `name`,
/// recording its final usage. The id is kept; labels come from `opts`.
///
/// # Errors
///
/// - [`SnapError::AlreadyExists`] if `name` is taken
/// - [`SnapError::NotFound`] if `key` does not exist
/// - [`SnapError::FailedPrecondition`] if `key` is not active
pub fn commit_active(
    tx: &Transaction<'_>,
    key: &str,
    name: &str,
    usage: Usage,
    opts: &SnapshotOptions,
) -> SnapResult<VolumeName> {
    tx.require_writable()?;
    if name.is_empty() {
        return Err(SnapError::InvalidArgument {
            message: "committed name must not be empty".to_string(),
        });
    }
    if key_exists(tx, name)? {
        return Err(SnapError::AlreadyExists {
            what: format!("snapshot {name:?}"),
        });
    }

    let record = load(tx, key)?;
    if record.info.kind != Kind::Active {
        return Err(SnapError::FailedPrecondition {
            message: format!("snapshot {key:?} is {}, not active", record.info.kind),
        });
    }

    let now = Utc::now();
    tx.conn()
        .execute(
            "UPDATE snapshots
             SET key = ?1, kind = 'committed', labels = ?2, created_at = ?3, updated_at = ?3,
                 size = ?4, inodes = ?5
             WHERE id = ?6",
            params![
                name,
                labels_json(&opts.labels)?,
                now,
                usage.size,
                usage.inodes,
                record.id
            ],
        )
        .map_err(from_rusqlite)?;

    tracing::debug!(key, name, id = record.id, "Committed snapshot record");
    volume_name(record.id)
}

/// Delete the record of `key`, returning its id and kind.
///
/// # Errors
///
/// - [`SnapError::NotFound`] if `key` does not exist
/// - [`SnapError::FailedPrecondition`] if other snapshots use it as parent
pub fn remove(tx: &Transaction<'_>, key: &str) -> SnapResult<(VolumeName, Kind)> {
    tx.require_writable()?;
    let record = load(tx, key)?;

    let children: i64 = tx
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM snapshots WHERE parent_id = ?1",
            [record.id],
            |row| row.get(0),
        )
        .map_err(from_rusqlite)?;
    if children > 0 {
        return Err(SnapError::FailedPrecondition {
            message: format!("cannot remove snapshot {key:?}: it has {children} children"),
        });
    }

    tx.conn()
        .execute("DELETE FROM snapshots WHERE id = ?1", [record.id])
        .map_err(from_rusqlite)?;

    tracing::debug!(key, id = record.id, "Removed snapshot record");
    Ok((volume_name(record.id)?, record.info.kind))
}

/// Call `visit` with every snapshot's info, ordered by key.
///
/// # Errors
///
/// Stops at and returns the first error from the store or from `visit`.
pub fn walk_info(
    tx: &Transaction<'_>,
    mut visit: impl FnMut(&Info) -> SnapResult<()>,
) -> SnapResult<()> {
    let mut stmt = tx
        .conn()
        .prepare(&format!("{SELECT_RECORD} ORDER BY s.key"))
        .map_err(from_rusqlite)?;
    let rows = stmt
        .query_map([], RawRecord::from_row)
        .map_err(from_rusqlite)?;

    for row in rows {
        let record = row.map_err(from_rusqlite)?.into_record()?;
        visit(&record.info)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetaStore;
    use proptest::prelude::*;

    fn open() -> (tempfile::TempDir, MetaStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("metadata.db")).unwrap();
        (dir, store)
    }

    fn prepare(store: &MetaStore, key: &str, parent: &str) -> Snapshot {
        let tx = store.transaction(true).unwrap();
        let snap =
            create_snapshot(&tx, Kind::Active, key, parent, &SnapshotOptions::default()).unwrap();
        tx.commit().unwrap();
        snap
    }

    fn commit(store: &MetaStore, key: &str, name: &str) -> VolumeName {
        let tx = store.transaction(true).unwrap();
        let id = commit_active(
            &tx,
            key,
            name,
            Usage::default(),
            &SnapshotOptions::default(),
        )
        .unwrap();
        tx.commit().unwrap();
        id
    }

    #[test]
    fn create_and_get() {
        let (_dir, store) = open();
        let snap = prepare(&store, "layer1", "");
        assert_eq!(snap.kind, Kind::Active);
        assert!(snap.parent_ids.is_empty());

        let tx = store.transaction(false).unwrap();
        let (id, info, usage) = get_info(&tx, "layer1").unwrap();
        assert_eq!(id, snap.id);
        assert_eq!(info.name, "layer1");
        assert_eq!(info.kind, Kind::Active);
        assert_eq!(info.parent, None);
        assert_eq!(usage, Usage::default());
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let (_dir, store) = open();
        prepare(&store, "a", "");
        let tx = store.transaction(true).unwrap();
        let err = create_snapshot(&tx, Kind::Active, "a", "", &SnapshotOptions::default())
            .unwrap_err();
        assert!(matches!(err, SnapError::AlreadyExists { .. }));
    }

    #[test]
    fn parent_must_exist_and_be_committed() {
        let (_dir, store) = open();
        prepare(&store, "active", "");

        let tx = store.transaction(true).unwrap();
        let opts = SnapshotOptions::default();
        assert!(
            create_snapshot(&tx, Kind::Active, "x", "missing", &opts)
                .unwrap_err()
                .is_not_found()
        );
        assert!(matches!(
            create_snapshot(&tx, Kind::View, "x", "active", &opts),
            Err(SnapError::FailedPrecondition { .. })
        ));
    }

    #[test]
    fn commit_keeps_id_and_renames() {
        let (_dir, store) = open();
        let active = prepare(&store, "layer1", "");
        let committed = commit(&store, "layer1", "base");
        assert_eq!(active.id, committed);

        let tx = store.transaction(false).unwrap();
        assert!(get_info(&tx, "layer1").unwrap_err().is_not_found());
        let (_, info, _) = get_info(&tx, "base").unwrap();
        assert_eq!(info.kind, Kind::Committed);
    }

    #[test]
    fn commit_requires_active() {
        let (_dir, store) = open();
        prepare(&store, "layer1", "");
        commit(&store, "layer1", "base");

        let tx = store.transaction(true).unwrap();
        create_snapshot(&tx, Kind::View, "v", "base", &SnapshotOptions::default()).unwrap();
        let err = commit_active(&tx, "v", "v2", Usage::default(), &SnapshotOptions::default())
            .unwrap_err();
        assert!(matches!(err, SnapError::FailedPrecondition { .. }));
        let err = commit_active(&tx, "base", "b2", Usage::default(), &SnapshotOptions::default())
            .unwrap_err();
        assert!(matches!(err, SnapError::FailedPrecondition { .. }));
    }

    #[test]
    fn parents_chain_nearest_first() {
        let (_dir, store) = open();
        let base = prepare(&store, "l1", "");
        commit(&store, "l1", "base");
        let mid = prepare(&store, "l2", "base");
        commit(&store, "l2", "mid");
        let top = prepare(&store, "l3", "mid");

        assert_eq!(top.parent_ids, vec![mid.id.clone(), base.id.clone()]);

        let tx = store.transaction(false).unwrap();
        assert_eq!(get_snapshot(&tx, "l3").unwrap().parent_ids, vec![mid.id, base.id]);
        let (_, info, _) = get_info(&tx, "l3").unwrap();
        assert_eq!(info.parent.as_deref(), Some("mid"));
    }

    #[test]
    fn parents_with_children_cannot_be_removed() {
        let (_dir, store) = open();
        prepare(&store, "l1", "");
        commit(&store, "l1", "base");
        prepare(&store, "child", "base");

        let tx = store.transaction(true).unwrap();
        assert!(matches!(
            remove(&tx, "base"),
            Err(SnapError::FailedPrecondition { .. })
        ));
        let (_, kind) = remove(&tx, "child").unwrap();
        assert_eq!(kind, Kind::Active);
        let (_, kind) = remove(&tx, "base").unwrap();
        assert_eq!(kind, Kind::Committed);
        tx.commit().unwrap();
    }

    #[test]
    fn ids_are_not_reused() {
        let (_dir, store) = open();
        let first = prepare(&store, "a", "");
        let tx = store.transaction(true).unwrap();
        remove(&tx, "a").unwrap();
        tx.commit().unwrap();

        let second = prepare(&store, "a", "");
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn update_field_paths() {
        let (_dir, store) = open();
        let tx = store.transaction(true).unwrap();
        let opts = SnapshotOptions::default()
            .with_label("keep", "1")
            .with_label("drop", "2");
        create_snapshot(&tx, Kind::Active, "a", "", &opts).unwrap();
        let (_, mut info, _) = get_info(&tx, "a").unwrap();

        info.labels.remove("drop");
        info.labels.insert("new".to_string(), "3".to_string());
        info.labels.insert("ignored".to_string(), "4".to_string());
        let updated = update_info(
            &tx,
            &info,
            &["labels.drop".to_string(), "labels.new".to_string()],
        )
        .unwrap();
        assert_eq!(updated.labels.get("keep").map(String::as_str), Some("1"));
        assert_eq!(updated.labels.get("new").map(String::as_str), Some("3"));
        assert!(!updated.labels.contains_key("drop"));
        assert!(!updated.labels.contains_key("ignored"));

        let replaced = update_info(&tx, &info, &[]).unwrap();
        assert_eq!(replaced.labels, info.labels);

        let err = update_info(&tx, &info, &["kind".to_string()]).unwrap_err();
        assert!(matches!(err, SnapError::InvalidArgument { .. }));
    }

    #[test]
    fn walk_visits_in_key_order() {
        let (_dir, store) = open();
        prepare(&store, "b", "");
        prepare(&store, "a", "");
        commit(&store, "a", "c");

        let tx = store.transaction(false).unwrap();
        let mut seen = Vec::new();
        walk_info(&tx, |info| {
            seen.push((info.name.clone(), info.kind));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![
                ("b".to_string(), Kind::Active),
                ("c".to_string(), Kind::Committed)
            ]
        );
    }

    #[test]
    fn writes_need_a_writable_transaction() {
        let (_dir, store) = open();
        let tx = store.transaction(false).unwrap();
        let err = create_snapshot(&tx, Kind::Active, "a", "", &SnapshotOptions::default())
            .unwrap_err();
        assert!(matches!(err, SnapError::FailedPrecondition { .. }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn labels_survive_storage(
            labels in prop::collection::btree_map("[a-z./]{1,12}", "\\PC{0,24}", 0..8)
        ) {
            let (_dir, store) = open();
            let tx = store.transaction(true).unwrap();
            let opts = SnapshotOptions { labels: labels.clone() };
            create_snapshot(&tx, Kind::Active, "layer", "", &opts).unwrap();
            tx.commit().unwrap();

            let tx = store.transaction(false).unwrap();
            let (_, info, _) = get_info(&tx, "layer").unwrap();
            prop_assert_eq!(info.labels, labels);
        }
    }
}
