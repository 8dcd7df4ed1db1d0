//! Snapshot persistence for the in-memory store.
//!
//! Commits serialize every map into a single MessagePack file, written to a
//! temporary file first and atomically moved into place so a crash mid-write
//! leaves the previous snapshot intact.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::core::{DbError, Result, Value, VersionedValue};
use crate::transaction::state::PreparedRecord;
use crate::transaction::undo_log::UndoEntry;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub next_map_id: u32,
    pub maps: Vec<MapSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MapSnapshot {
    pub name: String,
    pub map_id: u32,
    pub entries: MapEntries,
}

/// Entries tagged with the map's value kind, so a reopened store restores
/// each map under the kind it was created with.
#[derive(Debug, Serialize, Deserialize)]
pub enum MapEntries {
    Data(Vec<(Value, VersionedValue)>),
    Undo(Vec<(u64, UndoEntry)>),
    Meta(Vec<(u32, PreparedRecord)>),
}

pub fn write_snapshot(snapshot: &StoreSnapshot, path: &Path) -> Result<()> {
    let bytes = rmp_serde::to_vec(snapshot)
        .map_err(|err| DbError::SerializationError(err.to_string()))?;

    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .map_err(|err| DbError::IoError(format!("Failed to create snapshot directory: {}", err)))?;

    let mut file = NamedTempFile::new_in(dir)
        .map_err(|err| DbError::IoError(format!("Failed to create snapshot file: {}", err)))?;
    file.write_all(&bytes)
        .map_err(|err| DbError::IoError(format!("Failed to write snapshot: {}", err)))?;
    file.persist(path)
        .map_err(|err| DbError::IoError(format!("Failed to persist snapshot: {}", err)))?;
    Ok(())
}

pub fn read_snapshot(path: &Path) -> Result<StoreSnapshot> {
    let bytes = fs::read(path)
        .map_err(|err| DbError::IoError(format!("Failed to read snapshot: {}", err)))?;
    let snapshot: StoreSnapshot = rmp_serde::from_slice(&bytes)
        .map_err(|err| DbError::SerializationError(err.to_string()))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(DbError::SerializationError(format!(
            "Unsupported snapshot version: {}",
            snapshot.version
        )));
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.snapshot");

        let snapshot = StoreSnapshot {
            version: SNAPSHOT_VERSION,
            next_map_id: 3,
            maps: vec![MapSnapshot {
                name: "accounts".to_string(),
                map_id: 2,
                entries: MapEntries::Data(vec![(
                    Value::from("alice"),
                    VersionedValue::new(Value::Integer(100)),
                )]),
            }],
        };
        write_snapshot(&snapshot, &path).unwrap();

        let loaded = read_snapshot(&path).unwrap();
        assert_eq!(loaded.next_map_id, 3);
        assert_eq!(loaded.maps.len(), 1);
        assert_eq!(loaded.maps[0].name, "accounts");
        match &loaded.maps[0].entries {
            MapEntries::Data(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].0, Value::from("alice"));
            }
            _ => panic!("snapshot restored under the wrong map kind"),
        }
    }

    #[test]
    fn test_missing_snapshot_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_snapshot(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, DbError::IoError(_)));
    }
}
