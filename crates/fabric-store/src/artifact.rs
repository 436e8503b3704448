// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! JSON artifact I/O shared by the durable subsystems.
//!
//! Every durable artifact (entities, deltas, closures registry, work ledger,
//! timeline) is written whole via temp-file-then-rename, so readers never
//! observe a partial write and a crash leaves either the old artifact or the
//! new one.

use crate::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Reads and deserializes a JSON artifact. `Ok(None)` when the file does not
/// exist.
///
/// # Errors
///
/// Returns [`StoreError`] on I/O or parse failure.
pub fn read_json_artifact<T>(path: &Path) -> Result<Option<T>, StoreError>
where
    T: DeserializeOwned,
{
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::Io(e)),
    };
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Serializes and writes a JSON artifact atomically (temp + rename).
///
/// # Errors
///
/// Returns [`StoreError`] on I/O or serialize failure.
pub fn write_json_artifact<T>(path: &Path, value: &T) -> Result<(), StoreError>
where
    T: Serialize,
{
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&tmp, &data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn round_trips_and_reports_absence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        assert!(read_json_artifact::<Value>(&path).unwrap().is_none());

        write_json_artifact(&path, &json!({"k": [1, 2, 3]})).unwrap();
        let loaded: Value = read_json_artifact(&path).unwrap().unwrap();
        assert_eq!(loaded, json!({"k": [1, 2, 3]}));

        // No stray temp file survives a completed write.
        assert!(!dir.path().join("sample.json.tmp").exists());
    }
}
