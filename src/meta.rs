//! Small JSON metadata files.
//!
//! Used for the store's clean-shutdown marker and the per-queue recovery
//! terms. Writes go through a temp file, fsync and atomic rename so a
//! crash can never leave a half-written marker behind; the absence of a
//! marker is itself the unclean-shutdown signal.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Error, Result};

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value)
        .map_err(|_| Error::CorruptMetadata("metadata serialization"))?;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Read and deserialize a metadata file. `Ok(None)` when absent.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|_| Error::CorruptMetadata("metadata deserialization"))
}

/// Read a metadata file and delete it, so the next start without a fresh
/// write observes an unclean shutdown.
pub fn take_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let value = read_json(path)?;
    if value.is_some() {
        std::fs::remove_file(path)?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Marker {
        refs: Vec<String>,
        count: u64,
    }

    #[test]
    fn round_trip_and_take() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clean.meta");
        let marker = Marker {
            refs: vec!["ab".into()],
            count: 7,
        };

        write_json(&path, &marker).unwrap();
        assert_eq!(read_json::<Marker>(&path).unwrap().unwrap(), marker);

        let taken = take_json::<Marker>(&path).unwrap().unwrap();
        assert_eq!(taken, marker);
        assert!(read_json::<Marker>(&path).unwrap().is_none());
    }

    #[test]
    fn corrupt_metadata_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clean.meta");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(read_json::<Marker>(&path).is_err());
    }
}
