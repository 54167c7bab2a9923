//! Atomic JSON writes: temp file in the target's directory, fsync, rename.

use crate::Result;
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::trace;

/// Write `value` as pretty JSON to `path` so that readers see either the old
/// file or the complete new one.
///
/// The temp file is created next to `path` (same filesystem) and removed on
/// any failure before the rename.
pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut temp = tempfile::Builder::new()
        .prefix(&format!("{}_", stem))
        .suffix(".tmp")
        .tempfile_in(parent)?;

    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| e.error)?;
    sync_dir(parent);

    trace!(target: "synapse::store", "Atomically wrote {}", path.display());
    Ok(())
}

/// Make the rename itself durable. Best effort.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_write_creates_parent_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("doc.json");

        write_json(&path, &json!({"v": 1})).unwrap();
        write_json(&path, &json!({"v": 2})).unwrap();

        let back: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back["v"], 2);

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
