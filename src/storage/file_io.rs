//! Whole-file JSON persistence for history records and collection files.
//!
//! Writers stage the new contents in a uniquely named file beside the target
//! and rename it into place, so readers in this or another process only ever
//! see a complete previous or complete next version.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;

use crate::error::EngineError;

fn storage_err(action: &str, path: &Path, e: impl std::fmt::Display) -> EngineError {
    EngineError::Storage(format!("{} {}: {}", action, path.display(), e))
}

/// Load a JSON document. A file that was never written yields `T::default()`.
pub fn read_json<T, P>(path: P) -> Result<T, EngineError>
where
    T: DeserializeOwned + Default,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(storage_err("Cannot open", path, e)),
    };
    serde_json::from_reader(BufReader::new(file)).map_err(|e| storage_err("Cannot parse", path, e))
}

/// Replace `path` with the pretty-printed JSON of `data`.
///
/// The staged file is synced before the rename. On any error the target is
/// left as it was and the staged file is removed.
pub fn write_json_atomic<T, P>(path: P, data: &T) -> Result<(), EngineError>
where
    T: Serialize,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| storage_err("Cannot create directory", dir, e))?;

    let staged = NamedTempFile::new_in(dir).map_err(|e| storage_err("Cannot stage", path, e))?;
    {
        let mut out = BufWriter::new(staged.as_file());
        serde_json::to_writer_pretty(&mut out, data)
            .map_err(|e| storage_err("Cannot encode", path, e))?;
        out.flush().map_err(|e| storage_err("Cannot write", path, e))?;
    }
    staged
        .as_file()
        .sync_all()
        .map_err(|e| storage_err("Cannot sync", path, e))?;

    staged
        .persist(path)
        .map_err(|e| storage_err("Cannot replace", path, e.error))?;
    Ok(())
}
