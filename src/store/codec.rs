//! JSON file codec for ledgers, records and parameters.
//!
//! Writes go to a uniquely named temp file in the target directory and are
//! renamed into place, so a reader never observes a half-written file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::IndexError;

/// Outcome of reading a JSON file that is allowed to be missing.
#[derive(Debug)]
pub enum Decoded<T> {
    /// The file does not exist.
    Absent,
    /// The file exists and parsed.
    Parsed(T),
    /// The file exists but does not parse.
    Corrupt(String),
}

/// Reads and parses `path`, separating "missing" and "unparseable" from I/O failures.
///
/// # Errors
/// Returns `IndexError::Io` for read failures other than `NotFound`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Decoded<T>, IndexError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Decoded::Absent),
        Err(e) => return Err(IndexError::io(format!("reading {}", path.display()), e)),
    };

    Ok(match serde_json::from_slice(&bytes) {
        Ok(value) => Decoded::Parsed(value),
        Err(e) => Decoded::Corrupt(e.to_string()),
    })
}

/// Reads a file that must exist and parse.
///
/// # Errors
/// - `IndexError::NotFound` if the file is missing
/// - `IndexError::Serialization` if it does not parse
pub fn read_required<T: DeserializeOwned>(path: &Path) -> Result<T, IndexError> {
    match read_json(path)? {
        Decoded::Parsed(value) => Ok(value),
        Decoded::Absent => Err(IndexError::NotFound {
            path: path.to_path_buf(),
        }),
        Decoded::Corrupt(reason) => Err(IndexError::Serialization {
            path: path.to_path_buf(),
            reason,
        }),
    }
}

/// Serializes `value` to `path` through a temp file and rename.
///
/// Returns `Ok(false)` without touching the target when it already exists
/// and `overwrite` is false.
///
/// # Errors
/// Returns `IndexError::Io` or `IndexError::Serialization` on failure; the temp
/// file is removed on every error path.
pub fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
    overwrite: bool,
    sync: bool,
) -> Result<bool, IndexError> {
    let temp = TempFile::new(path);
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp.path)
        .map_err(|e| IndexError::io(format!("creating {}", temp.path.display()), e))?;

    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|e| IndexError::Serialization {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    writer
        .write_all(b"\n")
        .and_then(|()| writer.flush())
        .map_err(|e| IndexError::io(format!("writing {}", temp.path.display()), e))?;
    if sync {
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| IndexError::io(format!("syncing {}", temp.path.display()), e))?;
    }
    drop(writer);

    if overwrite {
        fs::rename(&temp.path, path)
            .map_err(|e| IndexError::io(format!("renaming into {}", path.display()), e))?;
    } else {
        // hard_link fails if the target exists, which rename would silently replace.
        match fs::hard_link(&temp.path, path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(IndexError::io(format!("linking into {}", path.display()), e));
            }
        }
    }

    if sync {
        sync_parent(path);
    }
    Ok(true)
}

/// Best effort; not every platform can open a directory for syncing.
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

/// Temp file removed on drop unless it has already been renamed away.
struct TempFile {
    path: PathBuf,
}

impl TempFile {
    fn new(target: &Path) -> Self {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            path: target.with_file_name(format!(".{name}.tmp.{}", Uuid::new_v4())),
        }
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    fn sample(count: u32) -> Sample {
        Sample {
            name: "focus".to_string(),
            count,
        }
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");

        assert!(write_json_atomic(&path, &sample(1), false, true).unwrap());
        let back: Sample = read_required(&path).unwrap();
        assert_eq!(back, sample(1));
    }

    #[test]
    fn test_no_overwrite_leaves_original() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");

        write_json_atomic(&path, &sample(1), false, false).unwrap();
        assert!(!write_json_atomic(&path, &sample(2), false, false).unwrap());

        let back: Sample = read_required(&path).unwrap();
        assert_eq!(back.count, 1);
    }

    #[test]
    fn test_overwrite_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");

        write_json_atomic(&path, &sample(1), false, false).unwrap();
        assert!(write_json_atomic(&path, &sample(2), true, false).unwrap());

        let back: Sample = read_required(&path).unwrap();
        assert_eq!(back.count, 2);
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");

        write_json_atomic(&path, &sample(1), false, false).unwrap();
        write_json_atomic(&path, &sample(2), false, false).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["sample.json".to_string()]);
    }

    #[test]
    fn test_absent_and_corrupt_are_distinguished() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(read_json::<Sample>(&missing).unwrap(), Decoded::Absent));

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ not json").unwrap();
        assert!(matches!(read_json::<Sample>(&broken).unwrap(), Decoded::Corrupt(_)));

        let err = read_required::<Sample>(&missing).unwrap_err();
        assert!(matches!(err, IndexError::NotFound { .. }));
        let err = read_required::<Sample>(&broken).unwrap_err();
        assert!(matches!(err, IndexError::Serialization { .. }));
    }
}
