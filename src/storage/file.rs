use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::{Persistence, PersistenceError};

/// Stores each key as `<dir>/<key>.json`.
///
/// Saves write a sibling temp file, fsync it, then rename over the target,
/// so a crash mid-write leaves the previous value intact.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens the store, creating `dir` if needed.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }
}

/// Restricts keys to a safe file-name alphabet.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl Persistence for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::from_io(key, 0, e)),
        }
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        let target = self.path_for(key);
        let tmp = target.with_extension("json.tmp");

        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &target)
        };

        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            PersistenceError::from_io(key, bytes.len(), e)
        })
    }

    fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::from_io(key, 0, e)),
        }
    }
}
