//! One file per document under a data directory.
//!
//! Document names are percent-encoded into a single path component, so
//! `alice/notes` is stored as `<data_dir>/alice%2Fnotes.txt`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, info};

use super::{Persister, StoreError};
use crate::escape;

const EXTENSION: &str = "txt";

#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Use `dir`, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Where `name` is stored.
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", escape::escape_file_name(name), EXTENSION))
    }

    /// Remove documents whose file has not been written within `max_age`.
    pub fn purge_expired(&self, max_age: Duration) -> Result<usize, StoreError> {
        let now = SystemTime::now();
        let mut purged = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let modified = fs::metadata(&path)?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age {
                info!("Purging expired document file {}", path.display());
                fs::remove_file(&path)?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

impl Persister for FileStore {
    fn load(&self, name: &str) -> Result<Option<String>, StoreError> {
        let path = self.file_path(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} bytes from {}", bytes.len(), path.display());
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| StoreError::InvalidText(name.to_string()))
    }

    fn save(&self, name: &str, text: Option<&str>) -> Result<(), StoreError> {
        let path = self.file_path(name);
        let Some(text) = text else {
            return match fs::remove_file(&path) {
                Ok(()) => {
                    info!("Deleted {}", path.display());
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        };

        // Write beside the target and rename so readers never see a
        // partial file.
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        debug!("Saved {} bytes to {}", text.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save("alice/notes", Some("hi")).unwrap();
        let expected = dir.path().join("alice%2Fnotes.txt");
        assert_eq!(store.file_path("alice/notes"), expected);
        assert_eq!(fs::read_to_string(expected).unwrap(), "hi");
    }

    #[test]
    fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("nested")).unwrap();
        assert_eq!(store.load("doc").unwrap(), None);
        store.save("doc", Some("line one\nline two")).unwrap();
        assert_eq!(store.load("doc").unwrap().as_deref(), Some("line one\nline two"));
        store.save("doc", Some("")).unwrap();
        assert_eq!(store.load("doc").unwrap().as_deref(), Some(""));
        store.save("doc", None).unwrap();
        assert_eq!(store.load("doc").unwrap(), None);
        // Deleting twice is fine.
        store.save("doc", None).unwrap();
    }

    #[test]
    fn test_invalid_utf8_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        fs::write(store.file_path("bin"), [0xff, 0xfe]).unwrap();
        assert!(matches!(store.load("bin"), Err(StoreError::InvalidText(_))));
    }

    #[test]
    fn test_purge_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save("a", Some("x")).unwrap();
        fs::write(dir.path().join("unrelated.log"), "keep").unwrap();
        assert_eq!(store.purge_expired(Duration::from_secs(3600)).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.purge_expired(Duration::from_millis(1)).unwrap(), 1);
        assert_eq!(store.load("a").unwrap(), None);
        assert!(dir.path().join("unrelated.log").exists());
    }
}
