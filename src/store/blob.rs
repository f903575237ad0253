//! Directory-backed blob store.
//!
//! One file per blob under `~/.fastread/blobs/`. Writes go through
//! write-temp-then-rename so a crash never tears the accumulator.

use std::path::PathBuf;

use super::{BlobHandle, BlobStore};
use crate::error::StoreError;
use crate::util::atomic_write_str;

pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    pub fn open() -> Result<Self, StoreError> {
        let home = dirs::home_dir().ok_or(StoreError::NoStateDir)?;
        Self::open_at(home.join(".fastread").join("blobs"))
    }

    pub fn open_at(dir: PathBuf) -> Result<Self, StoreError> {
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl BlobStore for FileBlobStore {
    fn read_or_init(&self, name: &str, init: &str) -> Result<(String, BlobHandle), StoreError> {
        let path = self.path_for(name);
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            return Ok((content, BlobHandle(name.to_string())));
        }
        atomic_write_str(&path, init)?;
        Ok((init.to_string(), BlobHandle(name.to_string())))
    }

    fn write(&self, handle: &BlobHandle, content: &str) -> Result<(), StoreError> {
        atomic_write_str(&self.path_for(&handle.0), content)?;
        Ok(())
    }

    fn trash(&self, name: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, FileBlobStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileBlobStore::open_at(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_read_or_init_creates_with_init() {
        let (_dir, store) = open_temp();
        let (content, handle) = store.read_or_init("acc.json", "{}").unwrap();
        assert_eq!(content, "{}");
        assert_eq!(handle.0, "acc.json");

        // Second read sees the stored content, not the init value.
        store.write(&handle, r#"{"x":1}"#).unwrap();
        let (content, _) = store.read_or_init("acc.json", "{}").unwrap();
        assert_eq!(content, r#"{"x":1}"#);
    }

    #[test]
    fn test_trash_is_idempotent() {
        let (_dir, store) = open_temp();
        store.read_or_init("acc.json", "{}").unwrap();
        store.trash("acc.json").unwrap();
        store.trash("acc.json").unwrap();
        let (content, _) = store.read_or_init("acc.json", "fresh").unwrap();
        assert_eq!(content, "fresh");
    }
}
