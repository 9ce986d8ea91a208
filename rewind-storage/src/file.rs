//! Flat-file store.
//!
//! Every entry is a single file directly under the base directory, named by
//! its key. Keys therefore have to be valid file names.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::error::{Result, StorageError};
use crate::traits::KeyValueStore;

/// Flat-file key/value store backend.
///
/// Mutations and prefix lookups are serialised through an internal lock;
/// point reads rely on `rename(2)` being atomic within a directory.
#[derive(Debug)]
pub struct FileStore {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create a new file store rooted at `base_path`.
    ///
    /// The directory is created lazily on first write.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Get the base path for this store.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn to_fs_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.base_path.join(key))
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = match fs::read_dir(&self.base_path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

fn validate_key(key: &str) -> Result<()> {
    let invalid = key.is_empty()
        || key == "."
        || key == ".."
        || key.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[async_trait]
impl KeyValueStore for FileStore {
    #[instrument(skip(self))]
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        let _guard = self.write_lock.lock().await;

        let mut found = Vec::new();
        for name in self.list_names().await? {
            if !name.starts_with(prefix) {
                continue;
            }
            match fs::read(self.base_path.join(&name)).await {
                Ok(data) => found.push((name, Bytes::from(data))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(found)
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let fs_path = self.to_fs_path(key)?;
        debug!("Reading from {:?}", fs_path);

        match fs::read(&fs_path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, value), fields(key = %key, size = value.len()))]
    async fn save(&self, key: &str, value: Bytes) -> Result<()> {
        let fs_path = self.to_fs_path(key)?;
        let _guard = self.write_lock.lock().await;

        fs::create_dir_all(&self.base_path).await?;
        debug!("Writing {} bytes to {:?}", value.len(), fs_path);
        fs::write(&fs_path, &value).await?;
        Ok(())
    }

    #[instrument(skip(self, value), fields(key = %key, size = value.len()))]
    async fn commit(
        &self,
        pending_key: &str,
        key: &str,
        value: Bytes,
        replaces_prefix: &str,
    ) -> Result<()> {
        let pending_path = self.to_fs_path(pending_key)?;
        let fs_path = self.to_fs_path(key)?;
        let _guard = self.write_lock.lock().await;

        fs::create_dir_all(&self.base_path).await?;
        let superseded: Vec<String> = self
            .list_names()
            .await?
            .into_iter()
            .filter(|name| name != key && name.starts_with(replaces_prefix))
            .collect();

        fs::write(&pending_path, &value).await?;
        if let Err(e) = fs::rename(&pending_path, &fs_path).await {
            if let Err(cleanup) = fs::remove_file(&pending_path).await {
                warn!("Failed to remove provisional file {:?}: {}", pending_path, cleanup);
            }
            return Err(e.into());
        }

        for name in superseded {
            match fs::remove_file(self.base_path.join(&name)).await {
                Ok(()) => debug!("Removed superseded entry {}", name),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove superseded entry {}: {}", name, e),
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<bool> {
        let fs_path = self.to_fs_path(key)?;
        let _guard = self.write_lock.lock().await;

        match fs::remove_file(&fs_path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn rename(&self, old_key: &str, new_key: &str) -> Result<()> {
        let from_path = self.to_fs_path(old_key)?;
        let to_path = self.to_fs_path(new_key)?;
        let _guard = self.write_lock.lock().await;

        debug!("Renaming {:?} to {:?}", from_path, to_path);
        match fs::rename(&from_path, &to_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(old_key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.list_names().await
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (FileStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("cache"));
        (store, dir)
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let (store, _dir) = create_test_store();
        store
            .save("hash_class_1_2_0_0", Bytes::from("body"))
            .await
            .unwrap();

        let read = store.get("hash_class_1_2_0_0").await.unwrap();
        assert_eq!(read, Some(Bytes::from("body")));
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let (store, _dir) = create_test_store();
        assert!(store.get("nothing").await.unwrap().is_none());
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let (store, _dir) = create_test_store();
        for key in ["", ".", "..", "a/b", "a\\b"] {
            let err = store.save(key, Bytes::from("x")).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidKey(_)), "{:?}", key);
        }
    }

    #[tokio::test]
    async fn test_find_by_prefix() {
        let (store, _dir) = create_test_store();
        store.save("aaa_bbb_1_2_0_0", Bytes::from("x")).await.unwrap();
        store.save("ccc_bbb_1_2_0_0", Bytes::from("y")).await.unwrap();

        assert_eq!(
            store.find_by_prefix("ccc_bbb_").await.unwrap(),
            vec![("ccc_bbb_1_2_0_0".to_string(), Bytes::from("y"))]
        );
        assert!(store.find_by_prefix("ddd_").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_replaces_superseded_entry() {
        let (store, _dir) = create_test_store();
        store
            .commit("pending-1", "aaa_bbb_1_2_0_0", Bytes::from("old"), "aaa_bbb_")
            .await
            .unwrap();
        store.save("ccc_bbb_1_2_0_0", Bytes::from("other")).await.unwrap();

        store
            .commit("pending-2", "aaa_bbb_3_4_0_0", Bytes::from("new"), "aaa_bbb_")
            .await
            .unwrap();

        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["aaa_bbb_3_4_0_0", "ccc_bbb_1_2_0_0"]);
        assert_eq!(
            store.get("aaa_bbb_3_4_0_0").await.unwrap(),
            Some(Bytes::from("new"))
        );
    }

    #[tokio::test]
    async fn test_rename_moves_payload() {
        let (store, _dir) = create_test_store();
        store.save("pending-x", Bytes::from("payload")).await.unwrap();
        store.rename("pending-x", "x_y_1_2_0_0").await.unwrap();

        assert!(store.get("pending-x").await.unwrap().is_none());
        assert_eq!(
            store.get("x_y_1_2_0_0").await.unwrap(),
            Some(Bytes::from("payload"))
        );
    }

    #[tokio::test]
    async fn test_rename_missing_source() {
        let (store, _dir) = create_test_store();
        store.save("other", Bytes::from("x")).await.unwrap();
        let err = store.rename("missing", "target").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_and_values() {
        let (store, _dir) = create_test_store();
        store.save("k1", Bytes::from("v1")).await.unwrap();
        store.save("k2", Bytes::from("v2")).await.unwrap();

        assert!(store.delete("k1").await.unwrap());
        assert!(!store.delete("k1").await.unwrap());

        let values = store.values().await.unwrap();
        assert_eq!(values, vec![("k2".to_string(), Bytes::from("v2"))]);
    }
}
