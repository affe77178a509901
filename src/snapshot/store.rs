//! Durable key/value storage for snapshot archives
//!
//! One namespaced slot per key, each holding one binary value that every
//! write replaces. Backends:
//! - `MemoryStore`: shared in-process map (tests, embedding)
//! - `DirectoryStore`: one file per key under a directory (native)
//! - `OpfsStore`: one file per key in an OPFS directory (browser)

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

/// Store failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend cannot be reached at all
    Unavailable { reason: String },
    /// Reading or writing a key failed
    Io { key: String, message: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { reason } => write!(f, "store unavailable: {}", reason),
            Self::Io { key, message } => write!(f, "store error for {}: {}", key, message),
        }
    }
}

impl std::error::Error for StoreError {}

/// A durable key/value store
pub trait DurableStore: 'static {
    /// `None` if nothing is stored under `key`
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>>;

    /// Replace the value under `key`
    fn put(&self, key: &str, value: Vec<u8>) -> impl Future<Output = Result<(), StoreError>>;

    /// Remove `key`; removing a missing key is not an error
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), StoreError>>;
}

/// In-process store. Clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Rc<RefCell<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.borrow().contains_key(key)
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.borrow().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.borrow_mut().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use native::DirectoryStore;

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use super::{DurableStore, StoreError};
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    /// One file per key under a root directory
    #[derive(Clone, Debug)]
    pub struct DirectoryStore {
        root: PathBuf,
    }

    impl DirectoryStore {
        /// The directory is created on first write
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
            if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
                return Err(StoreError::Io {
                    key: key.to_string(),
                    message: "invalid key".to_string(),
                });
            }
            Ok(self.root.join(key))
        }
    }

    fn io_error(key: &str, e: io::Error) -> StoreError {
        StoreError::Io {
            key: key.to_string(),
            message: e.to_string(),
        }
    }

    impl DurableStore for DirectoryStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            match fs::read(self.path_for(key)?) {
                Ok(data) => Ok(Some(data)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(io_error(key, e)),
            }
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
            let path = self.path_for(key)?;
            fs::create_dir_all(&self.root).map_err(|e| io_error(key, e))?;

            // Write then rename, so a crash never leaves half an archive
            let partial = self.root.join(format!(".{}.partial", key));
            fs::write(&partial, &value).map_err(|e| io_error(key, e))?;
            fs::rename(&partial, &path).map_err(|e| io_error(key, e))
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            match fs::remove_file(self.path_for(key)?) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_error(key, e)),
            }
        }
    }
}

#[cfg(target_arch = "wasm32")]
pub use opfs::OpfsStore;

#[cfg(target_arch = "wasm32")]
mod opfs {
    use super::{DurableStore, StoreError};
    use wasm_bindgen::JsCast;
    use wasm_bindgen_futures::JsFuture;

    /// Default OPFS directory for snapshot data
    pub const DEFAULT_DIR: &str = "isobox";

    /// One file per key in an OPFS directory
    #[derive(Clone, Debug)]
    pub struct OpfsStore {
        dir: String,
    }

    impl Default for OpfsStore {
        fn default() -> Self {
            Self::new(DEFAULT_DIR)
        }
    }

    fn io_error(key: &str, what: &str, e: wasm_bindgen::JsValue) -> StoreError {
        StoreError::Io {
            key: key.to_string(),
            message: format!("{}: {:?}", what, e),
        }
    }

    impl OpfsStore {
        pub fn new(dir: impl Into<String>) -> Self {
            Self { dir: dir.into() }
        }

        /// Get the OPFS root directory handle
        async fn root() -> Result<web_sys::FileSystemDirectoryHandle, StoreError> {
            let unavailable = |reason: String| StoreError::Unavailable { reason };
            let window = web_sys::window().ok_or_else(|| unavailable("no window object".into()))?;
            let storage = window.navigator().storage();

            JsFuture::from(storage.get_directory())
                .await
                .map_err(|e| unavailable(format!("failed to get OPFS root: {:?}", e)))?
                .dyn_into()
                .map_err(|_| unavailable("OPFS root is not a directory handle".into()))
        }

        /// Get or create the store directory
        async fn directory(&self) -> Result<web_sys::FileSystemDirectoryHandle, StoreError> {
            let root = Self::root().await?;

            let dir_opts = web_sys::FileSystemGetDirectoryOptions::new();
            dir_opts.set_create(true);

            JsFuture::from(root.get_directory_handle_with_options(&self.dir, &dir_opts))
                .await
                .map_err(|e| StoreError::Unavailable {
                    reason: format!("failed to open {}: {:?}", self.dir, e),
                })?
                .dyn_into()
                .map_err(|_| StoreError::Unavailable {
                    reason: format!("{} is not a directory handle", self.dir),
                })
        }
    }

    impl DurableStore for OpfsStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            let dir = self.directory().await?;

            let file_opts = web_sys::FileSystemGetFileOptions::new();
            file_opts.set_create(false);

            let file_handle: web_sys::FileSystemFileHandle =
                match JsFuture::from(dir.get_file_handle_with_options(key, &file_opts)).await {
                    Ok(handle) => handle
                        .dyn_into()
                        .map_err(|e| io_error(key, "not a file handle", e))?,
                    Err(_) => return Ok(None),
                };

            let file: web_sys::File = JsFuture::from(file_handle.get_file())
                .await
                .map_err(|e| io_error(key, "failed to get file", e))?
                .dyn_into()
                .map_err(|e| io_error(key, "not a file", e))?;

            let array_buffer = JsFuture::from(file.array_buffer())
                .await
                .map_err(|e| io_error(key, "failed to read file", e))?;

            Ok(Some(js_sys::Uint8Array::new(&array_buffer).to_vec()))
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
            let dir = self.directory().await?;

            let file_opts = web_sys::FileSystemGetFileOptions::new();
            file_opts.set_create(true);

            let file_handle: web_sys::FileSystemFileHandle =
                JsFuture::from(dir.get_file_handle_with_options(key, &file_opts))
                    .await
                    .map_err(|e| io_error(key, "failed to get file handle", e))?
                    .dyn_into()
                    .map_err(|e| io_error(key, "not a file handle", e))?;

            // The writable swaps in its contents atomically on close
            let writable: web_sys::FileSystemWritableFileStream =
                JsFuture::from(file_handle.create_writable())
                    .await
                    .map_err(|e| io_error(key, "failed to create writable", e))?
                    .dyn_into()
                    .map_err(|e| io_error(key, "not a writable stream", e))?;

            let data = js_sys::Uint8Array::from(value.as_slice());
            let write = writable
                .write_with_buffer_source(&data)
                .map_err(|e| io_error(key, "failed to start write", e))?;
            JsFuture::from(write)
                .await
                .map_err(|e| io_error(key, "failed to write", e))?;

            JsFuture::from(writable.close())
                .await
                .map_err(|e| io_error(key, "failed to close", e))?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            let dir = self.directory().await?;
            // A missing entry rejects; that is fine here
            JsFuture::from(dir.remove_entry(key)).await.ok();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn test_memory_store_clones_share() {
        let store = MemoryStore::new();
        let other = store.clone();

        block_on(store.put("memory", b"one".to_vec())).unwrap();
        assert_eq!(block_on(other.get("memory")).unwrap(), Some(b"one".to_vec()));

        block_on(other.put("memory", b"two".to_vec())).unwrap();
        assert_eq!(block_on(store.get("memory")).unwrap(), Some(b"two".to_vec()));

        block_on(store.delete("memory")).unwrap();
        block_on(store.delete("memory")).unwrap();
        assert_eq!(block_on(other.get("memory")).unwrap(), None);
        assert!(store.keys().is_empty());
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_directory_store() {
        let root = std::env::temp_dir().join(format!("isobox-store-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        let store = DirectoryStore::new(&root);

        assert_eq!(block_on(store.get("memory")).unwrap(), None);
        block_on(store.put("memory", b"archive".to_vec())).unwrap();
        block_on(store.put("memory", b"newer".to_vec())).unwrap();
        assert_eq!(block_on(store.get("memory")).unwrap(), Some(b"newer".to_vec()));
        assert!(!root.join(".memory.partial").exists());

        block_on(store.delete("memory")).unwrap();
        block_on(store.delete("memory")).unwrap();
        assert_eq!(block_on(store.get("memory")).unwrap(), None);

        assert!(block_on(store.put("../escape", Vec::new())).is_err());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[cfg(target_arch = "wasm32")]
    mod browser {
        use super::super::*;
        use wasm_bindgen_test::{wasm_bindgen_test, wasm_bindgen_test_configure};

        wasm_bindgen_test_configure!(run_in_browser);

        #[wasm_bindgen_test]
        async fn test_opfs_store() {
            let store = OpfsStore::new("isobox-test");
            store.delete("memory").await.unwrap();

            assert_eq!(store.get("memory").await.unwrap(), None);
            store.put("memory", b"archive".to_vec()).await.unwrap();
            store.put("memory", b"newer".to_vec()).await.unwrap();
            assert_eq!(store.get("memory").await.unwrap(), Some(b"newer".to_vec()));

            store.delete("memory").await.unwrap();
            store.delete("memory").await.unwrap();
            assert_eq!(store.get("memory").await.unwrap(), None);
        }
    }
}
