//! Memory snapshots
//!
//! `SnapshotManager` owns the shared linear memory buffer's lifecycle:
//! - `get` restores it from the durable store or creates a clean one, once
//! - `persist` writes it back as a versioned archive
//! - `download`/`upload` move archives between the store and the user
//!
//! Restoration is fail-closed: an archive from any other engine version is
//! discarded, never partially applied.

pub mod archive;
pub mod host;
pub mod memory;
pub mod store;

pub use archive::{ArchiveError, SnapshotMetadata};
pub use host::{HostError, SnapshotHost};
pub use memory::{
    FlatEngine, LinearMemory, MAX_PAGES, MemoryEngine, MemoryError, PAGE_SIZE, SharedMemory,
};
pub use store::{DurableStore, MemoryStore, StoreError};

#[cfg(not(target_arch = "wasm32"))]
pub use host::DirectoryHost;
#[cfg(target_arch = "wasm32")]
pub use host::WebHost;
#[cfg(not(target_arch = "wasm32"))]
pub use store::DirectoryStore;
#[cfg(target_arch = "wasm32")]
pub use store::OpfsStore;

use crate::config::SnapshotConfig;
use crate::{console_error, console_log, console_warn};
use futures::future::{FutureExt, LocalBoxFuture, Shared};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Snapshot manager errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    Archive(ArchiveError),
    Store(StoreError),
    Memory(MemoryError),
    Host(HostError),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Archive(e) => write!(f, "{}", e),
            Self::Store(e) => write!(f, "{}", e),
            Self::Memory(e) => write!(f, "memory error: {}", e),
            Self::Host(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Archive(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Memory(e) => Some(e),
            Self::Host(e) => Some(e),
        }
    }
}

impl From<ArchiveError> for SnapshotError {
    fn from(e: ArchiveError) -> Self {
        Self::Archive(e)
    }
}

impl From<StoreError> for SnapshotError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<MemoryError> for SnapshotError {
    fn from(e: MemoryError) -> Self {
        Self::Memory(e)
    }
}

impl From<HostError> for SnapshotError {
    fn from(e: HostError) -> Self {
        Self::Host(e)
    }
}

/// Why a well-formed archive was not accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// No `metadata.json` entry
    MissingMetadata,
    /// Produced by another engine version
    VersionMismatch { expected: String, found: String },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingMetadata => write!(f, "snapshot has no version metadata"),
            Self::VersionMismatch { expected, found } => write!(
                f,
                "snapshot version {} does not match engine version {}",
                found, expected
            ),
        }
    }
}

/// Result of `persist`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Written,
    /// Another persist was in flight
    Skipped,
}

/// Result of `upload`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Stored; a reload was requested
    Accepted,
    /// Left the store untouched
    Rejected(Rejection),
}

enum Verdict {
    Accepted(LinearMemory),
    Rejected(Rejection),
}

struct Core<S, E> {
    store: S,
    engine: E,
    config: SnapshotConfig,
}

impl<S: DurableStore, E: MemoryEngine> Core<S, E> {
    /// Restore, falling back to a clean buffer. Never fails.
    async fn initialize(&self) -> SharedMemory {
        match self.restore().await {
            Ok(Some(memory)) => return SharedMemory::new(memory),
            Ok(None) => {}
            Err(e) => {
                console_error!("[snapshot] failed to restore memory: {}", e);
                console_warn!("[snapshot] booting a clean memory buffer");
            }
        }
        SharedMemory::new(self.engine.create().await)
    }

    async fn restore(&self) -> Result<Option<LinearMemory>, SnapshotError> {
        let key = &self.config.store_key;
        let Some(bytes) = self.store.get(key).await? else {
            return Ok(None);
        };

        match self.check(&bytes)? {
            Verdict::Accepted(memory) => Ok(Some(memory)),
            Verdict::Rejected(rejection) => {
                console_warn!("[snapshot] discarding stored snapshot: {}", rejection);
                if let Rejection::VersionMismatch { found, .. } = &rejection
                    && self.config.backup_on_mismatch
                {
                    let backup = self.config.backup_key(found);
                    self.store.put(&backup, bytes).await?;
                    console_log!("[snapshot] stored snapshot backed up as {}", backup);
                }
                Ok(None)
            }
        }
    }

    /// Validate an archive against the running engine
    fn check(&self, bytes: &[u8]) -> Result<Verdict, SnapshotError> {
        let archive = archive::decode(bytes, &self.config.store_key)?;
        let expected = self.engine.version();

        match archive.metadata {
            None => Ok(Verdict::Rejected(Rejection::MissingMetadata)),
            Some(metadata) if metadata.version != expected => {
                Ok(Verdict::Rejected(Rejection::VersionMismatch {
                    expected: expected.to_string(),
                    found: metadata.version,
                }))
            }
            Some(_) => Ok(Verdict::Accepted(self.engine.deserialize(&archive.payload)?)),
        }
    }

    fn export(&self, memory: &SharedMemory) -> Result<Vec<u8>, SnapshotError> {
        let payload = self.engine.serialize(&memory.borrow());
        let metadata = SnapshotMetadata {
            version: self.engine.version().to_string(),
        };
        Ok(archive::encode(&self.config.store_key, &payload, &metadata)?)
    }
}

/// Clears the in-flight flag however persist ends
struct PersistGuard<'a>(&'a Cell<bool>);

impl Drop for PersistGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

type MemoryFuture = Shared<LocalBoxFuture<'static, SharedMemory>>;

/// Owner of the shared memory buffer
pub struct SnapshotManager<S: DurableStore, E: MemoryEngine> {
    core: Rc<Core<S, E>>,
    memory: RefCell<Option<MemoryFuture>>,
    persisting: Cell<bool>,
}

impl<S: DurableStore, E: MemoryEngine> SnapshotManager<S, E> {
    pub fn new(store: S, engine: E) -> Self {
        Self::with_config(store, engine, SnapshotConfig::default())
    }

    pub fn with_config(store: S, engine: E, config: SnapshotConfig) -> Self {
        Self {
            core: Rc::new(Core {
                store,
                engine,
                config,
            }),
            memory: RefCell::new(None),
            persisting: Cell::new(false),
        }
    }

    pub fn store(&self) -> &S {
        &self.core.store
    }

    pub fn engine(&self) -> &E {
        &self.core.engine
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.core.config
    }

    /// The shared buffer, restored or created on first use.
    ///
    /// Every caller shares one initialization; it never fails.
    pub fn get(&self) -> MemoryFuture {
        self.memory
            .borrow_mut()
            .get_or_insert_with(|| {
                let core = self.core.clone();
                async move { core.initialize().await }.boxed_local().shared()
            })
            .clone()
    }

    /// Has `get` resolved yet
    pub fn is_initialized(&self) -> bool {
        self.memory
            .borrow()
            .as_ref()
            .is_some_and(|memory| memory.peek().is_some())
    }

    /// Read the stored snapshot. `None` if nothing is stored, or if it was
    /// discarded for a missing or mismatched version.
    pub async fn restore(&self) -> Result<Option<SharedMemory>, SnapshotError> {
        Ok(self.core.restore().await?.map(SharedMemory::new))
    }

    /// Write the buffer to the store. Skipped while another persist runs.
    pub async fn persist(&self) -> Result<PersistOutcome, SnapshotError> {
        if self.persisting.replace(true) {
            console_log!("[snapshot] persist already in progress, skipping");
            return Ok(PersistOutcome::Skipped);
        }
        let _guard = PersistGuard(&self.persisting);

        let memory = self.get().await;
        let archive = self.core.export(&memory)?;
        self.core
            .store
            .put(&self.core.config.store_key, archive)
            .await?;
        Ok(PersistOutcome::Written)
    }

    /// Hand the current buffer to the user as an archive file
    pub async fn download(&self, host: &impl SnapshotHost) -> Result<(), SnapshotError> {
        let memory = self.get().await;
        let archive = self.core.export(&memory)?;
        host.deliver(&self.core.config.download_file_name(), &archive)?;
        Ok(())
    }

    /// Validate a user-supplied archive; if it is accepted, store it and
    /// reload the host
    pub async fn upload(
        &self,
        archive: &[u8],
        host: &impl SnapshotHost,
    ) -> Result<UploadOutcome, SnapshotError> {
        match self.core.check(archive)? {
            Verdict::Rejected(rejection) => {
                console_warn!("[snapshot] rejecting uploaded snapshot: {}", rejection);
                Ok(UploadOutcome::Rejected(rejection))
            }
            Verdict::Accepted(_) => {
                self.core
                    .store
                    .put(&self.core.config.store_key, archive.to_vec())
                    .await?;
                host.reload()?;
                Ok(UploadOutcome::Accepted)
            }
        }
    }

    /// Delete the stored snapshot. The live buffer is untouched.
    pub async fn reset(&self) -> Result<(), SnapshotError> {
        self.core.store.delete(&self.core.config.store_key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::future::join;
    use futures::task::{Context, Poll};
    use std::future::Future;
    use std::pin::Pin;

    fn manager(store: &MemoryStore, version: &str) -> SnapshotManager<MemoryStore, FlatEngine> {
        SnapshotManager::new(store.clone(), FlatEngine::new(version))
    }

    /// Host that records deliveries and reloads
    #[derive(Default)]
    struct RecordingHost {
        files: RefCell<Vec<(String, Vec<u8>)>>,
        reloads: Cell<usize>,
    }

    impl SnapshotHost for RecordingHost {
        fn deliver(&self, file_name: &str, archive: &[u8]) -> Result<(), HostError> {
            self.files
                .borrow_mut()
                .push((file_name.to_string(), archive.to_vec()));
            Ok(())
        }

        fn reload(&self) -> Result<(), HostError> {
            self.reloads.set(self.reloads.get() + 1);
            Ok(())
        }
    }

    /// Resolves on its second poll
    #[derive(Default)]
    struct Tick(bool);

    impl Future for Tick {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                return Poll::Ready(());
            }
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    /// Store whose writes suspend once and are counted
    #[derive(Default)]
    struct SlowStore {
        inner: MemoryStore,
        writes: Cell<usize>,
    }

    impl DurableStore for SlowStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
            Tick::default().await;
            self.writes.set(self.writes.get() + 1);
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }
    }

    fn archive_with_version(version: &str) -> Vec<u8> {
        let store = MemoryStore::new();
        let manager = manager(&store, version);
        block_on(manager.persist()).unwrap();
        block_on(store.get("memory")).unwrap().unwrap()
    }

    #[test]
    fn test_get_creates_clean_buffer() {
        let store = MemoryStore::new();
        let manager = manager(&store, "1.0.0");
        assert!(!manager.is_initialized());

        let memory = block_on(manager.get());
        assert_eq!(memory.borrow().pages(), 1);
        assert!(memory.to_vec().iter().all(|&b| b == 0));
        assert!(manager.is_initialized());
    }

    #[test]
    fn test_get_is_memoized() {
        let manager = manager(&MemoryStore::new(), "1.0.0");
        let (a, b) = block_on(join(manager.get(), manager.get()));
        assert!(a.same_buffer(&b));
        assert!(a.same_buffer(&block_on(manager.get())));
    }

    #[test]
    fn test_persist_restore_round_trip() {
        let store = MemoryStore::new();
        let first = manager(&store, "1.0.0");
        let memory = block_on(first.get());
        memory.borrow_mut().write(1234, b"persist me").unwrap();
        memory.borrow_mut().grow(1).unwrap();

        assert_eq!(block_on(first.persist()).unwrap(), PersistOutcome::Written);

        // A new session against the same store
        let second = manager(&store, "1.0.0");
        let restored = block_on(second.restore()).unwrap().unwrap();
        assert_eq!(restored.to_vec(), memory.to_vec());
        assert_eq!(block_on(second.get()).to_vec(), memory.to_vec());
    }

    #[test]
    fn test_version_mismatch_falls_back() {
        let store = MemoryStore::new();
        block_on(store.put("memory", archive_with_version("0.9.0"))).unwrap();

        let manager = manager(&store, "1.0.0");
        assert!(block_on(manager.restore()).unwrap().is_none());

        let memory = block_on(manager.get());
        assert!(memory.to_vec().iter().all(|&b| b == 0));
        // No backup unless asked for
        assert_eq!(store.keys(), vec!["memory"]);
    }

    #[test]
    fn test_backup_before_discard() {
        let store = MemoryStore::new();
        let old = archive_with_version("0.9.0");
        block_on(store.put("memory", old.clone())).unwrap();

        let config = SnapshotConfig {
            backup_on_mismatch: true,
            ..SnapshotConfig::default()
        };
        let manager = SnapshotManager::with_config(store.clone(), FlatEngine::new("1.0.0"), config);
        block_on(manager.get());

        assert_eq!(
            block_on(store.get("memory.backup-0.9.0")).unwrap(),
            Some(old)
        );
    }

    #[test]
    fn test_corrupt_archive_falls_back() {
        let store = MemoryStore::new();
        block_on(store.put("memory", b"garbage".to_vec())).unwrap();

        let manager = manager(&store, "1.0.0");
        assert!(matches!(
            block_on(manager.restore()),
            Err(SnapshotError::Archive(ArchiveError::Malformed { .. }))
        ));
        assert_eq!(block_on(manager.get()).borrow().pages(), 1);
    }

    #[test]
    fn test_concurrent_persist_writes_once() {
        let store = SlowStore::default();
        let manager = SnapshotManager::new(store, FlatEngine::new("1.0.0"));

        let (first, second) = block_on(join(manager.persist(), manager.persist()));
        assert_eq!(first.unwrap(), PersistOutcome::Written);
        assert_eq!(second.unwrap(), PersistOutcome::Skipped);
        assert_eq!(manager.store().writes.get(), 1);

        // The flag is cleared afterwards
        assert_eq!(block_on(manager.persist()).unwrap(), PersistOutcome::Written);
        assert_eq!(manager.store().writes.get(), 2);
    }

    #[test]
    fn test_download_delivers_archive() {
        let store = MemoryStore::new();
        let manager = manager(&store, "1.0.0");
        let host = RecordingHost::default();

        block_on(manager.download(&host)).unwrap();

        let files = host.files.borrow();
        assert_eq!(files[0].0, "workspace.zip");
        let archive = archive::decode(&files[0].1, "memory").unwrap();
        assert_eq!(archive.metadata.unwrap().version, "1.0.0");
        assert_eq!(archive.payload.len(), PAGE_SIZE);
        // Downloading does not touch the store
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_upload_accepts_matching_version() {
        let store = MemoryStore::new();
        let manager = manager(&store, "1.0.0");
        let host = RecordingHost::default();
        let archive = archive_with_version("1.0.0");

        let outcome = block_on(manager.upload(&archive, &host)).unwrap();
        assert_eq!(outcome, UploadOutcome::Accepted);
        assert_eq!(block_on(store.get("memory")).unwrap(), Some(archive));
        assert_eq!(host.reloads.get(), 1);
    }

    #[test]
    fn test_upload_rejects_mismatch() {
        let store = MemoryStore::new();
        let manager = manager(&store, "1.0.0");
        let host = RecordingHost::default();

        let outcome = block_on(manager.upload(&archive_with_version("2.0.0"), &host)).unwrap();
        assert_eq!(
            outcome,
            UploadOutcome::Rejected(Rejection::VersionMismatch {
                expected: "1.0.0".to_string(),
                found: "2.0.0".to_string(),
            })
        );
        assert!(store.keys().is_empty());
        assert_eq!(host.reloads.get(), 0);

        assert!(block_on(manager.upload(b"junk", &host)).is_err());
    }

    #[test]
    fn test_reset_deletes_stored_snapshot() {
        let store = MemoryStore::new();
        let manager = manager(&store, "1.0.0");
        block_on(manager.persist()).unwrap();
        assert!(store.contains("memory"));

        block_on(manager.reset()).unwrap();
        assert!(!store.contains("memory"));
        assert!(block_on(manager.restore()).unwrap().is_none());
    }
}
