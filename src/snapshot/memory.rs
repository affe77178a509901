//! The shared linear memory buffer
//!
//! One flat, page-granular byte buffer backs the virtual filesystem. The
//! `MemoryEngine` that owns its layout decides how it is created and how it
//! is turned into a payload and back. The payload is only meaningful to the
//! exact engine version that produced it.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::future::Future;
use std::rc::Rc;

/// Linear memory page size (64 KiB, as in WebAssembly)
pub const PAGE_SIZE: usize = 65536;

/// Page ceiling when none is configured (4 GiB, the wasm32 address space)
pub const MAX_PAGES: u32 = 65536;

/// Memory errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Payload length is not a whole number of pages
    Unaligned { len: usize },
    /// Access outside the buffer
    OutOfBounds { offset: usize, len: usize, size: usize },
    /// Growth past the maximum page count
    GrowthLimit { requested: u32, max: u32 },
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unaligned { len } => {
                write!(f, "payload of {} bytes is not a multiple of the page size", len)
            }
            Self::OutOfBounds { offset, len, size } => write!(
                f,
                "access of {} bytes at offset {} exceeds memory size {}",
                len, offset, size
            ),
            Self::GrowthLimit { requested, max } => {
                write!(f, "cannot grow to {} pages (max {})", requested, max)
            }
        }
    }
}

impl std::error::Error for MemoryError {}

/// Byte size of `pages` pages, if that stays under the ceiling
fn byte_len(pages: u32, max_pages: Option<u32>) -> Result<usize, MemoryError> {
    let max = max_pages.map_or(MAX_PAGES, |max| max.min(MAX_PAGES));
    let too_many = MemoryError::GrowthLimit {
        requested: pages,
        max,
    };
    if pages > max {
        return Err(too_many);
    }
    (pages as usize).checked_mul(PAGE_SIZE).ok_or(too_many)
}

/// A growable, page-aligned byte buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearMemory {
    data: Vec<u8>,
    max_pages: Option<u32>,
}

impl LinearMemory {
    /// Zeroed memory of `pages` pages
    pub fn new(pages: u32, max_pages: Option<u32>) -> Result<Self, MemoryError> {
        let len = byte_len(pages, max_pages)?;
        Ok(Self {
            data: vec![0; len],
            max_pages,
        })
    }

    /// Rebuild memory from raw contents
    pub fn from_bytes(bytes: Vec<u8>, max_pages: Option<u32>) -> Result<Self, MemoryError> {
        if bytes.len() % PAGE_SIZE != 0 {
            return Err(MemoryError::Unaligned { len: bytes.len() });
        }
        let pages = u32::try_from(bytes.len() / PAGE_SIZE).unwrap_or(u32::MAX);
        byte_len(pages, max_pages)?;
        Ok(Self {
            data: bytes,
            max_pages,
        })
    }

    pub fn pages(&self) -> u32 {
        (self.data.len() / PAGE_SIZE) as u32
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn max_pages(&self) -> Option<u32> {
        self.max_pages
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Grow by `delta` zeroed pages, returning the previous page count
    pub fn grow(&mut self, delta: u32) -> Result<u32, MemoryError> {
        let previous = self.pages();
        let len = byte_len(previous.saturating_add(delta), self.max_pages)?;
        self.data.resize(len, 0);
        Ok(previous)
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(MemoryError::OutOfBounds {
                offset,
                len,
                size: self.data.len(),
            }),
        }
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.check(offset, buf.len())?;
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        self.check(offset, bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

/// The one buffer everybody shares
///
/// Clones are handles onto the same memory.
#[derive(Clone, Debug)]
pub struct SharedMemory(Rc<RefCell<LinearMemory>>);

impl SharedMemory {
    pub fn new(memory: LinearMemory) -> Self {
        Self(Rc::new(RefCell::new(memory)))
    }

    pub fn borrow(&self) -> Ref<'_, LinearMemory> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, LinearMemory> {
        self.0.borrow_mut()
    }

    /// Copy of the current contents
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.borrow().as_bytes().to_vec()
    }

    /// Both handles point at the same buffer
    pub fn same_buffer(&self, other: &SharedMemory) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Owner of the buffer's layout
pub trait MemoryEngine: 'static {
    /// Exact build identity; payloads only load into a matching version
    fn version(&self) -> &str;

    /// A fresh, empty buffer
    fn create(&self) -> impl Future<Output = LinearMemory>;

    fn serialize(&self, memory: &LinearMemory) -> Vec<u8>;

    fn deserialize(&self, payload: &[u8]) -> Result<LinearMemory, MemoryError>;
}

/// Engine whose payload is the raw buffer contents
#[derive(Debug, Clone)]
pub struct FlatEngine {
    version: String,
    initial_pages: u32,
    max_pages: Option<u32>,
}

impl FlatEngine {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            initial_pages: 1,
            max_pages: None,
        }
    }

    pub fn with_pages(mut self, initial: u32, max: Option<u32>) -> Self {
        self.initial_pages = initial;
        self.max_pages = max;
        self
    }
}

impl Default for FlatEngine {
    /// Versioned by this crate's own version
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_VERSION"))
    }
}

impl MemoryEngine for FlatEngine {
    fn version(&self) -> &str {
        &self.version
    }

    async fn create(&self) -> LinearMemory {
        // An impossible initial size degrades to an empty buffer
        LinearMemory::new(self.initial_pages, self.max_pages)
            .unwrap_or_else(|_| LinearMemory {
                data: Vec::new(),
                max_pages: self.max_pages,
            })
    }

    fn serialize(&self, memory: &LinearMemory) -> Vec<u8> {
        memory.as_bytes().to_vec()
    }

    fn deserialize(&self, payload: &[u8]) -> Result<LinearMemory, MemoryError> {
        LinearMemory::from_bytes(payload.to_vec(), self.max_pages)
    }
}
