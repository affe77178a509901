//! Host virtual filesystem
//!
//! The filesystem that image instances see through their proxy mount. The
//! engine behind it is pluggable: anything implementing `FileSystem` can be
//! bridged into an image with `FsProxy`. `MemoryFs` is the in-memory backend.

pub mod memory;
pub mod proxy;
pub mod workspace;

pub use memory::MemoryFs;
pub use proxy::{FsProxy, ProxyFs};
pub use workspace::WorkspaceFs;

use std::io;

/// A file handle
pub type FileHandle = usize;

/// File open modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
            truncate: false,
            append: false,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    /// Parse node-style flag strings ("r", "r+", "w", "w+", "a", "a+", "wx", ...)
    pub fn from_flags(flags: &str) -> Option<Self> {
        let base = flags.replace(['s', 'x'], "");
        let opts = match base.as_str() {
            "r" => Self::new(),
            "r+" => Self::new().write(true),
            "w" => Self::new().read(false).write(true).create(true).truncate(true),
            "w+" => Self::new().write(true).create(true).truncate(true),
            "a" => Self::new().read(false).write(true).create(true).append(true),
            "a+" => Self::new().write(true).create(true).append(true),
            _ => return None,
        };
        Some(opts)
    }
}

/// File metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    /// Inode number, shared by hard links
    pub ino: u64,
    pub size: u64,
    pub is_dir: bool,
    pub is_file: bool,
    pub is_symlink: bool,
    pub symlink_target: Option<String>,
    /// Owner user ID
    pub uid: u32,
    /// Owner group ID
    pub gid: u32,
    /// Unix permission mode (rwxrwxrwx)
    pub mode: u16,
    /// Access time in milliseconds since epoch
    pub atime: f64,
    /// Modification time in milliseconds since epoch
    pub mtime: f64,
    /// Change time in milliseconds since epoch
    pub ctime: f64,
    /// Number of hard links to this inode
    pub nlink: u32,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            ino: 0,
            size: 0,
            is_dir: false,
            is_file: true,
            is_symlink: false,
            symlink_target: None,
            uid: 1000,
            gid: 1000,
            mode: 0o644,
            atime: 0.0,
            mtime: 0.0,
            ctime: 0.0,
            nlink: 1,
        }
    }
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub is_symlink: bool,
}

/// The FileSystem trait - implement this for different backends
pub trait FileSystem {
    /// Open a file, returning a handle
    fn open(&mut self, path: &str, options: OpenOptions) -> io::Result<FileHandle>;

    /// Close a file handle
    fn close(&mut self, handle: FileHandle) -> io::Result<()>;

    /// Read from a file at the handle's position
    fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> io::Result<usize>;

    /// Write to a file at the handle's position (end of file in append mode)
    fn write(&mut self, handle: FileHandle, buf: &[u8]) -> io::Result<usize>;

    /// Seek within a file
    fn seek(&mut self, handle: FileHandle, pos: io::SeekFrom) -> io::Result<u64>;

    /// Metadata, following symlinks
    fn metadata(&self, path: &str) -> io::Result<Metadata>;

    /// Metadata of the path itself, not its symlink target
    fn symlink_metadata(&self, path: &str) -> io::Result<Metadata>;

    /// Create a directory
    fn create_dir(&mut self, path: &str) -> io::Result<()>;

    /// Read directory contents
    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>>;

    /// Remove a file or symlink
    fn remove_file(&mut self, path: &str) -> io::Result<()>;

    /// Remove an empty directory
    fn remove_dir(&mut self, path: &str) -> io::Result<()>;

    /// Rename/move a file or directory
    fn rename(&mut self, from: &str, to: &str) -> io::Result<()>;

    /// Check if path exists (following symlinks)
    fn exists(&self, path: &str) -> bool;

    /// Create a symbolic link at `link_path` pointing at `target`
    fn symlink(&mut self, target: &str, link_path: &str) -> io::Result<()>;

    /// Read the target of a symbolic link
    fn read_link(&self, path: &str) -> io::Result<String>;

    /// Create a hard link: `dest` shares the inode of `source`
    fn link(&mut self, source: &str, dest: &str) -> io::Result<()>;

    /// Change file mode (permissions)
    fn chmod(&mut self, path: &str, mode: u16) -> io::Result<()>;

    /// Change file owner
    fn chown(&mut self, path: &str, uid: Option<u32>, gid: Option<u32>) -> io::Result<()>;

    /// Cut or zero-extend a file to `len` bytes
    fn truncate(&mut self, path: &str, len: u64) -> io::Result<()>;

    /// Update access and modification times
    ///
    /// If atime or mtime is None, the current clock time is used.
    fn utimes(&mut self, path: &str, atime: Option<f64>, mtime: Option<f64>) -> io::Result<()>;
}

/// Convenience wrapper for reading an entire file
pub fn read_all<F: FileSystem + ?Sized>(fs: &mut F, path: &str) -> io::Result<Vec<u8>> {
    let handle = fs.open(path, OpenOptions::new().read(true))?;
    let mut content = Vec::new();
    let mut buf = [0u8; 4096];
    let result = loop {
        match fs.read(handle, &mut buf) {
            Ok(0) => break Ok(content),
            Ok(n) => content.extend_from_slice(&buf[..n]),
            Err(e) => break Err(e),
        }
    };
    fs.close(handle)?;
    result
}

/// Convenience wrapper for replacing a file's contents
pub fn write_all<F: FileSystem + ?Sized>(fs: &mut F, path: &str, content: &[u8]) -> io::Result<()> {
    let handle = fs.open(
        path,
        OpenOptions::new().read(false).write(true).create(true).truncate(true),
    )?;
    let result = fs.write(handle, content).map(|_| ());
    fs.close(handle)?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags() {
        assert_eq!(OpenOptions::from_flags("r"), Some(OpenOptions::new()));
        let w = OpenOptions::from_flags("w").unwrap();
        assert!(!w.read && w.write && w.create && w.truncate && !w.append);
        let a = OpenOptions::from_flags("a+").unwrap();
        assert!(a.read && a.write && a.append && !a.truncate);
        assert_eq!(OpenOptions::from_flags("wx"), OpenOptions::from_flags("w"));
        assert_eq!(OpenOptions::from_flags("q"), None);
    }

    #[test]
    fn test_read_write_helpers() {
        let mut fs = MemoryFs::new();
        write_all(&mut fs, "/note.txt", b"hello").unwrap();
        assert_eq!(read_all(&mut fs, "/note.txt").unwrap(), b"hello");
        write_all(&mut fs, "/note.txt", b"hi").unwrap();
        assert_eq!(read_all(&mut fs, "/note.txt").unwrap(), b"hi");
    }
}
