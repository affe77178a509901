//! Filesystem living inside the snapshot buffer
//!
//! `WorkspaceFs` keeps a `MemoryFs` whose image is written into the shared
//! linear memory after every change, so persisting the memory persists the
//! files. Layout from offset 0:
//!
//! ```text
//! "ISOBOXFS" | image length (u64 LE) | JSON image
//! ```
//!
//! An all-zero buffer holds an empty filesystem.

use super::{DirEntry, FileHandle, FileSystem, MemoryFs, Metadata, OpenOptions};
use crate::snapshot::{PAGE_SIZE, SharedMemory};
use std::io::{self, SeekFrom};

const MAGIC: &[u8; 8] = b"ISOBOXFS";
const HEADER_LEN: usize = 16;

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

/// A `MemoryFs` mirrored into a `SharedMemory`
pub struct WorkspaceFs {
    memory: SharedMemory,
    fs: MemoryFs,
}

impl WorkspaceFs {
    /// Load the filesystem stored in `memory`, formatting it when blank
    pub fn open(memory: SharedMemory) -> io::Result<Self> {
        let fs = {
            let buffer = memory.borrow();
            let bytes = buffer.as_bytes();
            match bytes.get(..HEADER_LEN) {
                Some(header) if header.iter().any(|&b| b != 0) => {
                    if &header[..8] != MAGIC {
                        return Err(invalid("memory does not hold a filesystem image"));
                    }
                    let mut len = [0u8; 8];
                    len.copy_from_slice(&header[8..]);
                    let image = usize::try_from(u64::from_le_bytes(len))
                        .ok()
                        .and_then(|len| bytes.get(HEADER_LEN..HEADER_LEN.checked_add(len)?))
                        .ok_or_else(|| invalid("filesystem image overruns memory"))?;
                    Some(MemoryFs::from_json(image)?)
                }
                _ => None,
            }
        };

        match fs {
            Some(fs) => Ok(Self { memory, fs }),
            None => {
                crate::console_log!("[vfs] formatting blank workspace memory");
                let mut workspace = Self {
                    memory,
                    fs: MemoryFs::new(),
                };
                workspace.flush()?;
                Ok(workspace)
            }
        }
    }

    /// The buffer the image is written to
    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    pub fn set_clock(&mut self, now: f64) {
        self.fs.set_clock(now);
    }

    /// Write the current image into memory, growing it as needed
    pub fn flush(&mut self) -> io::Result<()> {
        let image = self.fs.to_json().map_err(io::Error::other)?;
        let needed = HEADER_LEN + image.len();

        let mut buffer = self.memory.borrow_mut();
        if buffer.len() < needed {
            let missing = (needed - buffer.len()).div_ceil(PAGE_SIZE);
            let delta = u32::try_from(missing).unwrap_or(u32::MAX);
            buffer
                .grow(delta)
                .map_err(|e| io::Error::new(io::ErrorKind::StorageFull, e))?;
        }

        let mut header = [0u8; HEADER_LEN];
        header[..8].copy_from_slice(MAGIC);
        header[8..].copy_from_slice(&(image.len() as u64).to_le_bytes());
        buffer.write(0, &header).map_err(io::Error::other)?;
        buffer.write(HEADER_LEN, &image).map_err(io::Error::other)?;
        Ok(())
    }

    /// Flush after a successful change
    fn commit<T>(&mut self, result: io::Result<T>) -> io::Result<T> {
        let value = result?;
        self.flush()?;
        Ok(value)
    }
}

impl FileSystem for WorkspaceFs {
    fn open(&mut self, path: &str, options: OpenOptions) -> io::Result<FileHandle> {
        let result = self.fs.open(path, options);
        if options.write || options.create || options.truncate {
            self.commit(result)
        } else {
            result
        }
    }

    fn close(&mut self, handle: FileHandle) -> io::Result<()> {
        self.fs.close(handle)
    }

    fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> io::Result<usize> {
        self.fs.read(handle, buf)
    }

    fn write(&mut self, handle: FileHandle, buf: &[u8]) -> io::Result<usize> {
        let result = self.fs.write(handle, buf);
        self.commit(result)
    }

    fn seek(&mut self, handle: FileHandle, pos: SeekFrom) -> io::Result<u64> {
        self.fs.seek(handle, pos)
    }

    fn metadata(&self, path: &str) -> io::Result<Metadata> {
        self.fs.metadata(path)
    }

    fn symlink_metadata(&self, path: &str) -> io::Result<Metadata> {
        self.fs.symlink_metadata(path)
    }

    fn create_dir(&mut self, path: &str) -> io::Result<()> {
        let result = self.fs.create_dir(path);
        self.commit(result)
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        self.fs.read_dir(path)
    }

    fn remove_file(&mut self, path: &str) -> io::Result<()> {
        let result = self.fs.remove_file(path);
        self.commit(result)
    }

    fn remove_dir(&mut self, path: &str) -> io::Result<()> {
        let result = self.fs.remove_dir(path);
        self.commit(result)
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        let result = self.fs.rename(from, to);
        self.commit(result)
    }

    fn exists(&self, path: &str) -> bool {
        self.fs.exists(path)
    }

    fn symlink(&mut self, target: &str, link_path: &str) -> io::Result<()> {
        let result = self.fs.symlink(target, link_path);
        self.commit(result)
    }

    fn read_link(&self, path: &str) -> io::Result<String> {
        self.fs.read_link(path)
    }

    fn link(&mut self, source: &str, dest: &str) -> io::Result<()> {
        let result = self.fs.link(source, dest);
        self.commit(result)
    }

    fn chmod(&mut self, path: &str, mode: u16) -> io::Result<()> {
        let result = self.fs.chmod(path, mode);
        self.commit(result)
    }

    fn chown(&mut self, path: &str, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        let result = self.fs.chown(path, uid, gid);
        self.commit(result)
    }

    fn truncate(&mut self, path: &str, len: u64) -> io::Result<()> {
        let result = self.fs.truncate(path, len);
        self.commit(result)
    }

    fn utimes(&mut self, path: &str, atime: Option<f64>, mtime: Option<f64>) -> io::Result<()> {
        let result = self.fs.utimes(path, atime, mtime);
        self.commit(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::LinearMemory;
    use crate::vfs::{read_all, write_all};

    fn blank(pages: u32, max: Option<u32>) -> SharedMemory {
        SharedMemory::new(LinearMemory::new(pages, max).unwrap())
    }

    #[test]
    fn test_blank_memory_is_formatted() {
        let memory = blank(1, None);
        let fs = WorkspaceFs::open(memory.clone()).unwrap();

        assert!(fs.metadata("/").unwrap().is_dir);
        assert_eq!(&memory.to_vec()[..8], MAGIC);
        assert!(fs.memory().same_buffer(&memory));
    }

    #[test]
    fn test_files_survive_reopening_the_buffer() {
        let memory = blank(1, None);
        let mut fs = WorkspaceFs::open(memory.clone()).unwrap();
        fs.create_dir("/src").unwrap();
        write_all(&mut fs, "/src/lib.rs", b"pub fn answer() -> u32 { 42 }").unwrap();
        fs.rename("/src/lib.rs", "/src/main.rs").unwrap();
        drop(fs);

        // A byte-for-byte copy, as a snapshot restore would produce
        let copy = LinearMemory::from_bytes(memory.to_vec(), None).unwrap();
        let mut reopened = WorkspaceFs::open(SharedMemory::new(copy)).unwrap();
        assert_eq!(
            read_all(&mut reopened, "/src/main.rs").unwrap(),
            b"pub fn answer() -> u32 { 42 }"
        );
        assert!(!reopened.exists("/src/lib.rs"));
    }

    #[test]
    fn test_image_grows_the_buffer() {
        let memory = blank(0, None);
        let mut fs = WorkspaceFs::open(memory.clone()).unwrap();
        write_all(&mut fs, "/big", &vec![7u8; PAGE_SIZE]).unwrap();

        assert!(memory.borrow().pages() >= 2);
    }

    #[test]
    fn test_full_buffer_reports_storage_full() {
        let memory = blank(1, Some(1));
        let mut fs = WorkspaceFs::open(memory).unwrap();

        let err = write_all(&mut fs, "/big", &vec![7u8; PAGE_SIZE]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::StorageFull);
    }

    #[test]
    fn test_foreign_bytes_are_rejected() {
        let memory = blank(1, None);
        memory.borrow_mut().write(0, b"not a filesystem").unwrap();
        let err = WorkspaceFs::open(memory).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let memory = blank(1, None);
        let mut header = [0u8; HEADER_LEN];
        header[..8].copy_from_slice(MAGIC);
        header[8..].copy_from_slice(&u64::MAX.to_le_bytes());
        memory.borrow_mut().write(0, &header).unwrap();
        let err = WorkspaceFs::open(memory).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
