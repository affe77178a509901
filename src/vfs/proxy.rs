//! Filesystem proxy handed to image instances
//!
//! `ProxyFs` is the set of primitives an image's proxy mount delegates to:
//! path operations plus descriptor-based open/close/read/write. `FsProxy`
//! serves them from any `FileSystem`, rooted at a prefix of its namespace.

use super::{FileSystem, Metadata, OpenOptions};
use std::cell::RefCell;
use std::io::{self, SeekFrom};
use std::rc::Rc;

/// Host-side filesystem primitives, as seen through an image mount
pub trait ProxyFs {
    fn stat(&self, path: &str) -> io::Result<Metadata>;
    fn lstat(&self, path: &str) -> io::Result<Metadata>;
    fn exists(&self, path: &str) -> bool;

    /// Entry names, without `.` and `..`
    fn readdir(&self, path: &str) -> io::Result<Vec<String>>;
    fn mkdir(&self, path: &str, mode: Option<u16>) -> io::Result<()>;
    fn rmdir(&self, path: &str) -> io::Result<()>;
    fn unlink(&self, path: &str) -> io::Result<()>;
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    fn read_file(&self, path: &str) -> io::Result<Vec<u8>>;
    fn write_file(&self, path: &str, data: &[u8]) -> io::Result<()>;

    fn symlink(&self, target: &str, link_path: &str) -> io::Result<()>;
    fn readlink(&self, path: &str) -> io::Result<String>;
    fn link(&self, source: &str, dest: &str) -> io::Result<()>;

    fn chmod(&self, path: &str, mode: u16) -> io::Result<()>;
    fn chown(&self, path: &str, uid: u32, gid: u32) -> io::Result<()>;
    fn truncate(&self, path: &str, len: u64) -> io::Result<()>;
    /// Times in milliseconds since epoch
    fn utimes(&self, path: &str, atime: f64, mtime: f64) -> io::Result<()>;

    fn open(&self, path: &str, options: OpenOptions) -> io::Result<u32>;
    fn close(&self, fd: u32) -> io::Result<()>;
    /// Read at `position`, or at the descriptor's cursor when `None`
    fn read(&self, fd: u32, buf: &mut [u8], position: Option<u64>) -> io::Result<usize>;
    /// Write at `position`, or at the descriptor's cursor when `None`
    fn write(&self, fd: u32, buf: &[u8], position: Option<u64>) -> io::Result<usize>;

    /// Create `path` and any missing parents. Existing directories are fine.
    fn mkdir_all(&self, path: &str, mode: Option<u16>) -> io::Result<()> {
        let mut current = if path.starts_with('/') {
            "/".to_string()
        } else {
            String::new()
        };
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            if !current.is_empty() && !current.ends_with('/') {
                current.push('/');
            }
            current.push_str(part);
            match self.mkdir(&current, mode) {
                Err(e)
                    if e.kind() == io::ErrorKind::AlreadyExists
                        && self.stat(&current).is_ok_and(|m| m.is_dir) => {}
                result => result?,
            }
        }
        Ok(())
    }

    /// `write_file` under a node flag string: `a` appends, `x` refuses to
    /// replace an existing file
    fn write_file_with_flag(&self, path: &str, data: &[u8], flag: &str) -> io::Result<()> {
        let options = OpenOptions::from_flags(flag)
            .filter(|options| options.write)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("bad write flag: {}", flag))
            })?;
        if flag.contains('x') && self.exists(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("file already exists: {}", path),
            ));
        }
        if !options.append {
            return self.write_file(path, data);
        }

        let fd = self.open(path, options)?;
        let mut written = 0;
        let result = loop {
            if written == data.len() {
                break Ok(());
            }
            match self.write(fd, &data[written..], None) {
                Ok(0) => break Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) => break Err(e),
            }
        };
        self.close(fd)?;
        result
    }
}

/// Bridges a shared `FileSystem` into an image mount
pub struct FsProxy<F: FileSystem> {
    fs: Rc<RefCell<F>>,
    root: String,
}

impl<F: FileSystem> FsProxy<F> {
    /// Serve the whole namespace of `fs`
    pub fn new(fs: Rc<RefCell<F>>) -> Self {
        Self::rooted(fs, "/")
    }

    /// Serve the subtree at `root`; image paths are resolved beneath it
    pub fn rooted(fs: Rc<RefCell<F>>, root: &str) -> Self {
        let root = root.trim_end_matches('/');
        Self {
            fs,
            root: root.to_string(),
        }
    }

    /// The filesystem behind this proxy
    pub fn filesystem(&self) -> &Rc<RefCell<F>> {
        &self.fs
    }

    /// Map an image path under `root`. `..` stops at the image's `/`.
    fn host_path(&self, path: &str) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                part => parts.push(part),
            }
        }
        format!("{}/{}", self.root, parts.join("/"))
    }
}

impl<F: FileSystem> Clone for FsProxy<F> {
    fn clone(&self) -> Self {
        Self {
            fs: self.fs.clone(),
            root: self.root.clone(),
        }
    }
}

impl<F: FileSystem> ProxyFs for FsProxy<F> {
    fn stat(&self, path: &str) -> io::Result<Metadata> {
        self.fs.borrow().metadata(&self.host_path(path))
    }

    fn lstat(&self, path: &str) -> io::Result<Metadata> {
        self.fs.borrow().symlink_metadata(&self.host_path(path))
    }

    fn exists(&self, path: &str) -> bool {
        self.fs.borrow().exists(&self.host_path(path))
    }

    fn readdir(&self, path: &str) -> io::Result<Vec<String>> {
        let entries = self.fs.borrow().read_dir(&self.host_path(path))?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    fn mkdir(&self, path: &str, mode: Option<u16>) -> io::Result<()> {
        let host = self.host_path(path);
        let mut fs = self.fs.borrow_mut();
        fs.create_dir(&host)?;
        if let Some(mode) = mode {
            fs.chmod(&host, mode)?;
        }
        Ok(())
    }

    fn rmdir(&self, path: &str) -> io::Result<()> {
        self.fs.borrow_mut().remove_dir(&self.host_path(path))
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        self.fs.borrow_mut().remove_file(&self.host_path(path))
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        self.fs
            .borrow_mut()
            .rename(&self.host_path(from), &self.host_path(to))
    }

    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        super::read_all(&mut *self.fs.borrow_mut(), &self.host_path(path))
    }

    fn write_file(&self, path: &str, data: &[u8]) -> io::Result<()> {
        super::write_all(&mut *self.fs.borrow_mut(), &self.host_path(path), data)
    }

    fn symlink(&self, target: &str, link_path: &str) -> io::Result<()> {
        // Absolute targets live in the image's namespace too
        let target = if target.starts_with('/') {
            self.host_path(target)
        } else {
            target.to_string()
        };
        self.fs
            .borrow_mut()
            .symlink(&target, &self.host_path(link_path))
    }

    fn readlink(&self, path: &str) -> io::Result<String> {
        let target = self.fs.borrow().read_link(&self.host_path(path))?;
        if self.root.is_empty() {
            return Ok(target);
        }
        match target.strip_prefix(&self.root) {
            Some(inner) if inner.starts_with('/') => Ok(inner.to_string()),
            _ => Ok(target),
        }
    }

    fn link(&self, source: &str, dest: &str) -> io::Result<()> {
        self.fs
            .borrow_mut()
            .link(&self.host_path(source), &self.host_path(dest))
    }

    fn chmod(&self, path: &str, mode: u16) -> io::Result<()> {
        self.fs.borrow_mut().chmod(&self.host_path(path), mode)
    }

    fn chown(&self, path: &str, uid: u32, gid: u32) -> io::Result<()> {
        self.fs
            .borrow_mut()
            .chown(&self.host_path(path), Some(uid), Some(gid))
    }

    fn truncate(&self, path: &str, len: u64) -> io::Result<()> {
        self.fs.borrow_mut().truncate(&self.host_path(path), len)
    }

    fn utimes(&self, path: &str, atime: f64, mtime: f64) -> io::Result<()> {
        self.fs
            .borrow_mut()
            .utimes(&self.host_path(path), Some(atime), Some(mtime))
    }

    fn open(&self, path: &str, options: OpenOptions) -> io::Result<u32> {
        let handle = self.fs.borrow_mut().open(&self.host_path(path), options)?;
        u32::try_from(handle).map_err(|_| io::Error::other("too many open files"))
    }

    fn close(&self, fd: u32) -> io::Result<()> {
        self.fs.borrow_mut().close(fd as usize)
    }

    fn read(&self, fd: u32, buf: &mut [u8], position: Option<u64>) -> io::Result<usize> {
        let mut fs = self.fs.borrow_mut();
        if let Some(position) = position {
            fs.seek(fd as usize, SeekFrom::Start(position))?;
        }
        fs.read(fd as usize, buf)
    }

    fn write(&self, fd: u32, buf: &[u8], position: Option<u64>) -> io::Result<usize> {
        let mut fs = self.fs.borrow_mut();
        if let Some(position) = position {
            fs.seek(fd as usize, SeekFrom::Start(position))?;
        }
        fs.write(fd as usize, buf)
    }
}
