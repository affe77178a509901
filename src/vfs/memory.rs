//! In-memory filesystem implementation
//!
//! Paths map to inodes; inodes live in a slab so hard links can share one.
//! Symlinks are resolved component by component. Data lives only as long as
//! the value does.

use super::{DirEntry, FileHandle, FileSystem, Metadata, OpenOptions};
use serde::{Deserialize, Serialize};
use slab::Slab;
use std::collections::HashMap;
use std::io::{self, SeekFrom};

/// Symlink hops before giving up (Linux ELOOP limit)
const MAX_SYMLINK_DEPTH: usize = 40;

/// Largest regular file, in bytes
pub const MAX_FILE_SIZE: u64 = 1 << 30;

/// An open file: which inode and where we are in it
#[derive(Debug)]
struct OpenFile {
    ino: usize,
    position: u64,
    readable: bool,
    writable: bool,
    append: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum NodeKind {
    File(Vec<u8>),
    Directory,
    Symlink(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Inode {
    kind: NodeKind,
    uid: u32,
    gid: u32,
    mode: u16,
    atime: f64,
    mtime: f64,
    ctime: f64,
    nlink: u32,
    /// Handles still pointing here keep an unlinked inode alive
    #[serde(skip)]
    open_count: u32,
}

/// Serialized tree: live inodes and the paths naming them
#[derive(Serialize)]
struct ImageRef<'a> {
    clock: f64,
    inodes: Vec<(usize, &'a Inode)>,
    entries: Vec<(&'a str, usize)>,
}

#[derive(Deserialize)]
struct Image {
    clock: f64,
    inodes: Vec<(usize, Inode)>,
    entries: Vec<(String, usize)>,
}

/// In-memory filesystem
#[derive(Debug)]
pub struct MemoryFs {
    /// Every path, mapped to its inode
    entries: HashMap<String, usize>,
    inodes: Slab<Inode>,
    /// Open file handles
    handles: Slab<OpenFile>,
    /// Timestamp source, milliseconds since epoch
    clock: f64,
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such file or directory: {}", path))
}

fn too_large() -> io::Error {
    io::Error::new(io::ErrorKind::FileTooLarge, "file too large")
}

/// Byte range `[start, end)` of a write of `len` bytes at `position`
fn write_range(position: u64, len: usize) -> io::Result<(usize, usize)> {
    let end = position
        .checked_add(len as u64)
        .filter(|&end| end <= MAX_FILE_SIZE)
        .ok_or_else(too_large)?;
    let start = usize::try_from(position).map_err(|_| too_large())?;
    let end = usize::try_from(end).map_err(|_| too_large())?;
    Ok((start, end))
}

fn bad_handle() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "invalid file handle")
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut fs = Self {
            entries: HashMap::new(),
            inodes: Slab::new(),
            handles: Slab::new(),
            clock: 0.0,
        };
        // Root directory always exists
        let root = fs.new_inode(NodeKind::Directory, 0o755);
        fs.entries.insert("/".to_string(), root);
        fs
    }

    /// Set the clock used for timestamps
    pub fn set_clock(&mut self, now: f64) {
        self.clock = now;
    }

    /// Number of open handles
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Serialize the tree to JSON. Open handles are not part of it, and
    /// neither are unlinked files they still hold.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut entries: Vec<(&str, usize)> = self
            .entries
            .iter()
            .map(|(path, &ino)| (path.as_str(), ino))
            .collect();
        entries.sort_unstable();

        let image = ImageRef {
            clock: self.clock,
            inodes: self.inodes.iter().filter(|(_, inode)| inode.nlink > 0).collect(),
            entries,
        };
        serde_json::to_vec(&image)
    }

    /// Rebuild a tree written by `to_json`
    pub fn from_json(bytes: &[u8]) -> io::Result<Self> {
        let invalid = |message: String| io::Error::new(io::ErrorKind::InvalidData, message);

        let image: Image = serde_json::from_slice(bytes)
            .map_err(|e| invalid(format!("bad filesystem image: {}", e)))?;
        let inodes: Slab<Inode> = image.inodes.into_iter().collect();

        if let Some((path, _)) = image.entries.iter().find(|(_, ino)| !inodes.contains(*ino)) {
            return Err(invalid(format!("dangling entry in filesystem image: {}", path)));
        }
        let entries: HashMap<String, usize> = image.entries.into_iter().collect();
        match entries.get("/").map(|&ino| &inodes[ino].kind) {
            Some(NodeKind::Directory) => {}
            _ => return Err(invalid("filesystem image has no root directory".to_string())),
        }

        Ok(Self {
            entries,
            inodes,
            handles: Slab::new(),
            clock: image.clock,
        })
    }

    fn new_inode(&mut self, kind: NodeKind, mode: u16) -> usize {
        self.inodes.insert(Inode {
            kind,
            uid: 1000,
            gid: 1000,
            mode,
            atime: self.clock,
            mtime: self.clock,
            ctime: self.clock,
            nlink: 1,
            open_count: 0,
        })
    }

    /// Normalize a path: leading slash, no `.`/`..`/empty components
    fn normalize_path(path: &str) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                other => parts.push(other),
            }
        }
        format!("/{}", parts.join("/"))
    }

    /// Get parent directory of a normalized path
    fn parent_path(path: &str) -> Option<String> {
        if path == "/" {
            return None;
        }
        let idx = path.rfind('/')?;
        if idx == 0 {
            Some("/".to_string())
        } else {
            Some(path[..idx].to_string())
        }
    }

    fn join(dir: &str, name: &str) -> String {
        if dir == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", dir, name)
        }
    }

    /// Resolve symlinks in every component. The last component is only
    /// followed when `follow_last` is set.
    fn resolve(&self, path: &str, follow_last: bool) -> io::Result<String> {
        let mut pending: Vec<String> = Self::normalize_path(path)
            .split('/')
            .filter(|s| !s.is_empty())
            .rev()
            .map(str::to_string)
            .collect();
        let mut current = "/".to_string();
        let mut hops = 0;

        while let Some(part) = pending.pop() {
            if part == ".." {
                current = Self::parent_path(&current).unwrap_or_else(|| "/".to_string());
                continue;
            }
            let candidate = Self::join(&current, &part);
            let is_last = pending.is_empty();

            let target = match self.entries.get(&candidate).map(|&ino| &self.inodes[ino].kind) {
                Some(NodeKind::Symlink(target)) if follow_last || !is_last => target.clone(),
                _ => {
                    current = candidate;
                    continue;
                }
            };

            hops += 1;
            if hops > MAX_SYMLINK_DEPTH {
                return Err(io::Error::other(format!(
                    "too many levels of symbolic links: {}",
                    path
                )));
            }

            if target.starts_with('/') {
                current = "/".to_string();
            }
            for piece in target.split('/').filter(|s| !s.is_empty() && *s != ".").rev() {
                pending.push(piece.to_string());
            }
        }

        Ok(current)
    }

    fn lookup(&self, path: &str, follow_last: bool) -> io::Result<(String, usize)> {
        let resolved = self.resolve(path, follow_last)?;
        match self.entries.get(&resolved) {
            Some(&ino) => Ok((resolved, ino)),
            None => Err(not_found(path)),
        }
    }

    /// Resolved location for a new entry, with its parent checked
    fn prepare_new(&self, path: &str) -> io::Result<String> {
        let resolved = self.resolve(path, false)?;
        if self.entries.contains_key(&resolved) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("file exists: {}", path),
            ));
        }
        let parent = Self::parent_path(&resolved).ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "root already exists")
        })?;
        match self.entries.get(&parent).map(|&ino| &self.inodes[ino].kind) {
            Some(NodeKind::Directory) => Ok(resolved),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("not a directory: {}", parent),
            )),
            None => Err(not_found(&parent)),
        }
    }

    fn has_children(&self, dir: &str) -> bool {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };
        self.entries
            .keys()
            .any(|p| p != dir && p.starts_with(&prefix))
    }

    /// Drop a link to an inode, freeing it once unreferenced
    fn unlink_inode(&mut self, ino: usize) {
        let inode = &mut self.inodes[ino];
        inode.nlink = inode.nlink.saturating_sub(1);
        inode.ctime = self.clock;
        if inode.nlink == 0 && inode.open_count == 0 {
            self.inodes.remove(ino);
        }
    }

    fn metadata_of(&self, ino: usize) -> Metadata {
        let inode = &self.inodes[ino];
        let (size, is_dir, is_file, symlink_target) = match &inode.kind {
            NodeKind::File(data) => (data.len() as u64, false, true, None),
            NodeKind::Directory => (0, true, false, None),
            NodeKind::Symlink(target) => (target.len() as u64, false, false, Some(target.clone())),
        };
        Metadata {
            ino: ino as u64 + 1,
            size,
            is_dir,
            is_file,
            is_symlink: symlink_target.is_some(),
            symlink_target,
            uid: inode.uid,
            gid: inode.gid,
            mode: inode.mode,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
            nlink: inode.nlink,
        }
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for MemoryFs {
    fn open(&mut self, path: &str, options: OpenOptions) -> io::Result<FileHandle> {
        let ino = match self.lookup(path, true) {
            Ok((_, ino)) => {
                if options.truncate && options.write
                    && let NodeKind::File(data) = &mut self.inodes[ino].kind
                {
                    data.clear();
                    self.inodes[ino].mtime = self.clock;
                }
                ino
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && options.create => {
                let resolved = self.prepare_new(&self.resolve(path, true)?)?;
                let ino = self.new_inode(NodeKind::File(Vec::new()), 0o644);
                self.entries.insert(resolved, ino);
                ino
            }
            Err(e) => return Err(e),
        };

        if matches!(self.inodes[ino].kind, NodeKind::Directory) {
            return Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("is a directory: {}", path),
            ));
        }

        self.inodes[ino].open_count += 1;
        let handle = self.handles.insert(OpenFile {
            ino,
            position: 0,
            readable: options.read,
            writable: options.write || options.append,
            append: options.append,
        });

        Ok(handle)
    }

    fn close(&mut self, handle: FileHandle) -> io::Result<()> {
        if !self.handles.contains(handle) {
            return Err(bad_handle());
        }
        let file = self.handles.remove(handle);
        let inode = &mut self.inodes[file.ino];
        inode.open_count -= 1;
        if inode.nlink == 0 && inode.open_count == 0 {
            self.inodes.remove(file.ino);
        }
        Ok(())
    }

    fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.handles.get_mut(handle).ok_or_else(bad_handle)?;

        if !file.readable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file not opened for reading",
            ));
        }

        let inode = &mut self.inodes[file.ino];
        let NodeKind::File(data) = &inode.kind else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
        };

        let position = usize::try_from(file.position)
            .unwrap_or(usize::MAX)
            .min(data.len());
        let to_read = buf.len().min(data.len() - position);
        buf[..to_read].copy_from_slice(&data[position..position + to_read]);

        file.position += to_read as u64;
        inode.atime = self.clock;
        Ok(to_read)
    }

    fn write(&mut self, handle: FileHandle, buf: &[u8]) -> io::Result<usize> {
        let file = self.handles.get_mut(handle).ok_or_else(bad_handle)?;

        if !file.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file not opened for writing",
            ));
        }

        let inode = &mut self.inodes[file.ino];
        let NodeKind::File(data) = &mut inode.kind else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
        };

        if file.append {
            file.position = data.len() as u64;
        }
        let (start, end) = write_range(file.position, buf.len())?;

        // Extend file if necessary
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);

        file.position += buf.len() as u64;
        inode.mtime = self.clock;
        inode.ctime = self.clock;
        Ok(buf.len())
    }

    fn seek(&mut self, handle: FileHandle, pos: SeekFrom) -> io::Result<u64> {
        let file = self.handles.get_mut(handle).ok_or_else(bad_handle)?;

        let size = match &self.inodes[file.ino].kind {
            NodeKind::File(data) => data.len() as u64,
            _ => 0,
        };

        let new_pos = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(n) => size.checked_add_signed(n),
            SeekFrom::Current(n) => file.position.checked_add_signed(n),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file"))?;

        file.position = new_pos;
        Ok(new_pos)
    }

    fn metadata(&self, path: &str) -> io::Result<Metadata> {
        let (_, ino) = self.lookup(path, true)?;
        Ok(self.metadata_of(ino))
    }

    fn symlink_metadata(&self, path: &str) -> io::Result<Metadata> {
        let (_, ino) = self.lookup(path, false)?;
        Ok(self.metadata_of(ino))
    }

    fn create_dir(&mut self, path: &str) -> io::Result<()> {
        let resolved = self.prepare_new(path)?;
        let ino = self.new_inode(NodeKind::Directory, 0o755);
        self.entries.insert(resolved, ino);
        Ok(())
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let (dir, ino) = self.lookup(path, true)?;

        if !matches!(self.inodes[ino].kind, NodeKind::Directory) {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("not a directory: {}", path),
            ));
        }

        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };

        let mut entries: Vec<DirEntry> = self
            .entries
            .iter()
            .filter_map(|(p, &child)| {
                if p == &dir {
                    return None;
                }
                let relative = p.strip_prefix(&prefix)?;
                if relative.contains('/') {
                    return None; // Not a direct child
                }
                let kind = &self.inodes[child].kind;
                Some(DirEntry {
                    name: relative.to_string(),
                    is_dir: matches!(kind, NodeKind::Directory),
                    is_symlink: matches!(kind, NodeKind::Symlink(_)),
                })
            })
            .collect();

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn remove_file(&mut self, path: &str) -> io::Result<()> {
        let (resolved, ino) = self.lookup(path, false)?;

        if matches!(self.inodes[ino].kind, NodeKind::Directory) {
            return Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("is a directory: {}", path),
            ));
        }

        self.entries.remove(&resolved);
        self.unlink_inode(ino);
        Ok(())
    }

    fn remove_dir(&mut self, path: &str) -> io::Result<()> {
        let (resolved, ino) = self.lookup(path, false)?;

        if resolved == "/" {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "cannot remove root directory",
            ));
        }
        if !matches!(self.inodes[ino].kind, NodeKind::Directory) {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("not a directory: {}", path),
            ));
        }
        if self.has_children(&resolved) {
            return Err(io::Error::new(
                io::ErrorKind::DirectoryNotEmpty,
                format!("directory not empty: {}", path),
            ));
        }

        self.entries.remove(&resolved);
        self.inodes.remove(ino);
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        let (source, ino) = self.lookup(from, false)?;
        let dest = self.resolve(to, false)?;

        if source == dest {
            return Ok(());
        }
        if source == "/" || dest.starts_with(&format!("{}/", source)) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot move {} into itself", from),
            ));
        }

        let moving_dir = matches!(self.inodes[ino].kind, NodeKind::Directory);
        if let Some(&existing) = self.entries.get(&dest) {
            let existing_dir = matches!(self.inodes[existing].kind, NodeKind::Directory);
            match (moving_dir, existing_dir) {
                (true, false) => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotADirectory,
                        format!("not a directory: {}", to),
                    ));
                }
                (false, true) => {
                    return Err(io::Error::new(
                        io::ErrorKind::IsADirectory,
                        format!("is a directory: {}", to),
                    ));
                }
                (true, true) if self.has_children(&dest) => {
                    return Err(io::Error::new(
                        io::ErrorKind::DirectoryNotEmpty,
                        format!("directory not empty: {}", to),
                    ));
                }
                _ => {}
            }
            self.entries.remove(&dest);
            self.unlink_inode(existing);
        } else {
            self.prepare_new(&dest)?;
        }

        // Re-key the entry and, for directories, everything beneath it
        let prefix = format!("{}/", source);
        let moved: Vec<String> = self
            .entries
            .keys()
            .filter(|p| **p == source || p.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(child) = self.entries.remove(&old) {
                let new = format!("{}{}", dest, &old[source.len()..]);
                self.entries.insert(new, child);
            }
        }

        self.inodes[ino].ctime = self.clock;
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.lookup(path, true).is_ok()
    }

    fn symlink(&mut self, target: &str, link_path: &str) -> io::Result<()> {
        let resolved = self.prepare_new(link_path)?;
        let ino = self.new_inode(NodeKind::Symlink(target.to_string()), 0o777);
        self.entries.insert(resolved, ino);
        Ok(())
    }

    fn read_link(&self, path: &str) -> io::Result<String> {
        let (_, ino) = self.lookup(path, false)?;
        match &self.inodes[ino].kind {
            NodeKind::Symlink(target) => Ok(target.clone()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a symbolic link: {}", path),
            )),
        }
    }

    fn link(&mut self, source: &str, dest: &str) -> io::Result<()> {
        let (_, ino) = self.lookup(source, false)?;
        if matches!(self.inodes[ino].kind, NodeKind::Directory) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "hard links to directories are not allowed",
            ));
        }
        let resolved = self.prepare_new(dest)?;
        self.entries.insert(resolved, ino);
        let inode = &mut self.inodes[ino];
        inode.nlink += 1;
        inode.ctime = self.clock;
        Ok(())
    }

    fn chmod(&mut self, path: &str, mode: u16) -> io::Result<()> {
        let (_, ino) = self.lookup(path, true)?;
        let inode = &mut self.inodes[ino];
        inode.mode = mode & 0o7777;
        inode.ctime = self.clock;
        Ok(())
    }

    fn chown(&mut self, path: &str, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        let (_, ino) = self.lookup(path, true)?;
        let inode = &mut self.inodes[ino];
        if let Some(uid) = uid {
            inode.uid = uid;
        }
        if let Some(gid) = gid {
            inode.gid = gid;
        }
        inode.ctime = self.clock;
        Ok(())
    }

    fn truncate(&mut self, path: &str, len: u64) -> io::Result<()> {
        let (_, ino) = self.lookup(path, true)?;
        let inode = &mut self.inodes[ino];
        match &mut inode.kind {
            NodeKind::File(data) => {
                let (_, len) = write_range(len, 0)?;
                data.resize(len, 0);
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::IsADirectory,
                    format!("not a regular file: {}", path),
                ));
            }
        }
        inode.mtime = self.clock;
        inode.ctime = self.clock;
        Ok(())
    }

    fn utimes(&mut self, path: &str, atime: Option<f64>, mtime: Option<f64>) -> io::Result<()> {
        let (_, ino) = self.lookup(path, true)?;
        let now = self.clock;
        let inode = &mut self.inodes[ino];
        inode.atime = atime.unwrap_or(now);
        inode.mtime = mtime.unwrap_or(now);
        inode.ctime = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{read_all, write_all};

    #[test]
    fn test_basic_file_ops() {
        let mut fs = MemoryFs::new();

        let handle = fs
            .open("/test.txt", OpenOptions::new().write(true).create(true))
            .unwrap();
        fs.write(handle, b"hello world").unwrap();
        fs.close(handle).unwrap();

        let handle = fs.open("/test.txt", OpenOptions::new().read(true)).unwrap();
        let mut buf = [0u8; 11];
        let n = fs.read(handle, &mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
        fs.close(handle).unwrap();
        assert_eq!(fs.open_handles(), 0);
    }

    #[test]
    fn test_missing_parent() {
        let mut fs = MemoryFs::new();
        let err = fs
            .open("/nope/file", OpenOptions::new().write(true).create(true))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_dirs_and_listing() {
        let mut fs = MemoryFs::new();
        fs.create_dir("/home").unwrap();
        fs.create_dir("/home/user").unwrap();
        write_all(&mut fs, "/home/user/b.txt", b"b").unwrap();
        write_all(&mut fs, "/home/user/a.txt", b"a").unwrap();

        let names: Vec<String> = fs
            .read_dir("/home/user")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);

        let err = fs.remove_dir("/home/user").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::DirectoryNotEmpty);
        assert_eq!(
            fs.create_dir("/home").unwrap_err().kind(),
            io::ErrorKind::AlreadyExists
        );
    }

    #[test]
    fn test_path_normalization() {
        let mut fs = MemoryFs::new();
        fs.create_dir("/a").unwrap();
        write_all(&mut fs, "/a/./f.txt", b"x").unwrap();
        assert!(fs.exists("a/f.txt"));
        assert!(fs.exists("/a//f.txt/"));
        assert!(fs.exists("/a/../a/f.txt"));
    }

    #[test]
    fn test_symlinks() {
        let mut fs = MemoryFs::new();
        fs.create_dir("/data").unwrap();
        write_all(&mut fs, "/data/real.txt", b"content").unwrap();
        fs.symlink("/data/real.txt", "/link").unwrap();
        fs.symlink("data", "/dirlink").unwrap();

        assert_eq!(read_all(&mut fs, "/link").unwrap(), b"content");
        assert_eq!(read_all(&mut fs, "/dirlink/real.txt").unwrap(), b"content");
        assert_eq!(fs.read_link("/link").unwrap(), "/data/real.txt");
        assert!(fs.symlink_metadata("/link").unwrap().is_symlink);
        assert!(fs.metadata("/link").unwrap().is_file);

        fs.symlink("/loop2", "/loop1").unwrap();
        fs.symlink("/loop1", "/loop2").unwrap();
        assert!(fs.metadata("/loop1").is_err());

        // Removing the link leaves the target alone
        fs.remove_file("/link").unwrap();
        assert!(fs.exists("/data/real.txt"));
    }

    #[test]
    fn test_hard_links_share_inode() {
        let mut fs = MemoryFs::new();
        write_all(&mut fs, "/a", b"one").unwrap();
        fs.link("/a", "/b").unwrap();

        let meta = fs.metadata("/a").unwrap();
        assert_eq!(meta.nlink, 2);
        assert_eq!(meta.ino, fs.metadata("/b").unwrap().ino);

        write_all(&mut fs, "/b", b"two").unwrap();
        assert_eq!(read_all(&mut fs, "/a").unwrap(), b"two");

        fs.remove_file("/a").unwrap();
        assert_eq!(fs.metadata("/b").unwrap().nlink, 1);
        assert_eq!(read_all(&mut fs, "/b").unwrap(), b"two");
    }

    #[test]
    fn test_unlinked_file_readable_while_open() {
        let mut fs = MemoryFs::new();
        write_all(&mut fs, "/tmpfile", b"still here").unwrap();
        let handle = fs.open("/tmpfile", OpenOptions::new()).unwrap();
        fs.remove_file("/tmpfile").unwrap();
        assert!(!fs.exists("/tmpfile"));

        let mut buf = [0u8; 10];
        assert_eq!(fs.read(handle, &mut buf).unwrap(), 10);
        assert_eq!(&buf, b"still here");
        fs.close(handle).unwrap();
    }

    #[test]
    fn test_rename_directory_moves_children() {
        let mut fs = MemoryFs::new();
        fs.create_dir("/src").unwrap();
        fs.create_dir("/src/nested").unwrap();
        write_all(&mut fs, "/src/nested/f", b"f").unwrap();

        fs.rename("/src", "/dst").unwrap();
        assert!(!fs.exists("/src"));
        assert_eq!(read_all(&mut fs, "/dst/nested/f").unwrap(), b"f");

        let err = fs.rename("/dst", "/dst/nested/inner").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_rename_replaces_file() {
        let mut fs = MemoryFs::new();
        write_all(&mut fs, "/a", b"a").unwrap();
        write_all(&mut fs, "/b", b"b").unwrap();
        fs.rename("/a", "/b").unwrap();
        assert!(!fs.exists("/a"));
        assert_eq!(read_all(&mut fs, "/b").unwrap(), b"a");
    }

    #[test]
    fn test_append_truncate_seek() {
        let mut fs = MemoryFs::new();
        write_all(&mut fs, "/log", b"one\n").unwrap();

        let handle = fs
            .open("/log", OpenOptions::new().read(false).append(true))
            .unwrap();
        fs.write(handle, b"two\n").unwrap();
        fs.close(handle).unwrap();
        assert_eq!(read_all(&mut fs, "/log").unwrap(), b"one\ntwo\n");

        fs.truncate("/log", 3).unwrap();
        assert_eq!(read_all(&mut fs, "/log").unwrap(), b"one");

        let handle = fs.open("/log", OpenOptions::new()).unwrap();
        assert_eq!(fs.seek(handle, SeekFrom::End(-1)).unwrap(), 2);
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(handle, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'e');
        assert!(fs.seek(handle, SeekFrom::Current(-10)).is_err());
        fs.close(handle).unwrap();
    }

    #[test]
    fn test_permissions_and_times() {
        let mut fs = MemoryFs::new();
        fs.set_clock(1000.0);
        write_all(&mut fs, "/f", b"").unwrap();
        fs.chmod("/f", 0o100600).unwrap();
        fs.chown("/f", Some(0), None).unwrap();
        fs.utimes("/f", Some(5.0), None).unwrap();

        let meta = fs.metadata("/f").unwrap();
        assert_eq!(meta.mode, 0o600);
        assert_eq!(meta.uid, 0);
        assert_eq!(meta.gid, 1000);
        assert_eq!(meta.atime, 5.0);
        assert_eq!(meta.mtime, 1000.0);
    }

    #[test]
    fn test_cannot_remove_root_or_open_dir() {
        let mut fs = MemoryFs::new();
        assert_eq!(
            fs.remove_dir("/").unwrap_err().kind(),
            io::ErrorKind::PermissionDenied
        );
        assert_eq!(
            fs.open("/", OpenOptions::new()).unwrap_err().kind(),
            io::ErrorKind::IsADirectory
        );
    }

    #[test]
    fn test_write_past_size_limit_is_an_error() {
        let mut fs = MemoryFs::new();
        let handle = fs
            .open("/big", OpenOptions::new().read(true).write(true).create(true))
            .unwrap();

        fs.seek(handle, SeekFrom::Start(u64::MAX - 1)).unwrap();
        assert_eq!(
            fs.write(handle, b"ab").unwrap_err().kind(),
            io::ErrorKind::FileTooLarge
        );

        fs.seek(handle, SeekFrom::Start(MAX_FILE_SIZE)).unwrap();
        assert_eq!(
            fs.write(handle, b"a").unwrap_err().kind(),
            io::ErrorKind::FileTooLarge
        );
        assert_eq!(
            fs.truncate("/big", MAX_FILE_SIZE + 1).unwrap_err().kind(),
            io::ErrorKind::FileTooLarge
        );

        // Reading far past the end is just EOF
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(handle, &mut buf).unwrap(), 0);
        assert_eq!(fs.metadata("/big").unwrap().size, 0);
    }

    #[test]
    fn test_json_image_round_trip() {
        let mut fs = MemoryFs::new();
        fs.set_clock(42.0);
        fs.create_dir("/src").unwrap();
        write_all(&mut fs, "/src/main.rs", b"fn main() {}").unwrap();
        fs.link("/src/main.rs", "/main.rs").unwrap();
        fs.symlink("/src", "/code").unwrap();
        fs.chmod("/src/main.rs", 0o600).unwrap();

        // Unlinked while open: gone from the image
        write_all(&mut fs, "/scratch", b"tmp").unwrap();
        let handle = fs.open("/scratch", OpenOptions::new()).unwrap();
        fs.remove_file("/scratch").unwrap();

        let mut copy = MemoryFs::from_json(&fs.to_json().unwrap()).unwrap();
        assert_eq!(read_all(&mut copy, "/code/main.rs").unwrap(), b"fn main() {}");
        assert_eq!(copy.metadata("/main.rs").unwrap().mode, 0o600);
        assert_eq!(copy.read_link("/code").unwrap(), "/src");
        assert!(!copy.exists("/scratch"));
        assert_eq!(copy.open_handles(), 0);

        // Hard links still share one inode
        write_all(&mut copy, "/main.rs", b"changed").unwrap();
        assert_eq!(read_all(&mut copy, "/src/main.rs").unwrap(), b"changed");

        fs.close(handle).unwrap();
    }

    #[test]
    fn test_json_image_rejects_garbage() {
        assert_eq!(
            MemoryFs::from_json(b"not json").unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
        let dangling = br#"{"clock":0.0,"inodes":[],"entries":[["/",0]]}"#;
        assert_eq!(
            MemoryFs::from_json(dangling).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }
}
