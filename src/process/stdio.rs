//! Stdio normalization
//!
//! Resolves a caller's stdio request into concrete endpoints. Nothing is
//! buffered or copied here; endpoints are shared handles onto whatever the
//! caller or the host supplied.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;

/// A writable endpoint (stdout/stderr side)
#[derive(Clone)]
pub struct OutputStream(Rc<RefCell<dyn Write>>);

impl OutputStream {
    pub fn new<W: Write + 'static>(writer: W) -> Self {
        Self(Rc::new(RefCell::new(writer)))
    }

    /// Write the whole payload and flush
    pub fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.0.try_borrow_mut().map_err(|_| {
            io::Error::new(io::ErrorKind::WouldBlock, "stream is already being written")
        })?;
        writer.write_all(bytes)?;
        writer.flush()
    }

    /// Both handles point at the same underlying writer
    pub fn same_stream(&self, other: &OutputStream) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.0), Rc::as_ptr(&other.0))
    }
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OutputStream({:p})", Rc::as_ptr(&self.0))
    }
}

/// A readable endpoint (stdin side)
#[derive(Clone)]
pub struct InputStream(Rc<RefCell<dyn Read>>);

impl InputStream {
    pub fn new<R: Read + 'static>(reader: R) -> Self {
        Self(Rc::new(RefCell::new(reader)))
    }

    /// A stream that is always at EOF
    pub fn empty() -> Self {
        Self::new(io::empty())
    }

    /// Read a single byte, `None` on EOF or error
    pub fn read_byte(&self) -> Option<u8> {
        let mut reader = self.0.try_borrow_mut().ok()?;
        let mut byte = [0u8; 1];
        loop {
            match reader.read(&mut byte) {
                Ok(0) => return None,
                Ok(_) => return Some(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn same_stream(&self, other: &InputStream) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.0), Rc::as_ptr(&other.0))
    }
}

impl std::fmt::Debug for InputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InputStream({:p})", Rc::as_ptr(&self.0))
    }
}

/// Growable in-memory pipe, readable from the front and writable at the back.
///
/// Cloning shares the buffer, so one clone can be handed to a process as
/// stdout while the caller keeps the other to inspect what was written.
#[derive(Clone, Default)]
pub struct MemoryPipe {
    inner: Rc<RefCell<PipeInner>>,
}

#[derive(Default)]
struct PipeInner {
    data: Vec<u8>,
    read_pos: usize,
}

impl MemoryPipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pipe preloaded with input
    pub fn with_contents(bytes: impl Into<Vec<u8>>) -> Self {
        let pipe = Self::new();
        pipe.inner.borrow_mut().data = bytes.into();
        pipe
    }

    /// Everything written so far
    pub fn contents(&self) -> Vec<u8> {
        self.inner.borrow().data.clone()
    }

    /// Contents as string (lossy UTF-8)
    pub fn contents_str(&self) -> String {
        String::from_utf8_lossy(&self.inner.borrow().data).into_owned()
    }

    pub fn output_stream(&self) -> OutputStream {
        OutputStream::new(self.clone())
    }

    pub fn input_stream(&self) -> InputStream {
        InputStream::new(self.clone())
    }
}

impl Write for MemoryPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.borrow_mut().data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for MemoryPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();
        let available = &inner.data[inner.read_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        inner.read_pos += n;
        Ok(n)
    }
}

/// The host's own standard streams, the target of "inherit"
#[derive(Clone, Debug)]
pub struct HostStdio {
    pub stdin: InputStream,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
}

impl HostStdio {
    pub fn new(stdin: InputStream, stdout: OutputStream, stderr: OutputStream) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
        }
    }

    /// The embedding process's std streams
    #[cfg(not(target_arch = "wasm32"))]
    pub fn inherit() -> Self {
        Self::new(
            InputStream::new(io::stdin()),
            OutputStream::new(io::stdout()),
            OutputStream::new(io::stderr()),
        )
    }

    /// Browser: no stdin, output goes to the console line by line
    #[cfg(target_arch = "wasm32")]
    pub fn inherit() -> Self {
        Self::new(
            InputStream::empty(),
            OutputStream::new(ConsoleWriter::new(false)),
            OutputStream::new(ConsoleWriter::new(true)),
        )
    }

    /// Host streams backed by memory pipes, for embedding and tests
    pub fn captured() -> (Self, MemoryPipe, MemoryPipe) {
        let out = MemoryPipe::new();
        let err = MemoryPipe::new();
        let host = Self::new(InputStream::empty(), out.output_stream(), err.output_stream());
        (host, out, err)
    }
}

/// Line-buffered writer onto the browser console
#[cfg(target_arch = "wasm32")]
struct ConsoleWriter {
    line: Vec<u8>,
    error: bool,
}

#[cfg(target_arch = "wasm32")]
impl ConsoleWriter {
    fn new(error: bool) -> Self {
        Self {
            line: Vec::new(),
            error,
        }
    }

    fn emit(&mut self) {
        let text = String::from_utf8_lossy(&self.line).into_owned();
        if self.error {
            crate::console_error!("{}", text);
        } else {
            crate::console_log!("{}", text);
        }
        self.line.clear();
    }
}

#[cfg(target_arch = "wasm32")]
impl Write for ConsoleWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            if byte == b'\n' {
                self.emit();
            } else {
                self.line.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.line.is_empty() {
            self.emit();
        }
        Ok(())
    }
}

/// Request for the stdin slot
#[derive(Clone, Debug, Default)]
pub enum InputSlot {
    #[default]
    Inherit,
    /// File-descriptor sentinel; only 0 is addressable here
    Fd(u32),
    /// Always-EOF input
    Ignore,
    Stream(InputStream),
}

/// Request for the stdout or stderr slot
#[derive(Clone, Debug, Default)]
pub enum OutputSlot {
    #[default]
    Inherit,
    /// File-descriptor sentinel: 1 = host stdout, 2 = host stderr
    Fd(u32),
    /// Drop everything written
    Ignore,
    Stream(OutputStream),
}

/// Caller-facing stdio request
#[derive(Clone, Debug, Default)]
pub enum StdioOptions {
    #[default]
    Inherit,
    Slots(InputSlot, OutputSlot, OutputSlot),
}

/// Which of the three slots a request sat in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioSlot {
    Stdin,
    Stdout,
    Stderr,
}

impl std::fmt::Display for StdioSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdin => write!(f, "stdin"),
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// A descriptor sentinel that makes no sense in its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdioError {
    pub slot: StdioSlot,
    pub fd: u32,
}

impl std::fmt::Display for StdioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd {} cannot be used for {}", self.fd, self.slot)
    }
}

impl std::error::Error for StdioError {}

/// Concrete endpoints for one process. `None` outputs discard writes.
#[derive(Clone, Debug)]
pub struct ResolvedStdio {
    pub stdin: InputStream,
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
}

/// Resolve `options` against the host streams. `None` means inherit all.
pub fn normalize(
    options: Option<&StdioOptions>,
    host: &HostStdio,
) -> Result<ResolvedStdio, StdioError> {
    let (stdin, stdout, stderr) = match options {
        None | Some(StdioOptions::Inherit) => {
            return Ok(ResolvedStdio {
                stdin: host.stdin.clone(),
                stdout: Some(host.stdout.clone()),
                stderr: Some(host.stderr.clone()),
            });
        }
        Some(StdioOptions::Slots(stdin, stdout, stderr)) => (stdin, stdout, stderr),
    };

    Ok(ResolvedStdio {
        stdin: resolve_input(stdin, host)?,
        stdout: resolve_output(stdout, StdioSlot::Stdout, host)?,
        stderr: resolve_output(stderr, StdioSlot::Stderr, host)?,
    })
}

fn resolve_input(slot: &InputSlot, host: &HostStdio) -> Result<InputStream, StdioError> {
    match slot {
        InputSlot::Inherit | InputSlot::Fd(0) => Ok(host.stdin.clone()),
        InputSlot::Fd(fd) => Err(StdioError {
            slot: StdioSlot::Stdin,
            fd: *fd,
        }),
        InputSlot::Ignore => Ok(InputStream::empty()),
        InputSlot::Stream(stream) => Ok(stream.clone()),
    }
}

fn resolve_output(
    slot: &OutputSlot,
    which: StdioSlot,
    host: &HostStdio,
) -> Result<Option<OutputStream>, StdioError> {
    match slot {
        OutputSlot::Inherit => Ok(Some(match which {
            StdioSlot::Stderr => host.stderr.clone(),
            _ => host.stdout.clone(),
        })),
        OutputSlot::Fd(1) => Ok(Some(host.stdout.clone())),
        OutputSlot::Fd(2) => Ok(Some(host.stderr.clone())),
        OutputSlot::Fd(fd) => Err(StdioError { slot: which, fd: *fd }),
        OutputSlot::Ignore => Ok(None),
        OutputSlot::Stream(stream) => Ok(Some(stream.clone())),
    }
}
