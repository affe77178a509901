//! Embedded image boundary
//!
//! The command-line utility image is an external collaborator: something
//! that, given an `ImageConfig`, produces an instance whose `call_main`
//! runs one command to completion. This module only defines that contract.
//!
//! Loading order mirrors a module factory:
//! 1. The factory creates the instance's runtime and filesystem
//! 2. `pre_run` hooks run against that filesystem (`ModuleFs`)
//! 3. The instance is handed back, ready for `call_main`

#[cfg(target_arch = "wasm32")]
pub mod web;

use crate::vfs::ProxyFs;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

/// Failures reported by an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    /// The factory could not produce an instance
    Instantiation { reason: String },
    /// A pre-run hook failed
    Hook { reason: String },
    /// The entry point aborted
    Trap { reason: String },
    /// Filesystem setup inside the instance failed
    Io { message: String },
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instantiation { reason } => write!(f, "instantiation failed: {}", reason),
            Self::Hook { reason } => write!(f, "pre-run hook failed: {}", reason),
            Self::Trap { reason } => write!(f, "trap: {}", reason),
            Self::Io { message } => write!(f, "io error: {}", message),
        }
    }
}

impl std::error::Error for ImageError {}

impl From<std::io::Error> for ImageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            message: e.to_string(),
        }
    }
}

/// Byte sink for the instance's stdout/stderr
pub type PrintFn = Rc<dyn Fn(&[u8])>;

/// Byte source for the instance's stdin; `None` is EOF
pub type StdinFn = Rc<dyn Fn() -> Option<u8>>;

/// Runs after the instance's filesystem exists and before `call_main`
pub type PreRunHook = Box<dyn FnOnce(&mut dyn ModuleFs) -> Result<(), ImageError>>;

/// The instance's own filesystem, as exposed to pre-run hooks
pub trait ModuleFs {
    /// Does the instance support mounting a host proxy filesystem
    fn has_proxy_fs(&self) -> bool;

    fn mkdir(&mut self, path: &str) -> Result<(), ImageError>;

    /// Mount `fs` at `mountpoint`, with `root` as the host-side root
    fn mount_proxy(
        &mut self,
        fs: Rc<dyn ProxyFs>,
        root: &str,
        mountpoint: &str,
    ) -> Result<(), ImageError>;

    fn chdir(&mut self, path: &str) -> Result<(), ImageError>;
}

/// Configuration handed to the factory for one instance
pub struct ImageConfig {
    /// Program name the instance reports and dispatches on
    pub this_program: String,
    /// Keep the runtime alive after main returns
    pub no_exit_runtime: bool,
    pub print: PrintFn,
    pub print_err: PrintFn,
    pub stdin: StdinFn,
    pub pre_run: Vec<PreRunHook>,
}

impl ImageConfig {
    /// A config that discards output and reads nothing
    pub fn new(this_program: impl Into<String>) -> Self {
        Self {
            this_program: this_program.into(),
            no_exit_runtime: true,
            print: Rc::new(|_| {}),
            print_err: Rc::new(|_| {}),
            stdin: Rc::new(|| None),
            pre_run: Vec::new(),
        }
    }

    /// Run and consume every pre-run hook, stopping at the first failure
    pub fn run_pre_run(&mut self, fs: &mut dyn ModuleFs) -> Result<(), ImageError> {
        for hook in self.pre_run.drain(..) {
            hook(fs)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ImageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageConfig")
            .field("this_program", &self.this_program)
            .field("no_exit_runtime", &self.no_exit_runtime)
            .field("pre_run", &self.pre_run.len())
            .finish()
    }
}

/// Produces image instances, one per process
pub trait ImageFactory: 'static {
    type Instance: ImageInstance + 'static;

    fn instantiate(
        &self,
        config: ImageConfig,
    ) -> impl Future<Output = Result<Self::Instance, ImageError>>;
}

/// One loaded image, ready to run
pub trait ImageInstance {
    /// Run the entry point. `argv[0]` is the name the command was invoked as.
    fn call_main(&mut self, argv: &[String]) -> impl Future<Output = Result<i32, ImageError>>;
}
