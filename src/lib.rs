//! isobox - isomorphic child processes and memory snapshots, compiled to WASM
//!
//! Two halves that share one address space:
//! - `process`: spawn/exec over a single embedded command-line image, with
//!   PID bookkeeping, stdio plumbing and an explicit lifecycle
//! - `snapshot`: the shared linear memory buffer, restored from or persisted
//!   to a versioned two-entry archive
//!
//! Platform support:
//! - Browser (wasm32-unknown-unknown): OPFS store, Blob downloads, JS image factory
//! - Native: directory-backed store, std stdio, any `LocalSpawn` executor

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

pub mod config;
pub mod image;
pub mod process;
pub mod snapshot;
pub mod vfs;

pub use config::{PidPolicy, RuntimeConfig, SnapshotConfig};
pub use image::{ImageConfig, ImageError, ImageFactory, ImageInstance};
pub use process::{
    CommandResult, ProcessEvent, ProcessHandle, ProcessRuntime, ProcessState, SpawnError,
    SpawnOptions,
};
pub use snapshot::{SnapshotError, SnapshotManager};

/// Install the panic hook for readable panics in the browser console
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(js_name = installPanicHook)]
pub fn install_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    fn log(s: &str);

    #[wasm_bindgen(js_namespace = console)]
    fn warn(s: &str);

    #[wasm_bindgen(js_namespace = console)]
    fn error(s: &str);
}

/// Log to browser console (WASM)
#[cfg(target_arch = "wasm32")]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        $crate::__log(&format!($($t)*))
    };
}

/// Log to stderr (native)
#[cfg(not(target_arch = "wasm32"))]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        eprintln!($($t)*)
    };
}

/// Warn in browser console (WASM)
#[cfg(target_arch = "wasm32")]
#[macro_export]
macro_rules! console_warn {
    ($($t:tt)*) => {
        $crate::__warn(&format!($($t)*))
    };
}

/// Warn on stderr (native)
#[cfg(not(target_arch = "wasm32"))]
#[macro_export]
macro_rules! console_warn {
    ($($t:tt)*) => {
        eprintln!("warning: {}", format_args!($($t)*))
    };
}

/// Error in browser console (WASM)
#[cfg(target_arch = "wasm32")]
#[macro_export]
macro_rules! console_error {
    ($($t:tt)*) => {
        $crate::__error(&format!($($t)*))
    };
}

/// Error on stderr (native)
#[cfg(not(target_arch = "wasm32"))]
#[macro_export]
macro_rules! console_error {
    ($($t:tt)*) => {
        eprintln!("error: {}", format_args!($($t)*))
    };
}

#[cfg(target_arch = "wasm32")]
#[doc(hidden)]
pub fn __log(s: &str) {
    log(s)
}

#[cfg(target_arch = "wasm32")]
#[doc(hidden)]
pub fn __warn(s: &str) {
    warn(s)
}

#[cfg(target_arch = "wasm32")]
#[doc(hidden)]
pub fn __error(s: &str) {
    error(s)
}
