//! Where exported archives go, and how the environment restarts
//!
//! `download` hands the archive to the host as a named file; a successful
//! `upload` asks the host to reload, since the live buffer cannot be swapped
//! underneath the components already using it.

use std::fmt;

/// Host-side failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    pub message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host error: {}", self.message)
    }
}

impl std::error::Error for HostError {}

/// The embedding environment
pub trait SnapshotHost {
    /// Hand `archive` to the user as a file called `file_name`
    fn deliver(&self, file_name: &str, archive: &[u8]) -> Result<(), HostError>;

    /// Restart the environment so it boots from the stored snapshot
    fn reload(&self) -> Result<(), HostError>;
}

#[cfg(not(target_arch = "wasm32"))]
pub use native::DirectoryHost;

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use super::{HostError, SnapshotHost};
    use std::cell::Cell;
    use std::fs;
    use std::path::{Path, PathBuf};

    /// Writes exports into a directory and counts reload requests.
    ///
    /// A native embedder polls `reload_requested` and restarts itself.
    #[derive(Debug)]
    pub struct DirectoryHost {
        dir: PathBuf,
        reloads: Cell<usize>,
    }

    impl DirectoryHost {
        pub fn new(dir: impl Into<PathBuf>) -> Self {
            Self {
                dir: dir.into(),
                reloads: Cell::new(0),
            }
        }

        pub fn dir(&self) -> &Path {
            &self.dir
        }

        /// Number of reloads asked for so far
        pub fn reloads(&self) -> usize {
            self.reloads.get()
        }

        pub fn reload_requested(&self) -> bool {
            self.reloads.get() > 0
        }
    }

    impl SnapshotHost for DirectoryHost {
        fn deliver(&self, file_name: &str, archive: &[u8]) -> Result<(), HostError> {
            fs::create_dir_all(&self.dir)
                .and_then(|_| fs::write(self.dir.join(file_name), archive))
                .map_err(|e| HostError::new(format!("cannot write {}: {}", file_name, e)))
        }

        fn reload(&self) -> Result<(), HostError> {
            self.reloads.set(self.reloads.get() + 1);
            crate::console_log!("[snapshot] reload requested");
            Ok(())
        }
    }
}

#[cfg(target_arch = "wasm32")]
pub use web::WebHost;

#[cfg(target_arch = "wasm32")]
mod web {
    use super::{HostError, SnapshotHost};
    use wasm_bindgen::JsCast;

    fn js_error(what: &str, e: wasm_bindgen::JsValue) -> HostError {
        HostError::new(format!("{}: {:?}", what, e))
    }

    /// Browser host: Blob downloads and page reloads
    #[derive(Clone, Copy, Debug, Default)]
    pub struct WebHost;

    impl SnapshotHost for WebHost {
        fn deliver(&self, file_name: &str, archive: &[u8]) -> Result<(), HostError> {
            let window = web_sys::window().ok_or_else(|| HostError::new("no window object"))?;
            let document = window
                .document()
                .ok_or_else(|| HostError::new("no document"))?;

            let data = js_sys::Uint8Array::from(archive);
            let parts = js_sys::Array::of1(&data);
            let props = web_sys::BlobPropertyBag::new();
            props.set_type("application/zip");
            let blob = web_sys::Blob::new_with_u8_array_sequence_and_options(&parts, &props)
                .map_err(|e| js_error("failed to create blob", e))?;
            let url = web_sys::Url::create_object_url_with_blob(&blob)
                .map_err(|e| js_error("failed to create object URL", e))?;

            let anchor: web_sys::HtmlAnchorElement = document
                .create_element("a")
                .map_err(|e| js_error("failed to create anchor", e))?
                .dyn_into()
                .map_err(|e| js_error("not an anchor element", e.into()))?;
            anchor.set_href(&url);
            anchor.set_download(file_name);
            anchor.click();

            web_sys::Url::revoke_object_url(&url)
                .map_err(|e| js_error("failed to revoke object URL", e))
        }

        fn reload(&self) -> Result<(), HostError> {
            let window = web_sys::window().ok_or_else(|| HostError::new("no window object"))?;
            window
                .location()
                .reload()
                .map_err(|e| js_error("failed to reload", e))
        }
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;

    #[test]
    fn test_directory_host() {
        let dir = std::env::temp_dir().join(format!("isobox-host-{}", std::process::id()));
        let host = DirectoryHost::new(&dir);

        host.deliver("workspace.zip", b"PK").unwrap();
        assert_eq!(std::fs::read(dir.join("workspace.zip")).unwrap(), b"PK");

        assert!(!host.reload_requested());
        host.reload().unwrap();
        assert_eq!(host.reloads(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
