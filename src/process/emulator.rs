//! Boot sequence for one emulated process
//!
//! Each process gets its own image instance. The boot task:
//! 1. Yields once, so listeners attached right after `spawn` see `Spawn`
//! 2. Builds the image config: identity, stdio forwarding, proxy mount
//! 3. Instantiates the image; the handle goes to Running
//! 4. Runs the entry point with the invoked name as argv[0]
//! 5. Records the exit code, or the error and the forced exit

use super::command::Command;
use super::error::ProcessError;
use super::handle::{FAILURE_EXIT_CODE, ProcessHandle};
use crate::image::{ImageConfig, ImageFactory, ImageInstance, ModuleFs};
use crate::vfs::ProxyFs;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Resolves on its second poll, giving other ready tasks one turn
#[derive(Default)]
pub(crate) struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Everything the boot task needs
pub(crate) struct Boot<F: ImageFactory> {
    pub factory: Rc<F>,
    pub handle: ProcessHandle,
    pub command: Command,
    pub filesystem: Option<Rc<dyn ProxyFs>>,
    pub mount_point: String,
}

impl<F: ImageFactory> Boot<F> {
    /// Drive the handle to a terminal state
    pub async fn run(self) {
        YieldNow::default().await;

        let config = self.image_config();
        let mut instance = match self.factory.instantiate(config).await {
            Ok(instance) => instance,
            Err(e) => {
                self.handle.fail(ProcessError::Boot(e));
                return;
            }
        };
        self.handle.mark_running();

        let mut argv = Vec::with_capacity(self.handle.args().len() + 1);
        argv.push(self.handle.command().to_string());
        argv.extend_from_slice(self.handle.args());

        match instance.call_main(&argv).await {
            Ok(code) => {
                self.handle.finish(code);
            }
            Err(e) => {
                self.handle.fail(ProcessError::Exec(e));
            }
        }
    }

    fn image_config(&self) -> ImageConfig {
        let mut config = ImageConfig::new(self.command.image_identity());

        let stdout = self.handle.clone();
        config.print = Rc::new(move |bytes: &[u8]| stdout.write_stdout(bytes));
        let stderr = self.handle.clone();
        config.print_err = Rc::new(move |bytes: &[u8]| stderr.write_stderr(bytes));
        let stdin = self.handle.stdin().clone();
        config.stdin = Rc::new(move || stdin.read_byte());

        if let Some(filesystem) = self.filesystem.clone() {
            let mount_point = self.mount_point.clone();
            let program = self.command.name();
            config.pre_run.push(Box::new(move |module: &mut dyn ModuleFs| {
                mount_host_fs(module, filesystem, &mount_point, program)
            }));
        }

        config
    }
}

/// Mount the host filesystem at `mount_point` and make it the working
/// directory. A module without proxy support boots without a filesystem.
fn mount_host_fs(
    module: &mut dyn ModuleFs,
    filesystem: Rc<dyn ProxyFs>,
    mount_point: &str,
    program: &str,
) -> Result<(), crate::image::ImageError> {
    if !module.has_proxy_fs() {
        crate::console_warn!(
            "[process] proxy filesystem not available, {} will have no filesystem access",
            program
        );
        return Ok(());
    }

    module.mkdir(mount_point)?;
    module.mount_proxy(filesystem, "/", mount_point)?;
    module.chdir(mount_point)
}

/// Stand-in for a command that could not be spawned: boots, reports the
/// message on stderr and exits with the failure code.
pub(crate) async fn report(handle: ProcessHandle, message: String) {
    YieldNow::default().await;

    handle.mark_running();
    handle.write_stderr(format!("{}\n", message).as_bytes());
    handle.finish(FAILURE_EXIT_CODE);
}
