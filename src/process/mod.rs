//! Isomorphic child processes
//!
//! `ProcessRuntime` is the dispatcher: it checks a command against the
//! registry, resolves stdio, assigns a PID and schedules the boot task. The
//! handle comes back synchronously in the `Pending` state, so callers can
//! subscribe before anything asynchronous happens.
//!
//! Rejections (unknown or unsupported commands) are returned as errors and
//! never reach the image factory.

pub mod command;
pub mod emulator;
pub mod error;
pub mod events;
pub mod handle;
pub mod parser;
pub mod pid;
pub mod stdio;

pub use command::{Command, UnknownCommand};
pub use error::{CommandResult, ProcessError, SpawnError};
pub use events::Receiver;
pub use handle::{FAILURE_EXIT_CODE, ProcessEvent, ProcessHandle, ProcessState, WaitFuture};
pub use parser::{ParseError, SimpleCommand};
pub use pid::{Pid, PidError, PidPool};
pub use stdio::{
    HostStdio, InputSlot, InputStream, MemoryPipe, OutputSlot, OutputStream, StdioError,
    StdioOptions,
};

use crate::config::RuntimeConfig;
use crate::image::ImageFactory;
use crate::vfs::ProxyFs;
use emulator::Boot;
use futures::task::{LocalSpawn, LocalSpawnExt};
use std::cell::RefCell;
use std::rc::Rc;

/// Options for `spawn`/`exec`
#[derive(Clone, Debug, Default)]
pub struct SpawnOptions {
    /// `None` inherits all three host streams
    pub stdio: Option<StdioOptions>,
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdio(mut self, stdio: StdioOptions) -> Self {
        self.stdio = Some(stdio);
        self
    }
}

/// Spawns emulated processes over one image factory
pub struct ProcessRuntime<F: ImageFactory> {
    factory: Rc<F>,
    spawner: Rc<dyn LocalSpawn>,
    host: HostStdio,
    filesystem: Option<Rc<dyn ProxyFs>>,
    pids: Rc<RefCell<PidPool>>,
    config: RuntimeConfig,
}

impl<F: ImageFactory> ProcessRuntime<F> {
    /// Runtime with inherited host stdio, no filesystem and default config
    pub fn new(factory: F, spawner: impl LocalSpawn + 'static) -> Self {
        let config = RuntimeConfig::default();
        Self {
            factory: Rc::new(factory),
            spawner: Rc::new(spawner),
            host: HostStdio::inherit(),
            filesystem: None,
            pids: Rc::new(RefCell::new(PidPool::new(config.pid_policy, config.pid_max))),
            config,
        }
    }

    /// Streams that "inherit" resolves to
    pub fn with_host_stdio(mut self, host: HostStdio) -> Self {
        self.host = host;
        self
    }

    /// Host filesystem mounted into every instance
    pub fn with_filesystem(mut self, filesystem: impl ProxyFs + 'static) -> Self {
        self.filesystem = Some(Rc::new(filesystem));
        self
    }

    /// Replaces the config. The PID pool restarts under the new policy.
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.pids = Rc::new(RefCell::new(PidPool::new(config.pid_policy, config.pid_max)));
        self.config = config;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Number of PIDs currently held
    pub fn live_pids(&self) -> usize {
        self.pids.borrow().len()
    }

    /// Spawn `command` with pre-split arguments
    pub fn spawn<S: AsRef<str>>(
        &self,
        command: &str,
        args: &[S],
        options: SpawnOptions,
    ) -> Result<ProcessHandle, SpawnError> {
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
        let resolved = validate(command, &args)?;

        let stdio = stdio::normalize(options.stdio.as_ref(), &self.host)?;
        let pid = self.pids.borrow_mut().acquire()?;
        let handle = ProcessHandle::new(pid, command, &args, stdio);

        let boot = Boot {
            factory: self.factory.clone(),
            handle: handle.clone(),
            command: resolved,
            filesystem: self.filesystem.clone(),
            mount_point: self.config.mount_point.clone(),
        };
        self.schedule(pid, boot.run())?;

        Ok(handle)
    }

    /// Tokenize `line` and spawn the result
    pub fn exec(&self, line: &str, options: SpawnOptions) -> Result<ProcessHandle, SpawnError> {
        let parsed = parser::parse(line)?;
        self.spawn(&parsed.program, &parsed.args, options)
    }

    /// Like `spawn`, but a rejected command yields a handle that reports
    /// the rejection on stderr and exits with `FAILURE_EXIT_CODE`.
    ///
    /// Stdio, PID and executor failures are still returned as errors.
    pub fn spawn_reporting<S: AsRef<str>>(
        &self,
        command: &str,
        args: &[S],
        options: SpawnOptions,
    ) -> Result<ProcessHandle, SpawnError> {
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
        match validate(command, &args) {
            Ok(_) => self.spawn(command, &args, options),
            Err(rejection) => {
                let stdio = stdio::normalize(options.stdio.as_ref(), &self.host)?;
                let pid = self.pids.borrow_mut().acquire()?;
                let handle = ProcessHandle::new(pid, command, &args, stdio);
                self.schedule(pid, emulator::report(handle.clone(), rejection.to_string()))?;
                Ok(handle)
            }
        }
    }

    /// Run `command` to completion with captured output and empty stdin
    pub async fn output<S: AsRef<str>>(
        &self,
        command: &str,
        args: &[S],
    ) -> Result<CommandResult, SpawnError> {
        let stdout = MemoryPipe::new();
        let stderr = MemoryPipe::new();
        let options = SpawnOptions::new().stdio(StdioOptions::Slots(
            InputSlot::Ignore,
            OutputSlot::Stream(stdout.output_stream()),
            OutputSlot::Stream(stderr.output_stream()),
        ));

        let handle = self.spawn(command, args, options)?;
        let exit_code = handle.wait().await;

        Ok(CommandResult {
            exit_code,
            stdout: stdout.contents(),
            stderr: stderr.contents(),
        })
    }

    /// Hand a process task to the executor, releasing its PID when it ends
    fn schedule(
        &self,
        pid: Pid,
        task: impl std::future::Future<Output = ()> + 'static,
    ) -> Result<(), SpawnError> {
        let pids = self.pids.clone();
        let release = self.config.release_pids;
        let result = self.spawner.spawn_local(async move {
            task.await;
            if release {
                pids.borrow_mut().release(pid);
            }
        });

        result.map_err(|e| {
            self.pids.borrow_mut().release(pid);
            SpawnError::Executor {
                reason: e.to_string(),
            }
        })
    }
}

/// Registry check shared by every entry point
fn validate(command: &str, args: &[String]) -> Result<Command, SpawnError> {
    if Command::is_unsupported(command) {
        return Err(SpawnError::Unsupported {
            command: command.to_string(),
        });
    }
    Command::lookup(command).ok_or_else(|| SpawnError::UnknownCommand {
        command: command.to_string(),
        args: args.to_vec(),
    })
}

/// Runs process tasks on the browser's microtask queue
#[cfg(target_arch = "wasm32")]
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSpawner;

#[cfg(target_arch = "wasm32")]
impl LocalSpawn for WebSpawner {
    fn spawn_local_obj(
        &self,
        future: futures::task::LocalFutureObj<'static, ()>,
    ) -> Result<(), futures::task::SpawnError> {
        wasm_bindgen_futures::spawn_local(future);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PidPolicy;
    use crate::image::{ImageConfig, ImageError, ImageInstance};
    use futures::executor::LocalPool;
    use std::cell::Cell;

    /// Factory that counts instantiations and exits with argc
    #[derive(Default)]
    struct CountingImage {
        instantiated: Rc<Cell<usize>>,
    }

    struct CountingInstance {
        config: ImageConfig,
    }

    impl ImageFactory for CountingImage {
        type Instance = CountingInstance;

        async fn instantiate(&self, config: ImageConfig) -> Result<CountingInstance, ImageError> {
            self.instantiated.set(self.instantiated.get() + 1);
            Ok(CountingInstance { config })
        }
    }

    impl ImageInstance for CountingInstance {
        async fn call_main(&mut self, argv: &[String]) -> Result<i32, ImageError> {
            (self.config.print)(format!("{}\n", argv.join(" ")).as_bytes());
            (self.config.print_err)(self.config.this_program.as_bytes());
            Ok(argv.len() as i32 - 1)
        }
    }

    fn runtime(
        pool: &LocalPool,
    ) -> (
        ProcessRuntime<CountingImage>,
        Rc<Cell<usize>>,
        MemoryPipe,
        MemoryPipe,
    ) {
        let factory = CountingImage::default();
        let count = factory.instantiated.clone();
        let (host, out, err) = HostStdio::captured();
        let runtime = ProcessRuntime::new(factory, pool.spawner()).with_host_stdio(host);
        (runtime, count, out, err)
    }

    #[test]
    fn test_rejections_are_synchronous() {
        let mut pool = LocalPool::new();
        let (runtime, count, _, _) = runtime(&pool);

        let err = runtime.spawn("node", &["index.js"], SpawnOptions::new()).unwrap_err();
        assert_eq!(
            err,
            SpawnError::Unsupported {
                command: "node".to_string()
            }
        );

        let err = runtime.exec("frobnicate --x y", SpawnOptions::new()).unwrap_err();
        assert_eq!(err.to_string(), "unknown command: frobnicate with args: --x,y");

        pool.run_until_stalled();
        assert_eq!(count.get(), 0);
        assert_eq!(runtime.live_pids(), 0);
    }

    #[test]
    fn test_spawn_returns_pending_handle() {
        let mut pool = LocalPool::new();
        let (runtime, count, out, _) = runtime(&pool);

        let handle = runtime.spawn("echo", &["hello"], SpawnOptions::new()).unwrap();
        assert_eq!(handle.state(), ProcessState::Pending);
        assert_eq!(count.get(), 0);
        let events = handle.events();

        pool.run_until_stalled();
        assert_eq!(handle.state(), ProcessState::Exited(1));
        assert_eq!(
            events.drain(),
            vec![ProcessEvent::Spawn, ProcessEvent::Exit(Some(1))]
        );
        assert_eq!(out.contents_str(), "echo hello\n");
        assert_eq!(runtime.live_pids(), 0);
    }

    #[test]
    fn test_exec_tokenizes() {
        let mut pool = LocalPool::new();
        let (runtime, _, out, _) = runtime(&pool);

        let handle = runtime
            .exec(r#"grep -e "two words" 'file name'"#, SpawnOptions::new())
            .unwrap();
        assert_eq!(handle.args(), &["-e", "two words", "file name"]);

        pool.run_until_stalled();
        assert_eq!(out.contents_str(), "grep -e two words file name\n");
        assert_eq!(handle.exit_code(), Some(3));
    }

    #[test]
    fn test_live_pids_unique() {
        let mut pool = LocalPool::new();
        let (runtime, _, _, _) = runtime(&pool);

        let handles: Vec<ProcessHandle> = (0..20)
            .map(|_| runtime.spawn("true", &[] as &[&str], SpawnOptions::new()).unwrap())
            .collect();
        let mut pids: Vec<u32> = handles.iter().map(|h| h.pid().0).collect();
        pids.sort_unstable();
        pids.dedup();
        assert_eq!(pids.len(), 20);
        assert_eq!(runtime.live_pids(), 20);

        pool.run_until_stalled();
        assert_eq!(runtime.live_pids(), 0);
    }

    #[test]
    fn test_pids_kept_when_release_disabled() {
        let mut pool = LocalPool::new();
        let (runtime, _, _, _) = runtime(&pool);
        let runtime = runtime.with_config(RuntimeConfig {
            release_pids: false,
            pid_policy: PidPolicy::LowestFree,
            ..RuntimeConfig::default()
        });

        runtime.spawn("true", &[] as &[&str], SpawnOptions::new()).unwrap();
        pool.run_until_stalled();
        assert_eq!(runtime.live_pids(), 1);
    }

    #[test]
    fn test_spawn_reporting_stand_in() {
        let mut pool = LocalPool::new();
        let (runtime, count, _, err) = runtime(&pool);

        let handle = runtime
            .spawn_reporting("frobnicate", &["a"], SpawnOptions::new())
            .unwrap();
        pool.run_until_stalled();

        assert_eq!(handle.exit_code(), Some(FAILURE_EXIT_CODE));
        assert_eq!(
            handle.history(),
            vec![ProcessEvent::Spawn, ProcessEvent::Exit(Some(1))]
        );
        assert_eq!(err.contents_str(), "unknown command: frobnicate with args: a\n");
        assert_eq!(count.get(), 0);
        assert_eq!(runtime.live_pids(), 0);
    }

    #[test]
    fn test_output_collects_streams() {
        let mut pool = LocalPool::new();
        let (runtime, _, host_out, _) = runtime(&pool);

        let result = pool.run_until(runtime.output("zip", &["-r", "out.zip", "."])).unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout_str(), "zip -r out.zip .\n");
        assert_eq!(result.stderr_str(), "nanozip");
        assert!(host_out.contents().is_empty());
    }

    #[test]
    fn test_bad_stdio_rejected_before_pid() {
        let pool = LocalPool::new();
        let (runtime, _, _, _) = runtime(&pool);

        let options = SpawnOptions::new().stdio(StdioOptions::Slots(
            InputSlot::Inherit,
            OutputSlot::Fd(0),
            OutputSlot::Inherit,
        ));
        let err = runtime.spawn("cat", &[] as &[&str], options).unwrap_err();
        assert!(matches!(err, SpawnError::Stdio(_)));
        assert_eq!(runtime.live_pids(), 0);
    }
}
