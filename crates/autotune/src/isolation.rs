//! Execution units: one per configuration, in a child process or a thread.

use crate::config::ExecutorOptions;
use crate::executor::{Executor, UnitRequest};
use crate::results::ScoreSlots;
use crate::space::Configuration;
use crate::worker::WorkerArgs;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tilesmith_kernels::backend::{DeviceId, Toolchain};
use tilesmith_kernels::config::TuningTask;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::warn;

/// Program re-executed once per configuration. The worker arguments of each
/// unit are appended after `args`.
#[derive(Debug, Clone)]
pub struct ProcessIsolation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessIsolation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-execute the running binary.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// How units are isolated from each other and from the orchestrator.
///
/// Processes survive a crashing or hanging compiler; threads are only safe
/// with a toolchain that cannot take the process down.
#[derive(Clone)]
pub enum Isolation {
    Process(ProcessIsolation),
    Thread(Toolchain),
}

/// Everything a thread unit needs to run the executor.
pub(crate) struct ThreadUnitContext {
    pub task: Arc<TuningTask>,
    pub toolchain: Toolchain,
    pub options: Arc<ExecutorOptions>,
    pub slots: Arc<dyn ScoreSlots>,
    pub best_time: f64,
    pub use_auto_tiling: bool,
}

enum UnitHandle {
    Process(Child),
    Thread(oneshot::Receiver<()>),
    /// Never started; its slot keeps the pre-filled value.
    NotStarted,
}

pub(crate) struct Unit {
    pub index: usize,
    handle: UnitHandle,
    finished: bool,
}

impl Unit {
    pub fn spawn_process(
        isolation: &ProcessIsolation,
        worker: &WorkerArgs,
        profiling_dir: PathBuf,
    ) -> Self {
        let mut cmd = Command::new(&isolation.program);
        cmd.args(&isolation.args)
            .args(worker.to_args())
            .env("DEVICE_ID", worker.device.to_string())
            .env("PROFILING_DIR", profiling_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        // Tools launched by the worker join its group so a timeout reaches them.
        #[cfg(unix)]
        cmd.process_group(0);

        let handle = match cmd.spawn() {
            Ok(child) => UnitHandle::Process(child),
            Err(err) => {
                warn!(
                    index = worker.index,
                    program = %isolation.program.display(),
                    error = %err,
                    "failed to spawn execution unit"
                );
                UnitHandle::NotStarted
            }
        };
        Self::new(worker.index, handle)
    }

    pub fn spawn_thread(
        ctx: &ThreadUnitContext,
        index: usize,
        config: &Configuration,
        device: DeviceId,
    ) -> Self {
        let (tx, rx) = oneshot::channel();
        let task = Arc::clone(&ctx.task);
        let toolchain = ctx.toolchain.clone();
        let options = Arc::clone(&ctx.options);
        let slots = Arc::clone(&ctx.slots);
        let config = config.clone();
        let best_time = ctx.best_time;
        let use_auto_tiling = ctx.use_auto_tiling;

        let spawned = std::thread::Builder::new()
            .name(format!("tune-unit-{index}"))
            .spawn(move || {
                let request = UnitRequest {
                    index,
                    config: &config,
                    device,
                    best_time,
                    use_auto_tiling,
                };
                Executor::new(&task, &toolchain, &options).execute(&request, slots.as_ref());
                let _ = tx.send(());
            });

        let handle = match spawned {
            Ok(_) => UnitHandle::Thread(rx),
            Err(err) => {
                warn!(index, error = %err, "failed to spawn execution thread");
                UnitHandle::NotStarted
            }
        };
        Self::new(index, handle)
    }

    fn new(index: usize, handle: UnitHandle) -> Self {
        let finished = matches!(handle, UnitHandle::NotStarted);
        Self {
            index,
            handle,
            finished,
        }
    }

    /// Wait up to `timeout` for the unit to finish.
    pub async fn join(&mut self, timeout: Duration) {
        if self.finished {
            return;
        }
        let done = match &mut self.handle {
            UnitHandle::Process(child) => tokio::time::timeout(timeout, child.wait()).await.is_ok(),
            UnitHandle::Thread(rx) => tokio::time::timeout(timeout, rx).await.is_ok(),
            UnitHandle::NotStarted => true,
        };
        self.finished = done;
    }

    pub fn is_alive(&mut self) -> bool {
        if self.finished {
            return false;
        }
        let alive = match &mut self.handle {
            UnitHandle::Process(child) => matches!(child.try_wait(), Ok(None)),
            UnitHandle::Thread(rx) => {
                matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty))
            }
            UnitHandle::NotStarted => false,
        };
        self.finished = !alive;
        alive
    }

    /// Kill a process unit together with its process group and reap it. A
    /// thread cannot be killed; it is abandoned and anything it writes later
    /// is ignored by the orchestrator.
    pub async fn terminate(&mut self) {
        if let UnitHandle::Process(child) = &mut self.handle {
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    if let Err(err) = kill_process_group(pid) {
                        warn!(index = self.index, pid, error = %err, "failed to kill process group");
                    }
                }
            }
            if let Err(err) = child.kill().await {
                warn!(index = self.index, error = %err, "failed to kill execution unit");
            }
        }
        self.finished = true;
    }
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: killpg only sends a signal; the group was created at spawn.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
