//! Runner configuration captured once from the environment.

use crate::device::DevicePool;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tilesmith_kernels::backend::DeviceId;
use tilesmith_kernels::utils::Tolerance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    Gpu,
    #[default]
    Npu,
}

impl FromStr for RuntimeMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gpu" | "cuda" => Ok(RuntimeMode::Gpu),
            "npu" | "ascend" => Ok(RuntimeMode::Npu),
            other => Err(format!("unknown runtime mode `{other}`")),
        }
    }
}

/// Settings the executor itself needs; travels to worker processes in the
/// batch job file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorOptions {
    pub repeat_count: usize,
    pub runtime_mode: RuntimeMode,
    pub tolerance: Tolerance,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            repeat_count: 2,
            runtime_mode: RuntimeMode::default(),
            tolerance: Tolerance::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub devices: DevicePool,
    pub runtime_mode: RuntimeMode,
    /// Per-unit wall-clock budget.
    pub timeout: Duration,
    pub repeat_count: usize,
    pub tolerance: Tolerance,
    /// Scratch directory; stale `JOB*` entries are purged before each batch.
    pub job_dir: PathBuf,
    /// Directory scanned for `cuda_meta_*` leftovers in GPU mode.
    pub work_dir: PathBuf,
    /// Device profiling logs, purged per device in NPU mode.
    pub profiling_root: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            devices: DevicePool::default(),
            runtime_mode: RuntimeMode::default(),
            timeout: Duration::from_secs(600),
            repeat_count: 2,
            tolerance: Tolerance::default(),
            job_dir: PathBuf::from("./jobs"),
            work_dir: PathBuf::from("."),
            profiling_root: PathBuf::from("/var/log/npu/profiling"),
        }
    }
}

impl RunnerConfig {
    /// Read `DEVICE_TOTAL_NUM`, `DEVICE_ID`, `RUNTIME_MODE` and
    /// `PROFILING_ROOT`; unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Same as [`RunnerConfig::from_env`] with variables read from `lookup`.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(count) = parse_var::<u32>(&lookup, "DEVICE_TOTAL_NUM") {
            config.devices.count = count;
        }
        if let Some(base) = parse_var::<DeviceId>(&lookup, "DEVICE_ID") {
            config.devices.base = base;
        }
        if let Some(mode) = parse_var::<RuntimeMode>(&lookup, "RUNTIME_MODE") {
            config.runtime_mode = mode;
        }
        if let Some(root) = lookup("PROFILING_ROOT") {
            config.profiling_root = PathBuf::from(root);
        }
        config
    }

    pub fn with_devices(mut self, count: u32, base: DeviceId) -> Self {
        self.devices = DevicePool::new(count, base);
        self
    }

    pub fn with_runtime_mode(mut self, mode: RuntimeMode) -> Self {
        self.runtime_mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_repeat_count(mut self, repeat_count: usize) -> Self {
        self.repeat_count = repeat_count;
        self
    }

    pub fn with_job_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.job_dir = dir.into();
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_profiling_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.profiling_root = dir.into();
        self
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            repeat_count: self.repeat_count,
            runtime_mode: self.runtime_mode,
            tolerance: self.tolerance,
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}
