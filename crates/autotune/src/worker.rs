//! Worker side of process isolation.
//!
//! The orchestrator writes one [`BatchJob`] per batch; each worker process
//! loads it, scores the configuration at its index and writes the score into
//! the shared results file.

use crate::config::ExecutorOptions;
use crate::executor::{Executor, UnitRequest};
use crate::results::ResultsFile;
use crate::space::Configuration;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tilesmith_kernels::backend::{DeviceId, Toolchain};
use tilesmith_kernels::config::TuningTask;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub task: TuningTask,
    pub options: ExecutorOptions,
    /// `None` means no previous best, i.e. every repetition is checked.
    pub best_time: Option<f64>,
    pub use_auto_tiling: bool,
    pub configs: Vec<Configuration>,
}

impl BatchJob {
    pub fn best_time(&self) -> f64 {
        self.best_time.unwrap_or(f64::INFINITY)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let blob = serde_json::to_vec(self)?;
        fs::write(path, blob)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("failed to read batch job {}", path.display()))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Where one worker process finds its inputs.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub job: PathBuf,
    pub results: PathBuf,
    pub index: usize,
    pub device: DeviceId,
}

impl WorkerArgs {
    /// Command-line form appended to the worker program's own arguments.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--job".to_string(),
            self.job.display().to_string(),
            "--results".to_string(),
            self.results.display().to_string(),
            "--index".to_string(),
            self.index.to_string(),
            "--device".to_string(),
            self.device.to_string(),
        ]
    }
}

pub fn run_worker(args: &WorkerArgs, toolchain: &Toolchain) -> Result<()> {
    let job = BatchJob::load(&args.job)?;
    let results = ResultsFile::open(&args.results)?;
    let config = job.configs.get(args.index).ok_or_else(|| {
        anyhow!(
            "worker index {} out of range for batch of {}",
            args.index,
            job.configs.len()
        )
    })?;

    let request = UnitRequest {
        index: args.index,
        config,
        device: args.device,
        best_time: job.best_time(),
        use_auto_tiling: job.use_auto_tiling,
    };
    Executor::new(&job.task, toolchain, &job.options).execute(&request, &results);
    Ok(())
}
