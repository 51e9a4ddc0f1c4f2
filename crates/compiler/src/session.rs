//! Tuning session: one runner plus the best-config cache that gates it.

use crate::report::BatchReport;
use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tilesmith_autotune::cache::{TuneCache, TuneRecord};
use tilesmith_autotune::runner::KernelRunner;
use tilesmith_autotune::space::Configuration;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Best-config cache file; the cache lives only in memory when unset.
    pub cache: Option<PathBuf>,
    pub use_auto_tiling: bool,
}

pub struct TuningSession {
    runner: KernelRunner,
    cache: TuneCache,
    options: SessionOptions,
}

impl TuningSession {
    pub fn new(runner: KernelRunner, options: SessionOptions) -> Result<Self> {
        let cache = match &options.cache {
            Some(path) => TuneCache::load_from_file(path)?,
            None => TuneCache::new(),
        };
        Ok(Self {
            runner,
            cache,
            options,
        })
    }

    pub fn op_name(&self) -> &str {
        &self.runner.task().op.name
    }

    /// Best real time recorded for this operator, or infinity.
    pub fn best_time(&self) -> f64 {
        self.cache.best_time(self.op_name())
    }

    pub fn best(&self) -> Option<&TuneRecord> {
        self.cache.get(self.op_name())
    }

    pub fn run_kernel_time(&self) -> Duration {
        self.runner.run_kernel_time()
    }

    /// Score a batch gated against the cached best time.
    pub fn run_batch(&mut self, configs: &[Configuration]) -> Result<BatchReport> {
        let best_time = self.best_time();
        self.run_batch_with_best_time(configs, best_time)
    }

    /// Score a batch against an explicit best time, then fold the result
    /// into the cache.
    pub fn run_batch_with_best_time(
        &mut self,
        configs: &[Configuration],
        best_time: f64,
    ) -> Result<BatchReport> {
        let scores = self
            .runner
            .run(configs, best_time, self.options.use_auto_tiling)?;
        let op = self.op_name().to_string();
        let report = BatchReport::new(&op, best_time, configs, &scores);

        if self.cache.update(&op, configs, &scores) {
            if let Some(record) = self.cache.get(&op) {
                info!(op = %op, config = %record.config, score = %record.score, "new best configuration");
            }
            if let Some(path) = &self.options.cache {
                self.cache.save_to_file(path)?;
            }
        }
        Ok(report)
    }
}
