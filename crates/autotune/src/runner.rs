//! Batch orchestration: fan configurations out to isolated units, bound each
//! by the per-unit timeout and collect one score per configuration.

use crate::cleanup::{purge_profiling, purge_stale_jobs};
use crate::config::RunnerConfig;
use crate::isolation::{Isolation, ThreadUnitContext, Unit};
use crate::results::{ResultsFile, ResultsVector, ScoreSlots};
use crate::score::Score;
use crate::space::Configuration;
use crate::worker::{BatchJob, WorkerArgs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tilesmith_kernels::config::TuningTask;
use tracing::{debug, info};

static BATCH_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to start runner runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("failed to prepare batch job in {}: {source}", dir.display())]
    Job {
        dir: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to collect batch results: {0}")]
    Results(#[source] anyhow::Error),
}

/// Compiles and executes batches of configurations of one operator.
pub struct KernelRunner {
    task: Arc<TuningTask>,
    config: RunnerConfig,
    isolation: Isolation,
    run_kernel_time: Duration,
}

impl KernelRunner {
    pub fn new(task: TuningTask, config: RunnerConfig, isolation: Isolation) -> Self {
        Self {
            task: Arc::new(task),
            config,
            isolation,
            run_kernel_time: Duration::ZERO,
        }
    }

    pub fn task(&self) -> &TuningTask {
        &self.task
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Wall time spent in [`KernelRunner::run`] across all batches.
    pub fn run_kernel_time(&self) -> Duration {
        self.run_kernel_time
    }

    /// Score every configuration; slot `i` of the result belongs to `configs[i]`.
    ///
    /// `best_time` is the best score the search has seen so far; only faster
    /// repetitions are checked against the reference. Errors are reserved for
    /// the runner's own setup; unit failures come back as sentinel scores.
    pub fn run(
        &mut self,
        configs: &[Configuration],
        best_time: f64,
        use_auto_tiling: bool,
    ) -> Result<Vec<Score>, RunnerError> {
        if configs.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        debug!(
            kernels = configs.len(),
            shapes = ?self.task.input_shapes(),
            "running kernel batch"
        );
        purge_stale_jobs(&self.config.job_dir);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(RunnerError::Runtime)?;
        let outcome = runtime.block_on(self.run_batch(configs, best_time, use_auto_tiling));
        // Abandoned thread units must not hold up the caller.
        runtime.shutdown_background();
        let scores = outcome?;

        debug!(process_s = start.elapsed().as_secs_f64(), "batch units joined");
        purge_profiling(&self.config);

        let elapsed = start.elapsed();
        self.run_kernel_time += elapsed;
        for (config, score) in configs.iter().zip(&scores) {
            debug!(config = %config, score = %score, "KernelRunTime");
        }
        let failures = scores.iter().filter(|s| s.is_failure()).count();
        info!(
            op = %self.task.op.name,
            kernels = scores.len(),
            failures,
            elapsed_s = elapsed.as_secs_f64(),
            "kernel batch finished"
        );
        Ok(scores)
    }

    async fn run_batch(
        &self,
        configs: &[Configuration],
        best_time: f64,
        use_auto_tiling: bool,
    ) -> Result<Vec<Score>, RunnerError> {
        let (slots, mut units) = match &self.isolation {
            Isolation::Thread(toolchain) => {
                let slots: Arc<dyn ScoreSlots> =
                    Arc::new(ResultsVector::filled(configs.len(), Score::COMPILE_FAILED));
                let ctx = ThreadUnitContext {
                    task: Arc::clone(&self.task),
                    toolchain: toolchain.clone(),
                    options: Arc::new(self.config.executor_options()),
                    slots: Arc::clone(&slots),
                    best_time,
                    use_auto_tiling,
                };
                let units: Vec<Unit> = configs
                    .iter()
                    .enumerate()
                    .map(|(idx, config)| {
                        Unit::spawn_thread(&ctx, idx, config, self.config.devices.allocate(idx))
                    })
                    .collect();
                (slots, units)
            }
            Isolation::Process(isolation) => {
                let dir = self.batch_dir();
                let job_path = dir.join("job.json");
                let results_path = dir.join("results.bin");
                let job = BatchJob {
                    task: (*self.task).clone(),
                    options: self.config.executor_options(),
                    best_time: best_time.is_finite().then_some(best_time),
                    use_auto_tiling,
                    configs: configs.to_vec(),
                };
                job.save(&job_path)
                    .map_err(|source| RunnerError::Job {
                        dir: dir.clone(),
                        source,
                    })?;
                let slots: Arc<dyn ScoreSlots> = Arc::new(
                    ResultsFile::create(&results_path, configs.len(), Score::COMPILE_FAILED)
                        .map_err(|source| RunnerError::Job {
                            dir: dir.clone(),
                            source,
                        })?,
                );

                let units: Vec<Unit> = (0..configs.len())
                    .map(|idx| {
                        let device = self.config.devices.allocate(idx);
                        let worker = WorkerArgs {
                            job: job_path.clone(),
                            results: results_path.clone(),
                            index: idx,
                            device,
                        };
                        let profiling_dir = self
                            .config
                            .profiling_root
                            .join("container")
                            .join(device.to_string());
                        Unit::spawn_process(isolation, &worker, profiling_dir)
                    })
                    .collect();
                (slots, units)
            }
        };

        let timed_out = self.join_units(&mut units, configs, slots.as_ref()).await;

        let mut scores = slots.snapshot().map_err(RunnerError::Results)?;
        for idx in timed_out {
            scores[idx] = Score::TIMEOUT;
        }
        Ok(scores)
    }

    /// Join in input order. Until some unit overstays, each join waits the
    /// full timeout; afterwards remaining units are only polled, so one
    /// straggler fails the tail fast instead of stacking timeouts.
    async fn join_units(
        &self,
        units: &mut [Unit],
        configs: &[Configuration],
        slots: &dyn ScoreSlots,
    ) -> Vec<usize> {
        let mut timeout_error = false;
        let mut timed_out = Vec::new();
        for unit in units.iter_mut() {
            if !timeout_error {
                unit.join(self.config.timeout).await;
            }
            if unit.is_alive() {
                timeout_error = true;
                debug!(index = unit.index, config = %configs[unit.index], "timeout error");
                unit.terminate().await;
                if let Err(err) = slots.store(unit.index, Score::TIMEOUT) {
                    debug!(index = unit.index, error = %err, "failed to record timeout");
                }
                timed_out.push(unit.index);
            }
        }
        timed_out
    }

    fn batch_dir(&self) -> PathBuf {
        let seq = BATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        self.config
            .job_dir
            .join(format!("JOB-tune-{}-{}", std::process::id(), seq))
    }
}
