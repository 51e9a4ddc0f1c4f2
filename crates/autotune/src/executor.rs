//! Single-configuration executor.
//!
//! Compiles one configuration, launches it `repeat_count` times and reduces
//! the repetitions to one score. Every failure is absorbed into a sentinel;
//! nothing here returns an error to the orchestrator.

use crate::config::{ExecutorOptions, RuntimeMode};
use crate::results::ScoreSlots;
use crate::score::Score;
use crate::space::{map_attributes, Configuration};
use anyhow::Result;
use std::time::Instant;
use tilesmith_kernels::backend::{DeviceId, KernelModule, Toolchain};
use tilesmith_kernels::config::TuningTask;
use tilesmith_kernels::utils::outputs_match;
use tracing::{debug, warn};

/// What one unit is asked to score.
#[derive(Debug, Clone, Copy)]
pub struct UnitRequest<'a> {
    pub index: usize,
    pub config: &'a Configuration,
    pub device: DeviceId,
    /// Repetitions slower than this skip the precision check.
    pub best_time: f64,
    /// Let the compiler choose tiling instead of mapping `config`.
    pub use_auto_tiling: bool,
}

pub struct Executor<'a> {
    task: &'a TuningTask,
    toolchain: &'a Toolchain,
    options: &'a ExecutorOptions,
}

impl<'a> Executor<'a> {
    pub fn new(task: &'a TuningTask, toolchain: &'a Toolchain, options: &'a ExecutorOptions) -> Self {
        Self {
            task,
            toolchain,
            options,
        }
    }

    /// Score `request` and publish the result into its slot.
    ///
    /// After a successful compile the slot holds `RUN_FAILED` and then the
    /// running minimum, so a unit killed mid-run still leaves a sane value.
    pub fn execute(&self, request: &UnitRequest<'_>, slots: &dyn ScoreSlots) {
        let started = Instant::now();
        let score = self.evaluate_with(request, |progress| {
            publish(slots, request.index, progress);
        });
        publish(slots, request.index, score);
        debug!(
            index = request.index,
            score = %score,
            elapsed_s = started.elapsed().as_secs_f64(),
            "end of kernel"
        );
    }

    pub fn evaluate(&self, request: &UnitRequest<'_>) -> Score {
        self.evaluate_with(request, |_| {})
    }

    /// Launch an already compiled module once and always check precision.
    /// A launch error counts as a compile failure: the module is unusable.
    pub fn measure_module(&self, module: &KernelModule, device: DeviceId) -> Score {
        match self.launch(module, device) {
            Ok((run_time, outputs_ok)) => {
                if outputs_ok {
                    Score::measured(run_time)
                } else {
                    debug!(op = %module.op_name, "precision error");
                    Score::PRECISION_ERROR
                }
            }
            Err(err) => {
                debug!(op = %module.op_name, error = %err, "module launch failed");
                Score::COMPILE_FAILED
            }
        }
    }

    fn evaluate_with(&self, request: &UnitRequest<'_>, mut progress: impl FnMut(Score)) -> Score {
        debug!(index = request.index, device = request.device, "compile kernel");
        let module = match self.compile(request) {
            Ok(module) => module,
            Err(err) => {
                debug!(
                    index = request.index,
                    config = %label(request),
                    error = %err,
                    "compile failed"
                );
                return Score::COMPILE_FAILED;
            }
        };

        let mut best = Score::RUN_FAILED;
        progress(best);
        for _ in 0..self.options.repeat_count {
            let score = self.run_once(&module, request);
            best = best.min(score);
            progress(best);
        }
        best
    }

    fn compile(&self, request: &UnitRequest<'_>) -> Result<KernelModule> {
        let started = Instant::now();
        let module = if request.use_auto_tiling {
            self.toolchain.compiler.compile(&self.task.op, None)?
        } else {
            let mut attrs = map_attributes(request.config, &self.task.index_table)?;
            if self.options.runtime_mode == RuntimeMode::Gpu {
                attrs.insert("target", "cuda");
            }
            self.toolchain.compiler.compile(&self.task.op, Some(&attrs))?
        };
        debug!(
            index = request.index,
            build_s = started.elapsed().as_secs_f64(),
            "finished compile"
        );
        Ok(module)
    }

    fn run_once(&self, module: &KernelModule, request: &UnitRequest<'_>) -> Score {
        let started = Instant::now();
        let launched = self.toolchain.launcher.launch(
            module,
            &self.task.inputs,
            self.task.output_indices.as_deref(),
            request.device,
        );
        let score = match launched {
            Ok(output) => {
                // Only competitive timings pay for the comparison.
                if output.run_time < request.best_time
                    && !outputs_match(&output.outputs, &self.task.expect, &self.options.tolerance)
                {
                    debug!(config = %label(request), "precision error");
                    Score::PRECISION_ERROR
                } else {
                    Score::measured(output.run_time)
                }
            }
            Err(err) => {
                debug!(config = %label(request), error = %err, "run failed");
                Score::RUN_FAILED
            }
        };
        debug!(
            index = request.index,
            launch_s = started.elapsed().as_secs_f64(),
            "mod launch"
        );
        score
    }

    fn launch(&self, module: &KernelModule, device: DeviceId) -> Result<(f64, bool)> {
        let output = self.toolchain.launcher.launch(
            module,
            &self.task.inputs,
            self.task.output_indices.as_deref(),
            device,
        )?;
        let ok = outputs_match(&output.outputs, &self.task.expect, &self.options.tolerance);
        Ok((output.run_time, ok))
    }
}

fn publish(slots: &dyn ScoreSlots, index: usize, score: Score) {
    if let Err(err) = slots.store(index, score) {
        warn!(index, error = %err, "failed to publish score");
    }
}

fn label(request: &UnitRequest<'_>) -> String {
    if request.use_auto_tiling {
        "auto".to_string()
    } else {
        request.config.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::ResultsVector;
    use anyhow::bail;
    use ndarray::{ArrayD, IxDyn};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tilesmith_kernels::backend::{DeviceLauncher, KernelCompiler, LaunchOutput};
    use tilesmith_kernels::config::{AttrValue, AttributeSet, OperatorDesc, Tensor};

    fn ones() -> Tensor {
        ArrayD::from_elem(IxDyn(&[4]), 1.0)
    }

    fn task() -> TuningTask {
        TuningTask::new(
            OperatorDesc::new("add", serde_json::json!({ "op": "Add" })),
            vec![ones(), ones()],
            vec![ones()],
        )
        .with_index_table(vec![vec![AttrValue::Int(0)]])
    }

    #[derive(Default)]
    struct RecordingCompiler {
        fail: bool,
        seen: Mutex<Vec<Option<AttributeSet>>>,
    }

    impl KernelCompiler for RecordingCompiler {
        fn compile(&self, op: &OperatorDesc, attrs: Option<&AttributeSet>) -> Result<KernelModule> {
            self.seen.lock().unwrap().push(attrs.cloned());
            if self.fail {
                bail!("polyhedral scheduling failed");
            }
            Ok(KernelModule::new(&op.name, "add.so"))
        }
    }

    /// Replays one scripted result per launch.
    struct ScriptedLauncher {
        script: Vec<Option<(f64, f32)>>,
        calls: AtomicUsize,
    }

    impl ScriptedLauncher {
        fn new(script: Vec<Option<(f64, f32)>>) -> Self {
            Self {
                script,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl DeviceLauncher for ScriptedLauncher {
        fn launch(
            &self,
            _module: &KernelModule,
            _inputs: &[Tensor],
            _output_indices: Option<&[usize]>,
            _device: DeviceId,
        ) -> Result<LaunchOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script[call % self.script.len()] {
                Some((run_time, value)) => Ok(LaunchOutput {
                    outputs: vec![ArrayD::from_elem(IxDyn(&[4]), value)],
                    run_time,
                }),
                None => bail!("device lost"),
            }
        }
    }

    fn run(
        compiler: RecordingCompiler,
        script: Vec<Option<(f64, f32)>>,
        options: ExecutorOptions,
        best_time: f64,
    ) -> (Score, Toolchain) {
        let task = task();
        let toolchain = Toolchain::new(compiler, ScriptedLauncher::new(script));
        let config = Configuration::new().tiling("tiling_0", 16);
        let request = UnitRequest {
            index: 0,
            config: &config,
            device: 0,
            best_time,
            use_auto_tiling: false,
        };
        let score = Executor::new(&task, &toolchain, &options).evaluate(&request);
        (score, toolchain)
    }

    #[test]
    fn compile_failure_skips_launch() {
        let compiler = RecordingCompiler {
            fail: true,
            ..Default::default()
        };
        let (score, _) = run(compiler, vec![Some((1.0, 1.0))], ExecutorOptions::default(), f64::INFINITY);
        assert_eq!(score, Score::COMPILE_FAILED);
    }

    #[test]
    fn best_repetition_wins() {
        let script = vec![Some((20.0, 1.0)), Some((12.3, 1.0))];
        let (score, _) = run(RecordingCompiler::default(), script, ExecutorOptions::default(), f64::INFINITY);
        assert_eq!(score, Score::measured(12.3));
    }

    #[test]
    fn launch_failure_is_run_failed() {
        let (score, _) = run(RecordingCompiler::default(), vec![None], ExecutorOptions::default(), f64::INFINITY);
        assert_eq!(score, Score::RUN_FAILED);
    }

    #[test]
    fn one_good_repetition_beats_failures() {
        let script = vec![None, Some((7.0, 1.0))];
        let (score, _) = run(RecordingCompiler::default(), script, ExecutorOptions::default(), f64::INFINITY);
        assert_eq!(score, Score::measured(7.0));
    }

    #[test]
    fn wrong_output_with_fast_time_is_precision_error() {
        let (score, _) = run(
            RecordingCompiler::default(),
            vec![Some((0.5, 1.5))],
            ExecutorOptions::default(),
            f64::INFINITY,
        );
        assert_eq!(score, Score::PRECISION_ERROR);
    }

    #[test]
    fn slow_repetitions_skip_precision_check() {
        let (score, _) = run(
            RecordingCompiler::default(),
            vec![Some((50.0, 1.5))],
            ExecutorOptions::default(),
            10.0,
        );
        assert_eq!(score, Score::measured(50.0));
    }

    #[test]
    fn mixed_failures_report_numeric_minimum() {
        let script = vec![None, Some((0.5, 9.0))];
        let (score, _) = run(RecordingCompiler::default(), script, ExecutorOptions::default(), f64::INFINITY);
        assert_eq!(score, Score::PRECISION_ERROR);
    }

    #[test]
    fn zero_repetitions_leave_run_failed() {
        let options = ExecutorOptions {
            repeat_count: 0,
            ..ExecutorOptions::default()
        };
        let (score, _) = run(RecordingCompiler::default(), vec![Some((1.0, 1.0))], options, f64::INFINITY);
        assert_eq!(score, Score::RUN_FAILED);
    }

    #[test]
    fn gpu_mode_targets_cuda() {
        let task = task();
        let compiler = std::sync::Arc::new(RecordingCompiler::default());
        let toolchain = Toolchain {
            compiler: compiler.clone(),
            launcher: std::sync::Arc::new(ScriptedLauncher::new(vec![Some((1.0, 1.0))])),
        };
        let options = ExecutorOptions {
            runtime_mode: RuntimeMode::Gpu,
            ..ExecutorOptions::default()
        };
        let config = Configuration::new().tiling("tiling_0", 16);
        let request = UnitRequest {
            index: 0,
            config: &config,
            device: 0,
            best_time: f64::INFINITY,
            use_auto_tiling: false,
        };
        Executor::new(&task, &toolchain, &options).evaluate(&request);

        let seen = compiler.seen.lock().unwrap();
        let attrs = seen[0].as_ref().unwrap();
        assert_eq!(attrs.get("target"), Some(&AttrValue::from("cuda")));
        assert_eq!(attrs.dim.as_ref().unwrap().to_string(), "0 16 1");
    }

    #[test]
    fn auto_tiling_passes_no_attributes() {
        let task = task();
        let compiler = std::sync::Arc::new(RecordingCompiler::default());
        let toolchain = Toolchain {
            compiler: compiler.clone(),
            launcher: std::sync::Arc::new(ScriptedLauncher::new(vec![Some((1.0, 1.0))])),
        };
        let options = ExecutorOptions::default();
        // More tiling fields than index rows would fail mapping; auto tiling never maps.
        let config = Configuration::new().tiling("tiling_0", 16).tiling("tiling_1", 8);
        let request = UnitRequest {
            index: 0,
            config: &config,
            device: 0,
            best_time: f64::INFINITY,
            use_auto_tiling: true,
        };
        let score = Executor::new(&task, &toolchain, &options).evaluate(&request);
        assert_eq!(score, Score::measured(1.0));
        assert_eq!(*compiler.seen.lock().unwrap(), vec![None]);
    }

    #[test]
    fn execute_publishes_into_slot() {
        let task = task();
        let toolchain = Toolchain::new(
            RecordingCompiler::default(),
            ScriptedLauncher::new(vec![Some((3.0, 1.0))]),
        );
        let options = ExecutorOptions::default();
        let slots = ResultsVector::filled(3, Score::COMPILE_FAILED);
        let config = Configuration::new().tiling("tiling_0", 16);
        let request = UnitRequest {
            index: 2,
            config: &config,
            device: 0,
            best_time: f64::INFINITY,
            use_auto_tiling: false,
        };
        Executor::new(&task, &toolchain, &options).execute(&request, &slots);
        assert_eq!(
            slots.snapshot().unwrap(),
            vec![Score::COMPILE_FAILED, Score::COMPILE_FAILED, Score::measured(3.0)]
        );
    }

    #[test]
    fn measure_module_always_checks_precision() {
        let task = task();
        let options = ExecutorOptions::default();
        let module = KernelModule::new("add", "add.so");

        let good = Toolchain::new(RecordingCompiler::default(), ScriptedLauncher::new(vec![Some((2.0, 1.0))]));
        assert_eq!(
            Executor::new(&task, &good, &options).measure_module(&module, 0),
            Score::measured(2.0)
        );

        let bad = Toolchain::new(RecordingCompiler::default(), ScriptedLauncher::new(vec![Some((2.0, 3.0))]));
        assert_eq!(
            Executor::new(&task, &bad, &options).measure_module(&module, 0),
            Score::PRECISION_ERROR
        );

        let lost = Toolchain::new(RecordingCompiler::default(), ScriptedLauncher::new(vec![None]));
        assert_eq!(
            Executor::new(&task, &lost, &options).measure_module(&module, 0),
            Score::COMPILE_FAILED
        );
    }
}
