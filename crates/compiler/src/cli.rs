//! CLI wiring for the Tilesmith tuner.

use crate::pipeline::{command_toolchain, CommandEvaluator, ToolCommand};
use crate::report::BatchReport;
use crate::session::{SessionOptions, TuningSession};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tilesmith_autotune::config::{RunnerConfig, RuntimeMode};
use tilesmith_autotune::executor::Executor;
use tilesmith_autotune::isolation::{Isolation, ProcessIsolation};
use tilesmith_autotune::runner::KernelRunner;
use tilesmith_autotune::space::Configuration;
use tilesmith_autotune::worker::{run_worker, WorkerArgs};
use tilesmith_kernels::backend::{DeviceId, KernelModule, Toolchain};
use tilesmith_kernels::config::{AttrValue, OperatorDesc, TuningTask};
use tilesmith_kernels::utils::generate_task;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tilesmith", about = "Kernel tiling autotuner")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Score a batch of configurations and emit a JSON report.
    Run {
        /// Tuning task (operator, inputs, expected outputs) as JSON.
        #[arg(long)]
        task: PathBuf,
        /// Configurations to score, as a JSON array.
        #[arg(long)]
        configs: PathBuf,
        /// Override the cached best time used to gate precision checks.
        #[arg(long)]
        best_time: Option<f64>,
        #[arg(long, default_value_t = false)]
        auto_tiling: bool,
        /// Run units as threads of this process instead of child processes.
        #[arg(long, default_value_t = false)]
        threads: bool,
        #[arg(long)]
        cache: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        tools: ToolArgs,
        #[command(flatten)]
        runner: RunnerArgs,
    },
    /// Launch an already compiled module once and print its score.
    Measure {
        #[arg(long)]
        task: PathBuf,
        /// Module handle as printed by the compiler.
        #[arg(long)]
        module: String,
        #[arg(long, env = "DEVICE_ID", default_value_t = 0)]
        device: DeviceId,
        #[command(flatten)]
        tools: ToolArgs,
        #[command(flatten)]
        runner: RunnerArgs,
    },
    /// Build a tuning task from seeded inputs and a reference program.
    Generate {
        #[arg(long)]
        name: String,
        /// Operator description as JSON, handed to the compiler untouched.
        #[arg(long)]
        op: PathBuf,
        /// Input shape such as `16,32`; repeat once per input.
        #[arg(long = "shape", required = true)]
        shapes: Vec<Shape>,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long)]
        reference: PathBuf,
        #[arg(long = "reference-arg", allow_hyphen_values = true)]
        reference_args: Vec<String>,
        /// Axis identity per tiling field as a JSON array of arrays.
        #[arg(long)]
        index_table: Option<PathBuf>,
        #[arg(long)]
        output: PathBuf,
    },
    /// Score one configuration of a batch job. Spawned by `run`.
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        job: PathBuf,
        #[arg(long)]
        results: PathBuf,
        #[arg(long)]
        index: usize,
        #[arg(long)]
        device: DeviceId,
        #[command(flatten)]
        tools: ToolArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ToolArgs {
    /// Compiler program; receives the operator and attributes on stdin.
    #[arg(long, env = "TILESMITH_COMPILER")]
    pub compiler: PathBuf,
    #[arg(long = "compiler-arg", allow_hyphen_values = true)]
    pub compiler_args: Vec<String>,
    /// Launcher program; runs a module and reports outputs and run time.
    #[arg(long, env = "TILESMITH_LAUNCHER")]
    pub launcher: PathBuf,
    #[arg(long = "launcher-arg", allow_hyphen_values = true)]
    pub launcher_args: Vec<String>,
}

impl ToolArgs {
    pub fn toolchain(&self) -> Toolchain {
        command_toolchain(
            ToolCommand::new(&self.compiler).with_args(self.compiler_args.iter().cloned()),
            ToolCommand::new(&self.launcher).with_args(self.launcher_args.iter().cloned()),
        )
    }

    /// Flags that reproduce these tools on a worker command line.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--compiler".to_string(),
            self.compiler.display().to_string(),
            "--launcher".to_string(),
            self.launcher.display().to_string(),
        ];
        args.extend(self.compiler_args.iter().map(|a| format!("--compiler-arg={a}")));
        args.extend(self.launcher_args.iter().map(|a| format!("--launcher-arg={a}")));
        args
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunnerArgs {
    /// Devices in the pool [env: DEVICE_TOTAL_NUM, default: 1].
    #[arg(long)]
    pub device_count: Option<u32>,
    /// First device id [env: DEVICE_ID, default: 0].
    #[arg(long)]
    pub device_base: Option<DeviceId>,
    /// `gpu` or `npu` [env: RUNTIME_MODE, default: npu].
    #[arg(long)]
    pub runtime_mode: Option<RuntimeMode>,
    /// Per-unit timeout in seconds.
    #[arg(long, default_value_t = 600)]
    pub timeout_secs: u64,
    #[arg(long, default_value_t = 2)]
    pub repeat_count: usize,
    #[arg(long, default_value = "./jobs")]
    pub job_dir: PathBuf,
    #[arg(long, default_value = ".")]
    pub work_dir: PathBuf,
    /// [env: PROFILING_ROOT, default: /var/log/npu/profiling]
    #[arg(long)]
    pub profiling_root: Option<PathBuf>,
}

impl RunnerArgs {
    /// Flags override the environment captured by [`RunnerConfig::from_env`].
    pub fn to_config(&self) -> RunnerConfig {
        self.overlay(RunnerConfig::from_env())
    }

    fn overlay(&self, base: RunnerConfig) -> RunnerConfig {
        let mut config = base
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_repeat_count(self.repeat_count)
            .with_job_dir(&self.job_dir)
            .with_work_dir(&self.work_dir);
        if let Some(count) = self.device_count {
            config.devices.count = count;
        }
        if let Some(base) = self.device_base {
            config.devices.base = base;
        }
        if let Some(mode) = self.runtime_mode {
            config.runtime_mode = mode;
        }
        if let Some(root) = &self.profiling_root {
            config.profiling_root = root.clone();
        }
        config
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape(pub Vec<usize>);

impl FromStr for Shape {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .split(',')
            .map(|dim| {
                dim.trim()
                    .parse::<usize>()
                    .map_err(|err| format!("invalid dimension `{dim}`: {err}"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Shape)
    }
}

/// Accepted shapes of a configuration in the configs file: the typed form,
/// or an ordered list of `[name, value]` pairs classified by name.
#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigSpec {
    Typed(Configuration),
    Named(Vec<(String, AttrValue)>),
}

fn load_configs(path: &Path) -> Result<Vec<Configuration>> {
    let specs: Vec<ConfigSpec> = read_json(path)?;
    specs
        .into_iter()
        .map(|spec| match spec {
            ConfigSpec::Typed(config) => Ok(config),
            ConfigSpec::Named(fields) => Configuration::from_named(fields),
        })
        .collect()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let blob = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(serde_json::from_str(&blob)?)
}

fn load_task(path: &Path) -> Result<TuningTask> {
    let task: TuningTask = read_json(path)?;
    task.validate()?;
    Ok(task)
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run {
            task,
            configs,
            best_time,
            auto_tiling,
            threads,
            cache,
            output,
            tools,
            runner,
        } => {
            let task = load_task(&task)?;
            let configs = load_configs(&configs)?;
            let isolation = if threads {
                Isolation::Thread(tools.toolchain())
            } else {
                Isolation::Process(
                    ProcessIsolation::current_exe()?
                        .arg("worker")
                        .args(tools.to_args()),
                )
            };
            let runner = KernelRunner::new(task, runner.to_config(), isolation);
            let options = SessionOptions {
                cache,
                use_auto_tiling: auto_tiling,
            };
            let mut session = TuningSession::new(runner, options)?;

            let report = match best_time {
                Some(best_time) => session.run_batch_with_best_time(&configs, best_time)?,
                None => session.run_batch(&configs)?,
            };
            print_summary(&report);
            info!(
                run_kernel_s = session.run_kernel_time().as_secs_f64(),
                "tuning batch complete"
            );

            match output {
                Some(path) => report.save(&path)?,
                None => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Command::Measure {
            task,
            module,
            device,
            tools,
            runner,
        } => {
            let task = load_task(&task)?;
            let toolchain = tools.toolchain();
            let options = runner.to_config().executor_options();
            let module = KernelModule::new(&task.op.name, module);
            let score = Executor::new(&task, &toolchain, &options).measure_module(&module, device);
            println!("{score}");
        }
        Command::Generate {
            name,
            op,
            shapes,
            seed,
            reference,
            reference_args,
            index_table,
            output,
        } => {
            let op = OperatorDesc::new(name, read_json(&op)?);
            let shapes: Vec<Vec<usize>> = shapes.into_iter().map(|shape| shape.0).collect();
            let evaluator = CommandEvaluator::new(ToolCommand::new(reference).with_args(reference_args));
            let mut task = generate_task(op, &shapes, seed, &evaluator)?;
            if let Some(path) = index_table {
                task = task.with_index_table(read_json(&path)?);
            }
            task.validate()?;
            info!(op = %task.op.name, inputs = task.inputs.len(), outputs = task.expect.len(), "task generated");
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&output, serde_json::to_vec(&task)?)?;
        }
        Command::Worker {
            job,
            results,
            index,
            device,
            tools,
        } => {
            let args = WorkerArgs {
                job,
                results,
                index,
                device,
            };
            run_worker(&args, &tools.toolchain())?;
        }
    }
    Ok(())
}

fn print_summary(report: &BatchReport) {
    eprintln!(
        "op={}, kernels={}, generated_at={}",
        report.op,
        report.entries.len(),
        report.generated_at_unix_ms
    );
    for entry in &report.entries {
        eprintln!("- [{}] {}: {} ({})", entry.index, entry.config, entry.score, entry.outcome);
    }
    if let Some(best) = report.best() {
        eprintln!("best: [{}] {} = {}", best.index, best.config, best.score);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilesmith_autotune::device::DevicePool;
    use tempfile::tempdir;

    #[test]
    fn worker_command_line_parses() {
        let tools = ToolArgs {
            compiler: PathBuf::from("/opt/tc/compile"),
            compiler_args: vec!["--opt-level".to_string(), "3".to_string()],
            launcher: PathBuf::from("/opt/tc/launch"),
            launcher_args: Vec::new(),
        };
        let worker = WorkerArgs {
            job: PathBuf::from("jobs/JOB-1/job.json"),
            results: PathBuf::from("jobs/JOB-1/results.bin"),
            index: 2,
            device: 5,
        };
        let mut argv = vec!["tilesmith".to_string(), "worker".to_string()];
        argv.extend(tools.to_args());
        argv.extend(worker.to_args());

        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Command::Worker {
                index,
                device,
                tools: parsed,
                ..
            } => {
                assert_eq!(index, 2);
                assert_eq!(device, 5);
                assert_eq!(parsed.compiler_args, tools.compiler_args);
                assert_eq!(parsed.launcher, tools.launcher);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn runner_flags_build_config() {
        let cli = Cli::try_parse_from([
            "tilesmith",
            "run",
            "--task",
            "task.json",
            "--configs",
            "configs.json",
            "--compiler",
            "cc",
            "--launcher",
            "ll",
            "--device-count",
            "4",
            "--device-base",
            "2",
            "--runtime-mode",
            "gpu",
            "--timeout-secs",
            "30",
        ])
        .unwrap();
        let Command::Run { runner, .. } = cli.command else {
            panic!("expected run");
        };
        let config = runner.overlay(RunnerConfig::default().with_devices(8, 0));
        assert_eq!(config.devices.allocate(3), 5);
        assert_eq!(config.runtime_mode, RuntimeMode::Gpu);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn unset_runner_flags_keep_environment_values() {
        let cli = Cli::try_parse_from([
            "tilesmith",
            "run",
            "--task",
            "task.json",
            "--configs",
            "configs.json",
            "--compiler",
            "cc",
            "--launcher",
            "ll",
            "--device-base",
            "1",
        ])
        .unwrap();
        let Command::Run { runner, .. } = cli.command else {
            panic!("expected run");
        };
        let env = RunnerConfig::default()
            .with_devices(4, 6)
            .with_runtime_mode(RuntimeMode::Gpu)
            .with_profiling_root("/data/prof");

        let config = runner.overlay(env);

        assert_eq!(config.devices, DevicePool::new(4, 1));
        assert_eq!(config.runtime_mode, RuntimeMode::Gpu);
        assert_eq!(config.profiling_root, PathBuf::from("/data/prof"));
        assert_eq!(config.timeout, Duration::from_secs(600));
    }

    #[test]
    fn configs_file_accepts_typed_and_named_forms() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("configs.json");
        let typed = Configuration::new().tiling("tiling_0", 4).attr("target", "gpu");
        let blob = serde_json::json!([
            typed,
            [["tiling_0", 4], ["target", "gpu"]],
        ]);
        fs::write(&path, blob.to_string()).unwrap();

        let configs = load_configs(&path).unwrap();
        assert_eq!(configs, vec![typed.clone(), typed]);
    }

    #[test]
    fn shapes_parse_from_comma_lists() {
        assert_eq!("16, 32".parse::<Shape>().unwrap(), Shape(vec![16, 32]));
        assert!("16,x".parse::<Shape>().is_err());
    }

    #[test]
    fn named_tiling_must_be_integer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("configs.json");
        fs::write(&path, r#"[[["tiling_0", "big"]]]"#).unwrap();
        assert!(load_configs(&path).is_err());
    }
}
