//! External compiler and device launcher driven as child commands.
//!
//! Both tools speak JSON over stdin/stdout. The compiler receives
//! `{"op", "attrs"}` (`attrs` is `null` for automatic tiling) and prints the
//! module handle on its last stdout line. The launcher receives
//! `{"module", "inputs", "output_indices", "device_id"}` and prints
//! `{"outputs", "run_time"}`. The reference program receives `{"op", "inputs"}`
//! and prints the expected outputs as a JSON array of tensors.

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use tilesmith_kernels::backend::{
    DeviceId, DeviceLauncher, KernelCompiler, KernelModule, LaunchOutput, ReferenceEvaluator,
    Toolchain,
};
use tilesmith_kernels::config::{AttrValue, AttributeSet, OperatorDesc, Tensor};

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run the tool with `request` as JSON on stdin and return its output
    /// when it exits successfully.
    fn invoke<T: Serialize>(&self, request: &T, envs: &[(&str, String)]) -> Result<Output> {
        let payload = serde_json::to_vec(request)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("{} has no stdin", self.program.display()))?;
        // Feed stdin concurrently so a chatty tool cannot deadlock on a full pipe.
        let output = std::thread::scope(|scope| {
            let writer = scope.spawn(move || stdin.write_all(&payload));
            let output = child.wait_with_output();
            let written = writer
                .join()
                .map_err(|_| anyhow!("stdin writer panicked"))?;
            match written {
                // The tool exited without draining stdin; its status decides.
                Err(err) if err.kind() == ErrorKind::BrokenPipe => {}
                other => other.context("failed to write request")?,
            }
            output.context("failed to wait for tool")
        })?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr_tail(&output.stderr)
            );
        }
        Ok(output)
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[derive(Serialize)]
struct CompileRequest<'a> {
    op: &'a OperatorDesc,
    attrs: Option<BTreeMap<String, AttrValue>>,
}

#[derive(Debug, Clone)]
pub struct CommandCompiler {
    command: ToolCommand,
}

impl CommandCompiler {
    pub fn new(command: ToolCommand) -> Self {
        Self { command }
    }
}

impl KernelCompiler for CommandCompiler {
    fn compile(&self, op: &OperatorDesc, attrs: Option<&AttributeSet>) -> Result<KernelModule> {
        let request = CompileRequest {
            op,
            attrs: attrs.map(AttributeSet::to_compiler_attrs),
        };
        let output = self.command.invoke(&request, &[])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let artifact = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .ok_or_else(|| anyhow!("compiler produced no module for `{}`", op.name))?;
        Ok(KernelModule::new(&op.name, artifact))
    }
}

#[derive(Serialize)]
struct LaunchRequest<'a> {
    module: &'a KernelModule,
    inputs: &'a [Tensor],
    output_indices: Option<&'a [usize]>,
    device_id: DeviceId,
}

#[derive(Debug, Clone)]
pub struct CommandLauncher {
    command: ToolCommand,
}

impl CommandLauncher {
    pub fn new(command: ToolCommand) -> Self {
        Self { command }
    }
}

impl DeviceLauncher for CommandLauncher {
    fn launch(
        &self,
        module: &KernelModule,
        inputs: &[Tensor],
        output_indices: Option<&[usize]>,
        device: DeviceId,
    ) -> Result<LaunchOutput> {
        let request = LaunchRequest {
            module,
            inputs,
            output_indices,
            device_id: device,
        };
        let output = self
            .command
            .invoke(&request, &[("DEVICE_ID", device.to_string())])?;
        let launched: LaunchOutput = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("malformed launcher output for `{}`", module.op_name))?;
        Ok(launched)
    }
}

#[derive(Serialize)]
struct EvaluateRequest<'a> {
    op: &'a OperatorDesc,
    inputs: &'a [Tensor],
}

#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    command: ToolCommand,
}

impl CommandEvaluator {
    pub fn new(command: ToolCommand) -> Self {
        Self { command }
    }
}

impl ReferenceEvaluator for CommandEvaluator {
    fn evaluate(&self, op: &OperatorDesc, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let output = self.command.invoke(&EvaluateRequest { op, inputs }, &[])?;
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("malformed reference output for `{}`", op.name))
    }
}

pub fn command_toolchain(compiler: ToolCommand, launcher: ToolCommand) -> Toolchain {
    Toolchain::new(CommandCompiler::new(compiler), CommandLauncher::new(launcher))
}
