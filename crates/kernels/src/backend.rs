//! Contracts for the external compiler, device launcher and reference evaluator.

use crate::config::{AttributeSet, OperatorDesc, Tensor};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type DeviceId = u32;

/// Handle to a compiled kernel. `artifact` is whatever the compiler hands back
/// (a module path, a cache key) and is only meaningful to the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelModule {
    pub op_name: String,
    pub artifact: String,
}

impl KernelModule {
    pub fn new(op_name: impl Into<String>, artifact: impl Into<String>) -> Self {
        Self {
            op_name: op_name.into(),
            artifact: artifact.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchOutput {
    pub outputs: Vec<Tensor>,
    /// Achieved timing statistic reported by the device.
    pub run_time: f64,
}

pub trait KernelCompiler: Send + Sync {
    /// Build `op`. `attrs` is `None` when the compiler should pick its own tiling.
    fn compile(&self, op: &OperatorDesc, attrs: Option<&AttributeSet>) -> Result<KernelModule>;
}

pub trait DeviceLauncher: Send + Sync {
    /// Run `module` on `device` with timing enabled.
    fn launch(
        &self,
        module: &KernelModule,
        inputs: &[Tensor],
        output_indices: Option<&[usize]>,
        device: DeviceId,
    ) -> Result<LaunchOutput>;
}

pub trait ReferenceEvaluator: Send + Sync {
    fn evaluate(&self, op: &OperatorDesc, inputs: &[Tensor]) -> Result<Vec<Tensor>>;
}

pub type DynKernelCompiler = Arc<dyn KernelCompiler>;
pub type DynDeviceLauncher = Arc<dyn DeviceLauncher>;

/// Compiler and launcher pair used by one executor.
#[derive(Clone)]
pub struct Toolchain {
    pub compiler: DynKernelCompiler,
    pub launcher: DynDeviceLauncher,
}

impl Toolchain {
    pub fn new<C, L>(compiler: C, launcher: L) -> Self
    where
        C: KernelCompiler + 'static,
        L: DeviceLauncher + 'static,
    {
        Self {
            compiler: Arc::new(compiler),
            launcher: Arc::new(launcher),
        }
    }
}
