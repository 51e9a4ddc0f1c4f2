//! Operator, attribute and task structures shared across the workspace.

use anyhow::{bail, Result};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Dense tensor buffer exchanged with launchers and reference evaluators.
pub type Tensor = ArrayD<f32>;

/// Operator handed to the external compiler.
///
/// `desc` is opaque to the engine: for JSON-described fused operators it is
/// the composite graph, for single operators it holds the operator's
/// parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorDesc {
    pub name: String,
    pub desc: serde_json::Value,
}

impl OperatorDesc {
    pub fn new(name: impl Into<String>, desc: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            desc,
        }
    }
}

/// Scalar value of a compiler attribute or a non-tiling configuration field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

/// One row of a `dim` directive: axis identity, tile size and tile factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimEntry {
    pub axis: Vec<AttrValue>,
    pub tile: i64,
    pub factor: i64,
}

/// Tiling directive understood by the compiler, rendered as space separated
/// `axis.. tile factor` groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DimDirective {
    pub entries: Vec<DimEntry>,
}

impl DimDirective {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for DimDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for entry in &self.entries {
            for token in &entry.axis {
                if !first {
                    f.write_str(" ")?;
                }
                write!(f, "{token}")?;
                first = false;
            }
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{} {}", entry.tile, entry.factor)?;
            first = false;
        }
        Ok(())
    }
}

/// Compiler options built from one configuration right before compilation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeSet {
    pub dim: Option<DimDirective>,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        self.attrs.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    /// Flat option map as the compiler consumes it, with `dim` rendered.
    pub fn to_compiler_attrs(&self) -> BTreeMap<String, AttrValue> {
        let mut attrs = self.attrs.clone();
        if let Some(dim) = &self.dim {
            attrs.insert("dim".to_string(), AttrValue::Str(dim.to_string()));
        }
        attrs
    }
}

/// Everything an executor needs to score configurations of one operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningTask {
    pub op: OperatorDesc,
    pub inputs: Vec<Tensor>,
    pub expect: Vec<Tensor>,
    /// Argument positions holding outputs, for fused operators whose launch
    /// returns several tensors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_indices: Option<Vec<usize>>,
    /// Axis identity for each tiling field, by position.
    #[serde(default)]
    pub index_table: Vec<Vec<AttrValue>>,
}

impl TuningTask {
    pub fn new(op: OperatorDesc, inputs: Vec<Tensor>, expect: Vec<Tensor>) -> Self {
        Self {
            op,
            inputs,
            expect,
            output_indices: None,
            index_table: Vec::new(),
        }
    }

    pub fn with_output_indices(mut self, indices: Vec<usize>) -> Self {
        self.output_indices = Some(indices);
        self
    }

    pub fn with_index_table(mut self, table: Vec<Vec<AttrValue>>) -> Self {
        self.index_table = table;
        self
    }

    pub fn input_shapes(&self) -> Vec<Vec<usize>> {
        self.inputs.iter().map(|t| t.shape().to_vec()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.expect.is_empty() {
            bail!("task `{}` has no expected outputs", self.op.name);
        }
        if let Some(indices) = &self.output_indices {
            if indices.len() != self.expect.len() {
                bail!(
                    "task `{}` declares {} output indices but {} expected outputs",
                    self.op.name,
                    indices.len(),
                    self.expect.len()
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dim_directive_renders_groups_in_order() {
        let dim = DimDirective {
            entries: vec![
                DimEntry {
                    axis: vec![AttrValue::Int(0), AttrValue::Int(0)],
                    tile: 16,
                    factor: 1,
                },
                DimEntry {
                    axis: vec![AttrValue::Int(0), AttrValue::Int(1)],
                    tile: 32,
                    factor: 1,
                },
            ],
        };
        assert_eq!(dim.to_string(), "0 0 16 1 0 1 32 1");
    }

    #[test]
    fn compiler_attrs_include_rendered_dim() {
        let mut attrs = AttributeSet::new();
        attrs.insert("enable_atomic_add", true);
        attrs.dim = Some(DimDirective {
            entries: vec![DimEntry {
                axis: vec!["axis0".into()],
                tile: 4,
                factor: 1,
            }],
        });

        let flat = attrs.to_compiler_attrs();
        assert_eq!(flat.get("dim"), Some(&AttrValue::Str("axis0 4 1".into())));
        assert_eq!(flat.get("enable_atomic_add"), Some(&AttrValue::Bool(true)));
    }

    #[test]
    fn attr_values_deserialize_untagged() {
        let values: Vec<AttrValue> = serde_json::from_str(r#"[true, 3, 0.5, "cuda"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                AttrValue::Bool(true),
                AttrValue::Int(3),
                AttrValue::Float(0.5),
                AttrValue::Str("cuda".into())
            ]
        );
    }

    #[test]
    fn task_rejects_mismatched_output_indices() {
        let task = TuningTask::new(
            OperatorDesc::new("fused_add", serde_json::json!({})),
            vec![Tensor::zeros(vec![2])],
            vec![Tensor::zeros(vec![2])],
        )
        .with_output_indices(vec![1, 2]);
        assert!(task.validate().is_err());
    }

    #[test]
    fn input_shapes_follow_input_order() {
        let task = TuningTask::new(
            OperatorDesc::new("matmul", serde_json::json!({})),
            vec![Tensor::zeros(vec![2, 3]), Tensor::zeros(vec![3])],
            vec![Tensor::zeros(vec![2])],
        );
        assert_eq!(task.input_shapes(), vec![vec![2, 3], vec![3]]);
    }
}
