//! Tuning configurations and their mapping onto compiler attributes.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tilesmith_kernels::config::{AttrValue, AttributeSet, DimDirective, DimEntry};

/// Prefix that marks a field as a tiling parameter in loosely-typed configs.
pub const TILING_PREFIX: &str = "tiling";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ConfigValue {
    /// Tile size for the axis at the same position in the index table.
    Tiling(i64),
    /// Passed through to the compiler untouched.
    Attr(AttrValue),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub name: String,
    pub value: ConfigValue,
}

/// One candidate tiling/scheduling choice, in field order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    entries: Vec<ConfigEntry>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tiling(mut self, name: impl Into<String>, tile: i64) -> Self {
        self.entries.push(ConfigEntry {
            name: name.into(),
            value: ConfigValue::Tiling(tile),
        });
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.entries.push(ConfigEntry {
            name: name.into(),
            value: ConfigValue::Attr(value.into()),
        });
        self
    }

    /// Classify an ordered `name -> value` list produced by a search-space
    /// generator: integer fields named `tiling*` become tiling entries.
    pub fn from_named<I, K>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, AttrValue)>,
        K: Into<String>,
    {
        let mut config = Self::new();
        for (name, value) in fields {
            let name = name.into();
            config = if name.starts_with(TILING_PREFIX) {
                match value {
                    AttrValue::Int(tile) => config.tiling(name, tile),
                    other => bail!("tiling field `{name}` must be an integer, got `{other}`"),
                }
            } else {
                config.attr(name, value)
            };
        }
        Ok(config)
    }

    pub fn entries(&self) -> &[ConfigEntry] {
        &self.entries
    }

    pub fn tilings(&self) -> impl Iterator<Item = (&str, i64)> {
        self.entries.iter().filter_map(|entry| match entry.value {
            ConfigValue::Tiling(tile) => Some((entry.name.as_str(), tile)),
            ConfigValue::Attr(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (idx, entry) in self.entries.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            match &entry.value {
                ConfigValue::Tiling(tile) => write!(f, "{}: {}", entry.name, tile)?,
                ConfigValue::Attr(value) => write!(f, "{}: {}", entry.name, value)?,
            }
        }
        f.write_str("}")
    }
}

/// Build compiler attributes for `config`.
///
/// Tiling entries pair with `index_table` rows by position and collapse into a
/// single `dim` directive. Without tiling entries no `dim` is emitted and the
/// compiler tiles on its own.
pub fn map_attributes(config: &Configuration, index_table: &[Vec<AttrValue>]) -> Result<AttributeSet> {
    let mut attrs = AttributeSet::new();
    let mut dim = DimDirective::default();

    for entry in config.entries() {
        match &entry.value {
            ConfigValue::Tiling(tile) => {
                let position = dim.entries.len();
                let Some(axis) = index_table.get(position) else {
                    bail!(
                        "tiling field `{}` has no index table entry (table has {} rows)",
                        entry.name,
                        index_table.len()
                    );
                };
                dim.entries.push(DimEntry {
                    axis: axis.clone(),
                    tile: *tile,
                    factor: 1,
                });
            }
            ConfigValue::Attr(value) => attrs.insert(entry.name.clone(), value.clone()),
        }
    }

    if dim.is_empty() {
        tracing::debug!("no tiling info in configuration, using auto tiling");
    } else {
        attrs.dim = Some(dim);
    }
    Ok(attrs)
}
