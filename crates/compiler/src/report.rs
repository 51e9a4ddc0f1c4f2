//! Per-batch JSON report.
//!
//! One entry per configuration, in input order, carrying the raw score and
//! a readable outcome so reports can be compared across tuning rounds.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tilesmith_autotune::score::Score;
use tilesmith_autotune::space::Configuration;

pub const MEASURED: &str = "measured";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub index: usize,
    pub config: Configuration,
    pub score: Score,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub op: String,
    pub generated_at_unix_ms: u128,
    /// Best time the batch was gated against, if any.
    pub best_time: Option<f64>,
    pub entries: Vec<ReportEntry>,
}

impl BatchReport {
    pub fn new(op: impl Into<String>, best_time: f64, configs: &[Configuration], scores: &[Score]) -> Self {
        let entries = configs
            .iter()
            .zip(scores)
            .enumerate()
            .map(|(index, (config, score))| ReportEntry {
                index,
                config: config.clone(),
                score: *score,
                outcome: score
                    .failure()
                    .map(|failure| failure.name())
                    .unwrap_or(MEASURED)
                    .to_string(),
            })
            .collect();

        let generated_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_millis();

        Self {
            op: op.into(),
            generated_at_unix_ms,
            best_time: best_time.is_finite().then_some(best_time),
            entries,
        }
    }

    pub fn scores(&self) -> Vec<Score> {
        self.entries.iter().map(|entry| entry.score).collect()
    }

    /// Fastest real measurement of the batch.
    pub fn best(&self) -> Option<&ReportEntry> {
        self.entries
            .iter()
            .filter(|entry| !entry.score.is_failure())
            .min_by(|a, b| a.score.value().total_cmp(&b.score.value()))
    }

    /// Number of entries per outcome name.
    pub fn outcome_counts(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.outcome.as_str()).or_insert(0) += 1;
        }
        counts
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write report {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let blob = fs::read_to_string(path)
            .with_context(|| format!("failed to read report {}", path.display()))?;
        Ok(serde_json::from_str(&blob)?)
    }
}
