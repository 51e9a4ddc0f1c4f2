//! Best configuration found so far, per operator.

use crate::score::Score;
use crate::space::Configuration;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneRecord {
    pub config: Configuration,
    pub score: Score,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TuneCache {
    best: HashMap<String, TuneRecord>,
}

impl TuneCache {
    pub fn new() -> Self {
        Self {
            best: HashMap::new(),
        }
    }

    pub fn get(&self, op_name: &str) -> Option<&TuneRecord> {
        self.best.get(op_name)
    }

    /// Best known real time for `op_name`, or infinity when nothing has
    /// succeeded yet.
    pub fn best_time(&self, op_name: &str) -> f64 {
        self.get(op_name)
            .map(|record| record.score.value())
            .unwrap_or(f64::INFINITY)
    }

    /// Keep the fastest measured configuration of a batch if it beats the
    /// cached one. Sentinel scores are never cached.
    pub fn update(&mut self, op_name: &str, configs: &[Configuration], scores: &[Score]) -> bool {
        let Some((config, score)) = configs
            .iter()
            .zip(scores)
            .filter(|(_, score)| !score.is_failure())
            .min_by(|(_, a), (_, b)| a.value().total_cmp(&b.value()))
        else {
            return false;
        };

        if score.value() >= self.best_time(op_name) {
            return false;
        }
        self.best.insert(
            op_name.to_string(),
            TuneRecord {
                config: config.clone(),
                score: *score,
            },
        );
        true
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = fs::read(path)?;
        let cache = serde_json::from_slice(&data)?;
        Ok(cache)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let blob = serde_json::to_vec_pretty(self)?;
        fs::write(path, blob)?;
        Ok(())
    }
}
