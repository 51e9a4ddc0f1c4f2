//! Best-effort purging of per-batch artifacts and device profiling state.

use crate::config::{RunnerConfig, RuntimeMode};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tilesmith_kernels::backend::DeviceId;
use tracing::debug;

/// Remove every `JOB*` entry left in the job directory by a previous batch.
pub fn purge_stale_jobs(job_dir: &Path) {
    remove_matching(&job_dir.join("JOB*"));
}

/// Drop device profiling state once every unit of a batch is gone.
pub fn purge_profiling(config: &RunnerConfig) {
    match config.runtime_mode {
        RuntimeMode::Gpu => remove_matching(&config.work_dir.join("cuda_meta_*")),
        RuntimeMode::Npu => {
            for device in config.devices.devices() {
                if let Some(job) = latest_job_dir(&config.profiling_root, device) {
                    debug!(device, path = %job.display(), "removing profiling job");
                    remove_path(&job);
                }
            }
        }
    }
}

/// Newest profiling job directory holding a `*.log.<device>` file.
pub fn latest_job_dir(profiling_root: &Path, device: DeviceId) -> Option<PathBuf> {
    let pattern = profiling_root.join("**").join(format!("*.log.{device}"));
    let pattern = pattern.to_str()?;

    let newest = glob::glob(pattern)
        .ok()?
        .filter_map(Result::ok)
        .filter(|path| path.to_string_lossy().contains("JOB"))
        .map(|path| {
            let modified = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, path)
        })
        .max_by_key(|(modified, _)| *modified)?;

    let job_name = newest.1.parent()?.file_name()?;
    Some(profiling_root.join(job_name))
}

fn remove_matching(pattern: &Path) {
    let Some(pattern) = pattern.to_str() else {
        return;
    };
    let Ok(paths) = glob::glob(pattern) else {
        debug!(pattern, "invalid cleanup pattern");
        return;
    };
    for path in paths.filter_map(Result::ok) {
        remove_path(&path);
    }
}

fn remove_path(path: &Path) {
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(err) = removed {
        debug!(path = %path.display(), error = %err, "cleanup skipped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stale_jobs_are_removed() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("JOB123/kernel_meta")).unwrap();
        fs::write(dir.path().join("JOB9.log"), b"x").unwrap();
        fs::create_dir_all(dir.path().join("keep")).unwrap();

        purge_stale_jobs(dir.path());

        assert!(!dir.path().join("JOB123").exists());
        assert!(!dir.path().join("JOB9.log").exists());
        assert!(dir.path().join("keep").exists());
    }

    #[test]
    fn missing_job_dir_is_ignored() {
        let dir = tempdir().unwrap();
        purge_stale_jobs(&dir.path().join("absent"));
    }

    #[test]
    fn gpu_mode_removes_cuda_meta() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("cuda_meta_4242")).unwrap();
        fs::write(dir.path().join("other.txt"), b"x").unwrap();

        let config = RunnerConfig::default()
            .with_runtime_mode(RuntimeMode::Gpu)
            .with_work_dir(dir.path());
        purge_profiling(&config);

        assert!(!dir.path().join("cuda_meta_4242").exists());
        assert!(dir.path().join("other.txt").exists());
    }

    #[test]
    fn npu_mode_removes_latest_job_per_device() {
        let root = tempdir().unwrap();
        let job_a = root.path().join("JOBA");
        let job_b = root.path().join("JOBB");
        fs::create_dir_all(&job_a).unwrap();
        fs::create_dir_all(&job_b).unwrap();
        fs::write(job_a.join("trace.log.0"), b"x").unwrap();
        fs::write(job_b.join("trace.log.1"), b"x").unwrap();
        fs::create_dir_all(root.path().join("other")).unwrap();
        fs::write(root.path().join("other/trace.log.0"), b"x").unwrap();

        assert_eq!(latest_job_dir(root.path(), 0), Some(job_a.clone()));

        let config = RunnerConfig::default()
            .with_devices(1, 0)
            .with_profiling_root(root.path());
        purge_profiling(&config);

        assert!(!job_a.exists());
        assert!(job_b.exists());
        assert!(root.path().join("other").exists());
    }
}
