//! Host resource sampling and temp-dir housekeeping

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, SystemTime};
use sysinfo::{Disks, System};

/// One resource sample; `None` where the value could not be read
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    /// Fullest mounted disk
    pub disk_percent: Option<f64>,
}

/// Keeps one `System` around so CPU usage is measured between samples.
///
/// The first CPU reading after construction is not meaningful and is
/// reported as `None`. Blocking.
pub struct ResourceSampler {
    system: Mutex<System>,
    primed: Mutex<bool>,
}

impl ResourceSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
            primed: Mutex::new(false),
        }
    }

    pub fn sample(&self) -> ResourceUsage {
        let (cpu_percent, memory_percent) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();

            let mut primed = self.primed.lock();
            let cpu = if *primed {
                Some(f64::from(system.global_cpu_usage()))
            } else {
                *primed = true;
                None
            };

            let total = system.total_memory();
            let memory = (total > 0).then(|| system.used_memory() as f64 / total as f64 * 100.0);
            (cpu, memory)
        };

        ResourceUsage {
            cpu_percent,
            memory_percent,
            disk_percent: fullest_disk_percent(),
        }
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn fullest_disk_percent() -> Option<f64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| disk.total_space() > 0)
        .map(|disk| {
            let used = disk.total_space().saturating_sub(disk.available_space());
            used as f64 / disk.total_space() as f64 * 100.0
        })
        .reduce(f64::max)
}

/// Remove regular files in `dir` last modified at least `retention` ago
///
/// Returns the number of files removed. A missing directory prunes nothing.
/// Blocking.
pub fn prune_stale_files(dir: &Path, retention: Duration) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(error) => {
            tracing::warn!(dir = %dir.display(), %error, "Cannot list temp directory");
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < retention {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(error) => {
                tracing::debug!(path = %entry.path().display(), %error, "Failed to remove stale file");
            }
        }
    }
    removed
}
