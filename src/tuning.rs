//! Auto-tuning module
//!
//! Picks a snapshot worker count when `initialization.parallel_workers = 0`.
//! Half the cores go to workers; PostgreSQL does the actual COPY work on
//! both ends and keeps the rest. Small machines are further capped so the
//! chunks held in flight stay within a tenth of RAM.

use sysinfo::System;

use crate::config::MAX_PARALLEL_WORKERS;

/// Chunk size assumed when sizing workers against memory
const CHUNK_ESTIMATE_MB: u64 = 8;

/// Tuned values based on hardware detection
#[derive(Debug, Clone)]
pub struct TunedConfig {
    /// Snapshot workers (shared by streaming and loading)
    pub parallel_workers: usize,
    /// Detected CPU cores
    pub detected_cores: usize,
    /// Detected RAM in MB
    pub detected_ram_mb: u64,
}

impl Default for TunedConfig {
    fn default() -> Self {
        Self {
            parallel_workers: 4,
            detected_cores: 4,
            detected_ram_mb: 8192,
        }
    }
}

/// Detect the number of available CPU cores
pub fn detect_cpu_cores() -> usize {
    let sys = System::new_all();
    sys.cpus().len().max(1)
}

/// Detect total RAM in megabytes
pub fn detect_ram_mb() -> u64 {
    let sys = System::new_all();
    sys.total_memory() / 1024 / 1024
}

/// Workers for a machine with `cores` CPUs and `ram_mb` of memory, 1..=16.
///
/// A worker holds up to one raw and one compressed chunk at a time.
pub fn recommended_workers(cores: usize, ram_mb: u64) -> usize {
    let by_memory = (ram_mb / 10 / (2 * CHUNK_ESTIMATE_MB)) as usize;
    (cores / 2).min(by_memory).clamp(1, MAX_PARALLEL_WORKERS)
}

/// Auto-tune based on detected hardware
pub fn auto_tune() -> TunedConfig {
    let cores = detect_cpu_cores();
    let ram_mb = detect_ram_mb();

    let config = TunedConfig {
        parallel_workers: recommended_workers(cores, ram_mb),
        detected_cores: cores,
        detected_ram_mb: ram_mb,
    };

    tracing::info!(
        cores = cores,
        ram_mb = ram_mb,
        parallel_workers = config.parallel_workers,
        "Auto-tuned snapshot workers based on hardware"
    );

    config
}

/// Get a human-readable summary of the tuned configuration
pub fn tuning_summary(config: &TunedConfig) -> String {
    format!(
        "Detected: {} cores, {} MB RAM\nSnapshot: {} parallel workers",
        config.detected_cores, config.detected_ram_mb, config.parallel_workers,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommended_workers_bounds() {
        assert_eq!(recommended_workers(1, 8192), 1);
        assert_eq!(recommended_workers(2, 8192), 1);
        assert_eq!(recommended_workers(8, 8192), 4);
        assert_eq!(recommended_workers(64, 65536), 16);
    }

    #[test]
    fn test_small_memory_caps_workers() {
        // 512 MB leaves room for 3 workers' chunks
        assert_eq!(recommended_workers(16, 512), 3);
        assert_eq!(recommended_workers(16, 64), 1);
    }

    #[test]
    fn test_auto_tune_within_limits() {
        let config = auto_tune();
        assert!(config.parallel_workers >= 1);
        assert!(config.parallel_workers <= MAX_PARALLEL_WORKERS);
        assert!(config.detected_cores >= 1);
        assert!(tuning_summary(&config).contains("parallel workers"));
    }
}
