//! Empirical knobs for sizing, fault budgets and the intern table.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Hard upper bound for the port label table.
pub const PORT_LABEL_TABLE_MAX: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Extra space added on top of the raw estimate, as a percentage.
    pub estimate_slack_percent: u64,
    /// Total time a capture may spend faulting pages in.
    pub max_fault_time_us: u64,
    /// Frame budget for one backtrace.
    pub max_frames: usize,
    /// Upper bound on load info entries read per task.
    pub max_loadinfos: usize,
    /// Port label table capacity. 0 disables interning.
    pub port_label_capacity: usize,
    pub emit_intern_stats: bool,
    pub est_task_bytes: u64,
    pub est_thread_bytes: u64,
    pub est_uuid_bytes_per_task: u64,
    pub supplement_bytes: u64,
    pub min_ceiling_bytes: u64,
    pub ceiling_bytes_per_gib: u64,
    /// Overrides the memory-derived ceiling when set.
    pub max_buffer_bytes: Option<u64>,
    pub max_container_depth: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            estimate_slack_percent: 40,
            max_fault_time_us: 3000,
            max_frames: 1000,
            max_loadinfos: 500,
            port_label_capacity: 256,
            emit_intern_stats: false,
            est_task_bytes: 816,
            est_thread_bytes: 1184,
            est_uuid_bytes_per_task: 256,
            supplement_bytes: 16 * KIB,
            min_ceiling_bytes: 8 * MIB,
            ceiling_bytes_per_gib: MIB,
            max_buffer_bytes: None,
            max_container_depth: 8,
        }
    }
}

impl Tunables {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let tunables: Tunables = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(tunables)
    }

    pub fn slack_percent(&self) -> u64 {
        self.estimate_slack_percent.min(100)
    }

    pub fn label_capacity(&self) -> usize {
        self.port_label_capacity.min(PORT_LABEL_TABLE_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_config_takes_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"estimate_slack_percent": 250, "port_label_capacity": 5000}}"#).unwrap();
        let t = Tunables::from_file(file.path()).unwrap();
        assert_eq!(t.slack_percent(), 100);
        assert_eq!(t.label_capacity(), PORT_LABEL_TABLE_MAX);
        assert_eq!(t.max_fault_time_us, 3000);
        assert_eq!(t.max_buffer_bytes, None);
    }

    #[test]
    fn test_bad_config_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = Tunables::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
    }
}
