use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use t3_format::{Result, VmError};

/// Sizing knobs for a VM instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Slots in the undo journal. Fixed for the life of the VM.
    pub undo_records: usize,
    pub max_savepoints: u32,
    /// Allocations between automatic collections; 0 disables them.
    pub gc_alloc_threshold: usize,
    pub default_bucket_count: usize,
    pub default_capacity: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            undo_records: 16384,
            max_savepoints: 32,
            gc_alloc_threshold: 10000,
            default_bucket_count: 32,
            default_capacity: 64,
        }
    }
}

impl VmConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: VmConfig =
            serde_json::from_str(text).map_err(|err| VmError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref()).map_err(VmError::ReadFile)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.undo_records < 2 {
            return Err(VmError::InvalidConfig(format!(
                "undo_records must be at least 2, got {}",
                self.undo_records
            )));
        }
        if self.max_savepoints == 0 {
            return Err(VmError::InvalidConfig(
                "max_savepoints must be positive".to_string(),
            ));
        }
        if self.default_bucket_count == 0 || self.default_capacity == 0 {
            return Err(VmError::InvalidConfig(
                "default table sizes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
