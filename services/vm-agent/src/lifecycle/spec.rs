//! Create requests.

use serde::{Deserialize, Serialize};

use crate::firecracker::config::MAX_VCPUS;

/// Sizes applied when a request leaves them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecDefaults {
    pub memory_mib: u32,
    pub vcpu_count: u8,
    pub disk_size_gib: u32,
}

impl Default for SpecDefaults {
    fn default() -> Self {
        Self {
            memory_mib: 512,
            vcpu_count: 1,
            disk_size_gib: 2,
        }
    }
}

/// Requested shape of a new VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub memory_mib: Option<u32>,
    pub vcpu_count: Option<u8>,
    pub disk_size_gib: Option<u32>,
}

impl VmSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Spec with every size given explicitly.
    pub fn sized(name: impl Into<String>, memory_mib: u32, vcpu_count: u8, disk_size_gib: u32) -> Self {
        Self {
            name: name.into(),
            memory_mib: Some(memory_mib),
            vcpu_count: Some(vcpu_count),
            disk_size_gib: Some(disk_size_gib),
        }
    }

    /// Fill in missing sizes.
    pub fn with_defaults(self, defaults: &SpecDefaults) -> Self {
        Self {
            memory_mib: self.memory_mib.or(Some(defaults.memory_mib)),
            vcpu_count: self.vcpu_count.or(Some(defaults.vcpu_count)),
            disk_size_gib: self.disk_size_gib.or(Some(defaults.disk_size_gib)),
            name: self.name,
        }
    }

    /// Check a spec whose defaults have been applied.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        match self.vcpu_count {
            Some(n) if (1..=MAX_VCPUS).contains(&n) => {}
            other => {
                return Err(format!(
                    "vcpu_count must be between 1 and {MAX_VCPUS}, got {}",
                    other.unwrap_or(0)
                ))
            }
        }
        if self.memory_mib.unwrap_or(0) == 0 {
            return Err("memory_mib must be greater than zero".to_string());
        }
        if self.disk_size_gib.unwrap_or(0) == 0 {
            return Err("disk_size_gib must be greater than zero".to_string());
        }
        Ok(())
    }
}
