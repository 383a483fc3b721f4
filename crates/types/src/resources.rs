//! Resource quadruples used for node capacity accounting.

use serde::{Deserialize, Serialize};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * 1024 * 1024;

/// A quadruple of schedulable resource dimensions. Nodes carry three of
/// these (capacity, allocatable, allocated) and the invariant
/// `allocated <= allocatable <= capacity` must hold per dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Resources {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub gpu_count: u32,
}

impl Resources {
    pub fn new(cpu_cores: u32, memory_bytes: u64, disk_bytes: u64, gpu_count: u32) -> Self {
        Resources {
            cpu_cores,
            memory_bytes,
            disk_bytes,
            gpu_count,
        }
    }

    /// True when every dimension of `self` covers `request`.
    pub fn satisfies(&self, request: &Resources) -> bool {
        self.cpu_cores >= request.cpu_cores
            && self.memory_bytes >= request.memory_bytes
            && self.disk_bytes >= request.disk_bytes
            && self.gpu_count >= request.gpu_count
    }

    /// True when every dimension of `self` is within `limit`.
    pub fn fits_within(&self, limit: &Resources) -> bool {
        limit.satisfies(self)
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cpu_cores: self.cpu_cores.saturating_add(other.cpu_cores),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            disk_bytes: self.disk_bytes.saturating_add(other.disk_bytes),
            gpu_count: self.gpu_count.saturating_add(other.gpu_count),
        }
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_cores: self.cpu_cores.saturating_sub(other.cpu_cores),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            disk_bytes: self.disk_bytes.saturating_sub(other.disk_bytes),
            gpu_count: self.gpu_count.saturating_sub(other.gpu_count),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Resources::default()
    }
}
