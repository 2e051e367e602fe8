//! Host health: volume usage and process memory
//!
//! The [`HealthProbe`] trait is the seam to the operating system; [`SysinfoProbe`]
//! is the production implementation.

use crate::protocol::round2;
use sysinfo::{Disks, System};
use thiserror::Error;

/// Raw volume information as reported by a probe
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeInfo {
    pub id: String,
    pub ready: bool,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub filesystem: String,
    pub label: String,
}

/// Normalized volume status
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeStatus {
    pub volume_id: String,
    pub is_ready: bool,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    /// 0..=100, two decimals
    pub used_percent: f64,
    pub filesystem: String,
    pub label: String,
}

impl VolumeStatus {
    /// Ready volumes satisfy `used + free == total`; unready volumes carry
    /// zeroed byte fields.
    pub fn from_info(info: VolumeInfo) -> Self {
        if !info.ready {
            return Self {
                volume_id: info.id,
                is_ready: false,
                total_bytes: 0,
                used_bytes: 0,
                free_bytes: 0,
                used_percent: 0.0,
                filesystem: info.filesystem,
                label: info.label,
            };
        }

        let total_bytes = info.total_bytes;
        // Some filesystems report more available space than capacity (quotas, compression)
        let free_bytes = info.free_bytes.min(total_bytes);
        let used_bytes = total_bytes - free_bytes;
        let used_percent = if total_bytes == 0 {
            0.0
        } else {
            round2(used_bytes as f64 / total_bytes as f64 * 100.0)
        };

        Self {
            volume_id: info.id,
            is_ready: true,
            total_bytes,
            used_bytes,
            free_bytes,
            used_percent,
            filesystem: info.filesystem,
            label: info.label,
        }
    }
}

/// Host state captured once per tick
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    /// Sorted by volume id, one entry per id
    pub volumes: Vec<VolumeStatus>,
    pub process_memory_bytes: u64,
}

impl HealthSnapshot {
    pub fn new(mut volumes: Vec<VolumeStatus>, process_memory_bytes: u64) -> Self {
        volumes.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        volumes.dedup_by(|a, b| a.volume_id == b.volume_id);
        Self {
            volumes,
            process_memory_bytes,
        }
    }

    pub fn collect(probe: &dyn HealthProbe) -> Result<Self, ProbeError> {
        let volumes = probe
            .enumerate_volumes()?
            .into_iter()
            .map(VolumeStatus::from_info)
            .collect();
        let memory = probe.current_process_memory()?;
        Ok(Self::new(volumes, memory))
    }

    pub fn ready_volumes(&self) -> impl Iterator<Item = &VolumeStatus> {
        self.volumes.iter().filter(|volume| volume.is_ready)
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Health probe unavailable: {0}")]
    Unavailable(String),
}

/// Operating system probe for storage and memory
pub trait HealthProbe: Send + Sync {
    fn enumerate_volumes(&self) -> Result<Vec<VolumeInfo>, ProbeError>;

    /// Resident memory of the current process in bytes
    fn current_process_memory(&self) -> Result<u64, ProbeError>;
}

/// [`HealthProbe`] backed by `sysinfo`
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProbe;

impl SysinfoProbe {
    /// Human-readable OS descriptor, e.g. `Linux 22.04 Ubuntu`
    pub fn os_descriptor() -> String {
        System::long_os_version().unwrap_or_else(|| std::env::consts::OS.to_string())
    }
}

impl HealthProbe for SysinfoProbe {
    fn enumerate_volumes(&self) -> Result<Vec<VolumeInfo>, ProbeError> {
        let disks = Disks::new_with_refreshed_list();
        Ok(disks
            .list()
            .iter()
            .map(|disk| VolumeInfo {
                id: disk.mount_point().to_string_lossy().into_owned(),
                ready: disk.total_space() > 0,
                total_bytes: disk.total_space(),
                free_bytes: disk.available_space(),
                filesystem: disk.file_system().to_string_lossy().into_owned(),
                label: disk.name().to_string_lossy().into_owned(),
            })
            .collect())
    }

    fn current_process_memory(&self) -> Result<u64, ProbeError> {
        let pid = sysinfo::get_current_pid().map_err(|e| ProbeError::Unavailable(e.to_string()))?;
        let mut system = System::new();
        system.refresh_process(pid);
        system
            .process(pid)
            .map(|process| process.memory())
            .ok_or_else(|| ProbeError::Unavailable(format!("process {pid} not found")))
    }
}
