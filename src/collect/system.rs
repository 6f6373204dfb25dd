//! Host metrics backed by `sysinfo`

use super::types::{
    CpuMetrics, DiskMetrics, MemoryMetrics, MetricsSnapshot, NetworkMetrics, SystemInfo,
};
use super::MetricsSource;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use sysinfo::{Disks, Networks, System};

struct Probes {
    system: System,
    disks: Disks,
    networks: Networks,
}

/// Metrics source reading the local host.
///
/// CPU usage is the delta since the previous sample, so the first snapshot
/// after construction may report 0%.
#[derive(Clone)]
pub struct SysinfoMetrics {
    probes: Arc<Mutex<Probes>>,
}

impl SysinfoMetrics {
    pub fn new() -> Self {
        Self {
            probes: Arc::new(Mutex::new(Probes {
                system: System::new_all(),
                disks: Disks::new_with_refreshed_list(),
                networks: Networks::new_with_refreshed_list(),
            })),
        }
    }

    fn sample_blocking(probes: &Mutex<Probes>) -> Result<MetricsSnapshot> {
        let mut guard = probes
            .lock()
            .map_err(|_| Error::Collection("metrics probes poisoned".to_string()))?;
        let probes = &mut *guard;

        probes.system.refresh_cpu();
        probes.system.refresh_memory();
        probes.disks.refresh();
        probes.networks.refresh();

        let cpus = probes.system.cpus();
        let cpu = CpuMetrics {
            usage_percent: probes.system.global_cpu_info().cpu_usage() as f64,
            cores: cpus.len(),
            model: cpus
                .first()
                .map(|c| c.brand().trim().to_string())
                .unwrap_or_default(),
        };

        let total = probes.system.total_memory();
        let used = probes.system.used_memory();
        let memory = MemoryMetrics {
            total,
            used,
            free: probes.system.free_memory(),
            usage_percent: percent(used, total),
        };

        // Root filesystem, or the first disk when nothing is mounted at `/`
        let root = probes
            .disks
            .list()
            .iter()
            .find(|d| d.mount_point() == Path::new("/"))
            .or_else(|| probes.disks.list().first());
        let disk = match root {
            Some(d) => {
                let total = d.total_space();
                let free = d.available_space();
                let used = total.saturating_sub(free);
                DiskMetrics {
                    total,
                    used,
                    free,
                    usage_percent: percent(used, total),
                    mount_point: d.mount_point().display().to_string(),
                }
            }
            None => DiskMetrics {
                mount_point: "/".to_string(),
                ..Default::default()
            },
        };

        let mut network = NetworkMetrics::default();
        for (_name, data) in probes.networks.iter() {
            network.bytes_recv += data.total_received();
            network.bytes_sent += data.total_transmitted();
            network.packets_recv += data.total_packets_received();
            network.packets_sent += data.total_packets_transmitted();
        }

        Ok(MetricsSnapshot {
            cpu,
            memory,
            disk,
            network,
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

#[async_trait]
impl MetricsSource for SysinfoMetrics {
    async fn sample(&self) -> Result<MetricsSnapshot> {
        let probes = self.probes.clone();
        tokio::task::spawn_blocking(move || Self::sample_blocking(&probes))
            .await
            .map_err(|e| Error::Collection(format!("metrics sampler panicked: {}", e)))?
    }

    async fn system_info(&self) -> Result<SystemInfo> {
        Ok(SystemInfo {
            hostname: System::host_name().unwrap_or_default(),
            os: System::name().unwrap_or_default(),
            os_version: System::os_version().unwrap_or_default(),
            kernel: System::kernel_version().unwrap_or_default(),
            uptime: System::uptime(),
            architecture: System::cpu_arch().unwrap_or_default(),
        })
    }
}
