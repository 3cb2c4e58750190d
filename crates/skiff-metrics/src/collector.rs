use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Components, Disks, Networks, System};
use tracing::debug;

/// How many processes the snapshot keeps, ranked by CPU then by RSS.
const TOP_PROCESSES: usize = 5;

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cpu_usage: f32,
    pub rss_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac_address: String,
}

/// An immutable view of host health at one collection tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Overall CPU utilisation, percent.
    pub cpu_usage: f32,
    /// Memory used / total, MB.
    pub memory_usage: u64,
    pub memory_total: u64,
    /// Root-filesystem storage used / total, MB.
    pub storage_usage: u64,
    pub storage_total: u64,
    /// CPU temperature, °C, when the host exposes a thermal sensor.
    pub temperature: Option<f32>,
    /// Host uptime, seconds.
    pub uptime_secs: u64,
    pub top_processes: Vec<ProcessInfo>,
    pub interfaces: Vec<NetworkInterface>,
    pub collected_at: DateTime<Utc>,
}

/// Samples host CPU/memory/storage/temperature/processes.
///
/// Keep one collector alive for the agent's lifetime: CPU usage is computed
/// from the delta between consecutive refreshes, so the first tick reads 0.
pub struct MetricsCollector {
    system: System,
    disks: Disks,
    components: Components,
    networks: Networks,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
            components: Components::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
        }
    }

    /// Refresh every source and produce a snapshot.
    pub fn collect(&mut self) -> MetricsSnapshot {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.system.refresh_processes();
        self.disks.refresh();
        self.components.refresh();
        self.networks.refresh();

        let cpu_usage = self.system.global_cpu_info().cpu_usage();
        let memory_total = self.system.total_memory() / MB;
        let memory_usage = self.system.used_memory() / MB;

        let (storage_total, storage_usage) = self
            .disks
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| self.disks.iter().next())
            .map(|d| {
                let total = d.total_space() / MB;
                (total, total - d.available_space() / MB)
            })
            .unwrap_or((0, 0));

        let temperature = self
            .components
            .iter()
            .find(|c| {
                let label = c.label().to_ascii_lowercase();
                label.contains("cpu") || label.contains("package") || label.contains("core")
            })
            .or_else(|| self.components.iter().next())
            .map(|c| c.temperature());

        let mut processes: Vec<ProcessInfo> = self
            .system
            .processes()
            .iter()
            .map(|(pid, p)| ProcessInfo {
                pid: pid.as_u32(),
                name: p.name().to_string(),
                cpu_usage: p.cpu_usage(),
                rss_mb: p.memory() / MB,
            })
            .collect();
        processes.sort_by(|a, b| {
            b.cpu_usage
                .partial_cmp(&a.cpu_usage)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.rss_mb.cmp(&a.rss_mb))
        });
        processes.truncate(TOP_PROCESSES);

        let interfaces: Vec<NetworkInterface> = self
            .networks
            .iter()
            .filter(|(name, _)| !name.starts_with("lo"))
            .map(|(name, data)| NetworkInterface {
                name: name.clone(),
                mac_address: data.mac_address().to_string(),
            })
            .collect();

        let snapshot = MetricsSnapshot {
            cpu_usage,
            memory_usage,
            memory_total,
            storage_usage,
            storage_total,
            temperature,
            uptime_secs: System::uptime(),
            top_processes: processes,
            interfaces,
            collected_at: Utc::now(),
        };
        debug!(
            cpu = snapshot.cpu_usage,
            mem_mb = snapshot.memory_usage,
            "collected metrics"
        );
        snapshot
    }

    /// MAC address of the first non-loopback interface, for registration.
    pub fn primary_mac_address(&self) -> Option<String> {
        self.networks
            .iter()
            .filter(|(name, _)| !name.starts_with("lo"))
            .map(|(_, data)| data.mac_address().to_string())
            .find(|mac| mac != "00:00:00:00:00:00")
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_has_plausible_values() {
        let mut collector = MetricsCollector::new();
        let snapshot = collector.collect();

        assert!(snapshot.memory_total > 0);
        assert!(snapshot.memory_usage <= snapshot.memory_total);
        assert!(snapshot.top_processes.len() <= TOP_PROCESSES);
    }

    #[test]
    fn snapshot_serializes() {
        let mut collector = MetricsCollector::new();
        let snapshot = collector.collect();
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("cpu_usage"));
    }
}
