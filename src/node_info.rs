//! This node's info, read from system files
//!
//! Static fields are collected once at startup. The provisioning status is
//! re-read from the state file on every request, so an external tool
//! rewriting the file is picked up.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use iam_proto::{CpuInfo, NodeAttribute, NodeInfo, NodeStatus, PartitionInfo};
use iam_server::{NodeInfoProvider, ServiceError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::NodeInfoConfig;

const BYTES_PER_KB: u64 = 1024;

/// [`NodeInfoProvider`] backed by procfs-style files and a state file
pub struct FileNodeInfoProvider {
    info: Mutex<NodeInfo>,
    state_path: PathBuf,
}

impl FileNodeInfoProvider {
    /// Collect this node's info
    ///
    /// A missing node ID or meminfo file is an error. A missing cpuinfo file
    /// reports one single-core CPU.
    pub fn new(config: &NodeInfoConfig) -> Result<Self, ServiceError> {
        let node_id = read_node_id(&config.node_id_path)?;
        let total_ram = read_mem_total(&config.mem_info_path)?;
        let cpus = read_cpu_info(&config.cpu_info_path);
        let status = read_status(&config.provisioning_state_path)?;

        let mut info = NodeInfo {
            node_id,
            node_type: config.node_type.clone(),
            name: config.node_name.clone(),
            os_type: config.os_type.clone(),
            cpus,
            max_dmips: config.max_dmips,
            total_ram,
            attrs: attributes(&config.attrs),
            partitions: config
                .partitions
                .iter()
                .map(|p| PartitionInfo {
                    name: p.name.clone(),
                    types: p.types.clone(),
                    total_size: 0,
                    path: p.path.clone(),
                })
                .collect(),
            ..Default::default()
        };
        info.set_status(status);

        info!(node_id = %info.node_id, status = %status, "Node info loaded");

        Ok(Self {
            info: Mutex::new(info),
            state_path: config.provisioning_state_path.clone(),
        })
    }
}

#[async_trait]
impl NodeInfoProvider for FileNodeInfoProvider {
    async fn get_node_info(&self) -> Result<NodeInfo, ServiceError> {
        let status = read_status(&self.state_path)?;

        let mut info = self.info.lock().clone();
        info.set_status(status);
        Ok(info)
    }

    async fn set_node_status(&self, status: NodeStatus) -> Result<(), ServiceError> {
        if self.info.lock().status() == status {
            debug!(status = %status, "Node status is not changed");
            return Ok(());
        }

        if status == NodeStatus::Unprovisioned {
            match tokio::fs::remove_file(&self.state_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_failed("remove provisioning state", &self.state_path, e)),
            }
        } else {
            tokio::fs::write(&self.state_path, status.label())
                .await
                .map_err(|e| io_failed("write provisioning state", &self.state_path, e))?;
        }

        self.info.lock().set_status(status);

        info!(status = %status, "Node status updated");

        Ok(())
    }
}

fn io_failed(what: &str, path: &Path, e: std::io::Error) -> ServiceError {
    ServiceError::failed(format!("{} {}: {}", what, path.display(), e))
}

fn attributes(attrs: &BTreeMap<String, String>) -> Vec<NodeAttribute> {
    attrs
        .iter()
        .map(|(name, value)| NodeAttribute {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

fn read_node_id(path: &Path) -> Result<String, ServiceError> {
    let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => ServiceError::NotFound(format!("node ID file {}", path.display())),
        _ => io_failed("read node ID", path, e),
    })?;

    let node_id = text.lines().next().unwrap_or_default().trim();
    if node_id.is_empty() {
        return Err(ServiceError::failed(format!(
            "node ID file {} is empty",
            path.display()
        )));
    }

    Ok(node_id.to_string())
}

/// Provisioning status from the state file; a missing file is unprovisioned
fn read_status(path: &Path) -> Result<NodeStatus, ServiceError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(NodeStatus::Unprovisioned),
        Err(e) => return Err(io_failed("read provisioning state", path, e)),
    };

    text.lines()
        .next()
        .unwrap_or_default()
        .parse::<NodeStatus>()
        .map_err(|e| ServiceError::failed(e.to_string()))
}

fn key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    Some((key.trim(), value.trim()))
}

/// Total RAM in bytes from the `MemTotal` line
fn read_mem_total(path: &Path) -> Result<u64, ServiceError> {
    let text = std::fs::read_to_string(path).map_err(|e| io_failed("read meminfo", path, e))?;

    for line in text.lines() {
        let Some(("MemTotal", value)) = key_value(line) else {
            continue;
        };

        let kb = value
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .parse::<u64>()
            .map_err(|e| ServiceError::failed(format!("bad MemTotal {:?}: {}", value, e)))?;

        return kb
            .checked_mul(BYTES_PER_KB)
            .ok_or_else(|| ServiceError::failed(format!("MemTotal {} kB overflows", kb)));
    }

    Err(ServiceError::NotFound(format!(
        "MemTotal in {}",
        path.display()
    )))
}

fn default_cpu() -> CpuInfo {
    CpuInfo {
        num_cores: 1,
        num_threads: 1,
        arch: std::env::consts::ARCH.to_string(),
        ..Default::default()
    }
}

/// One entry per physical CPU package
///
/// Processor blocks are separated by blank lines. Only the first block of
/// each `physical id` is used.
fn read_cpu_info(path: &Path) -> Vec<CpuInfo> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read cpuinfo, using default");
            return vec![default_cpu()];
        }
    };

    let mut cpus: BTreeMap<u64, CpuInfo> = BTreeMap::new();

    for block in text.split("\n\n") {
        let mut physical_id = 0;
        let mut cpu = default_cpu();
        let mut seen = false;

        for (key, value) in block.lines().filter_map(key_value) {
            seen = true;
            match key {
                "physical id" => physical_id = value.parse().unwrap_or(0),
                "model name" => cpu.model_name = value.to_string(),
                "cpu cores" => cpu.num_cores = value.parse().unwrap_or(1),
                "siblings" => cpu.num_threads = value.parse().unwrap_or(1),
                "cpu family" => cpu.arch_family = value.to_string(),
                _ => {}
            }
        }

        if seen {
            cpus.entry(physical_id).or_insert(cpu);
        }
    }

    if cpus.is_empty() {
        return vec![default_cpu()];
    }

    cpus.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionConfig;
    use tempfile::TempDir;

    const CPU_INFO: &str = "processor\t: 0
physical id\t: 0
model name\t: Cortex A53
cpu cores\t: 4
siblings\t: 8
cpu family\t: 8

processor\t: 1
physical id\t: 0
model name\t: Cortex A53
cpu cores\t: 4
siblings\t: 8

processor\t: 2
physical id\t: 1
model name\t: Cortex A72
cpu cores\t: 2
siblings\t: 2
";

    fn setup(dir: &TempDir) -> NodeInfoConfig {
        let path = |name: &str| dir.path().join(name);

        std::fs::write(path("node-id"), "node1\nignored\n").expect("write");
        std::fs::write(path("meminfo"), "MemTotal:       2048 kB\nMemFree: 1 kB\n").expect("write");
        std::fs::write(path("cpuinfo"), CPU_INFO).expect("write");

        NodeInfoConfig {
            cpu_info_path: path("cpuinfo"),
            mem_info_path: path("meminfo"),
            provisioning_state_path: path("provisionstate"),
            node_id_path: path("node-id"),
            node_name: "Node 1".to_string(),
            node_type: "main".to_string(),
            os_type: "linux".to_string(),
            max_dmips: 1000,
            attrs: BTreeMap::from([("MainNode".to_string(), String::new())]),
            partitions: vec![PartitionConfig {
                name: "var".to_string(),
                types: vec!["services".to_string()],
                path: "/var".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn node_info_is_collected() {
        let dir = TempDir::new().expect("tempdir");
        let provider = FileNodeInfoProvider::new(&setup(&dir)).expect("provider");

        let info = provider.get_node_info().await.expect("info");
        assert_eq!(info.node_id, "node1");
        assert_eq!(info.total_ram, 2048 * 1024);
        assert_eq!(info.status(), NodeStatus::Unprovisioned);
        assert!(info.is_main_node());
        assert_eq!(info.partitions[0].types, vec!["services"]);

        assert_eq!(info.cpus.len(), 2);
        assert_eq!(info.cpus[0].model_name, "Cortex A53");
        assert_eq!(info.cpus[0].num_cores, 4);
        assert_eq!(info.cpus[0].num_threads, 8);
        assert_eq!(info.cpus[1].model_name, "Cortex A72");
    }

    #[tokio::test]
    async fn status_round_trips_through_state_file() {
        let dir = TempDir::new().expect("tempdir");
        let config = setup(&dir);
        let provider = FileNodeInfoProvider::new(&config).expect("provider");

        provider
            .set_node_status(NodeStatus::Provisioned)
            .await
            .expect("set");
        assert_eq!(
            std::fs::read_to_string(&config.provisioning_state_path).expect("state"),
            "provisioned"
        );
        assert_eq!(
            provider.get_node_info().await.expect("info").status(),
            NodeStatus::Provisioned
        );

        provider
            .set_node_status(NodeStatus::Unprovisioned)
            .await
            .expect("set");
        assert!(!config.provisioning_state_path.exists());
    }

    #[tokio::test]
    async fn external_state_change_is_visible() {
        let dir = TempDir::new().expect("tempdir");
        let config = setup(&dir);
        let provider = FileNodeInfoProvider::new(&config).expect("provider");

        std::fs::write(&config.provisioning_state_path, "paused\n").expect("write");
        assert_eq!(
            provider.get_node_info().await.expect("info").status(),
            NodeStatus::Paused
        );
    }

    #[tokio::test]
    async fn garbage_state_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let config = setup(&dir);
        let provider = FileNodeInfoProvider::new(&config).expect("provider");

        std::fs::write(&config.provisioning_state_path, "bogus").expect("write");
        assert!(provider.get_node_info().await.is_err());
    }

    #[test]
    fn missing_node_id_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let mut config = setup(&dir);
        config.node_id_path = dir.path().join("absent");

        assert!(matches!(
            FileNodeInfoProvider::new(&config),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn oversized_mem_total_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let config = setup(&dir);
        let meminfo = format!("MemTotal: {} kB\n", u64::MAX);
        std::fs::write(&config.mem_info_path, meminfo).expect("write meminfo");

        assert!(matches!(
            FileNodeInfoProvider::new(&config),
            Err(ServiceError::Failed { .. })
        ));
    }

    #[test]
    fn missing_cpuinfo_falls_back_to_one_cpu() {
        let cpus = read_cpu_info(Path::new("/nonexistent/cpuinfo"));
        assert_eq!(cpus.len(), 1);
        assert_eq!(cpus[0].num_cores, 1);
        assert_eq!(cpus[0].arch, std::env::consts::ARCH);
    }
}
