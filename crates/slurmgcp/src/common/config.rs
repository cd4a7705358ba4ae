use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use gce::selflink::parse_self_link;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::error::SyncError;

pub const DEFAULT_STATE_DIR: &str = "/var/spool/slurm";
pub const DEFAULT_OUTPUT_DIR: &str = "/usr/local/etc/slurm";
pub const DEFAULT_SLURM_BIN_DIR: &str = "/usr/local/bin";
pub const DEFAULT_CACHE_DIR: &str = "/tmp/slurm_gcp_cache";
pub const DEFAULT_SCRIPTS_DIR: &str = "/slurm/scripts";
pub const DEFAULT_CUSTOM_SCRIPTS_DIR: &str = "/slurm/custom_scripts";

/// Seconds, one week.
pub const MAX_RUN_DURATION: u64 = 7 * 24 * 60 * 60;

type Unknown = BTreeMap<String, serde_yaml::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    Controller,
    Compute,
    Login,
}

impl InstanceRole {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "controller" => Some(InstanceRole::Controller),
            "compute" => Some(InstanceRole::Compute),
            "login" => Some(InstanceRole::Login),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceRole::Controller => "controller",
            InstanceRole::Compute => "compute",
            InstanceRole::Login => "login",
        }
    }
}

/// Cluster wide configuration (`config.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub slurm_cluster_name: String,
    pub project: String,

    /// Default zone of the cluster, used when a nodeset does not restrict zones.
    #[serde(default)]
    pub zone: Option<String>,

    #[serde(default)]
    pub enable_debug_logging: bool,

    #[serde(default)]
    pub extra_logging_flags: BTreeMap<String, bool>,

    #[serde(default)]
    pub nodeset: BTreeMap<String, NodesetConfig>,

    #[serde(default)]
    pub nodeset_dyn: BTreeMap<String, DynNodesetConfig>,

    #[serde(default)]
    pub nodeset_tpu: BTreeMap<String, TpuNodesetConfig>,

    #[serde(default)]
    pub partitions: BTreeMap<String, PartitionConfig>,

    #[serde(default)]
    pub cloud_parameters: CloudParameters,

    #[serde(default)]
    pub endpoint_versions: EndpointVersions,

    #[serde(default)]
    pub instance_role: Option<InstanceRole>,

    /// Slurm is not managed by this cluster (no slurmctld reconfiguration).
    #[serde(default)]
    pub hybrid: bool,

    #[serde(default = "default_slurm_bin_dir")]
    pub slurm_bin_dir: PathBuf,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    #[serde(default = "default_custom_scripts_dir")]
    pub custom_scripts_dir: PathBuf,

    /// Where the authoritative copy of `config.yaml` is published.
    #[serde(default)]
    pub config_source: Option<PathBuf>,

    /// Directory with `slurm-<path>-script-<name>` files.
    #[serde(default)]
    pub custom_scripts_source: Option<PathBuf>,

    #[serde(flatten)]
    pub unknown: Unknown,
}

fn default_slurm_bin_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SLURM_BIN_DIR)
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_DIR)
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_DIR)
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SCRIPTS_DIR)
}

fn default_custom_scripts_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CUSTOM_SCRIPTS_DIR)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointVersions {
    #[serde(default)]
    pub compute: Option<String>,
    #[serde(default)]
    pub tpu: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudParameters {
    #[serde(default = "default_topology_plugin")]
    pub topology_plugin: String,
    #[serde(default)]
    pub topology_param: Option<String>,
    #[serde(default)]
    pub tree_width: Option<u32>,
    #[serde(default)]
    pub resume_rate: Option<u32>,
    #[serde(default)]
    pub resume_timeout: Option<u32>,
    #[serde(default)]
    pub suspend_rate: Option<u32>,
    #[serde(default)]
    pub suspend_timeout: Option<u32>,
    #[serde(default)]
    pub scheduler_parameters: Vec<String>,
}

impl Default for CloudParameters {
    fn default() -> Self {
        CloudParameters {
            topology_plugin: default_topology_plugin(),
            topology_param: None,
            tree_width: None,
            resume_rate: None,
            resume_timeout: None,
            suspend_rate: None,
            suspend_timeout: None,
            scheduler_parameters: Vec::new(),
        }
    }
}

pub const TOPOLOGY_PLUGIN_TREE: &str = "topology/tree";

fn default_topology_plugin() -> String {
    TOPOLOGY_PLUGIN_TREE.to_string()
}

/// Dynamic Workload Scheduler flex start options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DwsFlexConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Provision through bulk insert instead of a MIG resize request.
    #[serde(default)]
    pub use_bulk_insert: bool,
    #[serde(default = "default_max_run_duration")]
    pub max_run_duration: u64,
    #[serde(default)]
    pub use_job_duration: bool,
}

fn default_max_run_duration() -> u64 {
    MAX_RUN_DURATION
}

impl Default for DwsFlexConfig {
    fn default() -> Self {
        DwsFlexConfig {
            enabled: false,
            use_bulk_insert: false,
            max_run_duration: MAX_RUN_DURATION,
            use_job_duration: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesetConfig {
    #[serde(default)]
    pub nodeset_name: String,

    #[serde(default)]
    pub node_count_static: u32,

    #[serde(default)]
    pub node_count_dynamic_max: u32,

    pub instance_template: String,

    /// Self link of the subnetwork, determines the region of the nodeset.
    #[serde(default)]
    pub subnetwork: String,

    #[serde(default = "default_true")]
    pub enable_placement: bool,

    #[serde(default)]
    pub placement_max_distance: Option<u32>,

    #[serde(default)]
    pub zone_policy_allow: Vec<String>,

    #[serde(default)]
    pub zone_policy_deny: Vec<String>,

    #[serde(default = "default_target_shape")]
    pub zone_target_shape: String,

    /// `projects/<project>/reservations/<name>`
    #[serde(default)]
    pub reservation_name: Option<String>,

    /// `projects/<project>/zones/<zone>/futureReservations/<name>`
    #[serde(default)]
    pub future_reservation: Option<String>,

    #[serde(default)]
    pub maintenance_interval: Option<String>,

    #[serde(default)]
    pub dws_flex: DwsFlexConfig,

    /// GPU topology of a slice, e.g. `1x72`.
    #[serde(default)]
    pub accelerator_topology: Option<String>,

    /// Provision slices of `accelerator_topology` through managed instance groups.
    #[serde(default)]
    pub enable_mig_slices: bool,

    #[serde(default)]
    pub enable_spot_vm: bool,

    /// Reserve nodes in Slurm for the window of their upcoming host maintenance.
    #[serde(default)]
    pub enable_maintenance_reservation: bool,

    /// Run the maintenance early through a job once the node becomes free.
    #[serde(default)]
    pub enable_opportunistic_maintenance: bool,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Merged over generated instance properties of bulk inserts.
    #[serde(default)]
    pub instance_properties: Option<serde_json::Map<String, Value>>,

    /// Extra `NodeName` parameters.
    #[serde(default)]
    pub node_conf: BTreeMap<String, serde_yaml::Value>,

    #[serde(flatten)]
    pub unknown: Unknown,
}

fn default_target_shape() -> String {
    "ANY_SINGLE_ZONE".to_string()
}

impl NodesetConfig {
    pub fn node_count(&self) -> u32 {
        self.node_count_static + self.node_count_dynamic_max
    }

    pub fn region(&self) -> Option<String> {
        parse_self_link(&self.subnetwork).region
    }

    /// Allowed zones with denied zones removed, sorted.
    pub fn zones(&self) -> Vec<String> {
        let mut zones: Vec<String> = self
            .zone_policy_allow
            .iter()
            .filter(|zone| !self.zone_policy_deny.contains(zone))
            .cloned()
            .collect();
        zones.sort();
        zones.dedup();
        zones
    }

    /// Flex nodes are provisioned through a MIG resize request.
    pub fn is_flex(&self) -> bool {
        self.dws_flex.enabled && !self.dws_flex.use_bulk_insert
    }

    pub fn uses_mig_slices(&self) -> bool {
        self.enable_mig_slices && self.accelerator_topology.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynNodesetConfig {
    #[serde(default)]
    pub nodeset_name: String,
    #[serde(default)]
    pub nodeset_feature: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcceleratorConfig {
    #[serde(default)]
    pub topology: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceAccount {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpuNodesetConfig {
    #[serde(default)]
    pub nodeset_name: String,
    #[serde(default)]
    pub node_count_static: u32,
    #[serde(default)]
    pub node_count_dynamic_max: u32,
    /// Accelerator type, e.g. `v3-32`.
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub accelerator_config: AcceleratorConfig,
    #[serde(default)]
    pub tf_version: String,
    pub zone: String,
    #[serde(default)]
    pub preemptible: bool,
    #[serde(default)]
    pub reserved: bool,
    /// Stop single VM TPUs instead of deleting them on suspend.
    #[serde(default)]
    pub preserve_tpu: bool,
    #[serde(default)]
    pub enable_public_ip: bool,
    #[serde(default)]
    pub subnetwork: String,
    #[serde(default)]
    pub service_account: Option<ServiceAccount>,
    #[serde(default)]
    pub docker_image: Option<String>,
    #[serde(default)]
    pub data_disks: Vec<String>,
    #[serde(default)]
    pub node_conf: BTreeMap<String, serde_yaml::Value>,
    #[serde(flatten)]
    pub unknown: Unknown,
}

const TPUS_PER_VM: u32 = 4;
const TPU_CORES_PER_VM: u32 = 8;

impl TpuNodesetConfig {
    pub fn node_count(&self) -> u32 {
        self.node_count_static + self.node_count_dynamic_max
    }

    /// Number of VMs forming a single TPU node.
    pub fn vmcount(&self) -> u32 {
        let topology = &self.accelerator_config.topology;
        let count = if !topology.is_empty() {
            topology
                .split('x')
                .map(|dim| dim.trim().parse::<u32>().unwrap_or(1))
                .product::<u32>()
                / TPUS_PER_VM
        } else {
            // v3-32 has 32 cores, 8 cores per VM
            self.node_type
                .as_deref()
                .and_then(|t| t.rsplit('-').next())
                .and_then(|cores| cores.parse::<u32>().ok())
                .map(|cores| cores / TPU_CORES_PER_VM)
                .unwrap_or(1)
        };
        count.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    #[serde(default)]
    pub partition_name: String,
    #[serde(default)]
    pub partition_nodeset: Vec<String>,
    #[serde(default)]
    pub partition_nodeset_dyn: Vec<String>,
    #[serde(default)]
    pub partition_nodeset_tpu: Vec<String>,
    #[serde(default)]
    pub enable_job_exclusive: bool,
    #[serde(default)]
    pub partition_conf: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub partition_feature: Option<String>,
}

impl PartitionConfig {
    pub fn is_tpu(&self) -> bool {
        !self.partition_nodeset_tpu.is_empty()
    }
}

impl ClusterConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|error| {
            SyncError::ConfigError(format!("Cannot read config file {path:?}: {error}"))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> crate::Result<Self> {
        let mut config: ClusterConfig = serde_yaml::from_str(content)?;
        config.normalize()?;
        config.warn_unknown_keys();
        Ok(config)
    }

    pub fn to_yaml(&self) -> crate::Result<String> {
        serde_yaml::to_string(self)
            .map_err(|error| SyncError::SerializationError(error.to_string()))
    }

    /// Fills names from map keys and validates names used in node names.
    fn normalize(&mut self) -> crate::Result<()> {
        if self.slurm_cluster_name.is_empty() || self.slurm_cluster_name.contains('-') {
            return Err(SyncError::ConfigError(format!(
                "slurm_cluster_name '{}' must be non-empty and must not contain '-'",
                self.slurm_cluster_name
            )));
        }
        for (name, nodeset) in self.nodeset.iter_mut() {
            if nodeset.nodeset_name.is_empty() {
                nodeset.nodeset_name = name.clone();
            }
        }
        for (name, nodeset) in self.nodeset_dyn.iter_mut() {
            if nodeset.nodeset_name.is_empty() {
                nodeset.nodeset_name = name.clone();
            }
        }
        for (name, nodeset) in self.nodeset_tpu.iter_mut() {
            if nodeset.nodeset_name.is_empty() {
                nodeset.nodeset_name = name.clone();
            }
        }
        for (name, partition) in self.partitions.iter_mut() {
            if partition.partition_name.is_empty() {
                partition.partition_name = name.clone();
            }
        }
        Ok(())
    }

    fn warn_unknown_keys(&self) {
        for key in self.unknown.keys() {
            log::warn!("Unknown configuration key '{key}' is ignored");
        }
        for nodeset in self.nodeset.values() {
            for key in nodeset.unknown.keys() {
                log::warn!(
                    "Unknown key '{key}' of nodeset {} is ignored",
                    nodeset.nodeset_name
                );
            }
        }
        for nodeset in self.nodeset_tpu.values() {
            for key in nodeset.unknown.keys() {
                log::warn!(
                    "Unknown key '{key}' of TPU nodeset {} is ignored",
                    nodeset.nodeset_name
                );
            }
        }
    }

    pub fn scontrol(&self) -> PathBuf {
        self.slurm_bin_dir.join("scontrol")
    }

    pub fn nodeset_prefix(&self, nodeset: &str) -> String {
        format!("{}-{nodeset}", self.slurm_cluster_name)
    }

    pub fn role(&self) -> InstanceRole {
        self.instance_role.unwrap_or(InstanceRole::Controller)
    }

    pub fn is_controller(&self) -> bool {
        self.role() == InstanceRole::Controller
    }

    pub fn trace_api(&self) -> bool {
        self.extra_logging_flags
            .get("trace_api")
            .copied()
            .unwrap_or(false)
    }

    pub fn uses_tree_topology(&self) -> bool {
        self.cloud_parameters.topology_plugin == TOPOLOGY_PLUGIN_TREE
    }

    pub fn pubsub_dir(&self) -> PathBuf {
        self.state_dir.join("pubsub")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
slurm_cluster_name: hpc
project: proj
zone: us-central1-a
nodeset:
  gpu:
    node_count_static: 2
    node_count_dynamic_max: 8
    instance_template: projects/proj/global/instanceTemplates/tpl
    subnetwork: projects/proj/regions/us-central1/subnetworks/default
    zone_policy_allow: [us-central1-b, us-central1-a, us-central1-c]
    zone_policy_deny: [us-central1-c]
    dws_flex:
      enabled: true
    mystery: 1
nodeset_tpu:
  v3:
    node_type: v3-32
    zone: us-central1-b
partitions:
  debug:
    partition_nodeset: [gpu]
    enable_job_exclusive: true
cloud_parameters:
  resume_timeout: 600
legacy_option: x
"#;

    #[test]
    fn parse_config() {
        let config = ClusterConfig::from_yaml(CONFIG).unwrap();
        assert_eq!(config.slurm_cluster_name, "hpc");
        assert_eq!(config.state_dir, PathBuf::from(DEFAULT_STATE_DIR));
        assert_eq!(config.scontrol(), PathBuf::from("/usr/local/bin/scontrol"));
        assert!(config.unknown.contains_key("legacy_option"));
        assert!(config.uses_tree_topology());
        assert_eq!(config.cloud_parameters.resume_timeout, Some(600));

        let nodeset = &config.nodeset["gpu"];
        assert_eq!(nodeset.nodeset_name, "gpu");
        assert_eq!(nodeset.node_count(), 10);
        assert!(nodeset.enable_placement);
        assert!(nodeset.is_flex());
        assert_eq!(nodeset.dws_flex.max_run_duration, MAX_RUN_DURATION);
        assert_eq!(nodeset.region().as_deref(), Some("us-central1"));
        assert_eq!(nodeset.zones(), vec!["us-central1-a", "us-central1-b"]);
        assert!(nodeset.unknown.contains_key("mystery"));

        assert_eq!(config.nodeset_tpu["v3"].vmcount(), 4);
        assert_eq!(config.partitions["debug"].partition_name, "debug");
    }

    #[test]
    fn reject_cluster_name_with_dash() {
        let result = ClusterConfig::from_yaml("slurm_cluster_name: my-hpc\nproject: p\n");
        assert!(matches!(result, Err(SyncError::ConfigError(_))));
    }

    #[test]
    fn tpu_vmcount_from_topology() {
        let config = ClusterConfig::from_yaml(
            "slurm_cluster_name: c\nproject: p\nnodeset_tpu:\n  t:\n    zone: z\n    accelerator_config:\n      topology: 2x2x4\n      version: V4\n",
        )
        .unwrap();
        assert_eq!(config.nodeset_tpu["t"].vmcount(), 4);
    }
}
