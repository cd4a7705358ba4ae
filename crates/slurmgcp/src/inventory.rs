//! Cached view of the cluster: Compute Engine instances, Slurm nodes, templates
//! and reservations. Everything is fetched at most once per invocation.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, Utc};
use gce::selflink::{parse_self_link, trim_self_link};
use gce::{BatchExecutor, ComputeRequest};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::common::cache::Cache;
use crate::common::config::{ClusterConfig, DynNodesetConfig, NodesetConfig, TpuNodesetConfig};
use crate::common::error::{SyncError, error};
use crate::scheduler::{JobInfo, NodeState, Scheduler};
use crate::Map;

static NODE_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<prefix>(?P<cluster>[^\s\-]+)-(?P<nodeset>\S+))-(?P<suffix>\w+|\[[\d,-]+\])$",
    )
    .expect("invalid node name regex")
});

static CUSTOM_MACHINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^((?P<family>\w+)-)?custom-(?P<cpus>\d+)-(?P<mem>\d+)")
        .expect("invalid machine type regex")
});

/// Parts of a node name `{cluster}-{nodeset}-{suffix}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDesc {
    pub prefix: String,
    pub cluster: String,
    pub nodeset: String,
    pub suffix: String,
}

impl NodeDesc {
    pub fn index(&self) -> Option<u32> {
        self.suffix.parse().ok()
    }
}

/// FQDN suffixes are ignored.
pub fn parse_node_name(name: &str) -> crate::Result<NodeDesc> {
    let short = name.split('.').next().unwrap_or(name);
    let captures = NODE_NAME_REGEX
        .captures(short)
        .ok_or_else(|| SyncError::NamingError(name.to_string()))?;
    Ok(NodeDesc {
        prefix: captures["prefix"].to_string(),
        cluster: captures["cluster"].to_string(),
        nodeset: captures["nodeset"].to_string(),
        suffix: captures["suffix"].to_string(),
    })
}

pub fn node_index(name: &str) -> crate::Result<u32> {
    parse_node_name(name)?
        .index()
        .ok_or_else(|| SyncError::NamingError(name.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Provisioning,
    Staging,
    Running,
    Stopping,
    Stopped,
    Suspending,
    Suspended,
    Repairing,
    Terminated,
    Other(String),
}

impl InstanceStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "PROVISIONING" => InstanceStatus::Provisioning,
            "STAGING" => InstanceStatus::Staging,
            "RUNNING" => InstanceStatus::Running,
            "STOPPING" => InstanceStatus::Stopping,
            "STOPPED" => InstanceStatus::Stopped,
            "SUSPENDING" => InstanceStatus::Suspending,
            "SUSPENDED" => InstanceStatus::Suspended,
            "REPAIRING" => InstanceStatus::Repairing,
            "TERMINATED" => InstanceStatus::Terminated,
            other => InstanceStatus::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub name: String,
    pub status: InstanceStatus,
    pub zone: String,
    pub machine_type: String,
    pub creation_timestamp: Option<DateTime<FixedOffset>>,
    pub role: String,
    pub metadata: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub preemptible: bool,
    pub provisioning_model: Option<String>,
    pub physical_host: Option<String>,
    /// Start of the next scheduled host maintenance.
    pub upcoming_maintenance: Option<DateTime<FixedOffset>>,
}

impl Instance {
    /// Returns `None` for instances that were not created by this system.
    pub fn from_value(value: &Value) -> Option<Self> {
        let metadata: BTreeMap<String, String> = value["metadata"]["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some((
                            item["key"].as_str()?.to_string(),
                            item["value"].as_str().unwrap_or_default().to_string(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let role = metadata.get("slurm_instance_role")?.clone();
        let text = |value: &Value| value.as_str().map(|s| s.to_string());
        Some(Instance {
            name: text(&value["name"])?,
            status: InstanceStatus::parse(value["status"].as_str().unwrap_or_default()),
            zone: trim_self_link(value["zone"].as_str().unwrap_or_default()).to_string(),
            machine_type: trim_self_link(value["machineType"].as_str().unwrap_or_default())
                .to_string(),
            creation_timestamp: value["creationTimestamp"]
                .as_str()
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok()),
            role,
            metadata,
            labels: serde_json::from_value(value["labels"].clone()).unwrap_or_default(),
            preemptible: value["scheduling"]["preemptible"].as_bool().unwrap_or(false),
            provisioning_model: text(&value["scheduling"]["provisioningModel"]),
            physical_host: text(&value["resourceStatus"]["physicalHost"]),
            upcoming_maintenance: value["resourceStatus"]["upcomingMaintenance"]
                ["windowStartTime"]
                .as_str()
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok()),
        })
    }

    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.creation_timestamp
            .map(|created| now.signed_duration_since(created))
    }

    pub fn is_preemptible(&self) -> bool {
        self.preemptible || self.provisioning_model.as_deref() == Some("SPOT")
    }
}

/// A Cloud TPU node, named like the Slurm node of its first VM.
#[derive(Debug, Clone)]
pub struct TpuNode {
    pub name: String,
    pub state: String,
    pub preemptible: bool,
    pub ip_addresses: Vec<String>,
}

impl TpuNode {
    pub fn from_value(value: &Value) -> Option<Self> {
        Some(TpuNode {
            name: trim_self_link(value["name"].as_str()?).to_string(),
            state: value["state"].as_str().unwrap_or_default().to_string(),
            preemptible: value["schedulingConfig"]["preemptible"]
                .as_bool()
                .unwrap_or(false),
            ip_addresses: value["networkEndpoints"]
                .as_array()
                .map(|endpoints| {
                    endpoints
                        .iter()
                        .filter_map(|e| e["ipAddress"].as_str().map(|ip| ip.to_string()))
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub guest_cpus: u32,
    pub memory_mb: u64,
    pub gpu_type: Option<String>,
    pub gpu_count: u32,
}

impl MachineInfo {
    fn from_value(value: &Value) -> Self {
        let accelerator = &value["accelerators"][0];
        MachineInfo {
            guest_cpus: value["guestCpus"].as_u64().unwrap_or(0) as u32,
            memory_mb: value["memoryMb"].as_u64().unwrap_or(0),
            gpu_type: accelerator["guestAcceleratorType"]
                .as_str()
                .map(|s| s.to_string()),
            gpu_count: accelerator["guestAcceleratorCount"].as_u64().unwrap_or(0) as u32,
        }
    }
}

/// Instance template properties relevant for provisioning and `cloud.conf`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub name: String,
    pub link: String,
    pub machine_type: String,
    pub machine: MachineInfo,
    pub labels: BTreeMap<String, String>,
    pub disks: Vec<Value>,
    pub threads_per_core: Option<u32>,
    pub gpu_type: Option<String>,
    pub gpu_count: u32,
}

impl TemplateInfo {
    /// `n2-standard-4` -> `n2`
    pub fn family(&self) -> &str {
        self.machine_type
            .split('-')
            .next()
            .unwrap_or(&self.machine_type)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReservationDetails {
    pub project: String,
    pub zone: String,
    pub name: String,
    pub policies: Vec<String>,
    pub dense: bool,
    pub calendar: bool,
}

impl ReservationDetails {
    fn from_value(project: &str, zone: &str, name: &str, value: &Value) -> Self {
        let policies = value["resourcePolicies"]
            .as_object()
            .map(|policies| {
                policies
                    .values()
                    .filter_map(|link| link.as_str())
                    .map(|link| trim_self_link(link).to_string())
                    .collect()
            })
            .unwrap_or_default();
        ReservationDetails {
            project: project.to_string(),
            zone: zone.to_string(),
            name: name.to_string(),
            policies,
            dense: value["deploymentType"].as_str() == Some("DENSE"),
            calendar: value["reservationMode"].as_str() == Some("CALENDAR"),
        }
    }

    /// Name accepted by `reservationAffinity` of a bulk insert.
    pub fn bulk_insert_name(&self) -> String {
        format!("projects/{}/reservations/{}", self.project, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FutureReservation {
    pub project: String,
    pub zone: String,
    pub name: String,
    pub specific: bool,
    pub calendar: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub active_reservation: Option<ReservationDetails>,
}

impl FutureReservation {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start_time < now && now < self.end_time
    }
}

/// Reference to the nodeset a node belongs to.
#[derive(Debug, Clone, Copy)]
pub enum NodesetRef<'a> {
    Regular(&'a NodesetConfig),
    Tpu(&'a TpuNodesetConfig),
    Dynamic(&'a DynNodesetConfig),
}

pub struct Inventory {
    config: Rc<ClusterConfig>,
    executor: BatchExecutor,
    scheduler: Scheduler,
    cache: Box<dyn Cache>,
    instances: OnceCell<BTreeMap<String, Instance>>,
    slurm_nodes: OnceCell<BTreeMap<String, NodeState>>,
    jobs: OnceCell<Vec<JobInfo>>,
    machine_types: OnceCell<BTreeMap<String, MachineInfo>>,
    templates: RefCell<Map<String, Rc<TemplateInfo>>>,
    tpu_nodes: RefCell<Map<String, Rc<BTreeMap<String, TpuNode>>>>,
    future_reservations: RefCell<Map<String, Rc<FutureReservation>>>,
}

impl Inventory {
    pub fn new(
        config: Rc<ClusterConfig>,
        executor: BatchExecutor,
        scheduler: Scheduler,
        cache: Box<dyn Cache>,
    ) -> Self {
        Inventory {
            config,
            executor,
            scheduler,
            cache,
            instances: OnceCell::new(),
            slurm_nodes: OnceCell::new(),
            jobs: OnceCell::new(),
            machine_types: OnceCell::new(),
            templates: Default::default(),
            tpu_nodes: Default::default(),
            future_reservations: Default::default(),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    fn project(&self) -> &str {
        &self.config.project
    }

    /// Instances of this cluster that carry the role metadata.
    pub async fn instances(&self) -> crate::Result<&BTreeMap<String, Instance>> {
        self.instances
            .get_or_try_init(|| async {
                let cluster = &self.config.slurm_cluster_name;
                let request = ComputeRequest::instances_aggregated_list(self.project())
                    .with_filter(format!(
                        "labels.slurm_cluster_name={cluster} AND name:{cluster}-*"
                    ));
                let pages = self.executor.list_pages(request).await?;
                let mut instances = BTreeMap::new();
                for page in &pages {
                    let Some(scopes) = page["items"].as_object() else {
                        continue;
                    };
                    for instance in scopes
                        .values()
                        .filter_map(|scope| scope["instances"].as_array())
                        .flatten()
                        .filter_map(Instance::from_value)
                    {
                        instances.insert(instance.name.clone(), instance);
                    }
                }
                log::debug!("Found {} instances", instances.len());
                Ok::<_, SyncError>(instances)
            })
            .await
    }

    pub async fn instance(&self, name: &str) -> crate::Result<Option<&Instance>> {
        Ok(self.instances().await?.get(name))
    }

    pub async fn slurm_nodes(&self) -> crate::Result<&BTreeMap<String, NodeState>> {
        self.slurm_nodes
            .get_or_try_init(|| async { Ok::<_, SyncError>(self.scheduler.show_nodes().await?) })
            .await
    }

    pub async fn slurm_node(&self, name: &str) -> crate::Result<Option<&NodeState>> {
        Ok(self.slurm_nodes().await?.get(name))
    }

    pub async fn jobs(&self) -> crate::Result<&[JobInfo]> {
        let jobs = self
            .jobs
            .get_or_try_init(|| async { Ok::<_, SyncError>(self.scheduler.show_jobs().await?) })
            .await?;
        Ok(jobs.as_slice())
    }

    pub async fn job(&self, job_id: u64) -> crate::Result<Option<&JobInfo>> {
        Ok(self.jobs().await?.iter().find(|job| job.job_id == job_id))
    }

    pub fn nodeset_ref(&self, node: &str) -> crate::Result<NodesetRef<'_>> {
        let name = parse_node_name(node)?.nodeset;
        if let Some(nodeset) = self.config.nodeset.get(&name) {
            Ok(NodesetRef::Regular(nodeset))
        } else if let Some(nodeset) = self.config.nodeset_tpu.get(&name) {
            Ok(NodesetRef::Tpu(nodeset))
        } else if let Some(nodeset) = self.config.nodeset_dyn.get(&name) {
            Ok(NodesetRef::Dynamic(nodeset))
        } else {
            error(format!("Nodeset {name} of node {node} is not configured"))
        }
    }

    pub fn node_nodeset(&self, node: &str) -> crate::Result<&NodesetConfig> {
        match self.nodeset_ref(node)? {
            NodesetRef::Regular(nodeset) => Ok(nodeset),
            _ => error(format!("Node {node} does not belong to a regular nodeset")),
        }
    }

    pub fn node_tpu_nodeset(&self, node: &str) -> crate::Result<&TpuNodesetConfig> {
        match self.nodeset_ref(node)? {
            NodesetRef::Tpu(nodeset) => Ok(nodeset),
            _ => error(format!("Node {node} does not belong to a TPU nodeset")),
        }
    }

    pub fn node_is_tpu(&self, node: &str) -> bool {
        matches!(self.nodeset_ref(node), Ok(NodesetRef::Tpu(_)))
    }

    pub fn node_is_dyn(&self, node: &str) -> bool {
        matches!(self.nodeset_ref(node), Ok(NodesetRef::Dynamic(_)))
    }

    pub fn node_is_flex(&self, node: &str) -> bool {
        matches!(self.nodeset_ref(node), Ok(NodesetRef::Regular(ns)) if ns.is_flex())
    }

    pub fn node_uses_mig_slices(&self, node: &str) -> bool {
        matches!(self.nodeset_ref(node), Ok(NodesetRef::Regular(ns)) if ns.uses_mig_slices())
    }

    fn node_counts(&self, node: &str) -> Option<(u32, u32)> {
        match self.nodeset_ref(node).ok()? {
            NodesetRef::Regular(ns) => Some((ns.node_count_static, ns.node_count_dynamic_max)),
            NodesetRef::Tpu(ns) => Some((ns.node_count_static, ns.node_count_dynamic_max)),
            NodesetRef::Dynamic(_) => None,
        }
    }

    /// Node of a regular or TPU nodeset within its configured size.
    pub fn is_power_managed_node(&self, node: &str) -> bool {
        match (self.node_counts(node), node_index(node)) {
            (Some((static_count, dynamic_count)), Ok(index)) => {
                index < static_count + dynamic_count
            }
            _ => false,
        }
    }

    pub fn is_static_node(&self, node: &str) -> bool {
        match (self.node_counts(node), node_index(node)) {
            (Some((static_count, _)), Ok(index)) => index < static_count,
            _ => false,
        }
    }

    pub fn node_prefix(&self, node: &str) -> crate::Result<String> {
        Ok(parse_node_name(node)?.prefix)
    }

    pub fn node_region(&self, node: &str) -> crate::Result<String> {
        let nodeset = self.node_nodeset(node)?;
        nodeset.region().ok_or_else(|| {
            SyncError::ConfigError(format!(
                "Cannot determine region of nodeset {}",
                nodeset.nodeset_name
            ))
        })
    }

    pub fn node_template(&self, node: &str) -> crate::Result<&str> {
        Ok(&self.node_nodeset(node)?.instance_template)
    }

    /// Names of static and dynamic nodes of a nodeset.
    pub fn nodenames(
        &self,
        nodeset: &str,
        static_count: u32,
        dynamic_count: u32,
    ) -> (Vec<String>, Vec<String>) {
        let prefix = self.config.nodeset_prefix(nodeset);
        (
            (0..static_count).map(|i| format!("{prefix}-{i}")).collect(),
            (static_count..static_count + dynamic_count)
                .map(|i| format!("{prefix}-{i}"))
                .collect(),
        )
    }

    /// Groups nodes by their nodeset name, invalid names are logged and dropped.
    pub fn nodeset_map<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a String>,
    ) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in nodes {
            match parse_node_name(node) {
                Ok(desc) => map.entry(desc.nodeset).or_default().push(node.clone()),
                Err(error) => log::error!("{error}"),
            }
        }
        map
    }

    async fn machine_types(&self) -> crate::Result<&BTreeMap<String, MachineInfo>> {
        self.machine_types
            .get_or_try_init(|| async {
                let request = ComputeRequest::machine_types_aggregated_list(self.project());
                let pages = self.executor.list_pages(request).await?;
                let mut machines = BTreeMap::new();
                for machine in pages
                    .iter()
                    .filter_map(|page| page["items"].as_object())
                    .flat_map(|scopes| scopes.values())
                    .filter_map(|scope| scope["machineTypes"].as_array())
                    .flatten()
                {
                    if let Some(name) = machine["name"].as_str() {
                        machines
                            .entry(name.to_string())
                            .or_insert_with(|| MachineInfo::from_value(machine));
                    }
                }
                Ok::<_, SyncError>(machines)
            })
            .await
    }

    pub async fn machine_type(&self, machine_type: &str) -> crate::Result<MachineInfo> {
        if let Some(captures) = CUSTOM_MACHINE_REGEX.captures(machine_type) {
            return Ok(MachineInfo {
                guest_cpus: captures["cpus"].parse().unwrap_or(0),
                memory_mb: captures["mem"].parse().unwrap_or(0),
                ..Default::default()
            });
        }
        match self.machine_types().await?.get(machine_type) {
            Some(info) => Ok(info.clone()),
            None => error(format!("Machine type {machine_type} not found")),
        }
    }

    /// Template properties, cached on disk by template name.
    pub async fn template_info(&self, template_link: &str) -> crate::Result<Rc<TemplateInfo>> {
        let name = trim_self_link(template_link).to_string();
        if let Some(info) = self.templates.borrow().get(&name) {
            return Ok(info.clone());
        }
        let info = match self.cache.get::<TemplateInfo>(&name) {
            Some(info) => info,
            None => {
                let info = self.fetch_template(template_link, &name).await?;
                self.cache.set(&name, &info);
                info
            }
        };
        let info = Rc::new(info);
        self.templates.borrow_mut().insert(name, info.clone());
        Ok(info)
    }

    async fn fetch_template(&self, link: &str, name: &str) -> crate::Result<TemplateInfo> {
        let parsed = parse_self_link(link);
        let project = parsed.project.as_deref().unwrap_or(self.project());
        let request = if link.contains("/regions/") {
            let region = parsed.region.as_deref().unwrap_or_default();
            ComputeRequest::region_instance_template_get(project, region, name)
        } else {
            ComputeRequest::instance_template_get(project, name)
        };
        let template = self.executor.ensure_execute(&request).await?;
        let properties = &template["properties"];
        let machine_type = properties["machineType"]
            .as_str()
            .map(|t| trim_self_link(t).to_string())
            .ok_or_else(|| {
                SyncError::ConfigError(format!("Instance template {name} has no machine type"))
            })?;
        let machine = self.machine_type(&machine_type).await?;
        let (gpu_type, gpu_count) = if machine.gpu_count > 0 {
            (machine.gpu_type.clone(), machine.gpu_count)
        } else {
            let accelerator = &properties["guestAccelerators"][0];
            (
                accelerator["acceleratorType"].as_str().map(|s| s.to_string()),
                accelerator["acceleratorCount"].as_u64().unwrap_or(0) as u32,
            )
        };
        Ok(TemplateInfo {
            name: name.to_string(),
            link: link.to_string(),
            machine_type,
            machine,
            labels: serde_json::from_value(properties["labels"].clone()).unwrap_or_default(),
            disks: properties["disks"].as_array().cloned().unwrap_or_default(),
            threads_per_core: properties["advancedMachineFeatures"]["threadsPerCore"]
                .as_u64()
                .map(|t| t as u32),
            gpu_type,
            gpu_count,
        })
    }

    /// Reservation configured for the nodeset. Requires exactly one allowed zone.
    pub async fn nodeset_reservation(
        &self,
        nodeset: &NodesetConfig,
    ) -> crate::Result<Option<ReservationDetails>> {
        let Some(reservation) = nodeset.reservation_name.as_deref() else {
            return Ok(None);
        };
        let (project, name) = match reservation.split('/').collect::<Vec<_>>().as_slice() {
            ["projects", project, "reservations", name] => (project.to_string(), name.to_string()),
            _ => {
                return Err(SyncError::ConfigError(format!(
                    "Invalid reservation name: '{reservation}', expected format is 'projects/PROJECT/reservations/NAME'"
                )));
            }
        };
        let zones = nodeset.zones();
        let [zone] = zones.as_slice() else {
            return Err(SyncError::ConfigError(format!(
                "Only one zone is supported when using a reservation, nodeset {} has {}",
                nodeset.nodeset_name,
                zones.len()
            )));
        };
        let value = self
            .executor
            .ensure_execute(&ComputeRequest::reservation_get(&project, zone, &name))
            .await?;
        Ok(Some(ReservationDetails::from_value(&project, zone, &name, &value)))
    }

    pub async fn future_reservation(
        &self,
        nodeset: &NodesetConfig,
    ) -> crate::Result<Option<Rc<FutureReservation>>> {
        let Some(link) = nodeset.future_reservation.as_deref() else {
            return Ok(None);
        };
        if let Some(fr) = self.future_reservations.borrow().get(link) {
            return Ok(Some(fr.clone()));
        }
        let parsed = parse_self_link(link);
        let (Some(project), Some(zone)) = (parsed.project, parsed.zone) else {
            return Err(SyncError::ConfigError(format!(
                "Invalid future reservation: '{link}', expected 'projects/PROJECT/zones/ZONE/futureReservations/NAME'"
            )));
        };
        let value = self
            .executor
            .ensure_execute(&ComputeRequest::future_reservation_get(
                &project,
                &zone,
                &parsed.name,
            ))
            .await?;
        let time = |key: &str| -> crate::Result<DateTime<Utc>> {
            let text = value["timeWindow"][key].as_str().unwrap_or_default();
            DateTime::parse_from_rfc3339(text)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    SyncError::DeserializationError(format!(
                        "Invalid {key} '{text}' of future reservation {}: {e}",
                        parsed.name
                    ))
                })
        };
        let mut fr = FutureReservation {
            project: project.clone(),
            zone: zone.clone(),
            name: parsed.name.clone(),
            specific: value["specificReservationRequired"].as_bool().unwrap_or(false),
            calendar: value["reservationMode"].as_str() == Some("CALENDAR"),
            start_time: time("startTime")?,
            end_time: time("endTime")?,
            active_reservation: None,
        };
        if fr.is_active(Utc::now()) {
            if let Some(created) = value["status"]["autoCreatedReservations"][0].as_str() {
                let reservation = parse_self_link(created);
                let project = reservation.project.unwrap_or(project);
                let zone = reservation.zone.unwrap_or(zone);
                let details = self
                    .executor
                    .ensure_execute(&ComputeRequest::reservation_get(
                        &project,
                        &zone,
                        &reservation.name,
                    ))
                    .await?;
                fr.active_reservation = Some(ReservationDetails::from_value(
                    &project,
                    &zone,
                    &reservation.name,
                    &details,
                ));
            }
        }
        let fr = Rc::new(fr);
        self.future_reservations
            .borrow_mut()
            .insert(link.to_string(), fr.clone());
        Ok(Some(fr))
    }

    /// TPU nodes in a zone, keyed by name.
    pub async fn tpu_nodes(&self, zone: &str) -> crate::Result<Rc<BTreeMap<String, TpuNode>>> {
        if let Some(nodes) = self.tpu_nodes.borrow().get(zone) {
            return Ok(nodes.clone());
        }
        let pages = self
            .executor
            .list_pages(ComputeRequest::tpu_nodes_list(self.project(), zone))
            .await?;
        let nodes: BTreeMap<String, TpuNode> = pages
            .iter()
            .filter_map(|page| page["nodes"].as_array())
            .flatten()
            .filter_map(TpuNode::from_value)
            .map(|node| (node.name.clone(), node))
            .collect();
        let nodes = Rc::new(nodes);
        self.tpu_nodes
            .borrow_mut()
            .insert(zone.to_string(), nodes.clone());
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::{TestEnv, instance_json};
    use serde_json::json;

    #[test]
    fn parse_names() {
        let desc = parse_node_name("hpc-gpu-large-12").unwrap();
        assert_eq!(desc.prefix, "hpc-gpu-large");
        assert_eq!(desc.cluster, "hpc");
        assert_eq!(desc.nodeset, "gpu-large");
        assert_eq!(desc.index(), Some(12));

        let desc = parse_node_name("hpc-n-3.c.proj.internal").unwrap();
        assert_eq!(desc.nodeset, "n");
        assert_eq!(parse_node_name("hpc-n-[0-3]").unwrap().suffix, "[0-3]");
        assert!(matches!(
            parse_node_name("login"),
            Err(SyncError::NamingError(_))
        ));
    }

    #[test]
    fn power_managed_nodes() {
        let env = TestEnv::new();
        let inventory = env.ctx.inventory();
        // nodeset `n` has 2 static and 4 dynamic nodes
        assert!(inventory.is_power_managed_node("hpc-n-0"));
        assert!(inventory.is_power_managed_node("hpc-n-5"));
        assert!(!inventory.is_power_managed_node("hpc-n-6"));
        assert!(!inventory.is_power_managed_node("hpc-unknown-0"));
        assert!(!inventory.is_power_managed_node("hpc-dyn-0"));
        assert!(inventory.is_static_node("hpc-n-1"));
        assert!(!inventory.is_static_node("hpc-n-2"));
        assert!(inventory.node_is_dyn("hpc-dyn-0"));
        assert_eq!(inventory.node_region("hpc-n-0").unwrap(), "us-central1");
    }

    #[tokio::test]
    async fn list_instances() {
        let env = TestEnv::with_handler(|request| match request.method_id {
            "compute.instances.aggregatedList" => Ok(match request.query_value("pageToken") {
                None => json!({
                    "items": {
                        "zones/us-central1-a": {"instances": [
                            instance_json("hpc-n-0", "RUNNING"),
                            {"name": "hpc-n-9", "status": "RUNNING", "zone": "zones/us-central1-a"}
                        ]},
                        "zones/us-central1-b": {"warning": {"code": "NO_RESULTS_ON_PAGE"}}
                    },
                    "nextPageToken": "next"
                }),
                _ => json!({"items": {"zones/us-central1-b": {"instances": [
                    instance_json("hpc-n-1", "TERMINATED")
                ]}}}),
            }),
            _ => Err(gce::ApiError::not_found("unexpected")),
        });
        let inventory = env.ctx.inventory();
        let instances = inventory.instances().await.unwrap();
        assert_eq!(instances.keys().collect::<Vec<_>>(), vec!["hpc-n-0", "hpc-n-1"]);
        let instance = &instances["hpc-n-1"];
        assert_eq!(instance.status, InstanceStatus::Terminated);
        assert_eq!(instance.zone, "us-central1-a");
        assert_eq!(instance.role, "compute");

        let request = &env.transport.requests()[0];
        assert_eq!(
            request.query_value("filter"),
            Some("labels.slurm_cluster_name=hpc AND name:hpc-*")
        );
        // cached for the invocation
        inventory.instances().await.unwrap();
        assert_eq!(env.transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn template_info_is_cached() {
        let env = TestEnv::with_handler(|request| match request.method_id {
            "compute.instanceTemplates.get" => Ok(json!({"properties": {
                "machineType": "a2-highgpu-2g",
                "labels": {"team": "x"},
                "disks": [{"initializeParams": {"diskType": "pd-ssd"}}],
            }})),
            "compute.machineTypes.aggregatedList" => Ok(json!({"items": {"zones/z": {"machineTypes": [
                {"name": "a2-highgpu-2g", "guestCpus": 24, "memoryMb": 174080,
                 "accelerators": [{"guestAcceleratorType": "nvidia-tesla-a100", "guestAcceleratorCount": 2}]}
            ]}}})),
            _ => Err(gce::ApiError::not_found("unexpected")),
        });
        let info = env
            .ctx
            .inventory()
            .template_info("projects/proj/global/instanceTemplates/tpl")
            .await
            .unwrap();
        assert_eq!(info.family(), "a2");
        assert_eq!(info.gpu_count, 2);
        assert_eq!(info.machine.guest_cpus, 24);

        // a new invocation reads the file cache
        let requests = env.transport.requests().len();
        let other = env.reopen();
        let cached = other
            .ctx
            .inventory()
            .template_info("projects/proj/global/instanceTemplates/tpl")
            .await
            .unwrap();
        assert_eq!(cached, info);
        assert_eq!(env.transport.requests().len(), requests);
    }

    #[tokio::test]
    async fn custom_machine_type() {
        let env = TestEnv::new();
        let info = env
            .ctx
            .inventory()
            .machine_type("n2-custom-8-16384")
            .await
            .unwrap();
        assert_eq!(info.guest_cpus, 8);
        assert_eq!(info.memory_mb, 16384);
        assert!(env.transport.requests().is_empty());
    }
}
