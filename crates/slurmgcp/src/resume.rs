//! Provisioning of nodes requested by the Slurm `ResumeProgram`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use gce::selflink::trim_self_link;
use gce::{ComputeRequest, Operation};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::common::config::{MAX_RUN_DURATION, NodesetConfig};
use crate::common::env::SLURM_RESUME_FILE;
use crate::common::error::SyncError;
use crate::common::hostlist::{compress_hostlist, expand_hostlist};
use crate::common::utils::{chunked, now, separate};
use crate::context::Context;
use crate::inventory::{ReservationDetails, node_index};
use crate::mig;
use crate::placement::{PlacementAndNodes, create_placements};
use crate::scheduler::JobInfo;
use crate::tpu;

/// Largest number of instances in one bulk insert.
pub const BULK_INSERT_LIMIT: usize = 5000;
/// Largest zonal managed instance group.
pub const ZONAL_MIG_SIZE_LIMIT: usize = 1000;

const MIN_RUN_DURATION: Duration = Duration::from_secs(30);
const RESERVATION_KEY: &str = "compute.googleapis.com/reservation-name";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResumeJob {
    pub job_id: u64,
    #[serde(default)]
    pub partition: Option<String>,
    /// Hostlist expression
    #[serde(default)]
    pub nodes_alloc: String,
}

/// Content of the file Slurm passes in `SLURM_RESUME_FILE`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResumeData {
    #[serde(default)]
    pub jobs: Vec<ResumeJob>,
}

impl ResumeData {
    pub fn parse(content: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        log::debug!("Resume data: {content}");
        Self::parse(&content)
    }

    pub fn from_env() -> Option<Self> {
        let Ok(path) = std::env::var(SLURM_RESUME_FILE) else {
            log::error!(
                "{SLURM_RESUME_FILE} was not in environment. Cannot get detailed job, node, partition allocation data."
            );
            return None;
        };
        match Self::load(Path::new(&path)) {
            Ok(data) => Some(data),
            Err(error) => {
                log::error!("Cannot read resume data from {path}: {error}");
                None
            }
        }
    }

    /// Jobs with expanded allocations, used to notify jobs about failed nodes.
    pub fn job_infos(&self) -> Vec<JobInfo> {
        self.jobs
            .iter()
            .map(|job| JobInfo {
                job_id: job.job_id,
                job_state: "CONFIGURING".to_string(),
                partition: job.partition.clone(),
                nodes: allocated_nodes(job),
                ..Default::default()
            })
            .collect()
    }
}

fn allocated_nodes(job: &ResumeJob) -> Vec<String> {
    if job.nodes_alloc.is_empty() {
        return Vec::new();
    }
    expand_hostlist(&job.nodes_alloc).unwrap_or_else(|error| {
        log::error!(
            "Invalid allocation {} of job {}: {error:?}",
            job.nodes_alloc,
            job.job_id
        );
        Vec::new()
    })
}

/// Seconds a DWS flex instance may run.
pub fn dws_run_duration(nodeset: &NodesetConfig, job: Option<&JobInfo>) -> u64 {
    let max = nodeset.dws_flex.max_run_duration;
    if !nodeset.dws_flex.use_job_duration {
        return max;
    }
    match job.and_then(|job| job.time_limit) {
        Some(limit)
            if limit >= MIN_RUN_DURATION && limit.as_secs() <= MAX_RUN_DURATION =>
        {
            limit.as_secs()
        }
        limit => {
            log::info!(
                "Job time limit {limit:?} is not usable as run duration, using {max}s of nodeset {}",
                nodeset.nodeset_name
            );
            max
        }
    }
}

/// Nodes inserted by a single request.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkChunk {
    pub nodes: Vec<String>,
    pub prefix: String,
    pub job_id: Option<u64>,
    pub placement: Option<String>,
    pub index: usize,
}

impl BulkChunk {
    pub fn name(&self) -> String {
        let job = self.job_id.unwrap_or(0);
        match (&self.placement, self.job_id) {
            (Some(placement), _) => format!("{}:job{job}:{placement}:{}", self.prefix, self.index),
            (None, Some(_)) => format!("{}:job{job}:{}", self.prefix, self.index),
            (None, None) => format!("{}:{}", self.prefix, self.index),
        }
    }
}

fn chunk_limit(ctx: &Context, model: &str) -> usize {
    let inventory = ctx.inventory();
    if inventory.node_is_flex(model) {
        ZONAL_MIG_SIZE_LIMIT
    } else if let Ok(nodeset) = inventory.node_tpu_nodeset(model) {
        nodeset.vmcount() as usize
    } else {
        BULK_INSERT_LIMIT
    }
}

/// Groups nodes by exclusive job and placement group, split into chunks of one insert request.
pub async fn group_nodes_bulk(
    ctx: &Context,
    nodes: &[String],
    resume_data: &ResumeData,
) -> crate::Result<Vec<BulkChunk>> {
    let requested: BTreeSet<&String> = nodes.iter().collect();
    let mut non_exclusive: BTreeSet<String> = nodes.iter().cloned().collect();
    let mut groups = Vec::new();
    for job in &resume_data.jobs {
        let exclusive = job
            .partition
            .as_ref()
            .and_then(|partition| ctx.config().partitions.get(partition))
            .is_some_and(|partition| partition.enable_job_exclusive);
        if !exclusive {
            continue;
        }
        let allocation = allocated_nodes(job);
        if !allocation.iter().any(|node| requested.contains(node)) {
            continue;
        }
        for node in &allocation {
            non_exclusive.remove(node);
        }
        // Placement groups span the whole allocation, only the requested nodes are resumed
        let placements = create_placements(ctx, &allocation, Some(job.job_id))
            .await?
            .into_iter()
            .map(|placement| PlacementAndNodes {
                placement: placement.placement,
                nodes: placement
                    .nodes
                    .into_iter()
                    .filter(|node| requested.contains(node))
                    .collect(),
            })
            .filter(|placement| !placement.nodes.is_empty())
            .collect();
        groups.push((Some(job.job_id), placements));
    }
    let non_exclusive: Vec<String> = non_exclusive.into_iter().collect();
    groups.push((None, create_placements(ctx, &non_exclusive, None).await?));

    let mut chunks = Vec::new();
    for (job_id, placements) in groups {
        for placement in placements {
            let mut by_prefix: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for node in placement.nodes {
                match ctx.inventory().node_prefix(&node) {
                    Ok(prefix) => by_prefix.entry(prefix).or_default().push(node),
                    Err(error) => log::error!("Cannot resume {node}: {error}"),
                }
            }
            for (prefix, nodes) in by_prefix {
                let limit = chunk_limit(ctx, &nodes[0]);
                for (index, nodes) in chunked(&nodes, limit).into_iter().enumerate() {
                    chunks.push(BulkChunk {
                        nodes,
                        prefix: prefix.clone(),
                        job_id,
                        placement: placement.placement.clone(),
                        index,
                    });
                }
            }
        }
    }
    Ok(chunks)
}

fn update_reservation_props(
    props: &mut Value,
    reservation: &ReservationDetails,
    placement: Option<&str>,
    calendar: bool,
) {
    props["reservationAffinity"] = json!({
        "consumeReservationType": "SPECIFIC_RESERVATION",
        "key": RESERVATION_KEY,
        "values": [reservation.bulk_insert_name()],
    });
    if reservation.dense || calendar {
        props["scheduling"]["provisioningModel"] = json!("RESERVATION_BOUND");
    }
    let policies: Vec<String> = if !reservation.policies.is_empty() {
        reservation.policies.clone()
    } else if let (true, Some(placement)) = (reservation.dense, placement) {
        vec![placement.to_string()]
    } else {
        Vec::new()
    };
    props["resourcePolicies"] = json!(policies);
}

/// `instanceProperties` of a bulk insert, the nodeset `instance_properties` override the rest.
async fn instance_properties(
    ctx: &Context,
    nodeset: &NodesetConfig,
    placement: Option<&str>,
    labels: &BTreeMap<String, String>,
    job: Option<&JobInfo>,
) -> crate::Result<Value> {
    let mut props = Value::Object(Map::new());
    if !labels.is_empty() {
        let template = ctx
            .inventory()
            .template_info(&nodeset.instance_template)
            .await?;
        let mut merged = template.labels.clone();
        merged.extend(labels.clone());
        props["labels"] = json!(merged);

        let mut disks = template.disks.clone();
        for disk in disks.iter_mut() {
            let Some(params) = disk.get_mut("initializeParams") else {
                continue;
            };
            if params["diskType"].as_str().map(trim_self_link).unwrap_or("local-ssd")
                == "local-ssd"
            {
                continue;
            }
            for (key, value) in labels {
                params["labels"][key] = json!(value);
            }
        }
        props["disks"] = Value::Array(disks);
    }

    if let Some(placement) = placement {
        props["resourcePolicies"] = json!([placement]);
    }
    if let Some(reservation) = ctx.inventory().nodeset_reservation(nodeset).await? {
        update_reservation_props(&mut props, &reservation, placement, reservation.calendar);
    }
    if let Some(fr) = ctx.inventory().future_reservation(nodeset).await? {
        if fr.specific {
            let Some(reservation) = fr.active_reservation.as_ref() else {
                return Err(SyncError::GenericError(format!(
                    "Future reservation {} has no active reservation",
                    fr.name
                )));
            };
            update_reservation_props(&mut props, reservation, placement, fr.calendar);
        }
    }

    if props["resourcePolicies"]
        .as_array()
        .is_some_and(|policies| !policies.is_empty())
    {
        props["scheduling"]["onHostMaintenance"] = json!("TERMINATE");
    }
    if let Some(interval) = nodeset.maintenance_interval.as_deref() {
        props["scheduling"]["maintenanceInterval"] = json!(interval);
    }
    if nodeset.dws_flex.enabled && nodeset.dws_flex.use_bulk_insert {
        props["scheduling"]["onHostMaintenance"] = json!("TERMINATE");
        props["scheduling"]["instanceTerminationAction"] = json!("DELETE");
        props["scheduling"]["maxRunDuration"] =
            json!({"seconds": dws_run_duration(nodeset, job)});
        props["reservationAffinity"] = json!({"consumeReservationType": "NO_RESERVATION"});
    }

    if let Some(overrides) = &nodeset.instance_properties {
        for (key, value) in overrides {
            props[key.as_str()] = value.clone();
        }
    }
    Ok(props)
}

/// Bulk insert request creating all nodes of the chunk.
pub async fn create_instances_request(
    ctx: &Context,
    chunk: &BulkChunk,
) -> crate::Result<ComputeRequest> {
    let model = &chunk.nodes[0];
    let nodeset = ctx.inventory().node_nodeset(model)?;
    let mut labels = BTreeMap::new();
    let job = match chunk.job_id {
        Some(job_id) => {
            labels.insert("slurm_job_id".to_string(), job_id.to_string());
            ctx.inventory().job(job_id).await?
        }
        None => None,
    };
    let properties =
        instance_properties(ctx, nodeset, chunk.placement.as_deref(), &labels, job).await?;

    let per_instance: Map<String, Value> = chunk
        .nodes
        .iter()
        .map(|node| (node.clone(), json!({})))
        .collect();
    let mut body = json!({
        "count": chunk.nodes.len(),
        "sourceInstanceTemplate": nodeset.instance_template,
        "perInstanceProperties": per_instance,
        "instanceProperties": properties,
    });
    if chunk.placement.is_none() || chunk.job_id.is_none() {
        body["minCount"] = json!(1);
    }

    let zones = nodeset.zones();
    if let [zone] = zones.as_slice() {
        return Ok(ComputeRequest::instances_bulk_insert(
            ctx.project(),
            zone,
            body,
        ));
    }
    let mut locations = Map::new();
    for zone in &zones {
        locations.insert(format!("zones/{zone}"), json!({"preference": "ALLOW"}));
    }
    for zone in &nodeset.zone_policy_deny {
        locations.insert(format!("zones/{zone}"), json!({"preference": "DENY"}));
    }
    body["locationPolicy"] = json!({
        "locations": locations,
        "targetShape": nodeset.zone_target_shape,
    });
    let region = ctx.inventory().node_region(model)?;
    Ok(ComputeRequest::region_instances_bulk_insert(
        ctx.project(),
        &region,
        body,
    ))
}

async fn failed_zonal_inserts(
    ctx: &Context,
    bulk: &Operation,
    zone: &str,
) -> crate::Result<Vec<Operation>> {
    let filter = format!(
        r#"(user eq "{}") AND (operationType eq "insert") AND (creationTimestamp > "{}") AND (creationTimestamp < "{}")"#,
        bulk.user.as_deref().unwrap_or_default(),
        bulk.start_time.as_deref().unwrap_or_default(),
        bulk.end_time.as_deref().unwrap_or_default(),
    );
    let pages = ctx
        .executor()
        .list_pages(ComputeRequest::zone_operations_list(ctx.project(), zone).with_filter(filter))
        .await?;
    Ok(pages
        .into_iter()
        .filter_map(|mut page| page["items"].as_array_mut().map(std::mem::take))
        .flatten()
        .filter_map(|op| Operation::from_value(op).ok())
        .filter(|op| op.operation_group_id == bulk.operation_group_id && op.has_error())
        .collect())
}

/// Reports nodes of a finished bulk insert that were not created.
async fn handle_bulk_insert_op(
    ctx: &Context,
    operation: &Operation,
    nodes: &[String],
    jobs: &[JobInfo],
) -> crate::Result<()> {
    if operation.has_error() {
        log::error!(
            "bulkInsert operation error: {} name={} operationGroupId={} nodes={}",
            operation.error_message(),
            operation.name,
            operation.operation_group_id.as_deref().unwrap_or("?"),
            compress_hostlist(nodes)
        );
    }
    let created = operation.created_vm_count() as usize;
    if created == nodes.len() {
        log::info!("created {created} instances: nodes={}", compress_hostlist(nodes));
        return Ok(());
    }

    let mut failures: BTreeMap<String, (String, Vec<String>)> = BTreeMap::new();
    for zone in operation.short_zones() {
        for op in failed_zonal_inserts(ctx, operation, &zone).await? {
            let Some(node) = op.target_name() else {
                continue;
            };
            let entry = failures
                .entry(op.error_codes())
                .or_insert_with(|| (op.error_message(), Vec::new()));
            entry.1.push(node.to_string());
        }
    }
    for (code, (message, failed)) in failures {
        log::error!(
            "{} instances failed to start: {code} ({})",
            failed.len(),
            compress_hostlist(&failed)
        );
        if code != "RESOURCE_ALREADY_EXISTS" {
            ctx.scheduler()
                .down_nodes_notify(&failed, &message, jobs)
                .await?;
        }
    }
    Ok(())
}

/// Whether the node belongs to a future reservation that cannot be used now.
async fn is_dormant_reservation_node(ctx: &Context, node: &str) -> crate::Result<bool> {
    let Ok(nodeset) = ctx.inventory().node_nodeset(node) else {
        return Ok(false);
    };
    Ok(ctx
        .inventory()
        .future_reservation(nodeset)
        .await?
        .is_some_and(|fr| !fr.is_active(now())))
}

/// Flex node whose instance is still owned by a MIG.
async fn is_provisioning_flex_node(ctx: &Context, node: &str) -> crate::Result<bool> {
    if !ctx.inventory().node_is_flex(node) {
        return Ok(false);
    }
    Ok(ctx
        .inventory()
        .instance(node)
        .await?
        .is_some_and(|instance| mig::managed_by(instance).is_some()))
}

/// Puts nodes of a group that could not be resumed down, other groups go on.
async fn fail_group(
    ctx: &Context,
    action: &str,
    nodes: &[String],
    error: &SyncError,
    jobs: &[JobInfo],
) {
    log::error!("{action} failed for {}: {error}", compress_hostlist(nodes));
    if let Err(error) = ctx
        .scheduler()
        .down_nodes_notify(nodes, &format!("GCP Error: {error}"), jobs)
        .await
    {
        log::error!("Cannot put nodes {} down: {error:?}", compress_hostlist(nodes));
    }
}

pub async fn resume_nodes(
    ctx: &Context,
    nodes: &[String],
    resume_data: &ResumeData,
) -> crate::Result<()> {
    let jobs = resume_data.job_infos();
    let scheduler = ctx.scheduler();

    let mut dormant = Vec::new();
    let mut provisioning = Vec::new();
    let mut remaining = Vec::new();
    for node in nodes {
        let checked = match is_dormant_reservation_node(ctx, node).await {
            Ok(true) => Ok(&mut dormant),
            Ok(false) => match is_provisioning_flex_node(ctx, node).await {
                Ok(true) => Ok(&mut provisioning),
                Ok(false) => Ok(&mut remaining),
                Err(error) => Err(error),
            },
            Err(error) => Err(error),
        };
        let target = match checked {
            Ok(target) => target,
            Err(error) => {
                fail_group(ctx, "Resume", std::slice::from_ref(node), &error, &jobs).await;
                continue;
            }
        };
        target.push(node.clone());
    }
    if !dormant.is_empty() {
        log::warn!(
            "Resume was unable to resume future reservation nodes={}",
            compress_hostlist(&dormant)
        );
        scheduler
            .down_nodes_notify(
                &dormant,
                "Reservation is not active, nodes cannot be resumed",
                &jobs,
            )
            .await?;
    }
    if !provisioning.is_empty() {
        log::warn!(
            "Resume was unable to resume nodes={} already managed by MIGs",
            compress_hostlist(&provisioning)
        );
        scheduler
            .down_nodes_notify(&provisioning, "VM is managed MIG, can not be resumed", &jobs)
            .await?;
    }

    let inventory = ctx.inventory();
    let (slices, mut remaining) = separate(remaining, |node| {
        inventory.node_uses_mig_slices(node) && !inventory.node_is_flex(node)
    });
    if !slices.is_empty() {
        if let Err(error) = mig::resume_slice_nodes(ctx, &slices, &jobs).await {
            fail_group(ctx, "Resume of MIG slices", &slices, &error, &jobs).await;
        }
    }
    if remaining.is_empty() {
        log::info!("No nodes to resume");
        return Ok(());
    }
    remaining.sort_by_cached_key(|node| {
        (
            inventory.node_prefix(node).unwrap_or_default(),
            node_index(node).unwrap_or(u32::MAX),
        )
    });

    let chunks = group_nodes_bulk(ctx, &remaining, resume_data).await?;
    if log::log_enabled!(log::Level::Debug) {
        for chunk in &chunks {
            log::debug!(
                "node bulk group {}: {}",
                chunk.name(),
                compress_hostlist(&chunk.nodes)
            );
        }
    }

    let mut tpu_chunks = Vec::new();
    let mut flex_chunks = Vec::new();
    let mut inserts = BTreeMap::new();
    for chunk in chunks {
        let model = &chunk.nodes[0];
        if inventory.node_is_tpu(model) {
            tpu_chunks.push(chunk);
        } else if inventory.node_is_flex(model) {
            flex_chunks.push(chunk);
        } else {
            inserts.insert(chunk.name(), chunk);
        }
    }

    for chunk in &flex_chunks {
        if let Err(error) = mig::resume_flex_chunk(ctx, &chunk.nodes, chunk.job_id, &jobs).await {
            fail_group(ctx, "Resume of flex MIG", &chunk.nodes, &error, &jobs).await;
        }
    }

    let mut requests = Vec::new();
    for (name, chunk) in &inserts {
        match create_instances_request(ctx, chunk).await {
            Ok(request) => requests.push((name.clone(), request)),
            Err(error) => {
                log::error!("Cannot create bulkInsert request for {name}: {error}");
                scheduler
                    .down_nodes_notify(&chunk.nodes, &format!("GCP Error: {error}"), &jobs)
                    .await?;
            }
        }
    }
    let (started, failed) = ctx.executor().batch_execute(requests).await;
    if !failed.is_empty() {
        log::error!(
            "bulkInsert API failures: {}",
            failed
                .iter()
                .map(|(name, (_, error))| format!("{name}: {error}"))
                .collect::<Vec<_>>()
                .join("; ")
        );
    }
    for (name, (_, error)) in &failed {
        if let Some(chunk) = inserts.get(name) {
            scheduler
                .down_nodes_notify(
                    &chunk.nodes,
                    &format!("GCP Error: {}", error.describe()),
                    &jobs,
                )
                .await?;
        }
    }
    for (name, value) in &started {
        log::debug!(
            "new bulkInsert operation started: group={name} name={} operationGroupId={}",
            value["name"].as_str().unwrap_or("?"),
            value["operationGroupId"].as_str().unwrap_or("?")
        );
    }
    let operations = ctx.wait_for_done(started).await;

    // TPUs are slower to start, regular nodes go first
    for chunk in &tpu_chunks {
        if let Err(error) = tpu::start_tpu(ctx, &chunk.nodes, &jobs).await {
            fail_group(ctx, "Resume of TPU", &chunk.nodes, &error, &jobs).await;
        }
    }

    for (name, result) in operations {
        let Some(chunk) = inserts.get(&name) else {
            continue;
        };
        match result {
            Ok(operation) => {
                if let Err(error) = handle_bulk_insert_op(ctx, &operation, &chunk.nodes, &jobs).await
                {
                    log::error!("Cannot check bulkInsert {name}: {error:?}");
                }
            }
            Err(error) => log::error!("Cannot wait for bulkInsert {name}: {error}"),
        }
    }
    Ok(())
}

/// Entry point of the `ResumeProgram`.
pub async fn resume(ctx: &Context, nodelist: &str) -> crate::Result<()> {
    let nodes = expand_hostlist(nodelist)?;
    let (nodes, other) = separate(nodes, |node| ctx.inventory().is_power_managed_node(node));
    if !other.is_empty() {
        log::error!(
            "Ignoring non-power-managed nodes '{}' from '{nodelist}'",
            compress_hostlist(&other)
        );
    }
    if nodes.is_empty() {
        log::info!("No nodes to resume");
        return Ok(());
    }
    log::info!("resume {}", compress_hostlist(&nodes));
    let resume_data = ResumeData::from_env().unwrap_or_default();
    resume_nodes(ctx, &nodes, &resume_data).await
}
