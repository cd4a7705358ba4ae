//! Cloud TPU nodes.
//!
//! A TPU node made of several VMs backs the same number of Slurm nodes and is
//! named after the first of them. The remaining Slurm nodes have no cloud
//! resource of their own.

use std::time::Duration;

use futures::future::join_all;
use gce::ComputeRequest;
use gce::backoff::Backoff;
use serde_json::{Value, json};

use crate::common::config::TpuNodesetConfig;
use crate::common::error::{SyncError, error};
use crate::common::hostlist::compress_hostlist;
use crate::context::Context;
use crate::inventory::{TpuNode, node_index};
use crate::scheduler::JobInfo;

const STARTUP_SCRIPT: &str = "startup.sh";
const MISSING_STARTUP_SCRIPT: &str =
    "#!/bin/bash\necho \"startup script not found\" > /var/log/startup_error.log\n";
const MAX_POLL: Duration = Duration::from_secs(30);

pub const STATE_READY: &str = "READY";
pub const STATE_STOPPED: &str = "STOPPED";

fn startup_script(ctx: &Context) -> String {
    let path = ctx.config().scripts_dir.join(STARTUP_SCRIPT);
    std::fs::read_to_string(&path).unwrap_or_else(|error| {
        log::warn!("Cannot read {}: {error}", path.display());
        MISSING_STARTUP_SCRIPT.to_string()
    })
}

/// `WORKER_0:node-0;WORKER_1:node-1`
fn slurm_names(nodes: &[String]) -> String {
    nodes
        .iter()
        .enumerate()
        .map(|(worker, node)| format!("WORKER_{worker}:{node}"))
        .collect::<Vec<_>>()
        .join(";")
}

fn create_body(ctx: &Context, nodeset: &TpuNodesetConfig, nodes: &[String]) -> crate::Result<Value> {
    let accelerator = &nodeset.accelerator_config;
    let mut body = if !accelerator.topology.is_empty() && !accelerator.version.is_empty() {
        json!({"acceleratorConfig": {
            "type": accelerator.version.to_uppercase(),
            "topology": accelerator.topology,
        }})
    } else if let Some(node_type) = nodeset.node_type.as_deref() {
        json!({"acceleratorType": node_type})
    } else {
        return Err(SyncError::ConfigError(format!(
            "TPU nodeset {} has neither node_type nor accelerator_config",
            nodeset.nodeset_name
        )));
    };

    let cluster = &ctx.config().slurm_cluster_name;
    let mut metadata = json!({
        "startup-script": startup_script(ctx),
        "slurm_instance_role": "compute",
        "slurm_cluster_name": cluster,
        "slurm_names": slurm_names(nodes),
    });
    if let Some(image) = nodeset.docker_image.as_deref() {
        metadata["slurm_docker_image"] = json!(image);
    }
    body["runtimeVersion"] = json!(format!("tpu-vm-tf-{}", nodeset.tf_version));
    body["metadata"] = metadata;
    body["tags"] = json!([cluster]);
    body["schedulingConfig"] = json!({
        "preemptible": nodeset.preemptible,
        "reserved": nodeset.reserved,
    });
    body["networkConfig"] = json!({
        "subnetwork": nodeset.subnetwork,
        "enableExternalIps": nodeset.enable_public_ip,
    });
    if let Some(account) = &nodeset.service_account {
        body["serviceAccount"] = json!({"email": account.email, "scope": account.scopes});
    }
    if !nodeset.data_disks.is_empty() {
        body["dataDisks"] = nodeset
            .data_disks
            .iter()
            .map(|disk| json!({"sourceDisk": disk, "mode": "DISK_MODE_UNSPECIFIED"}))
            .collect();
    }
    Ok(body)
}

/// Polls a TPU long running operation, returns its response.
async fn wait_tpu_operation(ctx: &Context, mut operation: Value) -> crate::Result<Value> {
    let Some(name) = operation["name"].as_str().map(|name| name.to_string()) else {
        return error(format!("TPU operation without a name: {operation}"));
    };
    let poll = Backoff::new(
        ctx.tunables().operation_poll,
        MAX_POLL.max(ctx.tunables().operation_poll),
        u32::MAX,
    );
    let mut attempt = 0;
    while !operation["done"].as_bool().unwrap_or(false) {
        tokio::time::sleep(poll.delay(attempt)).await;
        attempt += 1;
        operation = ctx
            .executor()
            .ensure_execute(&ComputeRequest::tpu_operation_get(&name))
            .await?;
    }
    if let Some(message) = operation["error"]["message"].as_str() {
        return error(format!("TPU operation {name} failed: {message}"));
    }
    Ok(operation["response"].take())
}

/// Runs a TPU request and waits until the node reaches `expected` state.
async fn execute_tpu_request(
    ctx: &Context,
    request: ComputeRequest,
    expected: &str,
) -> crate::Result<TpuNode> {
    let operation = ctx.executor().ensure_execute(&request).await?;
    let response = wait_tpu_operation(ctx, operation).await?;
    match TpuNode::from_value(&response) {
        Some(node) if node.state == expected => Ok(node),
        Some(node) => error(format!(
            "TPU node {} is {} instead of {expected}",
            node.name, node.state
        )),
        None => error(format!("Unexpected TPU operation response: {response}")),
    }
}

async fn register_nodes(ctx: &Context, nodes: &[String], tpu: &TpuNode) -> crate::Result<()> {
    if tpu.ip_addresses.len() < nodes.len() {
        log::warn!(
            "TPU node {} has {} endpoints for {} nodes",
            tpu.name,
            tpu.ip_addresses.len(),
            nodes.len()
        );
    }
    for (node, address) in nodes.iter().zip(&tpu.ip_addresses) {
        ctx.scheduler().update_node_addr(node, address).await?;
    }
    Ok(())
}

/// Creates (or starts a preserved) TPU node backing `nodes`.
pub async fn start_tpu(ctx: &Context, nodes: &[String], jobs: &[JobInfo]) -> crate::Result<()> {
    let Some(node_id) = nodes.first() else {
        return Ok(());
    };
    let nodeset = ctx.inventory().node_tpu_nodeset(node_id)?;
    let vmcount = nodeset.vmcount() as usize;
    if nodes.len() != vmcount {
        log::error!(
            "TPU nodeset {} needs {vmcount} nodes per TPU node, received {}",
            nodeset.nodeset_name,
            compress_hostlist(nodes)
        );
        ctx.scheduler()
            .down_nodes_notify(nodes, "Incomplete TPU node", jobs)
            .await?;
        return Ok(());
    }

    let existing = ctx
        .inventory()
        .tpu_nodes(&nodeset.zone)
        .await?
        .get(node_id)
        .cloned();
    let project = ctx.project();
    let result = match existing {
        None => {
            log::debug!(
                "Creating TPU node {node_id} of type {} with tf_version {} in zone {}",
                nodeset.node_type.as_deref().unwrap_or("?"),
                nodeset.tf_version,
                nodeset.zone
            );
            let body = create_body(ctx, nodeset, nodes)?;
            let request = ComputeRequest::tpu_node_create(project, &nodeset.zone, node_id, body);
            execute_tpu_request(ctx, request, STATE_READY).await
        }
        Some(tpu) if nodeset.preserve_tpu && tpu.state == STATE_STOPPED => {
            let request = ComputeRequest::tpu_node_start(project, &nodeset.zone, node_id);
            execute_tpu_request(ctx, request, STATE_READY).await
        }
        Some(tpu) => {
            log::info!("TPU node {node_id} already exists ({})", tpu.state);
            return Ok(());
        }
    };
    match result {
        Ok(tpu) => register_nodes(ctx, nodes, &tpu).await,
        Err(error) => {
            log::error!("Error starting TPU node {node_id}: {error}");
            ctx.scheduler()
                .down_nodes_notify(nodes, &format!("GCP Error: {}", error.api_reason()), jobs)
                .await?;
            Ok(())
        }
    }
}

/// Restarts a preempted single VM TPU node.
pub async fn restart_tpu(ctx: &Context, node: &str) -> crate::Result<()> {
    let nodeset = ctx.inventory().node_tpu_nodeset(node)?;
    let request = ComputeRequest::tpu_node_start(ctx.project(), &nodeset.zone, node);
    let tpu = execute_tpu_request(ctx, request, STATE_READY).await?;
    register_nodes(ctx, &[node.to_string()], &tpu).await
}

/// Whether a missing TPU node is expected, i.e. it is not the first VM of its TPU.
fn is_phantom(node: &str, vmcount: u32) -> bool {
    vmcount > 1 && node_index(node).is_ok_and(|index| index % vmcount != 0)
}

async fn suspend_tpu_node(
    ctx: &Context,
    nodeset: &TpuNodesetConfig,
    node: &str,
    exists: bool,
) -> crate::Result<()> {
    let vmcount = nodeset.vmcount();
    if !exists {
        if is_phantom(node, vmcount) {
            log::info!("Deleted TPU 'phantom' node {node}");
        } else if vmcount == 1 {
            log::error!("TPU single node {node} not found");
        } else {
            log::error!("TPU master node {node} not found");
        }
        return Ok(());
    }
    let project = ctx.project();
    if nodeset.preserve_tpu && vmcount == 1 {
        let request = ComputeRequest::tpu_node_stop(project, &nodeset.zone, node);
        execute_tpu_request(ctx, request, STATE_STOPPED).await?;
        log::info!("Stopped TPU node {node}");
        return Ok(());
    }
    let request = ComputeRequest::tpu_node_delete(project, &nodeset.zone, node);
    match ctx.executor().ensure_execute(&request).await {
        Ok(operation) => {
            wait_tpu_operation(ctx, operation).await?;
            log::info!("Deleted TPU node {node}");
        }
        Err(error) if error.is_not_found() => log::info!("TPU node {node} is already gone"),
        Err(error) => return Err(error.into()),
    }
    Ok(())
}

/// Stops preserved single VM TPU nodes and deletes the others.
pub async fn suspend_tpu_nodes(ctx: &Context, nodes: &[String]) -> crate::Result<()> {
    for (nodeset_name, nodes) in ctx.inventory().nodeset_map(nodes) {
        let Some(nodeset) = ctx.config().nodeset_tpu.get(&nodeset_name) else {
            log::error!("TPU nodeset {nodeset_name} is not configured");
            continue;
        };
        let existing = ctx.inventory().tpu_nodes(&nodeset.zone).await?;
        let results = join_all(nodes.iter().map(|node| {
            suspend_tpu_node(ctx, nodeset, node, existing.contains_key(node))
        }))
        .await;
        for (node, result) in nodes.iter().zip(results) {
            if let Err(error) = result {
                log::error!("Error suspending TPU node {node}: {error}");
            }
        }
    }
    Ok(())
}
