//! Deprovisioning of nodes released by the Slurm `SuspendProgram`.

use std::collections::BTreeMap;

use gce::{ComputeRequest, Operation};

use crate::common::hostlist::{compress_hostlist, expand_hostlist};
use crate::common::utils::separate;
use crate::context::Context;
use crate::mig;
use crate::opswatch::DeleteOpTopic;
use crate::tpu;

/// Deletes instances backing `nodes` and hands the operations over to the reconciliation loop.
pub async fn delete_instances(ctx: &Context, nodes: &[String]) -> crate::Result<()> {
    let mut requests = Vec::new();
    let mut missing = Vec::new();
    for node in nodes {
        match ctx.inventory().instance(node).await? {
            Some(instance) => requests.push((
                node.clone(),
                ComputeRequest::instance_delete(ctx.project(), &instance.zone, node),
            )),
            None => missing.push(node.as_str()),
        }
    }
    if !missing.is_empty() {
        log::debug!("instances do not exist: {}", compress_hostlist(&missing));
    }
    if requests.is_empty() {
        log::debug!("No instances to delete");
        return Ok(());
    }

    log::info!(
        "to delete {} instances ({})",
        requests.len(),
        compress_hostlist(requests.iter().map(|(node, _)| node))
    );
    let (done, failed) = ctx.executor().batch_execute(requests).await;

    let mut failures: BTreeMap<String, Vec<&String>> = BTreeMap::new();
    for (node, (_, error)) in &failed {
        failures.entry(error.describe()).or_default().push(node);
    }
    for (reason, nodes) in failures {
        log::error!(
            "{} instances failed to delete: {reason} ({})",
            nodes.len(),
            compress_hostlist(nodes)
        );
    }

    log::info!(
        "deleting {} instances {}",
        done.len(),
        compress_hostlist(done.keys())
    );
    let topic = DeleteOpTopic::new(ctx);
    for (node, value) in done {
        let published = Operation::from_value(value)
            .map_err(crate::Error::from)
            .and_then(|operation| topic.publish(&operation, &node));
        if let Err(error) = published {
            log::error!("Cannot watch delete operation of {node}: {error}");
        }
    }
    Ok(())
}

fn log_failure(kind: &str, nodes: &[String], error: &crate::Error) {
    log::error!(
        "Suspend of {kind} nodes {} failed: {error}",
        compress_hostlist(nodes)
    );
}

pub async fn suspend_nodes(ctx: &Context, nodes: Vec<String>) -> crate::Result<()> {
    let inventory = ctx.inventory();
    let (tpu_nodes, nodes) = separate(nodes, |node| inventory.node_is_tpu(node));
    let (flex_nodes, nodes) = separate(nodes, |node| inventory.node_is_flex(node));
    let (slice_nodes, nodes) = separate(nodes, |node| inventory.node_uses_mig_slices(node));

    if !flex_nodes.is_empty() {
        if let Err(error) = mig::suspend_flex_nodes(ctx, &flex_nodes).await {
            log_failure("flex MIG", &flex_nodes, &error);
        }
    }
    if !slice_nodes.is_empty() {
        if let Err(error) = mig::suspend_slice_nodes(ctx, &slice_nodes).await {
            log_failure("MIG slice", &slice_nodes, &error);
        }
    }
    if let Err(error) = delete_instances(ctx, &nodes).await {
        log_failure("instance", &nodes, &error);
    }
    if !tpu_nodes.is_empty() {
        if let Err(error) = tpu::suspend_tpu_nodes(ctx, &tpu_nodes).await {
            log_failure("TPU", &tpu_nodes, &error);
        }
    }
    Ok(())
}

/// Entry point of the `SuspendProgram`.
pub async fn suspend(ctx: &Context, nodelist: &str) -> crate::Result<()> {
    let (nodes, other) = separate(expand_hostlist(nodelist)?, |node| {
        ctx.inventory().is_power_managed_node(node)
    });
    if !other.is_empty() {
        log::debug!(
            "Ignoring non-power-managed nodes '{}' from '{nodelist}'",
            compress_hostlist(&other)
        );
    }
    if nodes.is_empty() {
        log::debug!("No cloud nodes to suspend");
        return Ok(());
    }
    log::info!("suspend {nodelist}");
    suspend_nodes(ctx, nodes).await
}
