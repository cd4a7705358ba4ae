//! Periodic reconciliation of Slurm node states with cloud instances.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gce::ComputeRequest;

use crate::common::hostlist::compress_hostlist;
use crate::common::utils::{now, separate};
use crate::context::Context;
use crate::inventory::{FutureReservation, Instance, InstanceStatus, NodesetRef, TpuNode};
use crate::reconfigure::scripts::install_custom_scripts;
use crate::reconfigure::{reconfigure_slurm, topology};
use crate::scheduler::NodeState;
use crate::tpu::{STATE_READY, STATE_STOPPED};
use crate::{maintenance, mig, opswatch, placement, suspend, tpu};

/// What has to happen with a node to make Slurm and the cloud agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeStatus {
    /// Running instance unknown to Slurm or powered down in Slurm.
    Orphan,
    PowerDown,
    Preempted,
    /// Slurm believes the node is powered down, make it idle.
    Restore,
    /// Static node without an instance, power it up.
    Resume,
    Terminated,
    Unbacked,
    Down { reason: String },
    Unchanged,
    Unknown {
        slurm_state: Option<String>,
        instance_state: Option<String>,
    },
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Orphan => f.write_str("orphan"),
            NodeStatus::PowerDown => f.write_str("power_down"),
            NodeStatus::Preempted => f.write_str("preempted"),
            NodeStatus::Restore => f.write_str("restore"),
            NodeStatus::Resume => f.write_str("resume"),
            NodeStatus::Terminated => f.write_str("terminated"),
            NodeStatus::Unbacked => f.write_str("unbacked"),
            NodeStatus::Down { reason } => write!(f, "down ({reason})"),
            NodeStatus::Unchanged => f.write_str("unchanged"),
            NodeStatus::Unknown {
                slurm_state,
                instance_state,
            } => write!(
                f,
                "unknown (slurm state: {}, instance state: {})",
                slurm_state.as_deref().unwrap_or("none"),
                instance_state.as_deref().unwrap_or("none")
            ),
        }
    }
}

fn unknown(state: Option<&NodeState>, instance_state: Option<String>) -> NodeStatus {
    NodeStatus::Unknown {
        slurm_state: state.map(|state| state.to_string()),
        instance_state,
    }
}

/// Slurm side of a missing instance, shared by compute and TPU nodes.
fn classify_missing(state: &NodeState, is_static: bool, is_tpu: bool) -> NodeStatus {
    if !is_tpu && state.has("POWERING_UP") {
        return NodeStatus::Unchanged;
    }
    if state.is_down() && state.has("POWERED_DOWN") {
        return NodeStatus::Restore;
    }
    if state.has("POWERING_DOWN") {
        return NodeStatus::Restore;
    }
    if state.has("COMPLETING") {
        return NodeStatus::Unbacked;
    }
    if !state.is_down() && !state.has_power_flags() {
        return NodeStatus::Unbacked;
    }
    if is_tpu {
        return if is_static {
            NodeStatus::Resume
        } else {
            NodeStatus::Unchanged
        };
    }
    if state.is_down() && !state.has_power_flags() {
        return NodeStatus::PowerDown;
    }
    if state.has("POWERED_DOWN") && is_static {
        return NodeStatus::Resume;
    }
    NodeStatus::Unchanged
}

/// Classifies a compute node from its instance and Slurm state.
pub fn classify(
    instance: Option<&Instance>,
    state: Option<&NodeState>,
    is_static: bool,
    now: DateTime<Utc>,
    orphan_grace: Duration,
) -> NodeStatus {
    let powered_down = state.is_none_or(|state| state.has("POWERED_DOWN"));
    match (instance, state) {
        (None, None) => unknown(None, None),
        (None, Some(state)) => classify_missing(state, is_static, false),
        (Some(instance), Some(state))
            if !state.has("POWERED_DOWN")
                && !state.has("POWERING_DOWN")
                && instance.status == InstanceStatus::Terminated =>
        {
            if instance.is_preemptible() {
                NodeStatus::Preempted
            } else if !state.is_down() {
                NodeStatus::Terminated
            } else {
                NodeStatus::Unchanged
            }
        }
        (Some(instance), _) if powered_down && instance.status == InstanceStatus::Running => {
            let grace = chrono::Duration::from_std(orphan_grace).unwrap_or(chrono::TimeDelta::MAX);
            let young = instance.age(now).is_some_and(|age| age < grace);
            if young {
                log::info!(
                    "{} not marked as orphan, it started less than {orphan_grace:?} ago",
                    instance.name
                );
                NodeStatus::Unchanged
            } else {
                NodeStatus::Orphan
            }
        }
        (Some(instance), None) => unknown(None, Some(format!("{:?}", instance.status))),
        _ => NodeStatus::Unchanged,
    }
}

/// Classifies a TPU node, `STOPPED` and `READY` take the roles of terminated and running.
pub fn classify_tpu(
    tpu: Option<&TpuNode>,
    state: Option<&NodeState>,
    is_static: bool,
    preemptible: bool,
) -> NodeStatus {
    match (tpu, state) {
        (None, None) => unknown(None, None),
        (None, Some(state)) => classify_missing(state, is_static, true),
        (Some(tpu), Some(state))
            if !state.has("POWERED_DOWN")
                && !state.has("POWERING_DOWN")
                && tpu.state == STATE_STOPPED =>
        {
            if preemptible {
                NodeStatus::Preempted
            } else if !state.is_down() {
                NodeStatus::Terminated
            } else {
                NodeStatus::Unchanged
            }
        }
        (Some(tpu), state)
            if state.is_none_or(|state| state.has("POWERED_DOWN")) && tpu.state == STATE_READY =>
        {
            NodeStatus::Orphan
        }
        (Some(tpu), None) => unknown(None, Some(tpu.state.clone())),
        _ => NodeStatus::Unchanged,
    }
}

/// Nodes of a future reservation are kept down outside of the reservation window.
pub fn classify_future_reservation(
    reservation: &FutureReservation,
    state: Option<&NodeState>,
    now: DateTime<Utc>,
) -> Option<NodeStatus> {
    let state = state?;
    if reservation.is_active(now) {
        return None;
    }
    if state.is_down() {
        return Some(NodeStatus::Unchanged);
    }
    let reason = if reservation.start_time >= now {
        format!(
            "Waiting for reservation:{} to start at {}",
            reservation.name, reservation.start_time
        )
    } else {
        format!("Reservation:{} is after its end-time", reservation.name)
    };
    Some(NodeStatus::Down { reason })
}

async fn tpu_node_status(
    ctx: &Context,
    node: &str,
    state: Option<&NodeState>,
) -> crate::Result<NodeStatus> {
    let inventory = ctx.inventory();
    let nodeset = inventory.node_tpu_nodeset(node)?;
    let tpus = inventory.tpu_nodes(&nodeset.zone).await?;
    let mut tpu_node = tpus.get(node);
    if tpu_node.is_none() && nodeset.vmcount() > 1 {
        let group = ctx.scheduler().topology_group(node).await?;
        let masters: Vec<&String> = group.iter().filter(|n| tpus.contains_key(*n)).collect();
        match masters.as_slice() {
            [] => {}
            [master] => tpu_node = tpus.get(*master),
            _ => {
                log::error!(
                    "More than one cloud TPU node for TPU group {}, found {}",
                    compress_hostlist(&group),
                    compress_hostlist(&masters)
                );
                return Ok(unknown(state, None));
            }
        }
    }
    Ok(classify_tpu(
        tpu_node,
        state,
        inventory.is_static_node(node),
        nodeset.preemptible,
    ))
}

/// Determines the status of a single node from the current inventory.
pub async fn node_status(ctx: &Context, node: &str) -> crate::Result<NodeStatus> {
    let inventory = ctx.inventory();
    let state = inventory.slurm_node(node).await?.cloned();
    let nodeset = inventory.nodeset_ref(node).ok();

    if let Some(NodesetRef::Regular(nodeset)) = nodeset {
        if let Some(reservation) = inventory.future_reservation(nodeset).await? {
            if let Some(status) =
                classify_future_reservation(&reservation, state.as_ref(), now())
            {
                return Ok(status);
            }
        }
    }
    match nodeset {
        Some(NodesetRef::Dynamic(_)) => return Ok(NodeStatus::Unchanged),
        Some(NodesetRef::Tpu(_)) => return tpu_node_status(ctx, node, state.as_ref()).await,
        _ => {}
    }

    // Hostnames of some VMs are FQDNs.
    let name = node.split('.').next().unwrap_or(node);
    let instance = inventory.instance(name).await?;
    Ok(classify(
        instance,
        state.as_ref(),
        inventory.is_static_node(node),
        now(),
        ctx.tunables().orphan_grace,
    ))
}

async fn start_instances(ctx: &Context, nodes: &[String]) -> crate::Result<()> {
    log::info!(
        "{} instances to start ({})",
        nodes.len(),
        compress_hostlist(nodes)
    );
    let (tpu_nodes, nodes) = separate(nodes.iter().cloned(), |node| {
        ctx.inventory().node_is_tpu(node)
    });
    let mut requests = Vec::new();
    for node in nodes {
        if let Some(instance) = ctx.inventory().instance(&node).await? {
            let request = ComputeRequest::instance_start(ctx.project(), &instance.zone, &node);
            requests.push((node, request));
        }
    }
    let (_, failed) = ctx.executor().batch_execute(requests).await;
    for (node, (_, error)) in failed {
        log::error!("Cannot start instance {node}: {}", error.describe());
    }
    for node in tpu_nodes {
        if let Err(error) = tpu::restart_tpu(ctx, &node).await {
            log::error!("Cannot start TPU node {node}: {error}");
        }
    }
    Ok(())
}

async fn set_down(ctx: &Context, nodes: &[String], reason: &str) -> crate::Result<()> {
    log::info!(
        "{} nodes set down ({}) with reason={reason}",
        nodes.len(),
        compress_hostlist(nodes)
    );
    ctx.scheduler().update_nodes(nodes, "down", Some(reason)).await?;
    Ok(())
}

async fn update_state(
    ctx: &Context,
    nodes: &[String],
    state: &str,
    action: &str,
) -> crate::Result<()> {
    log::info!("{} {action} ({})", nodes.len(), compress_hostlist(nodes));
    ctx.scheduler().update_nodes(nodes, state, None).await?;
    Ok(())
}

/// Executes the action of `status` for all `nodes`.
pub async fn apply_status(ctx: &Context, status: &NodeStatus, nodes: &[String]) -> crate::Result<()> {
    match status {
        NodeStatus::Resume => update_state(ctx, nodes, "power_up", "instances to resume").await,
        NodeStatus::Restore => update_state(ctx, nodes, "resume", "nodes to idle").await,
        NodeStatus::PowerDown => {
            update_state(ctx, nodes, "power_down", "instances to power down").await
        }
        NodeStatus::Orphan => {
            log::info!(
                "{} instances to delete ({})",
                nodes.len(),
                compress_hostlist(nodes)
            );
            suspend::delete_instances(ctx, nodes).await
        }
        NodeStatus::Preempted => {
            set_down(ctx, nodes, "Preempted instance").await?;
            start_instances(ctx, nodes).await
        }
        NodeStatus::Terminated => set_down(ctx, nodes, "Instance terminated").await,
        NodeStatus::Unbacked => set_down(ctx, nodes, "Unbacked instance").await,
        NodeStatus::Down { reason } => set_down(ctx, nodes, reason).await,
        NodeStatus::Unknown { .. } => {
            log::error!(
                "{} nodes have unexpected state, {status} ({})",
                nodes.len(),
                compress_hostlist(nodes)
            );
            Ok(())
        }
        NodeStatus::Unchanged => Ok(()),
    }
}

/// Classifies every compute instance and every cloud node of Slurm and applies the actions.
pub async fn sync_instances(ctx: &Context) -> crate::Result<()> {
    let inventory = ctx.inventory();
    let mut nodes: BTreeSet<String> = inventory
        .instances()
        .await?
        .values()
        .filter(|instance| instance.role == "compute")
        .map(|instance| instance.name.clone())
        .collect();
    nodes.extend(inventory.slurm_nodes().await?.keys().cloned());
    log::debug!("reconciling {} nodes", nodes.len());

    let mut by_status: BTreeMap<NodeStatus, Vec<String>> = BTreeMap::new();
    for node in nodes {
        match node_status(ctx, &node).await {
            Ok(status) => by_status.entry(status).or_default().push(node),
            Err(error) => log::error!("Cannot classify node {node}: {error}"),
        }
    }
    for (status, nodes) in &by_status {
        if let Err(error) = apply_status(ctx, status, nodes).await {
            log::error!(
                "Action {status} failed for {}: {error:?}",
                compress_hostlist(nodes)
            );
        }
    }
    Ok(())
}

/// Runs a sync step, failures are logged so that the next step still runs.
async fn step<T>(name: &str, future: impl Future<Output = crate::Result<T>>) {
    log::debug!("sync step: {name}");
    if let Err(error) = future.await {
        log::error!("Sync step '{name}' failed: {error:?}");
    }
}

/// A single reconciliation cycle.
///
/// `config_path` is the configuration this process was started with, it is replaced
/// when the published configuration changes.
pub async fn run_sync(ctx: &Context, config_path: &Path, hostname: &str) -> crate::Result<()> {
    let config = ctx.config();
    if config.hybrid {
        log::debug!("Hybrid cluster, configuration is managed externally");
    } else {
        step("reconfigure", reconfigure_slurm(ctx, config_path)).await;
    }
    if config.is_controller() {
        step(
            "watch delete operations",
            opswatch::watch_delete_vm_ops(ctx),
        )
        .await;
        step("sync instances", sync_instances(ctx)).await;
        step("sync MIG slices", mig::sync_slice_migs(ctx)).await;
        step(
            "sync placement groups",
            placement::sync_placement_groups(ctx),
        )
        .await;
        step("update topology", topology::update_topology(ctx)).await;
        step(
            "sync maintenance reservations",
            maintenance::sync_maintenance_reservations(ctx),
        )
        .await;
        step(
            "sync opportunistic maintenance",
            maintenance::sync_opportunistic_maintenance(ctx),
        )
        .await;
    }
    step("custom scripts", async {
        install_custom_scripts(config, hostname)
    })
    .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::InstanceRole;
    use crate::tests::utils::{TestConfigBuilder, TestEnv, instance_json};
    use gce::testing::FakeTransport;
    use gce::{ApiError, ApiResult};
    use serde_json::{Value, json};

    const GRACE: Duration = Duration::from_secs(90);

    fn instance(status: &str) -> Instance {
        Instance::from_value(&instance_json("hpc-n-0", status)).unwrap()
    }

    fn young_instance() -> Instance {
        let mut value = instance_json("hpc-n-0", "RUNNING");
        value["creationTimestamp"] = json!(Utc::now().to_rfc3339());
        Instance::from_value(&value).unwrap()
    }

    fn preemptible(status: &str) -> Instance {
        let mut value = instance_json("hpc-n-0", status);
        value["scheduling"] = json!({"provisioningModel": "SPOT"});
        Instance::from_value(&value).unwrap()
    }

    fn check(instance: Option<&Instance>, state: Option<&str>, is_static: bool) -> NodeStatus {
        let state = state.map(NodeState::parse);
        classify(instance, state.as_ref(), is_static, Utc::now(), GRACE)
    }

    #[test]
    fn missing_instance() {
        let cases = [
            ("IDLE+CLOUD+POWERING_UP", false, NodeStatus::Unchanged),
            ("DOWN+CLOUD+POWERED_DOWN", false, NodeStatus::Restore),
            ("IDLE+CLOUD+POWERING_DOWN", false, NodeStatus::Restore),
            ("ALLOCATED+CLOUD+COMPLETING", false, NodeStatus::Unbacked),
            ("IDLE+CLOUD", false, NodeStatus::Unbacked),
            ("DOWN+CLOUD", false, NodeStatus::PowerDown),
            ("IDLE+CLOUD+POWERED_DOWN", true, NodeStatus::Resume),
            ("IDLE+CLOUD+POWERED_DOWN", false, NodeStatus::Unchanged),
            ("DOWN+CLOUD+POWER_DOWN", false, NodeStatus::Unchanged),
        ];
        for (state, is_static, expected) in cases {
            assert_eq!(check(None, Some(state), is_static), expected, "{state}");
        }
    }

    #[test]
    fn down_powered_down_static_node_is_restored() {
        assert_eq!(
            check(None, Some("DOWN+CLOUD+POWERED_DOWN"), true),
            NodeStatus::Restore
        );
    }

    #[test]
    fn terminated_instance() {
        let terminated = instance("TERMINATED");
        assert_eq!(
            check(Some(&terminated), Some("IDLE+CLOUD"), true),
            NodeStatus::Terminated
        );
        assert_eq!(
            check(Some(&terminated), Some("DOWN+CLOUD"), true),
            NodeStatus::Unchanged
        );
        assert_eq!(
            check(Some(&terminated), Some("IDLE+CLOUD+POWERED_DOWN"), true),
            NodeStatus::Unchanged
        );
        assert_eq!(
            check(Some(&preemptible("TERMINATED")), Some("DOWN+CLOUD"), true),
            NodeStatus::Preempted
        );
    }

    #[test]
    fn running_instance() {
        let running = instance("RUNNING");
        assert_eq!(check(Some(&running), None, false), NodeStatus::Orphan);
        assert_eq!(
            check(Some(&running), Some("IDLE+CLOUD+POWERED_DOWN"), false),
            NodeStatus::Orphan
        );
        assert_eq!(check(Some(&young_instance()), None, false), NodeStatus::Unchanged);
        assert_eq!(
            check(Some(&running), Some("ALLOCATED+CLOUD"), false),
            NodeStatus::Unchanged
        );
    }

    #[test]
    fn unknown_states() {
        assert!(matches!(check(None, None, false), NodeStatus::Unknown { .. }));
        assert_eq!(
            check(Some(&instance("STOPPING")), None, false),
            NodeStatus::Unknown {
                slurm_state: None,
                instance_state: Some("Stopping".to_string()),
            }
        );
    }

    #[test]
    fn tpu_classification() {
        let tpu = |state: &str| TpuNode {
            name: "hpc-tpu-0".to_string(),
            state: state.to_string(),
            preemptible: false,
            ip_addresses: vec![],
        };
        let check = |node: Option<&TpuNode>, state: Option<&str>, preemptible: bool| {
            let state = state.map(NodeState::parse);
            classify_tpu(node, state.as_ref(), false, preemptible)
        };
        assert_eq!(
            check(Some(&tpu("STOPPED")), Some("IDLE+CLOUD"), false),
            NodeStatus::Terminated
        );
        assert_eq!(
            check(Some(&tpu("STOPPED")), Some("IDLE+CLOUD"), true),
            NodeStatus::Preempted
        );
        assert_eq!(check(Some(&tpu("READY")), None, false), NodeStatus::Orphan);
        assert_eq!(
            check(None, Some("IDLE+CLOUD+POWERING_UP"), false),
            NodeStatus::Unchanged
        );
        assert_eq!(check(None, Some("IDLE+CLOUD"), false), NodeStatus::Unbacked);
        assert_eq!(check(None, Some("DOWN+CLOUD"), false), NodeStatus::Unchanged);
        assert!(matches!(
            check(Some(&tpu("CREATING")), None, false),
            NodeStatus::Unknown { .. }
        ));
    }

    #[test]
    fn future_reservation_window() {
        let now = Utc::now();
        let reservation = |start: i64, end: i64| FutureReservation {
            project: "proj".to_string(),
            zone: "us-central1-a".to_string(),
            name: "fr".to_string(),
            specific: true,
            calendar: true,
            start_time: now + chrono::Duration::hours(start),
            end_time: now + chrono::Duration::hours(end),
            active_reservation: None,
        };
        let idle = NodeState::parse("IDLE+CLOUD");
        let down = NodeState::parse("DOWN+CLOUD");

        assert_eq!(
            classify_future_reservation(&reservation(-1, 1), Some(&idle), now),
            None
        );
        assert_eq!(classify_future_reservation(&reservation(1, 2), None, now), None);
        assert_eq!(
            classify_future_reservation(&reservation(1, 2), Some(&down), now),
            Some(NodeStatus::Unchanged)
        );
        let waiting = reservation(1, 2);
        assert_eq!(
            classify_future_reservation(&waiting, Some(&idle), now),
            Some(NodeStatus::Down {
                reason: format!("Waiting for reservation:fr to start at {}", waiting.start_time)
            })
        );
        assert_eq!(
            classify_future_reservation(&reservation(-2, -1), Some(&idle), now),
            Some(NodeStatus::Down {
                reason: "Reservation:fr is after its end-time".to_string()
            })
        );
    }

    const NODES: &str = "\
NodeName=hpc-n-0 Arch=x86_64 State=IDLE+CLOUD
NodeName=hpc-n-1 Arch=x86_64 State=IDLE+CLOUD
NodeName=hpc-n-2 Arch=x86_64 State=DOWN+CLOUD+POWERED_DOWN
NodeName=hpc-n-4 Arch=x86_64 State=IDLE+CLOUD+POWERED_DOWN
NodeName=hpc-dyn-0 Arch=x86_64 State=IDLE+DYNAMIC_NORM
NodeName=hpc-tpu-0 Arch=x86_64 State=IDLE+CLOUD+POWERED_DOWN
";

    fn handler(instances: Vec<Value>) -> impl Fn(&gce::ComputeRequest) -> ApiResult {
        move |request| match request.method_id {
            "compute.instances.aggregatedList" => {
                Ok(json!({"items": {"zones/us-central1-a": {"instances": instances.clone()}}}))
            }
            "compute.instances.delete" | "compute.instances.start" => {
                let node = request.path.split('/').nth(5).unwrap_or_default();
                Ok(json!({
                    "name": format!("op-{node}"),
                    "status": "RUNNING",
                    "zone": "projects/proj/zones/us-central1-a",
                }))
            }
            "tpu.projects.locations.nodes.list" => Ok(json!({"nodes": []})),
            _ => Err(ApiError::not_found("unexpected")),
        }
    }

    fn env(role: InstanceRole, instances: Vec<Value>) -> TestEnv {
        let config = TestConfigBuilder::default().role(role).build();
        let env = TestEnv::create(config, FakeTransport::new(handler(instances)));
        env.slurm.set_output("show nodes", NODES);
        env
    }

    fn instances() -> Vec<Value> {
        vec![
            instance_json("hpc-n-0", "RUNNING"),
            instance_json("hpc-n-1", "TERMINATED"),
            instance_json("hpc-n-3", "RUNNING"),
        ]
    }

    fn paths(env: &TestEnv, method_id: &str) -> Vec<String> {
        env.transport
            .requests_of(method_id)
            .iter()
            .map(|r| r.path.clone())
            .collect()
    }

    #[tokio::test]
    async fn reconcile_nodes() {
        let env = env(InstanceRole::Controller, instances());
        sync_instances(&env.ctx).await.unwrap();
        assert_eq!(
            env.slurm.updates(),
            vec![
                "update nodename=hpc-n-2 state=resume",
                "update nodename=hpc-n-1 state=down reason=Instance terminated",
            ]
        );
        assert_eq!(
            paths(&env, "compute.instances.delete"),
            vec!["projects/proj/zones/us-central1-a/instances/hpc-n-3"]
        );
    }

    #[tokio::test]
    async fn preempted_instance_is_restarted() {
        let mut preempted = instance_json("hpc-n-0", "TERMINATED");
        preempted["scheduling"]["preemptible"] = json!(true);
        let env = env(InstanceRole::Controller, vec![preempted]);
        env.slurm.set_output("show nodes", "NodeName=hpc-n-0 State=IDLE+CLOUD");

        assert_eq!(
            node_status(&env.ctx, "hpc-n-0").await.unwrap(),
            NodeStatus::Preempted
        );
        sync_instances(&env.ctx).await.unwrap();
        assert_eq!(
            env.slurm.updates(),
            vec!["update nodename=hpc-n-0 state=down reason=Preempted instance"]
        );
        assert_eq!(
            paths(&env, "compute.instances.start"),
            vec!["projects/proj/zones/us-central1-a/instances/hpc-n-0/start"]
        );
    }

    #[tokio::test]
    async fn dynamic_nodes_are_left_alone() {
        let env = env(InstanceRole::Controller, vec![]);
        assert_eq!(
            node_status(&env.ctx, "hpc-dyn-0").await.unwrap(),
            NodeStatus::Unchanged
        );
        assert_eq!(
            node_status(&env.ctx, "hpc-tpu-0").await.unwrap(),
            NodeStatus::Unchanged
        );
    }

    #[tokio::test]
    async fn future_reservation_nodes_wait_for_window() {
        let config = TestConfigBuilder::default()
            .future_reservation("projects/proj/zones/us-central1-a/futureReservations/fr")
            .build();
        let transport = FakeTransport::new(|request| match request.method_id {
            "compute.futureReservations.get" => Ok(json!({
                "timeWindow": {
                    "startTime": "2099-01-01T00:00:00Z",
                    "endTime": "2099-01-02T00:00:00Z",
                },
            })),
            "compute.instances.aggregatedList" => Ok(json!({"items": {}})),
            _ => Err(ApiError::not_found("unexpected")),
        });
        let env = TestEnv::create(config, transport);
        env.slurm.set_output("show nodes", NODES);
        assert_eq!(
            node_status(&env.ctx, "hpc-n-0").await.unwrap(),
            NodeStatus::Down {
                reason: "Waiting for reservation:fr to start at 2099-01-01 00:00:00 UTC"
                    .to_string()
            }
        );
        assert_eq!(
            node_status(&env.ctx, "hpc-n-2").await.unwrap(),
            NodeStatus::Unchanged
        );
    }

    #[tokio::test]
    async fn failing_steps_do_not_stop_sync() {
        let env = env(InstanceRole::Controller, instances());
        let dir = tempfile::TempDir::with_prefix("slurmgcp").unwrap();
        run_sync(&env.ctx, &dir.path().join("config.yaml"), "ctl")
            .await
            .unwrap();
        assert!(
            env.slurm
                .updates()
                .contains(&"update nodename=hpc-n-1 state=down reason=Instance terminated".to_string())
        );
        assert!(
            env.slurm
                .commands()
                .contains(&"show reservation --json".to_string())
        );
    }

    #[tokio::test]
    async fn compute_instances_only_reconfigure() {
        let env = env(InstanceRole::Compute, instances());
        let dir = tempfile::TempDir::with_prefix("slurmgcp").unwrap();
        run_sync(&env.ctx, &dir.path().join("config.yaml"), "hpc-n-0")
            .await
            .unwrap();
        assert!(env.slurm.commands().is_empty());
        assert!(env.transport.requests().is_empty());
    }
}
