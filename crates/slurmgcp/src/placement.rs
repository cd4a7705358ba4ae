//! Compact placement policies for nodes resumed together.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use gce::selflink::parse_self_link;
use gce::{ComputeRequest, Operation};
use regex::Regex;
use serde_json::{Value, json};

use crate::MANAGED_POLICY_INFIX;
use crate::common::config::NodesetConfig;
use crate::common::error::SyncError;
use crate::common::hostlist::compress_hostlist;
use crate::common::utils::chunked;
use crate::context::Context;
use crate::inventory::node_index;

/// Largest placement group for nodes without a distance or topology restriction.
pub const PLACEMENT_MAX_CNT: u32 = 1500;

/// Machine families that cannot be used with compact placement.
const NO_PLACEMENT_FAMILIES: [&str; 7] = ["e2", "t2d", "n1", "t2a", "m1", "m2", "m3"];

/// Jobs in these states still need their placement groups.
const KEEP_JOB_STATES: [&str; 6] = [
    "RUNNING",
    "CONFIGURING",
    "STOPPED",
    "SUSPENDED",
    "COMPLETING",
    "PENDING",
];

static PLACEMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<cluster>[^\s\-]+)-slurmgcp-managed-(?P<ns>[^\s\-]+)-(?P<job_id>\d+)-(?P<index>\d+)$")
        .expect("invalid placement regex")
});

/// Nodes that are inserted together, optionally inside a placement group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementAndNodes {
    pub placement: Option<String>,
    pub nodes: Vec<String>,
}

impl PlacementAndNodes {
    fn unplaced(nodes: Vec<String>) -> Self {
        PlacementAndNodes {
            placement: None,
            nodes,
        }
    }
}

/// `{cluster}-slurmgcp-managed-{nodeset}-{job}-{index}`, job `0` is used for nodes without an
/// exclusive job.
pub fn placement_name(cluster: &str, nodeset: &str, job_id: Option<u64>, index: usize) -> String {
    format!(
        "{cluster}-{MANAGED_POLICY_INFIX}-{nodeset}-{}-{index}",
        job_id.unwrap_or(0)
    )
}

/// Hosts forming one accelerator topology `AxB`.
pub fn hosts_per_topology(topology: &str, gpus_per_vm: u32) -> crate::Result<u32> {
    let dims = topology
        .split('x')
        .map(|dim| dim.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| {
            SyncError::ConfigError(format!(
                "Accelerator topology {topology} is formatted incorrectly"
            ))
        })?;
    let [a, b] = dims.as_slice() else {
        return Err(SyncError::ConfigError(format!(
            "Accelerator topology {topology} is formatted incorrectly"
        )));
    };
    if *a == 0 || *b == 0 {
        return Err(SyncError::ConfigError(format!(
            "Accelerator topology {topology} is formatted incorrectly"
        )));
    }
    if gpus_per_vm == 0 {
        return Err(SyncError::ConfigError(format!(
            "The machine type has no accelerators, cannot use accelerator topology {topology}"
        )));
    }
    if b % gpus_per_vm != 0 {
        log::error!(
            "The GPU count {gpus_per_vm} per node is not a factor of the accelerator topology {topology}"
        );
    }
    Ok(a * b / gpus_per_vm)
}

/// Maximal number of nodes in one placement group of the nodeset.
pub async fn chunk_size(ctx: &Context, nodeset: &NodesetConfig) -> crate::Result<u32> {
    let template = ctx
        .inventory()
        .template_info(&nodeset.instance_template)
        .await?;
    if let Some(topology) = nodeset.accelerator_topology.as_deref() {
        return hosts_per_topology(topology, template.gpu_count);
    }
    Ok(match nodeset.placement_max_distance {
        Some(1) => 22,
        Some(2) if template.family().starts_with("a3") => 256,
        Some(2) => 150,
        Some(3) => 1500,
        _ => PLACEMENT_MAX_CNT,
    })
}

async fn supports_placement(ctx: &Context, nodeset: &NodesetConfig) -> crate::Result<bool> {
    let template = ctx
        .inventory()
        .template_info(&nodeset.instance_template)
        .await?;
    if NO_PLACEMENT_FAMILIES.contains(&template.family()) {
        log::warn!(
            "Unsupported machine type for placement policy: {}. Please do not use any of the following machine types with placement policy: ({})",
            template.machine_type,
            NO_PLACEMENT_FAMILIES.join(",")
        );
        return Ok(false);
    }
    Ok(true)
}

/// Splits nodes of a single nodeset into placement groups.
async fn allocate_nodes_to_placements(
    ctx: &Context,
    nodes: Vec<String>,
    job_id: Option<u64>,
) -> crate::Result<Vec<PlacementAndNodes>> {
    let inventory = ctx.inventory();
    let Some(model) = nodes.first() else {
        return Ok(Vec::new());
    };
    if job_id.is_some() && nodes.len() < 2 {
        return Ok(vec![PlacementAndNodes::unplaced(nodes)]);
    }
    if inventory.node_is_tpu(model) || inventory.node_is_flex(model) {
        return Ok(vec![PlacementAndNodes::unplaced(nodes)]);
    }
    let nodeset = inventory.node_nodeset(model)?;
    if !nodeset.enable_placement || !supports_placement(ctx, nodeset).await? {
        return Ok(vec![PlacementAndNodes::unplaced(nodes)]);
    }

    let max_count = chunk_size(ctx, nodeset).await?.max(1);
    let cluster = &ctx.config().slurm_cluster_name;
    if let Some(job_id) = job_id {
        return Ok(chunked(&nodes, max_count as usize)
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| PlacementAndNodes {
                placement: Some(placement_name(
                    cluster,
                    &nodeset.nodeset_name,
                    Some(job_id),
                    i,
                )),
                nodes: chunk,
            })
            .collect());
    }

    // Groups are fixed over the whole nodeset, so a node always lands in the same group.
    let mut chunks: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    let mut invalid = Vec::new();
    for node in nodes {
        match node_index(&node) {
            Ok(index) => chunks.entry(index / max_count).or_default().push(node),
            Err(_) => invalid.push(node),
        }
    }
    let mut placements: Vec<PlacementAndNodes> = chunks
        .into_iter()
        .map(|(index, nodes)| PlacementAndNodes {
            placement: Some(placement_name(
                cluster,
                &nodeset.nodeset_name,
                None,
                index as usize,
            )),
            nodes,
        })
        .collect();
    if !invalid.is_empty() {
        log::error!(
            "Could not find placement for nodes with unexpected names: {}",
            compress_hostlist(&invalid)
        );
        placements.push(PlacementAndNodes::unplaced(invalid));
    }
    Ok(placements)
}

fn placement_request(
    ctx: &Context,
    name: &str,
    region: &str,
    nodeset: &NodesetConfig,
) -> ComputeRequest {
    let mut policy = json!({"collocation": "COLLOCATED"});
    if let Some(distance) = nodeset.placement_max_distance {
        policy["maxDistance"] = json!(distance);
    }
    if let Some(topology) = nodeset.accelerator_topology.as_deref() {
        policy["gpuTopology"] = json!(topology);
    }
    ComputeRequest::resource_policy_insert(
        ctx.project(),
        region,
        json!({
            "name": name,
            "region": region,
            "groupPlacementPolicy": policy,
        }),
    )
}

async fn create_nodeset_placements(
    ctx: &Context,
    nodes: Vec<String>,
    job_id: Option<u64>,
) -> crate::Result<Vec<PlacementAndNodes>> {
    let Some(model) = nodes.first().cloned() else {
        return Ok(Vec::new());
    };
    let placements = allocate_nodes_to_placements(ctx, nodes, job_id).await?;
    if log::log_enabled!(log::Level::Debug) {
        for placement in &placements {
            log::debug!(
                "placement group {}: {}",
                placement.placement.as_deref().unwrap_or("<none>"),
                compress_hostlist(&placement.nodes)
            );
        }
    }
    let names: Vec<&String> = placements
        .iter()
        .filter_map(|p| p.placement.as_ref())
        .collect();
    if names.is_empty() {
        return Ok(placements);
    }

    let region = ctx.inventory().node_region(&model)?;
    let nodeset = ctx.inventory().node_nodeset(&model)?;
    let requests = names
        .iter()
        .map(|name| {
            (
                name.to_string(),
                placement_request(ctx, name, &region, nodeset),
            )
        })
        .collect::<Vec<_>>();
    let (done, failed) = ctx.executor().batch_execute_quiet(requests).await;

    let (redundant, failed): (Vec<_>, Vec<_>) = failed
        .into_iter()
        .partition(|(_, (_, error))| error.is_already_exists());
    if !redundant.is_empty() {
        log::warn!(
            "placement policies already exist: {}",
            redundant
                .iter()
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>()
                .join(",")
        );
    }
    if !failed.is_empty() {
        log::error!(
            "failed to create placement policies: {}",
            failed
                .iter()
                .map(|(name, (_, error))| format!("{name}: {error}"))
                .collect::<Vec<_>>()
                .join("; ")
        );
    }

    let operations = done
        .into_values()
        .filter_map(|value| Operation::from_value(value).ok())
        .collect::<Vec<_>>();
    let mut created = Vec::new();
    for (operation, result) in operations
        .iter()
        .zip(ctx.executor().wait_for_operations(&operations).await)
    {
        match result {
            Ok(result) if result.has_error() => log::error!(
                "placement group failed to create: '{}' ({}): {}",
                result.target_name().unwrap_or("?"),
                result.name,
                result.error_message()
            ),
            Ok(result) => created.push(result.target_name().unwrap_or(&operation.name).to_string()),
            Err(error) => log::error!("Cannot wait for operation {}: {error}", operation.name),
        }
    }
    log::info!(
        "created {} placement groups ({})",
        created.len(),
        created.join(",")
    );
    Ok(placements)
}

/// Creates placement groups for nodes (split by nodeset) and returns the assignment.
pub async fn create_placements(
    ctx: &Context,
    nodes: &[String],
    job_id: Option<u64>,
) -> crate::Result<Vec<PlacementAndNodes>> {
    let mut placements = Vec::new();
    for (_, nodes) in ctx.inventory().nodeset_map(nodes) {
        placements.extend(create_nodeset_placements(ctx, nodes, job_id).await?);
    }
    Ok(placements)
}

async fn managed_policies(ctx: &Context) -> crate::Result<Vec<Value>> {
    let prefix = format!(
        "{}-{MANAGED_POLICY_INFIX}-",
        ctx.config().slurm_cluster_name
    );
    let regions: BTreeSet<String> = ctx
        .config()
        .nodeset
        .values()
        .filter_map(|nodeset| nodeset.region())
        .collect();
    let mut policies = Vec::new();
    for region in regions {
        let pages = ctx
            .executor()
            .list_pages(ComputeRequest::resource_policies_list(ctx.project(), &region))
            .await?;
        policies.extend(
            pages
                .iter()
                .filter_map(|page| page["items"].as_array())
                .flatten()
                .filter(|policy| {
                    policy["name"]
                        .as_str()
                        .is_some_and(|name| name.starts_with(&prefix))
                })
                .cloned(),
        );
    }
    Ok(policies)
}

/// Deletes placement groups of jobs that are no longer active.
pub async fn sync_placement_groups(ctx: &Context) -> crate::Result<()> {
    let mut keep_jobs: BTreeSet<String> = ctx
        .inventory()
        .jobs()
        .await?
        .iter()
        .filter(|job| KEEP_JOB_STATES.contains(&job.job_state.as_str()))
        .map(|job| job.job_id.to_string())
        .collect();
    keep_jobs.insert("0".to_string());

    let mut to_delete = Vec::new();
    for policy in managed_policies(ctx).await? {
        let name = policy["name"].as_str().unwrap_or_default();
        let Some(captures) = PLACEMENT_REGEX.captures(name) else {
            log::warn!("Unexpected resource policy name={name}");
            continue;
        };
        if !keep_jobs.contains(&captures["job_id"]) {
            match policy["selfLink"].as_str() {
                Some(link) => to_delete.push(link.to_string()),
                None => log::warn!("Resource policy {name} has no self link"),
            }
        }
    }
    if !to_delete.is_empty() {
        delete_resource_policies(ctx, &to_delete).await;
    }
    Ok(())
}

/// `resourceInUseByAnotherResource` failures are expected and not reported.
pub async fn delete_resource_policies(ctx: &Context, links: &[String]) {
    let requests = links
        .iter()
        .filter_map(|link| {
            let parsed = parse_self_link(link);
            let Some(region) = parsed.region else {
                log::error!("Cannot determine region of resource policy {link}");
                return None;
            };
            let request = ComputeRequest::resource_policy_delete(
                parsed.project.as_deref().unwrap_or(ctx.project()),
                &region,
                &parsed.name,
            );
            Some((parsed.name, request))
        })
        .collect::<Vec<_>>();
    let (done, failed) = ctx.executor().batch_execute_quiet(requests).await;
    let failures = failed
        .iter()
        .filter(|(_, (_, error))| !error.is_in_use())
        .map(|(name, (_, error))| format!("{name}: {error}"))
        .collect::<Vec<_>>();
    if !failures.is_empty() {
        log::error!(
            "some placement groups failed to delete: {}",
            failures.join("; ")
        );
    }
    log::info!(
        "deleted {} of {} placement groups ({})",
        done.len(),
        links.len(),
        done.keys().cloned().collect::<Vec<_>>().join(",")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::{TestConfigBuilder, TestEnv};
    use gce::ApiError;
    use gce::testing::{FakeTransport, operation_json};
    use serde_json::json;

    fn handler(machine_type: &'static str, gpus: u32) -> FakeTransport {
        let accelerators = if gpus > 0 {
            json!([{"guestAcceleratorType": "nvidia-h100", "guestAcceleratorCount": gpus}])
        } else {
            json!([])
        };
        FakeTransport::new(move |request| match request.method_id {
            "compute.instanceTemplates.get" => {
                Ok(json!({"properties": {"machineType": machine_type}}))
            }
            "compute.machineTypes.aggregatedList" => Ok(json!({"items": {"zones/z": {"machineTypes": [
                {"name": machine_type, "guestCpus": 8, "memoryMb": 1024,
                 "accelerators": accelerators.clone()}
            ]}}})),
            "compute.resourcePolicies.insert" => {
                let name = request.body.as_ref().unwrap()["name"].as_str().unwrap();
                if name.ends_with("-0-1") {
                    Err(ApiError::http(409, "alreadyExists", "exists"))
                } else {
                    Ok(json!({"name": format!("op-{name}"), "status": "RUNNING",
                        "region": "regions/us-central1", "targetLink": name}))
                }
            }
            _ => Ok(operation_json(&request.path, "DONE")),
        })
    }

    fn names(placements: &[PlacementAndNodes]) -> Vec<(Option<String>, String)> {
        placements
            .iter()
            .map(|p| (p.placement.clone(), compress_hostlist(&p.nodes)))
            .collect()
    }

    #[test]
    fn topology_hosts() {
        assert_eq!(hosts_per_topology("1x72", 4).unwrap(), 18);
        assert_eq!(hosts_per_topology("2x8", 8).unwrap(), 2);
        assert!(hosts_per_topology("1x72", 0).is_err());
        assert!(hosts_per_topology("72", 4).is_err());
        assert!(hosts_per_topology("ax2", 4).is_err());
    }

    #[test]
    fn placement_names() {
        assert_eq!(
            placement_name("hpc", "n", Some(12), 3),
            "hpc-slurmgcp-managed-n-12-3"
        );
        assert_eq!(placement_name("hpc", "n", None, 0), "hpc-slurmgcp-managed-n-0-0");
        let captures = PLACEMENT_REGEX
            .captures("hpc-slurmgcp-managed-n-12-3")
            .unwrap();
        assert_eq!(&captures["job_id"], "12");
        assert!(PLACEMENT_REGEX.captures("hpc-slurmgcp-managed-n-x").is_none());
    }

    #[tokio::test]
    async fn chunk_sizes() {
        for (distance, machine, expected) in [
            (Some(1), "c2-standard-60", 22),
            (Some(2), "c2-standard-60", 150),
            (Some(2), "a3-highgpu-8g", 256),
            (Some(3), "c2-standard-60", 1500),
            (None, "c2-standard-60", PLACEMENT_MAX_CNT),
        ] {
            let mut builder = TestConfigBuilder::default();
            if let Some(distance) = distance {
                builder = builder.placement_max_distance(distance);
            }
            let env = TestEnv::create(builder.build(), handler(machine, 8));
            let nodeset = &env.ctx.config().nodeset["n"];
            assert_eq!(chunk_size(&env.ctx, nodeset).await.unwrap(), expected);
        }

        let config = TestConfigBuilder::default()
            .accelerator_topology("1x72")
            .build();
        let env = TestEnv::create(config, handler("a4x-highgpu-4g", 4));
        let nodeset = &env.ctx.config().nodeset["n"];
        assert_eq!(chunk_size(&env.ctx, nodeset).await.unwrap(), 18);
    }

    #[tokio::test]
    async fn group_non_exclusive_nodes_by_index() {
        let config = TestConfigBuilder::default()
            .static_nodes(0)
            .dynamic_nodes(60)
            .placement_max_distance(1)
            .build();
        let env = TestEnv::create(config, handler("c2-standard-60", 0));
        let nodes: Vec<String> = [3, 21, 22, 40, 50]
            .iter()
            .map(|i| format!("hpc-n-{i}"))
            .collect();
        let placements = create_placements(&env.ctx, &nodes, None).await.unwrap();
        insta::assert_debug_snapshot!(names(&placements), @r###"
        [
            (
                Some(
                    "hpc-slurmgcp-managed-n-0-0",
                ),
                "hpc-n-[3,21]",
            ),
            (
                Some(
                    "hpc-slurmgcp-managed-n-0-1",
                ),
                "hpc-n-[22,40]",
            ),
            (
                Some(
                    "hpc-slurmgcp-managed-n-0-2",
                ),
                "hpc-n-50",
            ),
        ]
        "###);

        let inserts = env.transport.requests_of("compute.resourcePolicies.insert");
        assert_eq!(inserts.len(), 3);
        let body = inserts[0].body.as_ref().unwrap();
        assert_eq!(body["region"], "us-central1");
        assert_eq!(body["groupPlacementPolicy"]["collocation"], "COLLOCATED");
        assert_eq!(body["groupPlacementPolicy"]["maxDistance"], 1);
        // the redundant group is not awaited
        assert_eq!(env.transport.requests_of("compute.regionOperations.wait").len(), 2);
    }

    #[tokio::test]
    async fn exclusive_job_placements() {
        let config = TestConfigBuilder::default().placement_max_distance(1).build();
        let env = TestEnv::create(config, handler("c2-standard-60", 0));
        let nodes: Vec<String> = (0..3).map(|i| format!("hpc-n-{i}")).collect();
        let placements = create_placements(&env.ctx, &nodes, Some(7)).await.unwrap();
        assert_eq!(placements.len(), 1);
        assert_eq!(
            placements[0].placement.as_deref(),
            Some("hpc-slurmgcp-managed-n-7-0")
        );

        // a single node job gets no placement group
        env.transport.clear();
        let placements = create_placements(&env.ctx, &nodes[..1], Some(8))
            .await
            .unwrap();
        assert_eq!(placements[0].placement, None);
        assert!(env.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn no_placement_for_unsupported_family() {
        let env = TestEnv::create(
            TestConfigBuilder::default().build(),
            handler("n1-standard-4", 0),
        );
        let nodes = vec!["hpc-n-0".to_string(), "hpc-n-1".to_string()];
        let placements = create_placements(&env.ctx, &nodes, None).await.unwrap();
        assert_eq!(names(&placements), vec![(None, "hpc-n-[0-1]".to_string())]);

        let env = TestEnv::create(
            TestConfigBuilder::default().placement(false).build(),
            handler("c2-standard-60", 0),
        );
        let placements = create_placements(&env.ctx, &nodes, None).await.unwrap();
        assert_eq!(placements[0].placement, None);
        assert!(env
            .transport
            .requests_of("compute.resourcePolicies.insert")
            .is_empty());
    }

    #[tokio::test]
    async fn gc_placement_groups() {
        let env = TestEnv::create(
            TestConfigBuilder::default().build(),
            FakeTransport::new(|request| match request.method_id {
                "compute.resourcePolicies.list" => Ok(json!({"items": [
                    {"name": "hpc-slurmgcp-managed-n-0-0", "selfLink": "projects/proj/regions/us-central1/resourcePolicies/hpc-slurmgcp-managed-n-0-0"},
                    {"name": "hpc-slurmgcp-managed-n-5-0", "selfLink": "projects/proj/regions/us-central1/resourcePolicies/hpc-slurmgcp-managed-n-5-0"},
                    {"name": "hpc-slurmgcp-managed-n-6-0", "selfLink": "projects/proj/regions/us-central1/resourcePolicies/hpc-slurmgcp-managed-n-6-0"},
                    {"name": "hpc-slurmgcp-managed-n-7-1", "selfLink": "projects/proj/regions/us-central1/resourcePolicies/hpc-slurmgcp-managed-n-7-1"},
                    {"name": "hpc-slurmgcp-managed-weird", "selfLink": "projects/proj/regions/us-central1/resourcePolicies/hpc-slurmgcp-managed-weird"},
                    {"name": "other-policy", "selfLink": "projects/proj/regions/us-central1/resourcePolicies/other-policy"},
                ]})),
                "compute.resourcePolicies.delete" if request.path.ends_with("n-7-1") => Err(
                    ApiError::http(400, "resourceInUseByAnotherResource", "in use"),
                ),
                _ => Ok(operation_json(&request.path, "DONE")),
            }),
        );
        env.slurm.set_output(
            "show jobs",
            "JobId=5 JobState=RUNNING NodeList=hpc-n-0\nJobId=6 JobState=COMPLETED NodeList=hpc-n-1\nJobId=7 JobState=CANCELLED NodeList=(null)\n",
        );
        sync_placement_groups(&env.ctx).await.unwrap();
        let deleted: Vec<String> = env
            .transport
            .requests_of("compute.resourcePolicies.delete")
            .iter()
            .map(|r| r.path.clone())
            .collect();
        assert_eq!(
            deleted,
            vec![
                "projects/proj/regions/us-central1/resourcePolicies/hpc-slurmgcp-managed-n-6-0",
                "projects/proj/regions/us-central1/resourcePolicies/hpc-slurmgcp-managed-n-7-1",
            ]
        );
    }
}
