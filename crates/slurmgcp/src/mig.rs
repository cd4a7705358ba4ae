//! Managed instance groups as a provisioning unit.
//!
//! Nodesets with `enable_mig_slices` get one MIG per accelerator slice, the
//! slice of a node is given by its index. DWS flex nodesets get one MIG per
//! resumed chunk, grown by a resize request.

use std::collections::{BTreeMap, BTreeSet};

use gce::selflink::{parse_self_link, trim_self_link, zone_region};
use gce::{ApiError, ComputeRequest, Operation};
use rand::Rng;
use serde_json::{Value, json};

use crate::common::config::NodesetConfig;
use crate::common::error::SyncError;
use crate::common::hostlist::compress_hostlist;
use crate::context::Context;
use crate::inventory::{Instance, node_index};
use crate::placement::hosts_per_topology;
use crate::resume::dws_run_duration;
use crate::scheduler::JobInfo;

/// Metadata key set by Compute Engine on instances created by a MIG.
pub const CREATED_BY: &str = "created-by";

/// Link of the MIG that created the instance.
pub fn managed_by(instance: &Instance) -> Option<&str> {
    instance
        .metadata
        .get(CREATED_BY)
        .map(|link| link.as_str())
        .filter(|link| link.contains("/instanceGroupManagers/"))
}

fn workload_policy_name(ctx: &Context, nodeset: &NodesetConfig) -> String {
    format!(
        "{}-workload-policy",
        ctx.config().nodeset_prefix(&nodeset.nodeset_name)
    )
}

fn slice_zone(ctx: &Context, nodeset: &NodesetConfig) -> crate::Result<String> {
    match nodeset.zones().as_slice() {
        [zone] => Ok(zone.clone()),
        _ => ctx.config().zone.clone().ok_or_else(|| {
            SyncError::ConfigError(format!(
                "Cannot determine the zone of MIGs of nodeset {}",
                nodeset.nodeset_name
            ))
        }),
    }
}

async fn slice_hosts(ctx: &Context, nodeset: &NodesetConfig) -> crate::Result<u32> {
    let Some(topology) = nodeset.accelerator_topology.as_deref() else {
        return Err(SyncError::ConfigError(format!(
            "Nodeset {} has no accelerator topology",
            nodeset.nodeset_name
        )));
    };
    let template = ctx
        .inventory()
        .template_info(&nodeset.instance_template)
        .await?;
    Ok(hosts_per_topology(topology, template.gpu_count)?.max(1))
}

/// Slice MIG names with their nodes.
async fn allocate_nodes_to_slices(
    ctx: &Context,
    nodes: &[String],
) -> crate::Result<BTreeMap<String, Vec<String>>> {
    let mut slices: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (_, nodes) in ctx.inventory().nodeset_map(nodes) {
        let nodeset = ctx.inventory().node_nodeset(&nodes[0])?;
        let hosts = slice_hosts(ctx, nodeset).await?;
        let prefix = ctx.config().nodeset_prefix(&nodeset.nodeset_name);
        for node in nodes {
            let slice = node_index(&node)? / hosts;
            slices
                .entry(format!("{prefix}-{slice}"))
                .or_default()
                .push(node);
        }
    }
    Ok(slices)
}

async fn get_mig(ctx: &Context, zone: &str, name: &str) -> crate::Result<Option<Value>> {
    match ctx
        .executor()
        .ensure_execute(&ComputeRequest::igm_get(ctx.project(), zone, name))
        .await
    {
        Ok(mig) => Ok(Some(mig)),
        Err(error) if error.is_not_found() => Ok(None),
        Err(error) => Err(error.into()),
    }
}

async fn managed_instances(ctx: &Context, zone: &str, mig: &str) -> crate::Result<BTreeSet<String>> {
    let pages = ctx
        .executor()
        .list_pages(ComputeRequest::igm_list_managed_instances(
            ctx.project(),
            zone,
            mig,
        ))
        .await?;
    Ok(pages
        .iter()
        .filter_map(|page| page["managedInstances"].as_array())
        .flatten()
        .filter_map(|instance| instance["instance"].as_str())
        .map(|link| trim_self_link(link).to_string())
        .collect())
}

fn mig_body(name: &str, template: &str) -> Value {
    json!({
        "name": name,
        "versions": [{"instanceTemplate": template}],
        "targetSize": 0,
        "instanceLifecyclePolicy": {"defaultActionOnFailure": "DO_NOTHING"},
    })
}

fn instance_names(nodes: &[String]) -> Value {
    Value::Array(nodes.iter().map(|node| json!({"name": node})).collect())
}

/// Nodes named in a `createInstances` body.
fn requested_nodes(request: &ComputeRequest) -> Vec<String> {
    request
        .body
        .as_ref()
        .and_then(|body| body["instances"].as_array())
        .map(|instances| {
            instances
                .iter()
                .filter_map(|instance| instance["name"].as_str())
                .map(|name| name.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn is_benign(error: &ApiError) -> bool {
    error.is_already_exists() || error.reason() == "resourceNotReady"
}

/// Submits requests and waits for them. Failed `createInstances` requests put their nodes down.
async fn submit_and_wait(
    ctx: &Context,
    requests: Vec<(String, ComputeRequest)>,
    jobs: &[JobInfo],
) -> crate::Result<()> {
    if requests.is_empty() {
        return Ok(());
    }
    let (done, failed) = ctx.executor().batch_execute_quiet(requests).await;
    for (id, (request, error)) in failed {
        if is_benign(&error) {
            log::debug!("Ignoring error of {id}: {error}");
            continue;
        }
        log::warn!("Error raised when attempting: {id}. Error: {error}");
        let nodes = requested_nodes(&request);
        ctx.scheduler()
            .down_nodes_notify(&nodes, &error.describe(), jobs)
            .await?;
    }
    for (id, result) in ctx.wait_for_done(done).await {
        match result {
            Ok(operation) if operation.has_error() => log::error!(
                "Operation {} of {id} failed: {}",
                operation.name,
                operation.error_message()
            ),
            Ok(_) => {}
            Err(error) => log::error!("Unexpected error waiting for operation of {id}: {error}"),
        }
    }
    Ok(())
}

/// Creates missing workload policies and slice MIGs, then adds the nodes to them.
pub async fn resume_slice_nodes(
    ctx: &Context,
    nodes: &[String],
    jobs: &[JobInfo],
) -> crate::Result<()> {
    let project = ctx.project();
    let mut policies = BTreeMap::new();
    let mut migs = Vec::new();
    let mut creates = Vec::new();
    for (mig_name, nodes) in allocate_nodes_to_slices(ctx, nodes).await? {
        let nodeset = ctx.inventory().node_nodeset(&nodes[0])?;
        let zone = slice_zone(ctx, nodeset)?;
        if get_mig(ctx, &zone, &mig_name).await?.is_none() {
            let region = zone_region(&zone);
            let policy = workload_policy_name(ctx, nodeset);
            let mut body = mig_body(&mig_name, &nodeset.instance_template);
            body["resourcePolicies"] = json!({
                "workloadPolicy": format!("projects/{project}/regions/{region}/resourcePolicies/{policy}")
            });
            migs.push((
                mig_name.clone(),
                ComputeRequest::igm_insert(project, &zone, body),
            ));
            if !policies.contains_key(&policy) {
                let topology = nodeset.accelerator_topology.clone().unwrap_or_default();
                let request = ComputeRequest::resource_policy_insert(
                    project,
                    region,
                    json!({
                        "name": policy,
                        "region": region,
                        "workloadPolicy": {
                            "type": "HIGH_THROUGHPUT",
                            "acceleratorTopology": topology,
                        },
                    }),
                );
                policies.insert(policy, request);
            }
        }
        log::info!("Adding {} to MIG {mig_name}", compress_hostlist(&nodes));
        creates.push((
            mig_name.clone(),
            ComputeRequest::igm_create_instances(
                project,
                &zone,
                &mig_name,
                json!({"instances": instance_names(&nodes)}),
            ),
        ));
    }
    submit_and_wait(ctx, policies.into_iter().collect(), jobs).await?;
    submit_and_wait(ctx, migs, jobs).await?;
    submit_and_wait(ctx, creates, jobs).await
}

/// Removes slice nodes from their MIGs. Nodes outside of a MIG are skipped.
pub async fn suspend_slice_nodes(ctx: &Context, nodes: &[String]) -> crate::Result<()> {
    let mut requests = Vec::new();
    for (mig_name, nodes) in allocate_nodes_to_slices(ctx, nodes).await? {
        let nodeset = ctx.inventory().node_nodeset(&nodes[0])?;
        let zone = slice_zone(ctx, nodeset)?;
        if get_mig(ctx, &zone, &mig_name).await?.is_none() {
            log::info!("MIG {mig_name} not found (likely already deleted). Skipping suspend.");
            continue;
        }
        let members = managed_instances(ctx, &zone, &mig_name).await?;
        let mut links = Vec::new();
        for node in nodes {
            if members.contains(&node) {
                links.push(format!("zones/{zone}/instances/{node}"));
            } else {
                log::info!("Instance {node} is not part of MIG {mig_name}. Skipping.");
            }
        }
        if links.is_empty() {
            continue;
        }
        requests.push((
            mig_name.clone(),
            ComputeRequest::igm_delete_instances(
                ctx.project(),
                &zone,
                &mig_name,
                json!({"instances": links, "skipInstancesOnValidationError": true}),
            ),
        ));
    }
    let (_, failed) = ctx.executor().batch_execute_quiet(requests).await;
    let failures: Vec<String> = failed
        .iter()
        .filter(|(_, (_, error))| !error.is_not_found())
        .map(|(name, (_, error))| format!("{name}: {error}"))
        .collect();
    if !failures.is_empty() {
        log::error!("some mig nodes failed to delete: {}", failures.join("; "));
    }
    Ok(())
}

/// Deletes slice MIGs that shrank to zero together with their workload policies.
pub async fn sync_slice_migs(ctx: &Context) -> crate::Result<()> {
    let mut zones: BTreeMap<String, Vec<&NodesetConfig>> = BTreeMap::new();
    for nodeset in ctx.config().nodeset.values().filter(|ns| ns.uses_mig_slices()) {
        zones
            .entry(slice_zone(ctx, nodeset)?)
            .or_default()
            .push(nodeset);
    }

    let mut requests = Vec::new();
    let mut policies: BTreeMap<String, ComputeRequest> = BTreeMap::new();
    for (zone, nodesets) in &zones {
        let pages = ctx
            .executor()
            .list_pages(ComputeRequest::igm_list(ctx.project(), zone))
            .await?;
        for mig in pages.iter().filter_map(|page| page["items"].as_array()).flatten() {
            let name = mig["name"].as_str().unwrap_or_default();
            let Some(nodeset) = nodesets.iter().find(|nodeset| {
                name.strip_prefix(&ctx.config().nodeset_prefix(&nodeset.nodeset_name))
                    .and_then(|rest| rest.strip_prefix('-'))
                    .is_some_and(|slice| {
                        !slice.is_empty() && slice.chars().all(|c| c.is_ascii_digit())
                    })
            }) else {
                continue;
            };
            if mig["targetSize"].as_u64().unwrap_or(0) > 0 {
                continue;
            }
            requests.push((
                name.to_string(),
                ComputeRequest::igm_delete(ctx.project(), zone, name),
            ));
            let policy = workload_policy_name(ctx, nodeset);
            let request =
                ComputeRequest::resource_policy_delete(ctx.project(), zone_region(zone), &policy);
            policies.insert(policy, request);
        }
    }
    if requests.is_empty() {
        return Ok(());
    }

    let count = requests.len();
    let (done, failed) = ctx.executor().batch_execute_quiet(requests).await;
    log_delete_failures("mig groups", &failed);
    let mut deleted = Vec::new();
    for (name, result) in ctx.wait_for_done(done).await {
        match result {
            Ok(operation) if operation.has_error() => log::error!(
                "Failed to delete MIG {name}: {}",
                operation.error_message()
            ),
            Ok(_) => deleted.push(name),
            Err(error) => log::error!("Cannot wait for deletion of MIG {name}: {error}"),
        }
    }
    log::info!(
        "deleted {} of {count} mig groups ({})",
        deleted.len(),
        deleted.join(",")
    );

    let count = policies.len();
    let (done, failed) = ctx
        .executor()
        .batch_execute_quiet(policies.into_iter().collect::<Vec<_>>())
        .await;
    log_delete_failures("workload policies", &failed);
    log::info!(
        "deleted {} of {count} workload policies ({})",
        done.len(),
        done.keys().cloned().collect::<Vec<_>>().join(",")
    );
    Ok(())
}

fn log_delete_failures(what: &str, failed: &gce::executor::Failed) {
    let failures: Vec<String> = failed
        .iter()
        .filter(|(_, (_, error))| !error.is_in_use())
        .map(|(name, (_, error))| format!("{name}: {error}"))
        .collect();
    if !failures.is_empty() {
        log::error!("some {what} failed to delete: {}", failures.join("; "));
    }
}

fn flex_mig_name(prefix: &str, job_id: Option<u64>) -> String {
    let uid: u32 = rand::rng().random();
    match job_id {
        Some(job_id) => format!("{prefix}-job-{job_id}-{uid:08x}"),
        None => format!("{prefix}-{uid:08x}"),
    }
}

async fn run_flex_request(
    ctx: &Context,
    request: &ComputeRequest,
) -> Result<Operation, String> {
    let value = ctx
        .executor()
        .ensure_execute(request)
        .await
        .map_err(|error| format!("GCP Error: {}", error.describe()))?;
    let operation = Operation::from_value(value).map_err(|error| error.to_string())?;
    let operation = ctx
        .executor()
        .wait_for_operation(&operation)
        .await
        .map_err(|error| error.to_string())?;
    if operation.has_error() {
        return Err(format!("GCP Error: {}", operation.error_message()));
    }
    Ok(operation)
}

/// Creates a dedicated MIG for a chunk of flex nodes and requests the nodes through a resize
/// request. Nodes are put down when any step fails.
pub async fn resume_flex_chunk(
    ctx: &Context,
    nodes: &[String],
    job_id: Option<u64>,
    jobs: &[JobInfo],
) -> crate::Result<()> {
    let Some(model) = nodes.first() else {
        return Ok(());
    };
    let nodeset = ctx.inventory().node_nodeset(model)?;
    let zones = nodeset.zones();
    let [zone] = zones.as_slice() else {
        log::error!(
            "Flex nodeset {} requires exactly one zone, got {}",
            nodeset.nodeset_name,
            zones.len()
        );
        ctx.scheduler()
            .down_nodes_notify(nodes, "Flex nodeset requires exactly one zone", jobs)
            .await?;
        return Ok(());
    };
    let job = match job_id {
        Some(job_id) => ctx.inventory().job(job_id).await?,
        None => None,
    };
    let name = flex_mig_name(&ctx.config().nodeset_prefix(&nodeset.nodeset_name), job_id);
    log::info!("Creating MIG {name} for {}", compress_hostlist(nodes));

    let insert = ComputeRequest::igm_insert(
        ctx.project(),
        zone,
        mig_body(&name, &nodeset.instance_template),
    );
    let resize = ComputeRequest::igm_resize_request_insert(
        ctx.project(),
        zone,
        &name,
        json!({
            "name": "initial-resize",
            "instances": instance_names(nodes),
            "requestedRunDuration": {"seconds": dws_run_duration(nodeset, job)},
        }),
    );
    for request in [insert, resize] {
        if let Err(reason) = run_flex_request(ctx, &request).await {
            log::error!("{request} failed: {reason}");
            ctx.scheduler().down_nodes_notify(nodes, &reason, jobs).await?;
            return Ok(());
        }
    }
    Ok(())
}

/// Deletes flex nodes through the MIG that created them.
pub async fn suspend_flex_nodes(ctx: &Context, nodes: &[String]) -> crate::Result<()> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for node in nodes {
        match ctx.inventory().instance(node).await? {
            None => log::debug!("Flex node {node} has no instance, nothing to suspend"),
            Some(instance) => match managed_by(instance) {
                Some(link) => groups
                    .entry(link.to_string())
                    .or_default()
                    .push(node.clone()),
                None => log::warn!("Flex node {node} is not managed by a MIG, skipping"),
            },
        }
    }

    let mut requests = Vec::new();
    for (link, nodes) in groups {
        let parsed = parse_self_link(&link);
        let Some(zone) = parsed.zone else {
            log::error!("Cannot determine the zone of MIG {link}");
            continue;
        };
        let instances: Vec<String> = nodes
            .iter()
            .map(|node| format!("zones/{zone}/instances/{node}"))
            .collect();
        requests.push((
            parsed.name.clone(),
            ComputeRequest::igm_delete_instances(
                parsed.project.as_deref().unwrap_or(ctx.project()),
                &zone,
                &parsed.name,
                json!({"instances": instances, "skipInstancesOnValidationError": true}),
            ),
        ));
    }
    let (done, failed) = ctx.executor().batch_execute(requests).await;
    for (name, (_, error)) in &failed {
        log::error!("Failed to delete instances of MIG {name}: {error}");
    }
    for (name, result) in ctx.wait_for_done(done).await {
        match result {
            Ok(operation) if operation.has_error() => log::error!(
                "Failed to delete instances of MIG {name}: {}",
                operation.error_message()
            ),
            Ok(_) => {}
            Err(error) => log::error!("Cannot wait for MIG {name}: {error}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::{TestConfigBuilder, TestEnv, instance_json};
    use gce::testing::{FakeTransport, operation_json};

    fn template_handler(request: &ComputeRequest) -> Option<gce::ApiResult> {
        match request.method_id {
            "compute.instanceTemplates.get" => {
                Some(Ok(json!({"properties": {"machineType": "a4x-highgpu-4g"}})))
            }
            "compute.machineTypes.aggregatedList" => Some(Ok(json!({"items": {"zones/z": {"machineTypes": [
                {"name": "a4x-highgpu-4g", "guestCpus": 140, "memoryMb": 1024,
                 "accelerators": [{"guestAcceleratorType": "nvidia-gb200", "guestAcceleratorCount": 4}]}
            ]}}}))),
            _ => None,
        }
    }

    fn slice_env(handler: impl Fn(&ComputeRequest) -> gce::ApiResult + 'static) -> TestEnv {
        let config = TestConfigBuilder::default()
            .static_nodes(0)
            .dynamic_nodes(36)
            .mig_slices(true)
            .accelerator_topology("1x72")
            .build();
        TestEnv::create(
            config,
            FakeTransport::new(move |request| {
                template_handler(request).unwrap_or_else(|| handler(request))
            }),
        )
    }

    fn nodes(indices: &[u32]) -> Vec<String> {
        indices.iter().map(|i| format!("hpc-n-{i}")).collect()
    }

    #[tokio::test]
    async fn resume_creates_missing_slices() {
        let env = slice_env(|request| match request.method_id {
            "compute.instanceGroupManagers.get" if request.path.ends_with("hpc-n-0") => {
                Ok(json!({"name": "hpc-n-0", "targetSize": 3}))
            }
            "compute.instanceGroupManagers.get" => Err(ApiError::not_found("no mig")),
            _ => Ok(operation_json(&request.path, "DONE")),
        });
        // 18 hosts per slice
        resume_slice_nodes(&env.ctx, &nodes(&[3, 20, 21]), &[])
            .await
            .unwrap();

        let policies = env.transport.requests_of("compute.resourcePolicies.insert");
        assert_eq!(policies.len(), 1);
        let body = policies[0].body.as_ref().unwrap();
        assert_eq!(body["name"], "hpc-n-workload-policy");
        assert_eq!(body["workloadPolicy"]["acceleratorTopology"], "1x72");

        let migs = env.transport.requests_of("compute.instanceGroupManagers.insert");
        assert_eq!(migs.len(), 1);
        let body = migs[0].body.as_ref().unwrap();
        assert_eq!(body["name"], "hpc-n-1");
        assert_eq!(body["targetSize"], 0);
        assert_eq!(
            body["resourcePolicies"]["workloadPolicy"],
            "projects/proj/regions/us-central1/resourcePolicies/hpc-n-workload-policy"
        );

        let creates = env
            .transport
            .requests_of("compute.instanceGroupManagers.createInstances");
        assert_eq!(
            creates.iter().map(|r| r.path.clone()).collect::<Vec<_>>(),
            vec![
                "projects/proj/zones/us-central1-a/instanceGroupManagers/hpc-n-0/createInstances",
                "projects/proj/zones/us-central1-a/instanceGroupManagers/hpc-n-1/createInstances",
            ]
        );
        assert_eq!(
            creates[1].body.as_ref().unwrap()["instances"],
            json!([{"name": "hpc-n-20"}, {"name": "hpc-n-21"}])
        );
        assert!(env.slurm.updates().is_empty());
    }

    #[tokio::test]
    async fn failed_create_instances_puts_nodes_down() {
        let env = slice_env(|request| match request.method_id {
            "compute.instanceGroupManagers.get" => Ok(json!({"name": "hpc-n-0"})),
            "compute.instanceGroupManagers.createInstances" => {
                Err(ApiError::http(400, "invalid", "bad template"))
            }
            _ => Ok(operation_json(&request.path, "DONE")),
        });
        resume_slice_nodes(&env.ctx, &nodes(&[0, 1]), &[]).await.unwrap();
        assert_eq!(
            env.slurm.updates(),
            vec!["update nodename=hpc-n-[0-1] state=down reason=invalid: bad template"]
        );
    }

    #[tokio::test]
    async fn suspend_deletes_only_members() {
        let env = slice_env(|request| match request.method_id {
            "compute.instanceGroupManagers.get" if request.path.ends_with("hpc-n-1") => {
                Err(ApiError::not_found("no mig"))
            }
            "compute.instanceGroupManagers.get" => Ok(json!({"name": "hpc-n-0"})),
            "compute.instanceGroupManagers.listManagedInstances" => Ok(json!({"managedInstances": [
                {"instance": "https://www.googleapis.com/compute/v1/projects/proj/zones/us-central1-a/instances/hpc-n-0"},
                {"instance": "https://www.googleapis.com/compute/v1/projects/proj/zones/us-central1-a/instances/hpc-n-2"},
            ]})),
            _ => Ok(operation_json(&request.path, "DONE")),
        });
        suspend_slice_nodes(&env.ctx, &nodes(&[0, 1, 2, 19])).await.unwrap();
        let deletes = env
            .transport
            .requests_of("compute.instanceGroupManagers.deleteInstances");
        assert_eq!(deletes.len(), 1);
        assert_eq!(
            deletes[0].body.as_ref().unwrap(),
            &json!({
                "instances": [
                    "zones/us-central1-a/instances/hpc-n-0",
                    "zones/us-central1-a/instances/hpc-n-2",
                ],
                "skipInstancesOnValidationError": true,
            })
        );
    }

    #[tokio::test]
    async fn gc_empty_slices() {
        let env = slice_env(|request| match request.method_id {
            "compute.instanceGroupManagers.list" => Ok(json!({"items": [
                {"name": "hpc-n-0", "targetSize": 0},
                {"name": "hpc-n-1", "targetSize": 18},
                {"name": "hpc-n-job-5-abcdef12", "targetSize": 0},
                {"name": "other-mig", "targetSize": 0},
            ]})),
            _ => Ok(operation_json(&request.path, "DONE")),
        });
        sync_slice_migs(&env.ctx).await.unwrap();
        let deleted: Vec<String> = env
            .transport
            .requests_of("compute.instanceGroupManagers.delete")
            .iter()
            .map(|r| r.path.clone())
            .collect();
        assert_eq!(
            deleted,
            vec!["projects/proj/zones/us-central1-a/instanceGroupManagers/hpc-n-0"]
        );
        let policies = env.transport.requests_of("compute.resourcePolicies.delete");
        assert_eq!(
            policies[0].path,
            "projects/proj/regions/us-central1/resourcePolicies/hpc-n-workload-policy"
        );
    }

    #[tokio::test]
    async fn flex_chunk_uses_resize_request() {
        let config = TestConfigBuilder::default().flex(true).build();
        let env = TestEnv::create(config, FakeTransport::accept_all());
        env.slurm
            .set_output("show jobs", "JobId=9 JobState=PENDING TimeLimit=01:00:00\n");
        resume_flex_chunk(&env.ctx, &nodes(&[2, 3]), Some(9), &[])
            .await
            .unwrap();

        let insert = &env.transport.requests_of("compute.instanceGroupManagers.insert")[0];
        let name = insert.body.as_ref().unwrap()["name"].as_str().unwrap().to_string();
        assert!(name.starts_with("hpc-n-job-9-"));
        assert_eq!(name.len(), "hpc-n-job-9-".len() + 8);

        let resize = &env
            .transport
            .requests_of("compute.instanceGroupManagerResizeRequests.insert")[0];
        assert!(resize.path.contains(&format!("/instanceGroupManagers/{name}/")));
        let body = resize.body.as_ref().unwrap();
        assert_eq!(body["instances"], json!([{"name": "hpc-n-2"}, {"name": "hpc-n-3"}]));
        assert_eq!(body["requestedRunDuration"]["seconds"], 3600);
        assert!(env.slurm.updates().is_empty());
    }

    #[tokio::test]
    async fn flex_failure_puts_chunk_down() {
        let config = TestConfigBuilder::default().flex(true).build();
        let env = TestEnv::create(
            config,
            FakeTransport::new(|request| match request.method_id {
                "compute.instanceGroupManagerResizeRequests.insert" => {
                    Err(ApiError::http(403, "QUOTA", "no gpus"))
                }
                _ => Ok(operation_json(&request.path, "DONE")),
            }),
        );
        resume_flex_chunk(&env.ctx, &nodes(&[2]), None, &[]).await.unwrap();
        assert_eq!(
            env.slurm.updates(),
            vec!["update nodename=hpc-n-2 state=down reason=GCP Error: QUOTA: no gpus"]
        );
    }

    #[tokio::test]
    async fn flex_suspend_groups_by_creator() {
        let mig = "https://www.googleapis.com/compute/v1/projects/proj/zones/us-central1-a/instanceGroupManagers/hpc-n-abc";
        let config = TestConfigBuilder::default().flex(true).build();
        let env = TestEnv::create(
            config,
            FakeTransport::new(move |request| match request.method_id {
                "compute.instances.aggregatedList" => {
                    let mut managed = instance_json("hpc-n-2", "RUNNING");
                    managed["metadata"]["items"]
                        .as_array_mut()
                        .unwrap()
                        .push(json!({"key": "created-by", "value": mig}));
                    Ok(json!({"items": {"zones/us-central1-a": {"instances": [
                        managed,
                        instance_json("hpc-n-3", "RUNNING"),
                    ]}}}))
                }
                _ => Ok(operation_json(&request.path, "DONE")),
            }),
        );
        suspend_flex_nodes(&env.ctx, &nodes(&[2, 3, 4])).await.unwrap();
        let deletes = env
            .transport
            .requests_of("compute.instanceGroupManagers.deleteInstances");
        assert_eq!(deletes.len(), 1);
        assert_eq!(
            deletes[0].path,
            "projects/proj/zones/us-central1-a/instanceGroupManagers/hpc-n-abc/deleteInstances"
        );
        assert_eq!(
            deletes[0].body.as_ref().unwrap()["instances"],
            json!(["zones/us-central1-a/instances/hpc-n-2"])
        );
    }
}
