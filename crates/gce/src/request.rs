use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

/// API root the request path is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Compute,
    Tpu,
}

/// A single REST call against the Compute Engine (or Cloud TPU) API.
///
/// Requests are plain data so that they can be batched, logged, retried and
/// inspected by tests without touching the network.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeRequest {
    /// Discovery style identifier, e.g. `compute.instances.bulkInsert`.
    pub method_id: &'static str,
    pub service: Service,
    pub http_method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl fmt::Display for ComputeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method_id, self.path)
    }
}

impl ComputeRequest {
    fn new(
        method_id: &'static str,
        http_method: HttpMethod,
        path: String,
        body: Option<Value>,
    ) -> Self {
        ComputeRequest {
            method_id,
            service: Service::Compute,
            http_method,
            path,
            query: Vec::new(),
            body,
        }
    }

    fn tpu(method_id: &'static str, http_method: HttpMethod, path: String) -> Self {
        ComputeRequest {
            service: Service::Tpu,
            ..Self::new(method_id, http_method, path, None)
        }
    }

    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.retain(|(k, _)| k != key);
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn with_filter(self, filter: impl Into<String>) -> Self {
        self.with_query("filter", filter)
    }

    pub fn with_page_token(self, token: impl Into<String>) -> Self {
        self.with_query("pageToken", token)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    // Instances

    pub fn instances_aggregated_list(project: &str) -> Self {
        Self::new(
            "compute.instances.aggregatedList",
            HttpMethod::Get,
            format!("projects/{project}/aggregated/instances"),
            None,
        )
    }

    pub fn instances_bulk_insert(project: &str, zone: &str, body: Value) -> Self {
        Self::new(
            "compute.instances.bulkInsert",
            HttpMethod::Post,
            format!("projects/{project}/zones/{zone}/instances/bulkInsert"),
            Some(body),
        )
    }

    pub fn region_instances_bulk_insert(project: &str, region: &str, body: Value) -> Self {
        Self::new(
            "compute.regionInstances.bulkInsert",
            HttpMethod::Post,
            format!("projects/{project}/regions/{region}/instances/bulkInsert"),
            Some(body),
        )
    }

    pub fn instance_delete(project: &str, zone: &str, name: &str) -> Self {
        Self::new(
            "compute.instances.delete",
            HttpMethod::Delete,
            format!("projects/{project}/zones/{zone}/instances/{name}"),
            None,
        )
    }

    pub fn instance_start(project: &str, zone: &str, name: &str) -> Self {
        Self::new(
            "compute.instances.start",
            HttpMethod::Post,
            format!("projects/{project}/zones/{zone}/instances/{name}/start"),
            None,
        )
    }

    // Templates, machine types and reservations

    pub fn instance_template_get(project: &str, name: &str) -> Self {
        Self::new(
            "compute.instanceTemplates.get",
            HttpMethod::Get,
            format!("projects/{project}/global/instanceTemplates/{name}"),
            None,
        )
    }

    pub fn region_instance_template_get(project: &str, region: &str, name: &str) -> Self {
        Self::new(
            "compute.regionInstanceTemplates.get",
            HttpMethod::Get,
            format!("projects/{project}/regions/{region}/instanceTemplates/{name}"),
            None,
        )
    }

    pub fn machine_types_aggregated_list(project: &str) -> Self {
        Self::new(
            "compute.machineTypes.aggregatedList",
            HttpMethod::Get,
            format!("projects/{project}/aggregated/machineTypes"),
            None,
        )
    }

    pub fn reservation_get(project: &str, zone: &str, name: &str) -> Self {
        Self::new(
            "compute.reservations.get",
            HttpMethod::Get,
            format!("projects/{project}/zones/{zone}/reservations/{name}"),
            None,
        )
    }

    pub fn future_reservation_get(project: &str, zone: &str, name: &str) -> Self {
        Self::new(
            "compute.futureReservations.get",
            HttpMethod::Get,
            format!("projects/{project}/zones/{zone}/futureReservations/{name}"),
            None,
        )
    }

    // Resource policies

    pub fn resource_policy_insert(project: &str, region: &str, body: Value) -> Self {
        Self::new(
            "compute.resourcePolicies.insert",
            HttpMethod::Post,
            format!("projects/{project}/regions/{region}/resourcePolicies"),
            Some(body),
        )
    }

    pub fn resource_policy_delete(project: &str, region: &str, name: &str) -> Self {
        Self::new(
            "compute.resourcePolicies.delete",
            HttpMethod::Delete,
            format!("projects/{project}/regions/{region}/resourcePolicies/{name}"),
            None,
        )
    }

    pub fn resource_policies_list(project: &str, region: &str) -> Self {
        Self::new(
            "compute.resourcePolicies.list",
            HttpMethod::Get,
            format!("projects/{project}/regions/{region}/resourcePolicies"),
            None,
        )
    }

    // Managed instance groups

    pub fn igm_insert(project: &str, zone: &str, body: Value) -> Self {
        Self::new(
            "compute.instanceGroupManagers.insert",
            HttpMethod::Post,
            format!("projects/{project}/zones/{zone}/instanceGroupManagers"),
            Some(body),
        )
    }

    pub fn igm_get(project: &str, zone: &str, name: &str) -> Self {
        Self::new(
            "compute.instanceGroupManagers.get",
            HttpMethod::Get,
            format!("projects/{project}/zones/{zone}/instanceGroupManagers/{name}"),
            None,
        )
    }

    pub fn igm_list(project: &str, zone: &str) -> Self {
        Self::new(
            "compute.instanceGroupManagers.list",
            HttpMethod::Get,
            format!("projects/{project}/zones/{zone}/instanceGroupManagers"),
            None,
        )
    }

    pub fn igm_delete(project: &str, zone: &str, name: &str) -> Self {
        Self::new(
            "compute.instanceGroupManagers.delete",
            HttpMethod::Delete,
            format!("projects/{project}/zones/{zone}/instanceGroupManagers/{name}"),
            None,
        )
    }

    pub fn igm_create_instances(project: &str, zone: &str, igm: &str, body: Value) -> Self {
        Self::new(
            "compute.instanceGroupManagers.createInstances",
            HttpMethod::Post,
            format!("projects/{project}/zones/{zone}/instanceGroupManagers/{igm}/createInstances"),
            Some(body),
        )
    }

    pub fn igm_delete_instances(project: &str, zone: &str, igm: &str, body: Value) -> Self {
        Self::new(
            "compute.instanceGroupManagers.deleteInstances",
            HttpMethod::Post,
            format!("projects/{project}/zones/{zone}/instanceGroupManagers/{igm}/deleteInstances"),
            Some(body),
        )
    }

    pub fn igm_list_managed_instances(project: &str, zone: &str, igm: &str) -> Self {
        Self::new(
            "compute.instanceGroupManagers.listManagedInstances",
            HttpMethod::Post,
            format!(
                "projects/{project}/zones/{zone}/instanceGroupManagers/{igm}/listManagedInstances"
            ),
            None,
        )
    }

    pub fn igm_resize_request_insert(project: &str, zone: &str, igm: &str, body: Value) -> Self {
        Self::new(
            "compute.instanceGroupManagerResizeRequests.insert",
            HttpMethod::Post,
            format!("projects/{project}/zones/{zone}/instanceGroupManagers/{igm}/resizeRequests"),
            Some(body),
        )
    }

    // Operations

    pub fn zone_operation_get(project: &str, zone: &str, name: &str) -> Self {
        Self::new(
            "compute.zoneOperations.get",
            HttpMethod::Get,
            format!("projects/{project}/zones/{zone}/operations/{name}"),
            None,
        )
    }

    pub fn zone_operation_wait(project: &str, zone: &str, name: &str) -> Self {
        Self::new(
            "compute.zoneOperations.wait",
            HttpMethod::Post,
            format!("projects/{project}/zones/{zone}/operations/{name}/wait"),
            None,
        )
    }

    pub fn zone_operations_list(project: &str, zone: &str) -> Self {
        Self::new(
            "compute.zoneOperations.list",
            HttpMethod::Get,
            format!("projects/{project}/zones/{zone}/operations"),
            None,
        )
    }

    pub fn region_operation_wait(project: &str, region: &str, name: &str) -> Self {
        Self::new(
            "compute.regionOperations.wait",
            HttpMethod::Post,
            format!("projects/{project}/regions/{region}/operations/{name}/wait"),
            None,
        )
    }

    pub fn global_operation_wait(project: &str, name: &str) -> Self {
        Self::new(
            "compute.globalOperations.wait",
            HttpMethod::Post,
            format!("projects/{project}/global/operations/{name}/wait"),
            None,
        )
    }

    // Cloud TPU

    pub fn tpu_node_create(project: &str, zone: &str, node_id: &str, body: Value) -> Self {
        Self::tpu(
            "tpu.projects.locations.nodes.create",
            HttpMethod::Post,
            format!("projects/{project}/locations/{zone}/nodes"),
        )
        .with_query("nodeId", node_id)
        .with_body(body)
    }

    pub fn tpu_node_get(project: &str, zone: &str, node_id: &str) -> Self {
        Self::tpu(
            "tpu.projects.locations.nodes.get",
            HttpMethod::Get,
            format!("projects/{project}/locations/{zone}/nodes/{node_id}"),
        )
    }

    pub fn tpu_nodes_list(project: &str, zone: &str) -> Self {
        Self::tpu(
            "tpu.projects.locations.nodes.list",
            HttpMethod::Get,
            format!("projects/{project}/locations/{zone}/nodes"),
        )
    }

    pub fn tpu_node_delete(project: &str, zone: &str, node_id: &str) -> Self {
        Self::tpu(
            "tpu.projects.locations.nodes.delete",
            HttpMethod::Delete,
            format!("projects/{project}/locations/{zone}/nodes/{node_id}"),
        )
    }

    pub fn tpu_node_stop(project: &str, zone: &str, node_id: &str) -> Self {
        Self::tpu(
            "tpu.projects.locations.nodes.stop",
            HttpMethod::Post,
            format!("projects/{project}/locations/{zone}/nodes/{node_id}:stop"),
        )
    }

    pub fn tpu_node_start(project: &str, zone: &str, node_id: &str) -> Self {
        Self::tpu(
            "tpu.projects.locations.nodes.start",
            HttpMethod::Post,
            format!("projects/{project}/locations/{zone}/nodes/{node_id}:start"),
        )
    }

    /// `name` is the full operation name, `projects/*/locations/*/operations/*`.
    pub fn tpu_operation_get(name: &str) -> Self {
        Self::tpu(
            "tpu.projects.locations.operations.get",
            HttpMethod::Get,
            name.to_string(),
        )
    }
}
