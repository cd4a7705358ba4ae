use crate::error::ApiError;
use crate::request::ComputeRequest;
use crate::selflink::{parse_self_link, trim_self_link};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Long running operation returned by every mutating Compute Engine call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub operation_type: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub target_link: Option<String>,
    #[serde(default)]
    pub self_link: Option<String>,
    #[serde(default)]
    pub operation_group_id: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub error: Option<OperationError>,
    #[serde(default)]
    pub instances_bulk_insert_operation_metadata: Option<BulkInsertMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub errors: Vec<OperationErrorItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationErrorItem {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkInsertMetadata {
    #[serde(default)]
    pub per_location_status: BTreeMap<String, LocationStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationStatus {
    #[serde(default)]
    pub target_vm_count: u32,
    #[serde(default)]
    pub created_vm_count: u32,
}

impl Operation {
    pub fn from_value(value: Value) -> Result<Self, ApiError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn is_done(&self) -> bool {
        self.status == "DONE"
    }

    pub fn has_error(&self) -> bool {
        self.error
            .as_ref()
            .map(|e| !e.errors.is_empty())
            .unwrap_or(false)
    }

    pub fn zone_name(&self) -> Option<&str> {
        self.zone.as_deref().map(trim_self_link)
    }

    pub fn target_name(&self) -> Option<&str> {
        self.target_link.as_deref().map(trim_self_link)
    }

    /// Error codes joined by `+`, used to group failures of the same kind.
    pub fn error_codes(&self) -> String {
        self.error
            .iter()
            .flat_map(|e| e.errors.iter())
            .map(|e| e.code.as_str())
            .collect::<Vec<_>>()
            .join("+")
    }

    /// `CODE: message; CODE2: message2`
    pub fn error_message(&self) -> String {
        self.error
            .iter()
            .flat_map(|e| e.errors.iter())
            .map(|e| {
                format!(
                    "{}: {}",
                    e.code,
                    e.message.as_deref().unwrap_or("no message")
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Sum of VMs created by a bulk insert across all locations.
    pub fn created_vm_count(&self) -> u32 {
        self.instances_bulk_insert_operation_metadata
            .iter()
            .flat_map(|m| m.per_location_status.values())
            .map(|status| status.created_vm_count)
            .sum()
    }

    /// Zones of a bulk insert where not every requested VM was created.
    pub fn short_zones(&self) -> Vec<String> {
        let mut zones = Vec::new();
        for (location, status) in self
            .instances_bulk_insert_operation_metadata
            .iter()
            .flat_map(|m| m.per_location_status.iter())
        {
            match location.split_once('/') {
                Some(("zones", zone)) => {
                    if status.target_vm_count != status.created_vm_count {
                        zones.push(zone.to_string());
                    }
                }
                _ => log::error!("Unexpected location {location} in operation {}", self.name),
            }
        }
        zones
    }

    fn project(&self, default_project: &str) -> String {
        self.self_link
            .as_deref()
            .and_then(|link| parse_self_link(link).project)
            .unwrap_or_else(|| default_project.to_string())
    }

    /// Builds the matching `operations.wait` request (zonal, regional or global).
    pub fn wait_request(&self, default_project: &str) -> ComputeRequest {
        let project = self.project(default_project);
        if let Some(zone) = self.zone.as_deref() {
            ComputeRequest::zone_operation_wait(&project, trim_self_link(zone), &self.name)
        } else if let Some(region) = self.region.as_deref() {
            ComputeRequest::region_operation_wait(&project, trim_self_link(region), &self.name)
        } else {
            ComputeRequest::global_operation_wait(&project, &self.name)
        }
    }
}
