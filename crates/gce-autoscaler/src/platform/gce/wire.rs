//! JSON shapes of the compute v1 REST resources the autoscaler reads and writes.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::core::types::AcceleratorConfig;
use crate::core::types::AttachedDisk;
use crate::core::types::DiskInitializeParams;
use crate::core::types::InstanceProperties;
use crate::core::types::InstanceTemplate;
use crate::core::types::MachineType;
use crate::core::types::ManagedInstanceGroup;
use crate::platform::deserialize_i64_from_string;
use crate::platform::deserialize_optional_u64_from_string;

/// Any paginated list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage<T> {
    #[serde(default = "Vec::new", alias = "managedInstances")]
    pub items: Vec<T>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineTypeResource {
    pub name: String,
    #[serde(deserialize_with = "deserialize_i64_from_string")]
    pub guest_cpus: i64,
    #[serde(deserialize_with = "deserialize_i64_from_string")]
    pub memory_mb: i64,
}

impl From<MachineTypeResource> for MachineType {
    fn from(value: MachineTypeResource) -> Self {
        MachineType::from_api(&value.name, value.guest_cpus, value.memory_mb)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupManagerResource {
    pub name: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub base_instance_name: String,
    #[serde(default, deserialize_with = "deserialize_i64_from_string")]
    pub target_size: i64,
    #[serde(default)]
    pub instance_template: String,
    #[serde(default)]
    pub list_managed_instances_results: String,
    #[serde(default)]
    pub self_link: String,
}

impl From<InstanceGroupManagerResource> for ManagedInstanceGroup {
    fn from(value: InstanceGroupManagerResource) -> Self {
        let zone = value
            .zone
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        ManagedInstanceGroup {
            name: value.name,
            zone,
            base_instance_name: value.base_instance_name,
            target_size: value.target_size,
            instance_template: value.instance_template,
            list_managed_instances_results: value.list_managed_instances_results,
            self_link: value.self_link,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupResource {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedInstanceResource {
    pub instance: String,
    #[serde(default)]
    pub instance_status: String,
    #[serde(default)]
    pub current_action: String,
    #[serde(
        default,
        deserialize_with = "deserialize_optional_u64_from_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<LastAttempt>,
}

impl ManagedInstanceResource {
    pub fn last_attempt_errors(&self) -> &[OperationErrorItem] {
        self.last_attempt
            .as_ref()
            .and_then(|attempt| attempt.errors.as_ref())
            .map(|errors| errors.errors.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LastAttempt {
    #[serde(default)]
    pub errors: Option<OperationErrors>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OperationErrors {
    #[serde(default)]
    pub errors: Vec<OperationErrorItem>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OperationErrorItem {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResource {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub operation_type: String,
    #[serde(default)]
    pub target_link: String,
    #[serde(default)]
    pub error: Option<OperationErrors>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTemplateResource {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    #[serde(default)]
    pub properties: Option<InstancePropertiesResource>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancePropertiesResource {
    #[serde(default)]
    pub machine_type: String,
    #[serde(default)]
    pub guest_accelerators: Vec<AcceleratorResource>,
    #[serde(default)]
    pub metadata: Option<MetadataResource>,
    #[serde(default)]
    pub disks: Option<Vec<AttachedDiskResource>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorResource {
    pub accelerator_type: String,
    #[serde(default, deserialize_with = "deserialize_i64_from_string")]
    pub accelerator_count: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetadataResource {
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDiskResource {
    #[serde(default)]
    pub boot: bool,
    #[serde(default, rename = "type")]
    pub disk_type: String,
    #[serde(default)]
    pub initialize_params: Option<InitializeParamsResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParamsResource {
    #[serde(default, deserialize_with = "deserialize_i64_from_string")]
    pub disk_size_gb: i64,
    #[serde(default)]
    pub disk_type: String,
}

impl From<InstanceTemplateResource> for InstanceTemplate {
    fn from(value: InstanceTemplateResource) -> Self {
        let properties = value.properties.unwrap_or_default();
        let metadata = properties.metadata.map(|metadata| {
            metadata
                .items
                .into_iter()
                .filter_map(|item| item.value.map(|v| (item.key, v)))
                .collect()
        });
        let disks = properties.disks.map(|disks| {
            disks
                .into_iter()
                .map(|disk| AttachedDisk {
                    boot: disk.boot,
                    disk_type: disk.disk_type,
                    initialize_params: disk.initialize_params.map(|params| DiskInitializeParams {
                        disk_size_gb: params.disk_size_gb,
                        // the API may return the full disk type URL
                        disk_type: params
                            .disk_type
                            .rsplit('/')
                            .next()
                            .unwrap_or_default()
                            .to_string(),
                    }),
                })
                .collect()
        });
        InstanceTemplate {
            name: value.name,
            self_link: value.self_link,
            properties: InstanceProperties {
                machine_type: properties.machine_type,
                guest_accelerators: properties
                    .guest_accelerators
                    .into_iter()
                    .map(|accelerator| AcceleratorConfig {
                        accelerator_type: accelerator.accelerator_type,
                        count: accelerator.accelerator_count,
                    })
                    .collect(),
                metadata,
                disks,
                labels: properties.labels,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegionResource {
    #[serde(default)]
    pub zones: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteInstancesRequest {
    pub instances: Vec<String>,
    pub skip_instances_on_validation_error: bool,
}

#[derive(Debug, Serialize)]
pub struct CreateInstancesRequest {
    pub instances: Vec<PerInstanceConfig>,
}

#[derive(Debug, Serialize)]
pub struct PerInstanceConfig {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn template_conversion_keeps_metadata_and_disks() {
        let raw = serde_json::json!({
            "name": "tmpl-1",
            "selfLink": "https://www.googleapis.com/compute/v1/projects/p1/global/instanceTemplates/tmpl-1",
            "properties": {
                "machineType": "n1-standard-1",
                "guestAccelerators": [{"acceleratorType": "nvidia-tesla-k80", "acceleratorCount": 2}],
                "metadata": {"items": [{"key": "kube-env", "value": "A: b\n"}, {"key": "empty"}]},
                "disks": [
                    {"boot": true, "type": "PERSISTENT", "initializeParams": {"diskSizeGb": "100", "diskType": "pd-ssd"}},
                    {"type": "SCRATCH", "initializeParams": {"diskType": "zones/us-central1-b/diskTypes/local-ssd"}}
                ]
            }
        });
        let template: InstanceTemplate =
            serde_json::from_value::<InstanceTemplateResource>(raw).unwrap().into();
        assert_eq!(template.properties.guest_accelerators[0].count, 2);
        assert_eq!(
            template.kube_env_value().unwrap(),
            "A: b\n".to_string()
        );
        let disks = template.properties.disks.unwrap();
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].initialize_params.as_ref().unwrap().disk_size_gb, 100);
        assert_eq!(
            disks[1].initialize_params.as_ref().unwrap().disk_type,
            "local-ssd"
        );
    }

    #[test]
    fn managed_instance_groups_take_zone_name() {
        let raw = serde_json::json!({
            "name": "ng1",
            "zone": "https://www.googleapis.com/compute/v1/projects/p1/zones/us-central1-b",
            "baseInstanceName": "gke-ng1",
            "targetSize": 3,
            "instanceTemplate": "https://www.googleapis.com/compute/v1/projects/p1/global/instanceTemplates/t1"
        });
        let mig: ManagedInstanceGroup =
            serde_json::from_value::<InstanceGroupManagerResource>(raw).unwrap().into();
        assert_eq!(mig.zone, "us-central1-b");
        assert_eq!(mig.target_size, 3);
    }
}
