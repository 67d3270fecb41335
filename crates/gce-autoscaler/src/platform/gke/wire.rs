//! JSON shapes of the container v1 REST resources.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::core::types::Mig;
use crate::core::types::ResourceLimiter;
use crate::core::types::GPU_LABEL;
use crate::core::types::RESOURCE_MEMORY;
use crate::core::types::RESOURCE_NVIDIA_GPU;
use crate::platform::deserialize_i64_from_string;
use crate::platform::gke::client::NodePool;
use crate::template::quantity;

/// The control plane reports memory limits in GB.
const BYTES_PER_GB: i64 = 1_000_000_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolList {
    #[serde(default)]
    pub node_pools: Vec<NodePoolResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolResource {
    pub name: String,
    #[serde(default)]
    pub instance_group_urls: Vec<String>,
    #[serde(default)]
    pub autoscaling: Option<NodePoolAutoscaling>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolAutoscaling {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, deserialize_with = "deserialize_i64_from_string")]
    pub min_node_count: i64,
    #[serde(default, deserialize_with = "deserialize_i64_from_string")]
    pub max_node_count: i64,
    #[serde(default)]
    pub autoprovisioned: bool,
}

impl From<NodePoolResource> for NodePool {
    fn from(value: NodePoolResource) -> Self {
        let autoscaling = value.autoscaling.unwrap_or_default();
        NodePool {
            name: value.name,
            instance_group_urls: value.instance_group_urls,
            autoprovisioned: autoscaling.autoprovisioned,
            min_node_count: autoscaling.min_node_count,
            max_node_count: autoscaling.max_node_count,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResource {
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub autoscaling: Option<ClusterAutoscaling>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAutoscaling {
    #[serde(default)]
    pub resource_limits: Vec<ResourceLimit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimit {
    pub resource_type: String,
    #[serde(default, deserialize_with = "deserialize_i64_from_string")]
    pub minimum: i64,
    #[serde(default, deserialize_with = "deserialize_i64_from_string")]
    pub maximum: i64,
}

impl ClusterAutoscaling {
    /// `None` when no limits are defined; memory is converted from GB to bytes.
    pub fn resource_limiter(&self) -> Option<ResourceLimiter> {
        if self.resource_limits.is_empty() {
            return None;
        }
        let mut min = BTreeMap::new();
        let mut max = BTreeMap::new();
        for limit in &self.resource_limits {
            let scale = if limit.resource_type == RESOURCE_MEMORY {
                BYTES_PER_GB
            } else {
                1
            };
            min.insert(limit.resource_type.clone(), limit.minimum.saturating_mul(scale));
            max.insert(limit.resource_type.clone(), limit.maximum.saturating_mul(scale));
        }
        Some(ResourceLimiter::new(min, max))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOperation {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub target_link: String,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodePoolRequest {
    pub node_pool: NodePoolBody,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolBody {
    pub name: String,
    pub initial_node_count: i64,
    pub config: NodeConfigBody,
    pub autoscaling: NodePoolAutoscaling,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigBody {
    pub machine_type: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<NodeTaintBody>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub accelerators: Vec<AcceleratorBody>,
}

#[derive(Debug, Serialize)]
pub struct NodeTaintBody {
    pub key: String,
    pub value: String,
    pub effect: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorBody {
    pub accelerator_type: String,
    pub accelerator_count: i64,
}

/// Kubernetes taint effect to the container API enum.
fn taint_effect(effect: &str) -> String {
    match effect {
        "NoSchedule" => "NO_SCHEDULE".to_string(),
        "PreferNoSchedule" => "PREFER_NO_SCHEDULE".to_string(),
        "NoExecute" => "NO_EXECUTE".to_string(),
        _ => "EFFECT_UNSPECIFIED".to_string(),
    }
}

impl CreateNodePoolRequest {
    /// Request creating the pool behind an autoprovisioned group, autoscaled within the group's bounds.
    pub fn for_mig(mig: &Mig) -> Self {
        let spec = mig.spec.clone().unwrap_or_default();
        let accelerators = spec
            .extra_resources
            .get(RESOURCE_NVIDIA_GPU)
            .and_then(|count| quantity::value(count).ok())
            .filter(|count| *count > 0)
            .and_then(|count| {
                spec.labels.get(GPU_LABEL).map(|gpu_type| AcceleratorBody {
                    accelerator_type: gpu_type.clone(),
                    accelerator_count: count,
                })
            })
            .into_iter()
            .collect();
        let taints = spec
            .taints
            .iter()
            .map(|taint| NodeTaintBody {
                key: taint.key.clone(),
                value: taint.value.clone().unwrap_or_default(),
                effect: taint_effect(&taint.effect),
            })
            .collect();

        CreateNodePoolRequest {
            node_pool: NodePoolBody {
                name: mig.node_pool_name.clone().unwrap_or_default(),
                initial_node_count: 0,
                config: NodeConfigBody {
                    machine_type: spec.machine_type,
                    labels: spec.labels,
                    taints,
                    accelerators,
                },
                autoscaling: NodePoolAutoscaling {
                    enabled: true,
                    min_node_count: mig.min_size,
                    max_node_count: mig.max_size,
                    autoprovisioned: true,
                },
            },
        }
    }
}
