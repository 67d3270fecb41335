//! The cloud provider surface consumed by the outer autoscaling loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::info;

use crate::core::errors::AutoscalerError;
use crate::core::errors::AutoscalerResult;
use crate::core::gce_ref::GceRef;
use crate::core::gce_ref::GroupRef;
use crate::core::manager::GceManager;
use crate::core::manager::ManagerMode;
use crate::core::node_group::GceNodeGroup;
use crate::core::types::Mig;
use crate::core::types::MigSpec;
use crate::core::types::ResourceLimiter;
use crate::core::types::GPU_LABEL;
use crate::core::types::RESOURCE_NVIDIA_GPU;
use crate::template::builder::gpu_taint;
use crate::template::quantity;

pub const GCE_PROVIDER_NAME: &str = "gce";
pub const GKE_PROVIDER_NAME: &str = "gke";

const NODE_AUTOPROVISIONING_PREFIX: &str = "nap";
const MIN_AUTOPROVISIONED_SIZE: i64 = 0;
const MAX_AUTOPROVISIONED_SIZE: i64 = 1000;

const AUTOPROVISIONED_MACHINE_TYPES: &[&str] = &[
    "n1-standard-1",
    "n1-standard-2",
    "n1-standard-4",
    "n1-standard-8",
    "n1-standard-16",
    "n1-highcpu-2",
    "n1-highcpu-4",
    "n1-highcpu-8",
    "n1-highcpu-16",
    "n1-highmem-2",
    "n1-highmem-4",
    "n1-highmem-8",
    "n1-highmem-16",
];

/// Prices of nodes and pods over a time window. Pricing data is supplied by the caller.
pub trait PricingModel: Send + Sync {
    fn node_price(
        &self,
        node: &Node,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AutoscalerResult<f64>;

    fn pod_price(&self, pod: &Pod, start: DateTime<Utc>, end: DateTime<Utc>)
        -> AutoscalerResult<f64>;
}

/// Pricing used when none was injected.
#[derive(Debug, Default)]
pub struct UnimplementedPricing;

impl PricingModel for UnimplementedPricing {
    fn node_price(&self, _: &Node, _: DateTime<Utc>, _: DateTime<Utc>) -> AutoscalerResult<f64> {
        Err(Report::new(AutoscalerError::NotImplemented {
            operation: "node pricing".to_string(),
        }))
    }

    fn pod_price(&self, _: &Pod, _: DateTime<Utc>, _: DateTime<Utc>) -> AutoscalerResult<f64> {
        Err(Report::new(AutoscalerError::NotImplemented {
            operation: "pod pricing".to_string(),
        }))
    }
}

pub struct GceCloudProvider {
    manager: Arc<GceManager>,
    pricing: Arc<dyn PricingModel>,
}

impl GceCloudProvider {
    pub fn new(manager: Arc<GceManager>) -> Self {
        Self {
            manager,
            pricing: Arc::new(UnimplementedPricing),
        }
    }

    pub fn with_pricing(mut self, pricing: Arc<dyn PricingModel>) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn manager(&self) -> &Arc<GceManager> {
        &self.manager
    }

    pub fn name(&self) -> &'static str {
        if self.manager.mode().is_gke() {
            GKE_PROVIDER_NAME
        } else {
            GCE_PROVIDER_NAME
        }
    }

    fn node_group(&self, mig: Mig) -> GceNodeGroup {
        GceNodeGroup::new(mig, self.manager.ops().clone())
    }

    pub fn node_groups(&self) -> Vec<GceNodeGroup> {
        self.manager
            .get_migs()
            .into_iter()
            .map(|mig| self.node_group(mig))
            .collect()
    }

    /// Group the node's instance belongs to; `None` when it is outside every registered group.
    pub async fn node_group_for_node(&self, node: &Node) -> AutoscalerResult<Option<GceNodeGroup>> {
        let provider_id = node
            .spec
            .as_ref()
            .and_then(|spec| spec.provider_id.as_deref())
            .unwrap_or_default();
        let instance = GceRef::from_provider_id(provider_id)?;
        Ok(self
            .manager
            .ops()
            .get_mig_for_instance(&instance)
            .await?
            .map(|mig| self.node_group(mig)))
    }

    pub fn pricing(&self) -> Arc<dyn PricingModel> {
        self.pricing.clone()
    }

    pub fn available_machine_types(&self) -> Vec<String> {
        AUTOPROVISIONED_MACHINE_TYPES
            .iter()
            .map(|t| t.to_string())
            .collect()
    }

    /// Limits from the control plane, else the ones given on the command line.
    pub fn resource_limiter(&self) -> Option<ResourceLimiter> {
        self.manager
            .get_resource_limiter()
            .or_else(|| self.manager.config().flag_resource_limiter.clone())
    }

    /// Describes a group that autoprovisioning could create. Nothing is created in the cloud until
    /// [`GceNodeGroup::create`] is called.
    pub async fn new_node_group(
        &self,
        machine_type: &str,
        mut labels: BTreeMap<String, String>,
        system_labels: &BTreeMap<String, String>,
        mut taints: Vec<Taint>,
        mut extra_resources: BTreeMap<String, Quantity>,
    ) -> AutoscalerResult<GceNodeGroup> {
        if self.manager.mode() != ManagerMode::GkeNap {
            return Err(Report::new(AutoscalerError::NotImplemented {
                operation: format!("new node group in {} mode", self.manager.mode()),
            }));
        }
        let timestamp = Utc::now().timestamp();
        let mut pool_name = format!("{NODE_AUTOPROVISIONING_PREFIX}-{machine_type}-{timestamp}");
        let ops = self.manager.ops();

        if let Some(request) = extra_resources.get(RESOURCE_NVIDIA_GPU) {
            let gpu_type = system_labels.get(GPU_LABEL).ok_or_else(|| {
                Report::new(AutoscalerError::InvalidArgument {
                    message: format!("gpu request without the {GPU_LABEL} system label"),
                })
            })?;
            let requested = quantity::value(request).map_err(|e| {
                Report::new(AutoscalerError::InvalidArgument {
                    message: e.to_string(),
                })
            })?;
            let count = normalized_gpu_count(requested)?;
            extra_resources.insert(RESOURCE_NVIDIA_GPU.to_string(), quantity::from_value(count));
            labels.insert(GPU_LABEL.to_string(), gpu_type.clone());
            taints.push(gpu_taint());
            pool_name = format!("{NODE_AUTOPROVISIONING_PREFIX}-{machine_type}-gpu-{timestamp}");
        }

        let mut mig = Mig::new(
            GroupRef::new(
                ops.project(),
                ops.location(),
                format!("{pool_name}-temporary-mig"),
            ),
            MIN_AUTOPROVISIONED_SIZE,
            MAX_AUTOPROVISIONED_SIZE,
        );
        mig.exist = false;
        mig.autoprovisioned = true;
        mig.node_pool_name = Some(pool_name.clone());
        mig.spec = Some(MigSpec {
            machine_type: machine_type.to_string(),
            labels,
            taints,
            extra_resources,
        });

        let group = self.node_group(mig);
        group
            .template_node()
            .await
            .attach_printable("Failed to build node from spec")?;
        info!(pool = %pool_name, "Prepared autoprovisioned node group");
        Ok(group)
    }

    pub async fn refresh(&self) -> AutoscalerResult<()> {
        self.manager.refresh().await
    }

    pub fn cleanup(&self) {
        self.manager.cleanup();
    }
}

/// GPUs come in 1, 2, 4 or 8 per VM; a request is rounded up to the next supported count.
fn normalized_gpu_count(requested: i64) -> AutoscalerResult<i64> {
    [1, 2, 4, 8]
        .into_iter()
        .find(|&count| requested <= count)
        .ok_or_else(|| {
            Report::new(AutoscalerError::InvalidArgument {
                message: format!("too many gpus requested: {requested}, at most 8 are supported"),
            })
        })
}
