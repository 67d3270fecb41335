//! Domain types shared by the cache, the info provider and node groups.

use std::collections::BTreeMap;

use error_stack::Report;
use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::core::errors::AutoscalerError;
use crate::core::errors::AutoscalerResult;
use crate::core::gce_ref::GroupRef;
use crate::core::gce_ref::InstanceRef;

pub const MIB: i64 = 1024 * 1024;
pub const GIB: i64 = 1024 * MIB;

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_PODS: &str = "pods";
pub const RESOURCE_EPHEMERAL_STORAGE: &str = "ephemeral-storage";
pub const RESOURCE_NVIDIA_GPU: &str = "nvidia.com/gpu";
/// Node label carrying the accelerator type of GPU nodes.
pub const GPU_LABEL: &str = "cloud.google.com/gke-accelerator";

/// Lifecycle phase of a VM as reported by its managed group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    Creating,
    Running,
    Deleting,
    Unknown,
}

impl InstanceState {
    /// Maps the `currentAction` of a managed instance.
    pub fn from_current_action(action: &str) -> Self {
        match action {
            "CREATING" | "RECREATING" | "CREATING_WITHOUT_RETRIES" => Self::Creating,
            "ABANDONING" | "DELETING" => Self::Deleting,
            _ => Self::Running,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    OutOfResources,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    QuotaExceeded,
    ResourcePoolExhausted,
    IpSpaceExhausted,
    PermissionsError,
    VmExternalIpAccessPolicyConstraint,
    InvalidReservation,
    ReservationNotFound,
    ReservationNotReady,
    ReservationCapacityExceeded,
    ReservationIncompatible,
    UnsupportedTpuConfiguration,
    Other,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::ResourcePoolExhausted => "RESOURCE_POOL_EXHAUSTED",
            Self::IpSpaceExhausted => "IP_SPACE_EXHAUSTED",
            Self::PermissionsError => "PERMISSIONS_ERROR",
            Self::VmExternalIpAccessPolicyConstraint => "VM_EXTERNAL_IP_ACCESS_POLICY_CONSTRAINT",
            Self::InvalidReservation => "INVALID_RESERVATION",
            Self::ReservationNotFound => "RESERVATION_NOT_FOUND",
            Self::ReservationNotReady => "RESERVATION_NOT_READY",
            Self::ReservationCapacityExceeded => "RESERVATION_CAPACITY_EXCEEDED",
            Self::ReservationIncompatible => "RESERVATION_INCOMPATIBLE",
            Self::UnsupportedTpuConfiguration => "UNSUPPORTED_TPU_CONFIGURATION",
            Self::Other => "OTHER",
        }
    }
}

/// Why an instance failed to come up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceErrorInfo {
    pub class: ErrorClass,
    pub code: ErrorCode,
    pub message: String,
}

/// A VM as listed through its managed group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GceInstance {
    pub instance_ref: InstanceRef,
    pub state: InstanceState,
    pub error_info: Option<InstanceErrorInfo>,
    pub numeric_id: Option<u64>,
    pub template_name: Option<InstanceTemplateName>,
}

impl GceInstance {
    pub fn new(instance_ref: InstanceRef, state: InstanceState) -> Self {
        Self {
            instance_ref,
            state,
            error_info: None,
            numeric_id: None,
            template_name: None,
        }
    }

    pub fn provider_id(&self) -> String {
        self.instance_ref.to_provider_id()
    }
}

/// Shape of a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineType {
    pub name: String,
    pub cpu: i64,
    /// Memory in bytes.
    pub memory: i64,
}

impl MachineType {
    pub fn is_custom(name: &str) -> bool {
        name.starts_with("custom-")
    }

    /// Parses `custom-<cpu>-<memMiB>`. Anything after the memory field, such as the `-ext`
    /// of extended-memory types, is ignored.
    pub fn parse_custom(name: &str) -> AutoscalerResult<Self> {
        let invalid = || {
            Report::new(AutoscalerError::InvalidArgument {
                message: format!("failed to parse all params in {name}"),
            })
        };
        let rest = name.strip_prefix("custom-").ok_or_else(invalid)?;
        let mut parts = rest.split('-');
        let (Some(cpu), Some(mem_mib)) = (parts.next(), parts.next()) else {
            return Err(invalid());
        };
        let cpu: i64 = cpu.parse().map_err(|_| invalid())?;
        let mem_mib: i64 = mem_mib.parse().map_err(|_| invalid())?;
        Ok(Self {
            name: name.to_string(),
            cpu,
            memory: mem_mib * MIB,
        })
    }

    /// Builds a machine type from the API fields (`guestCpus`, `memoryMb`).
    pub fn from_api(name: &str, guest_cpus: i64, memory_mb: i64) -> Self {
        Self {
            name: name.to_string(),
            cpu: guest_cpus,
            memory: memory_mb * MIB,
        }
    }
}

/// Name of a group's launch template and whether it lives in a region rather than globally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct InstanceTemplateName {
    pub name: String,
    pub regional: bool,
}

impl InstanceTemplateName {
    /// Derives the name from a template URL: the last path segment, regional when the URL
    /// contains a `/regions/` segment.
    pub fn from_url(template_url: &str) -> Option<Self> {
        let path = template_url.split(['?', '#']).next()?;
        let name = path.rsplit('/').next()?;
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            regional: path.contains("/regions/"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorConfig {
    pub accelerator_type: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskInitializeParams {
    pub disk_size_gb: i64,
    pub disk_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachedDisk {
    pub boot: bool,
    /// `PERSISTENT` or `SCRATCH`.
    pub disk_type: String,
    pub initialize_params: Option<DiskInitializeParams>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceProperties {
    pub machine_type: String,
    pub guest_accelerators: Vec<AcceleratorConfig>,
    /// `None` when the template carries no metadata block at all.
    pub metadata: Option<BTreeMap<String, String>>,
    /// `None` when the template carries no disk list at all.
    pub disks: Option<Vec<AttachedDisk>>,
    pub labels: BTreeMap<String, String>,
}

/// Launch template of a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceTemplate {
    pub name: String,
    pub self_link: String,
    pub properties: InstanceProperties,
}

impl InstanceTemplate {
    /// Raw `kube-env` document.
    ///
    /// Errors when the template has no metadata block; an absent key yields an empty document.
    pub fn kube_env_value(&self) -> AutoscalerResult<String> {
        let metadata = self.properties.metadata.as_ref().ok_or_else(|| {
            Report::new(AutoscalerError::TemplateMissingKubeEnv {
                template: self.name.clone(),
            })
            .attach_printable(format!("instance template {} has no metadata", self.name))
        })?;
        Ok(metadata.get("kube-env").cloned().unwrap_or_default())
    }
}

/// A managed instance group as listed by the compute API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedInstanceGroup {
    pub name: String,
    pub zone: String,
    pub base_instance_name: String,
    pub target_size: i64,
    pub instance_template: String,
    pub list_managed_instances_results: String,
    pub self_link: String,
}

/// Shape requested for an autoprovisioned group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigSpec {
    pub machine_type: String,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub extra_resources: BTreeMap<String, Quantity>,
}

/// A registered group: identity, bounds and, for autoprovisioned groups, the requested shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Mig {
    pub gce_ref: GroupRef,
    pub min_size: i64,
    pub max_size: i64,
    pub autoprovisioned: bool,
    pub exist: bool,
    pub node_pool_name: Option<String>,
    pub spec: Option<MigSpec>,
}

impl Mig {
    pub fn new(gce_ref: GroupRef, min_size: i64, max_size: i64) -> Self {
        Self {
            gce_ref,
            min_size,
            max_size,
            autoprovisioned: false,
            exist: true,
            node_pool_name: None,
            spec: None,
        }
    }
}

/// Bounds on cluster-wide resources, keyed by resource name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimiter {
    min_limits: BTreeMap<String, i64>,
    max_limits: BTreeMap<String, i64>,
}

impl ResourceLimiter {
    pub fn new(min_limits: BTreeMap<String, i64>, max_limits: BTreeMap<String, i64>) -> Self {
        Self {
            min_limits,
            max_limits,
        }
    }

    pub fn min(&self, resource: &str) -> i64 {
        self.min_limits.get(resource).copied().unwrap_or(0)
    }

    pub fn max(&self, resource: &str) -> i64 {
        self.max_limits.get(resource).copied().unwrap_or(i64::MAX)
    }

    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.max_limits.keys().map(String::as_str)
    }
}
