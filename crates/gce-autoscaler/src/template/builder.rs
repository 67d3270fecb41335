//! Synthesizes the `Node` a group would produce, so the autoscaler can scale groups up from zero.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use chrono::Utc;
use error_stack::Report;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::NodeCondition;
use k8s_openapi::api::core::v1::NodeSpec;
use k8s_openapi::api::core::v1::NodeStatus;
use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use rand::Rng;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::core::errors::AutoscalerError;
use crate::core::errors::AutoscalerResult;
use crate::core::gce_ref::GceRef;
use crate::core::types::AcceleratorConfig;
use crate::core::types::InstanceProperties;
use crate::core::types::InstanceTemplate;
use crate::core::types::MachineType;
use crate::core::types::Mig;
use crate::core::types::GIB;
use crate::core::types::RESOURCE_CPU;
use crate::core::types::RESOURCE_EPHEMERAL_STORAGE;
use crate::core::types::RESOURCE_MEMORY;
use crate::core::types::RESOURCE_NVIDIA_GPU;
use crate::core::types::RESOURCE_PODS;
use crate::template::kube_env::KubeEnv;
use crate::template::os_info::MigOsInfo;
use crate::template::quantity;
use crate::template::reserved::kube_reserved_cpu_milli;
use crate::template::reserved::kube_reserved_memory;
use crate::template::reserved::local_ssd_filesystem_overhead;
use crate::template::reserved::EvictionHard;
use crate::template::reserved::GceReserved;
use crate::template::reserved::ReservedCalculator;

pub const DEFAULT_MAX_PODS_PER_NODE: i64 = 110;
pub const LOCAL_SSD_DISK_SIZE: i64 = 375 * GIB;

pub const BOOT_DISK_SIZE_ANNOTATION: &str = "cluster-autoscaler/gce/boot-disk-size";
pub const BOOT_DISK_TYPE_ANNOTATION: &str = "cluster-autoscaler/gce/boot-disk-type";
pub const EPHEMERAL_STORAGE_LOCAL_SSD_ANNOTATION: &str =
    "cluster-autoscaler/gce/ephemeral-storage-local-ssd";
pub const LOCAL_SSD_COUNT_ANNOTATION: &str = "cluster-autoscaler/gce/local-ssd-count";
pub const NODE_POOL_LABEL: &str = "cloud.google.com/gke-nodepool";

const LABEL_ARCH: &str = "kubernetes.io/arch";
const LABEL_OS: &str = "kubernetes.io/os";
const LABEL_OS_BETA: &str = "beta.kubernetes.io/os";
const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
const LABEL_REGION: &str = "topology.kubernetes.io/region";
const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
const LABEL_CSI_ZONE: &str = "topology.gke.io/zone";
const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";

const GPU_VENDOR_PREFIX: &str = "nvidia-";
const SCRATCH_DISK: &str = "SCRATCH";
const LOCAL_SSD_DISK_TYPE: &str = "local-ssd";

pub type ResourceList = BTreeMap<String, Quantity>;

fn template_error(message: impl Into<String>) -> Report<AutoscalerError> {
    Report::new(AutoscalerError::Template {
        message: message.into(),
    })
}

fn kube_env_error(message: impl Into<String>) -> Report<AutoscalerError> {
    Report::new(AutoscalerError::KubeEnv {
        message: message.into(),
    })
}

fn random_suffix() -> i64 {
    rand::rng().random_range(0..i64::MAX)
}

/// Millis for cpu, base units for everything else.
fn amount(resource: &str, value: &Quantity) -> Option<i64> {
    let parsed = if resource == RESOURCE_CPU {
        quantity::milli_value(value)
    } else {
        quantity::value(value)
    };
    match parsed {
        Ok(amount) => Some(amount),
        Err(e) => {
            warn!(resource, "ignoring unparsable quantity {:?}: {e}", value.0);
            None
        }
    }
}

fn to_quantity(resource: &str, amount: i64) -> Quantity {
    if resource == RESOURCE_CPU {
        quantity::from_milli_value(amount)
    } else {
        quantity::from_value(amount)
    }
}

/// `cpu`, `memory` and `ephemeral-storage` entries of a kube-reserved list; other resources,
/// unparsable and negative quantities are dropped.
pub fn parse_kube_reserved(kube_reserved: &str) -> AutoscalerResult<ResourceList> {
    let entries = crate::template::kube_env::parse_key_value_list(kube_reserved)
        .map_err(|e| kube_env_error(format!("failed to extract kube-reserved: {e}")))?;
    let mut reserved = ResourceList::new();
    for (name, value) in entries {
        match name.as_str() {
            RESOURCE_CPU | RESOURCE_MEMORY | RESOURCE_EPHEMERAL_STORAGE => {
                if quantity::parse_milli_value(&value).is_ok_and(|amount| amount >= 0) {
                    reserved.insert(name, Quantity(value));
                }
            }
            _ => warn!("ignoring resource from kube-reserved: {name:?}"),
        }
    }
    Ok(reserved)
}

/// `Ready` and the pressure conditions of a healthy node, transitioned a minute ago.
pub fn build_ready_conditions() -> Vec<NodeCondition> {
    let last_transition = Time(Utc::now() - ChronoDuration::minutes(1));
    [
        ("Ready", "True"),
        ("NetworkUnavailable", "False"),
        ("DiskPressure", "False"),
        ("MemoryPressure", "False"),
    ]
    .into_iter()
    .map(|(type_, status)| NodeCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        last_transition_time: Some(last_transition.clone()),
        ..Default::default()
    })
    .collect()
}

/// Labels every node of a group carries regardless of kube-env.
pub fn build_generic_labels(
    group: &GceRef,
    machine_type: &str,
    node_name: &str,
    os_info: &MigOsInfo,
) -> AutoscalerResult<BTreeMap<String, String>> {
    let (region, _) = group
        .zone
        .rsplit_once('-')
        .ok_or_else(|| template_error(format!("unexpected zone: {}", group.zone)))?;
    let os = os_info.os.to_string();
    Ok(BTreeMap::from([
        (LABEL_ARCH.to_string(), os_info.arch.to_string()),
        (LABEL_OS.to_string(), os.clone()),
        (LABEL_OS_BETA.to_string(), os),
        (LABEL_INSTANCE_TYPE.to_string(), machine_type.to_string()),
        (LABEL_REGION.to_string(), region.to_string()),
        (LABEL_ZONE.to_string(), group.zone.clone()),
        (LABEL_CSI_ZONE.to_string(), group.zone.clone()),
        (LABEL_HOSTNAME.to_string(), node_name.to_string()),
    ]))
}

/// What the kubelet of a managed node reserves for itself, derived from its memory and cpu.
fn bracketed_kube_reserved(capacity: &ResourceList) -> ResourceList {
    let mut reserved = ResourceList::new();
    if let Some(memory) = capacity
        .get(RESOURCE_MEMORY)
        .and_then(|m| amount(RESOURCE_MEMORY, m))
    {
        reserved.insert(
            RESOURCE_MEMORY.to_string(),
            quantity::from_value(kube_reserved_memory(memory)),
        );
    }
    if let Some(cpu) = capacity.get(RESOURCE_CPU).and_then(|c| amount(RESOURCE_CPU, c)) {
        reserved.insert(
            RESOURCE_CPU.to_string(),
            quantity::from_milli_value(kube_reserved_cpu_milli(cpu)),
        );
    }
    reserved
}

fn gpu_count(accelerators: &[AcceleratorConfig]) -> i64 {
    accelerators
        .iter()
        .filter(|accelerator| accelerator.accelerator_type.starts_with(GPU_VENDOR_PREFIX))
        .map(|accelerator| accelerator.count)
        .sum()
}

fn has_gpu_taint(taints: &[Taint]) -> bool {
    taints.iter().any(|taint| taint.key == RESOURCE_NVIDIA_GPU)
}

pub fn gpu_taint() -> Taint {
    Taint {
        key: RESOURCE_NVIDIA_GPU.to_string(),
        value: Some("present".to_string()),
        effect: "NoSchedule".to_string(),
        time_added: None,
    }
}

fn add_annotation(node: &mut Node, key: &str, value: String) {
    node.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value);
}

fn boot_disk_annotations(node: &mut Node, properties: &InstanceProperties) {
    let Some(boot) = properties
        .disks
        .iter()
        .flatten()
        .find(|disk| disk.boot)
        .and_then(|disk| disk.initialize_params.as_ref())
    else {
        return;
    };
    if boot.disk_size_gb > 0 {
        add_annotation(node, BOOT_DISK_SIZE_ANNOTATION, boot.disk_size_gb.to_string());
    }
    if !boot.disk_type.is_empty() {
        add_annotation(node, BOOT_DISK_TYPE_ANNOTATION, boot.disk_type.clone());
    }
}

/// Boot disk size in bytes, 0 when the template has no boot disk.
fn boot_disk_ephemeral_storage(properties: &InstanceProperties) -> AutoscalerResult<i64> {
    let disks = properties.disks.as_ref().ok_or_else(|| {
        template_error(
            "could not fetch ephemeral storage from instance template: instance properties disks is nil",
        )
    })?;
    Ok(disks
        .iter()
        .find(|disk| disk.boot)
        .and_then(|disk| disk.initialize_params.as_ref())
        .map(|params| params.disk_size_gb * GIB)
        .unwrap_or_default())
}

fn local_ssd_count(properties: &InstanceProperties) -> i64 {
    properties
        .disks
        .iter()
        .flatten()
        .filter(|disk| disk.disk_type == SCRATCH_DISK)
        .filter(|disk| {
            disk.initialize_params
                .as_ref()
                .is_some_and(|params| params.disk_type == LOCAL_SSD_DISK_TYPE)
        })
        .count() as i64
}

/// Builds template nodes from launch templates and from autoprovisioning specs.
#[derive(Clone)]
pub struct TemplateBuilder {
    reserved: Arc<dyn ReservedCalculator>,
}

impl Default for TemplateBuilder {
    fn default() -> Self {
        Self::new(Arc::new(GceReserved))
    }
}

impl std::fmt::Debug for TemplateBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateBuilder").finish_non_exhaustive()
    }
}

impl TemplateBuilder {
    pub fn new(reserved: Arc<dyn ReservedCalculator>) -> Self {
        Self { reserved }
    }

    pub fn mig_os_info(&self, mig_id: &str, kube_env: &KubeEnv) -> AutoscalerResult<MigOsInfo> {
        MigOsInfo::from_kube_env(mig_id, kube_env)
    }

    /// Physical resources of a node as the kubelet reports them.
    ///
    /// Ephemeral storage is only set for a positive `ephemeral_storage`; it is reduced by the
    /// local SSD filesystem overhead when SSDs back it, by the OS image otherwise.
    pub fn build_capacity(
        &self,
        machine: &MachineType,
        accelerators: &[AcceleratorConfig],
        os_info: &MigOsInfo,
        ephemeral_storage: i64,
        ephemeral_storage_local_ssd_count: i64,
        pods: Option<i64>,
        extended_resources: &ResourceList,
    ) -> ResourceList {
        let mut capacity = ResourceList::new();
        capacity.insert(
            RESOURCE_PODS.to_string(),
            quantity::from_value(pods.unwrap_or(DEFAULT_MAX_PODS_PER_NODE)),
        );
        capacity.insert(RESOURCE_CPU.to_string(), quantity::from_value(machine.cpu));
        let memory = machine.memory - self.reserved.kernel_reserved(os_info, machine.memory);
        capacity.insert(RESOURCE_MEMORY.to_string(), quantity::from_value(memory));

        if !accelerators.is_empty() {
            capacity.insert(
                RESOURCE_NVIDIA_GPU.to_string(),
                quantity::from_value(gpu_count(accelerators)),
            );
        }

        if ephemeral_storage > 0 {
            let overhead = if ephemeral_storage_local_ssd_count > 0 {
                local_ssd_filesystem_overhead(ephemeral_storage_local_ssd_count, os_info.distribution)
            } else {
                self.reserved
                    .os_reserved_ephemeral_storage(os_info, ephemeral_storage)
            };
            capacity.insert(
                RESOURCE_EPHEMERAL_STORAGE.to_string(),
                quantity::from_value((ephemeral_storage - overhead).max(0)),
            );
        }

        capacity.extend(extended_resources.clone());
        capacity
    }

    /// `capacity - kube_reserved`, additionally minus the hard eviction thresholds for memory
    /// and ephemeral storage.
    pub fn calculate_allocatable(
        &self,
        capacity: &ResourceList,
        kube_reserved: &ResourceList,
        eviction_hard: &EvictionHard,
    ) -> ResourceList {
        let mut allocatable = ResourceList::new();
        for (name, value) in capacity {
            let Some(total) = amount(name, value) else {
                allocatable.insert(name.clone(), value.clone());
                continue;
            };
            let mut remaining = total;
            if let Some(reserved) = kube_reserved.get(name).and_then(|r| amount(name, r)) {
                remaining -= reserved;
            }
            match name.as_str() {
                RESOURCE_MEMORY => remaining -= eviction_hard.memory,
                RESOURCE_EPHEMERAL_STORAGE => {
                    remaining -= eviction_hard.ephemeral_storage(total)
                }
                _ => {}
            }
            allocatable.insert(name.clone(), to_quantity(name, remaining));
        }
        allocatable
    }

    /// Allocatable of a managed node, reserving what the kubelet would on its memory and cpu.
    pub fn build_allocatable_from_capacity(&self, capacity: &ResourceList) -> ResourceList {
        self.calculate_allocatable(
            capacity,
            &bracketed_kube_reserved(capacity),
            &EvictionHard::default(),
        )
    }

    /// Node a new instance of `mig` created from `template` would register as.
    pub fn build_node_from_template(
        &self,
        mig: &Mig,
        os_info: &MigOsInfo,
        template: &InstanceTemplate,
        kube_env: &KubeEnv,
        machine: &MachineType,
        pods: Option<i64>,
    ) -> AutoscalerResult<Node> {
        let properties = &template.properties;
        let node_name = format!("{}-template-{}", template.name, random_suffix());
        let mut node = Node {
            metadata: ObjectMeta {
                name: Some(node_name.clone()),
                self_link: Some(format!("/api/v1/nodes/{node_name}")),
                labels: Some(BTreeMap::new()),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            ..Default::default()
        };

        boot_disk_annotations(&mut node, properties);

        let mut ephemeral_storage = -1;
        if kube_env.boot_disk_ephemeral_storage_blocked() {
            add_annotation(
                &mut node,
                EPHEMERAL_STORAGE_LOCAL_SSD_ANNOTATION,
                "true".to_string(),
            );
        } else {
            ephemeral_storage = boot_disk_ephemeral_storage(properties)?;
        }

        let extended_resources = match kube_env.extended_resources() {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|(name, value)| match quantity::parse_value(&value) {
                    Ok(_) => Some((name, Quantity(value))),
                    Err(e) => {
                        error!(mig = %mig.gce_ref, "error while obtaining extended resource {name}: {e}");
                        None
                    }
                })
                .collect(),
            Err(e) => {
                error!(mig = %mig.gce_ref, "error while obtaining extended resources from kube-env: {e}");
                ResourceList::new()
            }
        };

        let ssd_requested = kube_env.ephemeral_storage_local_ssd_count();
        let ssd_attached = local_ssd_count(properties);
        if ssd_attached > 0 {
            add_annotation(&mut node, LOCAL_SSD_COUNT_ANNOTATION, ssd_attached.to_string());
        }
        if ssd_requested > 0 {
            if ssd_attached < ssd_requested {
                return Err(template_error(
                    "could not fetch ephemeral storage from instance template: actual local SSD count is lower than ephemeral_storage_local_ssd_count",
                ));
            }
            ephemeral_storage = ssd_requested * LOCAL_SSD_DISK_SIZE;
        }

        let capacity = self.build_capacity(
            machine,
            &properties.guest_accelerators,
            os_info,
            ephemeral_storage,
            ssd_requested,
            pods,
            &extended_resources,
        );

        let mut labels = BTreeMap::new();
        let mut taints = Vec::new();
        let mut allocatable = None;
        if !kube_env.is_empty() {
            labels = kube_env
                .labels()
                .map_err(|e| kube_env_error(format!("failed to extract labels: {e}")))?;
            taints = kube_env
                .taints()
                .map_err(|e| kube_env_error(format!("failed to extract taints: {e}")))?;

            let eviction_values = kube_env.eviction_hard().unwrap_or_else(|e| {
                warn!(mig = %mig.gce_ref, "error while obtaining eviction-hard from kube-env: {e}");
                BTreeMap::new()
            });
            if eviction_values.is_empty() {
                debug!(mig = %mig.gce_ref, "no evictionHard in kube-env, using defaults");
            }
            let eviction_hard = EvictionHard::parse_or_default(&eviction_values);

            allocatable = Some(match kube_env.kube_reserved() {
                Some(raw) => match parse_kube_reserved(&raw) {
                    Ok(reserved) => self.calculate_allocatable(&capacity, &reserved, &eviction_hard),
                    Err(e) => {
                        warn!(mig = %mig.gce_ref, "could not extract kube-reserved from kubeEnv for mig {}, setting allocatable to capacity: {e:?}", mig.gce_ref.name);
                        capacity.clone()
                    }
                },
                None => self.calculate_allocatable(
                    &capacity,
                    &bracketed_kube_reserved(&capacity),
                    &eviction_hard,
                ),
            });
        }

        if !properties.guest_accelerators.is_empty() && !has_gpu_taint(&taints) {
            taints.push(gpu_taint());
        }

        labels.extend(build_generic_labels(
            &mig.gce_ref,
            &properties.machine_type,
            &node_name,
            os_info,
        )?);

        node.metadata.labels = Some(labels);
        if let Some(spec) = node.spec.as_mut() {
            spec.taints = (!taints.is_empty()).then_some(taints);
        }
        node.status = Some(NodeStatus {
            allocatable: Some(allocatable.unwrap_or_else(|| capacity.clone())),
            capacity: Some(capacity),
            conditions: Some(build_ready_conditions()),
            ..Default::default()
        });
        Ok(node)
    }

    /// Node an autoprovisioned group would produce, from its spec and machine shape alone.
    pub fn build_node_from_mig_spec(&self, mig: &Mig, machine: &MachineType) -> AutoscalerResult<Node> {
        let spec = mig
            .spec
            .as_ref()
            .ok_or_else(|| template_error(format!("no spec in mig {}", mig.gce_ref.name)))?;
        let node_name = format!(
            "{}-autoprovisioned-template-{}",
            mig.gce_ref.name,
            random_suffix()
        );
        let os_info = MigOsInfo::default();

        let capacity = self.build_capacity(
            machine,
            &[],
            &os_info,
            -1,
            0,
            None,
            &spec.extra_resources,
        );
        let allocatable = self.build_allocatable_from_capacity(&capacity);

        let mut labels = build_generic_labels(&mig.gce_ref, &spec.machine_type, &node_name, &os_info)?;
        labels.extend(spec.labels.clone());
        if let Some(pool) = &mig.node_pool_name {
            labels.insert(NODE_POOL_LABEL.to_string(), pool.clone());
        }

        Ok(Node {
            metadata: ObjectMeta {
                self_link: Some(format!("/api/v1/nodes/{node_name}")),
                name: Some(node_name),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                taints: (!spec.taints.is_empty()).then(|| spec.taints.clone()),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                capacity: Some(capacity),
                allocatable: Some(allocatable),
                conditions: Some(build_ready_conditions()),
                ..Default::default()
            }),
        })
    }
}
