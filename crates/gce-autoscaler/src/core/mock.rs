//! In-memory cloud clients used by the core tests.
//!
//! Both fakes keep their state behind mutexes, record every call by name and return whatever the
//! test scripted. Mutating calls update the scripted state the way the cloud would.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use parking_lot::Mutex;
use regex::Regex;

use crate::core::cache::GceCache;
use crate::core::gce_ref::generate_mig_url;
use crate::core::gce_ref::GceRef;
use crate::core::info_provider::CacheMigLister;
use crate::core::info_provider::CachingMigInfoProvider;
use crate::core::info_provider::InfoProviderConfig;
use crate::core::mig_operations::MigOperations;
use crate::core::types::GceInstance;
use crate::core::types::InstanceState;
use crate::core::types::InstanceTemplate;
use crate::core::types::MachineType;
use crate::core::types::ManagedInstanceGroup;
use crate::core::types::Mig;
use crate::core::types::ResourceLimiter;
use crate::platform::gce::client::generate_instance_name;
use crate::platform::gce::client::instance_ids_to_names;
use crate::platform::gce::AutoscalingGceClient;
use crate::platform::gke::AutoscalingGkeClient;
use crate::platform::gke::NodePool;
use crate::platform::CloudError;
use crate::platform::CloudResult;

pub const PROJECT: &str = "p1";
pub const ZONE: &str = "us-central1-b";

pub fn mig_ref(name: &str) -> GceRef {
    GceRef::new(PROJECT, ZONE, name)
}

/// A managed group listing as the compute API would return it, with template `<name>-template`.
pub fn managed_group(name: &str, target_size: i64) -> ManagedInstanceGroup {
    ManagedInstanceGroup {
        name: name.to_string(),
        zone: ZONE.to_string(),
        base_instance_name: name.to_string(),
        target_size,
        instance_template: format!(
            "https://www.googleapis.com/compute/v1/projects/{PROJECT}/global/instanceTemplates/{name}-template"
        ),
        list_managed_instances_results: "PAGINATED".to_string(),
        self_link: generate_mig_url(&mig_ref(name)),
    }
}

/// Operations over a fresh cache that always relists instances.
pub fn operations(gce: Arc<FakeGceClient>, gke: Option<Arc<FakeGkeClient>>) -> MigOperations {
    let cache = Arc::new(GceCache::new());
    let info = Arc::new(CachingMigInfoProvider::new(
        cache.clone(),
        Arc::new(CacheMigLister::new(cache.clone())),
        gce.clone(),
        InfoProviderConfig::new(PROJECT).with_mig_instances_min_refresh_wait(Duration::ZERO),
    ));
    let ops = MigOperations::new(PROJECT, ZONE, cache, info, gce);
    match gke {
        Some(gke) => ops.with_gke_client(gke),
        None => ops,
    }
}

pub fn running_instance(name: &str) -> GceInstance {
    GceInstance::new(mig_ref(name), InstanceState::Running)
}

#[derive(Default)]
struct ComputeState {
    migs: BTreeMap<GceRef, ManagedInstanceGroup>,
    instances: HashMap<GceRef, Vec<GceInstance>>,
    templates: HashMap<String, InstanceTemplate>,
    machine_types: HashMap<(String, String), MachineType>,
    region_zones: HashMap<String, Vec<String>>,
    failing_zones: HashSet<String>,
    failing_instance_lists: HashSet<GceRef>,
    calls: Vec<String>,
    deleted: Vec<(GceRef, Vec<GceRef>)>,
    created: Vec<(GceRef, Vec<String>)>,
}

#[derive(Default)]
pub struct FakeGceClient {
    state: Mutex<ComputeState>,
}

impl FakeGceClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mig(&self, mig: ManagedInstanceGroup) {
        let key = GceRef::new(PROJECT, mig.zone.clone(), mig.name.clone());
        self.state.lock().migs.insert(key, mig);
    }

    pub fn remove_mig(&self, mig: &GceRef) {
        self.state.lock().migs.remove(mig);
    }

    pub fn set_instances(&self, mig: &GceRef, instances: Vec<GceInstance>) {
        self.state.lock().instances.insert(mig.clone(), instances);
    }

    pub fn add_template(&self, template: InstanceTemplate) {
        self.state
            .lock()
            .templates
            .insert(template.name.clone(), template);
    }

    pub fn add_machine_type(&self, zone: &str, machine: MachineType) {
        self.state
            .lock()
            .machine_types
            .insert((zone.to_string(), machine.name.clone()), machine);
    }

    pub fn set_region_zones(&self, region: &str, zones: &[&str]) {
        self.state.lock().region_zones.insert(
            region.to_string(),
            zones.iter().map(|z| z.to_string()).collect(),
        );
    }

    pub fn fail_zone(&self, zone: &str) {
        self.state.lock().failing_zones.insert(zone.to_string());
    }

    pub fn fail_instance_list(&self, mig: &GceRef) {
        self.state.lock().failing_instance_lists.insert(mig.clone());
    }

    pub fn target_size(&self, mig: &GceRef) -> Option<i64> {
        self.state.lock().migs.get(mig).map(|m| m.target_size)
    }

    /// Names of the calls made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.as_str() == name)
            .count()
    }

    pub fn deleted(&self) -> Vec<(GceRef, Vec<GceRef>)> {
        self.state.lock().deleted.clone()
    }

    pub fn created(&self) -> Vec<(GceRef, Vec<String>)> {
        self.state.lock().created.clone()
    }

    fn record(&self, call: &str) {
        self.state.lock().calls.push(call.to_string());
    }

    fn missing(mig: &GceRef) -> Report<CloudError> {
        Report::new(CloudError::GroupDoesNotExist {
            group: mig.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl AutoscalingGceClient for FakeGceClient {
    async fn fetch_machine_type(&self, zone: &str, machine_type: &str) -> CloudResult<MachineType> {
        self.record("fetch_machine_type");
        self.state
            .lock()
            .machine_types
            .get(&(zone.to_string(), machine_type.to_string()))
            .cloned()
            .ok_or_else(|| {
                Report::new(CloudError::NotFound {
                    resource: format!("{zone}/{machine_type}"),
                })
            })
    }

    async fn fetch_machine_types(&self, zone: &str) -> CloudResult<Vec<MachineType>> {
        self.record("fetch_machine_types");
        Ok(self
            .state
            .lock()
            .machine_types
            .iter()
            .filter(|((z, _), _)| z == zone)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn fetch_all_migs(&self, zone: &str) -> CloudResult<Vec<ManagedInstanceGroup>> {
        self.record("fetch_all_migs");
        let state = self.state.lock();
        if state.failing_zones.contains(zone) {
            return Err(Report::new(CloudError::Transport {
                message: format!("zone {zone} unavailable"),
            }));
        }
        Ok(state
            .migs
            .values()
            .filter(|m| m.zone == zone)
            .cloned()
            .collect())
    }

    async fn fetch_mig(&self, mig: &GceRef) -> CloudResult<ManagedInstanceGroup> {
        self.record("fetch_mig");
        self.state
            .lock()
            .migs
            .get(mig)
            .cloned()
            .ok_or_else(|| Self::missing(mig))
    }

    async fn fetch_mig_instances(&self, mig: &GceRef) -> CloudResult<Vec<GceInstance>> {
        self.record("fetch_mig_instances");
        let state = self.state.lock();
        if state.failing_instance_lists.contains(mig) {
            return Err(Report::new(CloudError::Api {
                status: 500,
                message: "backend error".to_string(),
            }));
        }
        if !state.migs.contains_key(mig) {
            return Err(Self::missing(mig));
        }
        Ok(state.instances.get(mig).cloned().unwrap_or_default())
    }

    async fn fetch_mig_template(
        &self,
        _mig: &GceRef,
        template_name: &str,
        _regional: bool,
    ) -> CloudResult<InstanceTemplate> {
        self.record("fetch_mig_template");
        self.state
            .lock()
            .templates
            .get(template_name)
            .cloned()
            .ok_or_else(|| {
                Report::new(CloudError::NotFound {
                    resource: template_name.to_string(),
                })
            })
    }

    async fn fetch_migs_with_name(&self, zone: &str, filter: &Regex) -> CloudResult<Vec<String>> {
        self.record("fetch_migs_with_name");
        Ok(self
            .state
            .lock()
            .migs
            .values()
            .filter(|m| m.zone == zone)
            .filter(|m| {
                filter
                    .find(&m.name)
                    .is_some_and(|f| f.start() == 0 && f.end() == m.name.len())
            })
            .map(|m| m.self_link.clone())
            .collect())
    }

    async fn fetch_zones(&self, region: &str) -> CloudResult<Vec<String>> {
        self.record("fetch_zones");
        Ok(self
            .state
            .lock()
            .region_zones
            .get(region)
            .cloned()
            .unwrap_or_default())
    }

    async fn resize_mig(&self, mig: &GceRef, size: i64) -> CloudResult<()> {
        self.record("resize_mig");
        let mut state = self.state.lock();
        let group = state.migs.get_mut(mig).ok_or_else(|| Self::missing(mig))?;
        group.target_size = size;
        Ok(())
    }

    async fn delete_instances(&self, mig: &GceRef, instances: &[GceRef]) -> CloudResult<()> {
        self.record("delete_instances");
        let mut state = self.state.lock();
        if let Some(group) = state.migs.get_mut(mig) {
            group.target_size -= instances.len() as i64;
        }
        state.deleted.push((mig.clone(), instances.to_vec()));
        Ok(())
    }

    async fn create_instances(
        &self,
        mig: &GceRef,
        base_name: &str,
        delta: i64,
        existing_provider_ids: &[String],
    ) -> CloudResult<()> {
        self.record("create_instances");
        let mut existing = instance_ids_to_names(existing_provider_ids);
        let names: Vec<String> = (0..delta)
            .map(|_| {
                let name = generate_instance_name(base_name, &existing);
                existing.insert(name.clone());
                name
            })
            .collect();
        let mut state = self.state.lock();
        if let Some(group) = state.migs.get_mut(mig) {
            group.target_size += delta;
        }
        state.created.push((mig.clone(), names));
        Ok(())
    }
}

#[derive(Default)]
struct ContainerState {
    node_pools: Vec<NodePool>,
    locations: Vec<String>,
    limits: Option<ResourceLimiter>,
    created: Vec<Mig>,
    deleted: Vec<String>,
}

/// Container control plane fake. Created pools join the pool list backed by the groups passed to
/// [`FakeGkeClient::back_created_pools_with`].
#[derive(Default)]
pub struct FakeGkeClient {
    state: Mutex<ContainerState>,
    created_pool_groups: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeGkeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_node_pools(&self, pools: Vec<NodePool>) {
        self.state.lock().node_pools = pools;
    }

    pub fn set_locations(&self, locations: &[&str]) {
        self.state.lock().locations = locations.iter().map(|l| l.to_string()).collect();
    }

    pub fn set_limits(&self, limits: Option<ResourceLimiter>) {
        self.state.lock().limits = limits;
    }

    /// Group URLs a pool named `pool` gets once it is created.
    pub fn back_created_pools_with(&self, pool: &str, urls: Vec<String>) {
        self.created_pool_groups
            .lock()
            .insert(pool.to_string(), urls);
    }

    pub fn created(&self) -> Vec<Mig> {
        self.state.lock().created.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }
}

#[async_trait::async_trait]
impl AutoscalingGkeClient for FakeGkeClient {
    async fn fetch_node_pools(&self) -> CloudResult<Vec<NodePool>> {
        Ok(self.state.lock().node_pools.clone())
    }

    async fn fetch_locations(&self) -> CloudResult<Vec<String>> {
        Ok(self.state.lock().locations.clone())
    }

    async fn fetch_resource_limits(&self) -> CloudResult<Option<ResourceLimiter>> {
        Ok(self.state.lock().limits.clone())
    }

    async fn create_node_pool(&self, mig: &Mig) -> CloudResult<()> {
        let pool_name = mig.node_pool_name.clone().unwrap_or_default();
        let urls = self
            .created_pool_groups
            .lock()
            .get(&pool_name)
            .cloned()
            .unwrap_or_default();
        let mut state = self.state.lock();
        state.node_pools.push(NodePool {
            name: pool_name,
            instance_group_urls: urls,
            autoprovisioned: true,
            min_node_count: mig.min_size,
            max_node_count: mig.max_size,
        });
        state.created.push(mig.clone());
        Ok(())
    }

    async fn delete_node_pool(&self, name: &str) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.node_pools.retain(|p| p.name != name);
        state.deleted.push(name.to_string());
        Ok(())
    }
}
