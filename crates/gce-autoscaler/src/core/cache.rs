//! Process-wide store of group metadata, instance ownership, templates and machine types.
//!
//! Every family lives under one lock. Getters hand out copies, so nothing a caller holds can
//! change behind its back. Registering or unregistering a group does not touch the
//! instance-to-group map beyond the cascade of an unregistration; the info provider refills it.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;
use tracing::info;

use crate::core::gce_ref::GroupRef;
use crate::core::gce_ref::InstanceRef;
use crate::core::types::GceInstance;
use crate::core::types::InstanceTemplate;
use crate::core::types::InstanceTemplateName;
use crate::core::types::MachineType;
use crate::core::types::Mig;
use crate::core::types::ResourceLimiter;
use crate::template::KubeEnv;

/// Machine types are zone scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineTypeKey {
    pub zone: String,
    pub machine_type: String,
}

impl MachineTypeKey {
    pub fn new(zone: impl Into<String>, machine_type: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            machine_type: machine_type.into(),
        }
    }
}

/// A parsed kube-env together with the template it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedKubeEnv {
    pub template_name: String,
    pub kube_env: KubeEnv,
}

#[derive(Debug, Default)]
struct CacheState {
    migs: HashMap<GroupRef, Mig>,
    target_sizes: HashMap<GroupRef, i64>,
    base_names: HashMap<GroupRef, String>,
    template_names: HashMap<GroupRef, InstanceTemplateName>,
    templates: HashMap<GroupRef, InstanceTemplate>,
    kube_envs: HashMap<GroupRef, CachedKubeEnv>,
    autoscaling_options: HashMap<GroupRef, BTreeMap<String, String>>,
    instances: HashMap<GroupRef, Vec<GceInstance>>,
    instances_update_time: HashMap<GroupRef, Instant>,
    list_managed_instances_results: HashMap<GroupRef, String>,
    instance_to_mig: HashMap<InstanceRef, GroupRef>,
    instances_from_unknown_mig: HashSet<InstanceRef>,
    machines: HashMap<MachineTypeKey, MachineType>,
    resource_limiter: Option<ResourceLimiter>,
}

impl CacheState {
    fn remove_instances_for_mig(&mut self, mig: &GroupRef) {
        let owned: Vec<InstanceRef> = self
            .instance_to_mig
            .iter()
            .filter(|(_, owner)| *owner == mig)
            .map(|(instance, _)| instance.clone())
            .collect();
        for instance in owned {
            self.instance_to_mig.remove(&instance);
            self.instances_from_unknown_mig.remove(&instance);
        }
    }
}

#[derive(Debug, Default)]
pub struct GceCache {
    state: Mutex<CacheState>,
}

impl GceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the group was not known before or its configuration changed.
    pub fn register_mig(&self, mig: Mig) -> bool {
        let mut state = self.state.lock();
        match state.migs.get(&mig.gce_ref) {
            Some(existing) if *existing == mig => false,
            Some(_) => {
                debug!(mig = %mig.gce_ref, "Updated mig");
                state.migs.insert(mig.gce_ref.clone(), mig);
                true
            }
            None => {
                info!(mig = %mig.gce_ref, "Registering mig");
                state.migs.insert(mig.gce_ref.clone(), mig);
                true
            }
        }
    }

    /// Returns true if the group was registered. Its instance ownership entries go with it.
    pub fn unregister_mig(&self, mig: &GroupRef) -> bool {
        let mut state = self.state.lock();
        if state.migs.remove(mig).is_none() {
            return false;
        }
        info!(mig = %mig, "Unregistered mig");
        state.remove_instances_for_mig(mig);
        true
    }

    pub fn get_mig(&self, mig: &GroupRef) -> Option<Mig> {
        self.state.lock().migs.get(mig).cloned()
    }

    pub fn get_migs(&self) -> Vec<Mig> {
        let mut migs: Vec<Mig> = self.state.lock().migs.values().cloned().collect();
        migs.sort_by(|a, b| a.gce_ref.cmp(&b.gce_ref));
        migs
    }

    pub fn get_mig_instances(&self, mig: &GroupRef) -> Option<Vec<GceInstance>> {
        self.state.lock().instances.get(mig).cloned()
    }

    pub fn get_mig_instances_update_time(&self, mig: &GroupRef) -> Option<Instant> {
        self.state.lock().instances_update_time.get(mig).copied()
    }

    /// Replaces the instance list of `mig` and the ownership entries derived from it.
    pub fn set_mig_instances(&self, mig: &GroupRef, instances: Vec<GceInstance>, at: Instant) {
        let mut state = self.state.lock();
        state.remove_instances_for_mig(mig);
        for instance in &instances {
            state
                .instance_to_mig
                .insert(instance.instance_ref.clone(), mig.clone());
            state
                .instances_from_unknown_mig
                .remove(&instance.instance_ref);
        }
        state.instances.insert(mig.clone(), instances);
        state.instances_update_time.insert(mig.clone(), at);
    }

    /// Forgets the listed instances of `mig`. Ownership entries stay until the next listing.
    pub fn invalidate_mig_instances(&self, mig: &GroupRef) {
        let mut state = self.state.lock();
        state.instances.remove(mig);
        state.instances_update_time.remove(mig);
    }

    pub fn invalidate_all_mig_instances(&self) {
        let mut state = self.state.lock();
        state.instances = HashMap::new();
        state.instances_update_time = HashMap::new();
    }

    pub fn get_mig_for_instance(&self, instance: &InstanceRef) -> Option<GroupRef> {
        self.state.lock().instance_to_mig.get(instance).cloned()
    }

    pub fn is_mig_unknown_for_instance(&self, instance: &InstanceRef) -> bool {
        self.state
            .lock()
            .instances_from_unknown_mig
            .contains(instance)
    }

    /// Records that `instance` is outside every registered group, unless it is owned already.
    pub fn mark_instance_mig_unknown(&self, instance: &InstanceRef) {
        let mut state = self.state.lock();
        if !state.instance_to_mig.contains_key(instance) {
            state.instances_from_unknown_mig.insert(instance.clone());
        }
    }

    pub fn invalidate_instance_to_mig(&self, instance: &InstanceRef) {
        let mut state = self.state.lock();
        state.instance_to_mig.remove(instance);
        state.instances_from_unknown_mig.remove(instance);
    }

    pub fn invalidate_all_instances_from_unknown_mig(&self) {
        self.state.lock().instances_from_unknown_mig = HashSet::new();
    }

    pub fn invalidate_all_instances_to_mig(&self) {
        let mut state = self.state.lock();
        state.instance_to_mig = HashMap::new();
        state.instances_from_unknown_mig = HashSet::new();
    }

    pub fn get_mig_target_size(&self, mig: &GroupRef) -> Option<i64> {
        self.state.lock().target_sizes.get(mig).copied()
    }

    pub fn set_mig_target_size(&self, mig: &GroupRef, size: i64) {
        self.state.lock().target_sizes.insert(mig.clone(), size);
    }

    pub fn invalidate_mig_target_size(&self, mig: &GroupRef) {
        if self.state.lock().target_sizes.remove(mig).is_some() {
            debug!(mig = %mig, "Target size cache invalidated");
        }
    }

    pub fn invalidate_all_mig_target_sizes(&self) {
        self.state.lock().target_sizes = HashMap::new();
    }

    pub fn get_mig_basename(&self, mig: &GroupRef) -> Option<String> {
        self.state.lock().base_names.get(mig).cloned()
    }

    pub fn set_mig_basename(&self, mig: &GroupRef, base_name: String) {
        self.state.lock().base_names.insert(mig.clone(), base_name);
    }

    pub fn invalidate_mig_basename(&self, mig: &GroupRef) {
        self.state.lock().base_names.remove(mig);
    }

    pub fn invalidate_all_mig_basenames(&self) {
        self.state.lock().base_names = HashMap::new();
    }

    pub fn get_list_managed_instances_results(&self, mig: &GroupRef) -> Option<String> {
        self.state
            .lock()
            .list_managed_instances_results
            .get(mig)
            .cloned()
    }

    pub fn set_list_managed_instances_results(&self, mig: &GroupRef, results: String) {
        self.state
            .lock()
            .list_managed_instances_results
            .insert(mig.clone(), results);
    }

    pub fn invalidate_list_managed_instances_results(&self, mig: &GroupRef) {
        self.state.lock().list_managed_instances_results.remove(mig);
    }

    pub fn invalidate_all_list_managed_instances_results(&self) {
        self.state.lock().list_managed_instances_results = HashMap::new();
    }

    pub fn get_mig_instance_template_name(&self, mig: &GroupRef) -> Option<InstanceTemplateName> {
        self.state.lock().template_names.get(mig).cloned()
    }

    pub fn set_mig_instance_template_name(&self, mig: &GroupRef, name: InstanceTemplateName) {
        self.state.lock().template_names.insert(mig.clone(), name);
    }

    pub fn invalidate_mig_instance_template_name(&self, mig: &GroupRef) {
        self.state.lock().template_names.remove(mig);
    }

    pub fn invalidate_all_mig_instance_template_names(&self) {
        self.state.lock().template_names = HashMap::new();
    }

    pub fn get_mig_instance_template(&self, mig: &GroupRef) -> Option<InstanceTemplate> {
        self.state.lock().templates.get(mig).cloned()
    }

    pub fn set_mig_instance_template(&self, mig: &GroupRef, template: InstanceTemplate) {
        self.state.lock().templates.insert(mig.clone(), template);
    }

    pub fn invalidate_mig_instance_template(&self, mig: &GroupRef) {
        if self.state.lock().templates.remove(mig).is_some() {
            debug!(mig = %mig, "Instance template cache invalidated");
        }
    }

    pub fn invalidate_all_mig_instance_templates(&self) {
        self.state.lock().templates = HashMap::new();
    }

    pub fn get_mig_kube_env(&self, mig: &GroupRef) -> Option<CachedKubeEnv> {
        self.state.lock().kube_envs.get(mig).cloned()
    }

    pub fn set_mig_kube_env(&self, mig: &GroupRef, kube_env: CachedKubeEnv) {
        self.state.lock().kube_envs.insert(mig.clone(), kube_env);
    }

    pub fn invalidate_mig_kube_env(&self, mig: &GroupRef) {
        self.state.lock().kube_envs.remove(mig);
    }

    pub fn invalidate_all_mig_kube_envs(&self) {
        self.state.lock().kube_envs = HashMap::new();
    }

    pub fn get_autoscaling_options(&self, mig: &GroupRef) -> Option<BTreeMap<String, String>> {
        self.state.lock().autoscaling_options.get(mig).cloned()
    }

    pub fn set_autoscaling_options(&self, mig: &GroupRef, options: BTreeMap<String, String>) {
        self.state
            .lock()
            .autoscaling_options
            .insert(mig.clone(), options);
    }

    pub fn invalidate_autoscaling_options(&self, mig: &GroupRef) {
        self.state.lock().autoscaling_options.remove(mig);
    }

    pub fn invalidate_all_autoscaling_options(&self) {
        self.state.lock().autoscaling_options = HashMap::new();
    }

    pub fn get_machine(&self, zone: &str, machine_type: &str) -> Option<MachineType> {
        self.state
            .lock()
            .machines
            .get(&MachineTypeKey::new(zone, machine_type))
            .cloned()
    }

    pub fn add_machine(&self, zone: &str, machine: MachineType) {
        self.state
            .lock()
            .machines
            .insert(MachineTypeKey::new(zone, machine.name.clone()), machine);
    }

    /// Replaces the whole machine catalog.
    pub fn set_machines(&self, machines: HashMap<MachineTypeKey, MachineType>) {
        self.state.lock().machines = machines;
    }

    pub fn invalidate_machine(&self, zone: &str, machine_type: &str) {
        self.state
            .lock()
            .machines
            .remove(&MachineTypeKey::new(zone, machine_type));
    }

    pub fn invalidate_all_machines(&self) {
        self.state.lock().machines = HashMap::new();
    }

    pub fn get_resource_limiter(&self) -> Option<ResourceLimiter> {
        self.state.lock().resource_limiter.clone()
    }

    pub fn set_resource_limiter(&self, limiter: Option<ResourceLimiter>) {
        self.state.lock().resource_limiter = limiter;
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::core::gce_ref::GceRef;
    use crate::core::types::InstanceState;

    fn instance(name: &str) -> GceInstance {
        GceInstance::new(
            GceRef::new("p1", "us-central1-b", name),
            InstanceState::Running,
        )
    }

    #[test]
    fn register_reports_changes_only() {
        let cache = GceCache::new();
        let mig = Mig::new(GceRef::new("p1", "us-central1-b", "ng1"), 0, 10);
        assert!(cache.register_mig(mig.clone()));
        assert!(!cache.register_mig(mig.clone()));

        let mut resized = mig.clone();
        resized.max_size = 20;
        assert!(cache.register_mig(resized));
        assert_eq!(cache.get_mig(&mig.gce_ref).unwrap().max_size, 20);
    }

    #[test]
    fn set_instances_round_trip() {
        let cache = GceCache::new();
        let mig = GceRef::new("p1", "us-central1-b", "ng1");
        let instances = vec![instance("ng1-abcd"), instance("ng1-efgh")];
        cache.set_mig_instances(&mig, instances.clone(), Instant::now());

        assert_eq!(cache.get_mig_instances(&mig).unwrap(), instances);
        assert_eq!(
            cache.get_mig_for_instance(&instances[0].instance_ref),
            Some(mig.clone())
        );
        assert!(cache.get_mig_instances_update_time(&mig).is_some());
    }

    #[test]
    fn set_instances_replaces_ownership() {
        let cache = GceCache::new();
        let mig = GceRef::new("p1", "us-central1-b", "ng1");
        let gone = instance("ng1-gone");
        cache.set_mig_instances(&mig, vec![gone.clone()], Instant::now());
        cache.set_mig_instances(&mig, vec![instance("ng1-new")], Instant::now());
        assert_eq!(cache.get_mig_for_instance(&gone.instance_ref), None);
    }

    #[test]
    fn unregister_cascades_to_instances() {
        let cache = GceCache::new();
        let ng1 = Mig::new(GceRef::new("p1", "us-central1-b", "ng1"), 0, 10);
        let ng2 = Mig::new(GceRef::new("p1", "us-central1-b", "ng2"), 0, 10);
        cache.register_mig(ng1.clone());
        cache.register_mig(ng2.clone());
        cache.set_mig_instances(&ng1.gce_ref, vec![instance("ng1-a")], Instant::now());
        cache.set_mig_instances(&ng2.gce_ref, vec![instance("ng2-a")], Instant::now());

        assert!(cache.unregister_mig(&ng1.gce_ref));
        assert!(!cache.unregister_mig(&ng1.gce_ref));
        assert_eq!(
            cache.get_mig_for_instance(&GceRef::new("p1", "us-central1-b", "ng1-a")),
            None
        );
        assert_eq!(
            cache.get_mig_for_instance(&GceRef::new("p1", "us-central1-b", "ng2-a")),
            Some(ng2.gce_ref)
        );
        assert_eq!(cache.get_migs().len(), 1);
    }

    #[test]
    fn known_and_unknown_instances_are_exclusive() {
        let cache = GceCache::new();
        let mig = GceRef::new("p1", "us-central1-b", "ng1");
        let stray = GceRef::new("p1", "us-central1-b", "ng1-stray");
        cache.mark_instance_mig_unknown(&stray);
        assert!(cache.is_mig_unknown_for_instance(&stray));

        cache.set_mig_instances(
            &mig,
            vec![GceInstance::new(stray.clone(), InstanceState::Running)],
            Instant::now(),
        );
        assert!(!cache.is_mig_unknown_for_instance(&stray));
        cache.mark_instance_mig_unknown(&stray);
        assert!(!cache.is_mig_unknown_for_instance(&stray));
    }

    #[test]
    fn machines_are_zone_scoped() {
        let cache = GceCache::new();
        let machine = MachineType::from_api("n1-standard-1", 1, 3840);
        cache.add_machine("us-central1-b", machine.clone());
        assert_eq!(
            cache.get_machine("us-central1-b", "n1-standard-1"),
            Some(machine.clone())
        );
        assert_eq!(cache.get_machine("us-central1-c", "n1-standard-1"), None);

        cache.add_machine("us-central1-c", machine.clone());
        cache.invalidate_machine("us-central1-b", "n1-standard-1");
        assert_eq!(cache.get_machine("us-central1-b", "n1-standard-1"), None);
        assert_eq!(
            cache.get_machine("us-central1-c", "n1-standard-1"),
            Some(machine)
        );
        cache.invalidate_all_machines();
        assert_eq!(cache.get_machine("us-central1-c", "n1-standard-1"), None);
    }

    #[test]
    fn getters_return_copies() {
        let cache = GceCache::new();
        let mig = GceRef::new("p1", "us-central1-b", "ng1");
        cache.set_mig_instances(&mig, vec![instance("ng1-a")], Instant::now());
        let mut copy = cache.get_mig_instances(&mig).unwrap();
        copy.clear();
        assert_eq!(cache.get_mig_instances(&mig).unwrap().len(), 1);
    }

    #[test]
    fn per_mig_invalidation_leaves_other_migs() {
        let cache = GceCache::new();
        let ng1 = GceRef::new("p1", "us-central1-b", "ng1");
        let ng2 = GceRef::new("p1", "us-central1-b", "ng2");
        for mig in [&ng1, &ng2] {
            let owned = instance(&format!("{}-a", mig.name));
            cache.set_mig_instances(mig, vec![owned], Instant::now());
            cache.set_list_managed_instances_results(mig, "PAGELESS".into());
            cache.set_autoscaling_options(
                mig,
                BTreeMap::from([("scaledownunneededtime".to_string(), "1m".to_string())]),
            );
        }

        cache.invalidate_mig_instances(&ng1);
        cache.invalidate_list_managed_instances_results(&ng1);
        cache.invalidate_autoscaling_options(&ng1);

        assert_eq!(cache.get_mig_instances(&ng1), None);
        assert_eq!(cache.get_mig_instances_update_time(&ng1), None);
        assert_eq!(cache.get_list_managed_instances_results(&ng1), None);
        assert_eq!(cache.get_autoscaling_options(&ng1), None);
        assert_eq!(cache.get_mig_instances(&ng2).unwrap().len(), 1);
        assert_eq!(
            cache.get_list_managed_instances_results(&ng2).as_deref(),
            Some("PAGELESS")
        );
        assert!(cache.get_autoscaling_options(&ng2).is_some());
    }

    #[test]
    fn single_instance_ownership_is_invalidated() {
        let cache = GceCache::new();
        let mig = GceRef::new("p1", "us-central1-b", "ng1");
        let stray = GceRef::new("p1", "us-central1-b", "ng9-stray");
        cache.set_mig_instances(
            &mig,
            vec![instance("ng1-a"), instance("ng1-b")],
            Instant::now(),
        );
        cache.mark_instance_mig_unknown(&stray);

        cache.invalidate_instance_to_mig(&GceRef::new("p1", "us-central1-b", "ng1-a"));
        cache.invalidate_instance_to_mig(&stray);

        assert_eq!(
            cache.get_mig_for_instance(&GceRef::new("p1", "us-central1-b", "ng1-a")),
            None
        );
        assert_eq!(
            cache.get_mig_for_instance(&GceRef::new("p1", "us-central1-b", "ng1-b")),
            Some(mig)
        );
        assert!(!cache.is_mig_unknown_for_instance(&stray));
    }
}
