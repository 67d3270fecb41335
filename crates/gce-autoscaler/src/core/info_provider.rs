//! Read-through access to per-group facts.
//!
//! Every fact is served from [`GceCache`] when present. A miss takes the fill lock, lists every
//! group in the zones that hold registered groups (one call per zone, in parallel) and stores what
//! it finds for the registered ones. Groups the bulk listing did not return fall back to a single
//! GET. Only one fill runs at a time; the cache lock is never held across a cloud call.

use std::collections::BTreeSet;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use error_stack::Report;
use error_stack::ResultExt;
use futures::future::join_all;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::core::cache::CachedKubeEnv;
use crate::core::cache::GceCache;
use crate::core::errors::AutoscalerError;
use crate::core::errors::AutoscalerResult;
use crate::core::gce_ref::GceRef;
use crate::core::gce_ref::GroupRef;
use crate::core::gce_ref::InstanceRef;
use crate::core::types::GceInstance;
use crate::core::types::InstanceTemplate;
use crate::core::types::InstanceTemplateName;
use crate::core::types::MachineType;
use crate::core::types::Mig;
use crate::platform::gce::AutoscalingGceClient;
use crate::platform::CloudError;
use crate::platform::CloudResult;
use crate::template::KubeEnv;

/// Source of the registered groups and sink for per-group cloud failures.
pub trait MigLister: Send + Sync {
    fn get_migs(&self) -> Vec<Mig>;

    fn handle_mig_issue(&self, mig: &GroupRef, err: &Report<CloudError>) {
        warn!(mig = %mig, "Issue while talking to the cloud about mig: {err:?}");
    }
}

/// Lists the groups registered in the cache.
pub struct CacheMigLister {
    cache: Arc<GceCache>,
}

impl CacheMigLister {
    pub fn new(cache: Arc<GceCache>) -> Self {
        Self { cache }
    }
}

impl MigLister for CacheMigLister {
    fn get_migs(&self) -> Vec<Mig> {
        self.cache.get_migs()
    }
}

#[derive(Debug, Clone)]
pub struct InfoProviderConfig {
    pub project: String,
    /// Upper bound on concurrent per-group instance listings during regeneration.
    pub concurrent_refreshes: usize,
    /// A group's instance list younger than this is not listed again.
    pub mig_instances_min_refresh_wait: Duration,
}

impl InfoProviderConfig {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            concurrent_refreshes: 1,
            mig_instances_min_refresh_wait: Duration::from_secs(5),
        }
    }

    pub fn with_concurrent_refreshes(mut self, concurrent_refreshes: usize) -> Self {
        self.concurrent_refreshes = concurrent_refreshes.max(1);
        self
    }

    pub fn with_mig_instances_min_refresh_wait(mut self, wait: Duration) -> Self {
        self.mig_instances_min_refresh_wait = wait;
        self
    }
}

pub struct CachingMigInfoProvider {
    cache: Arc<GceCache>,
    lister: Arc<dyn MigLister>,
    client: Arc<dyn AutoscalingGceClient>,
    config: InfoProviderConfig,
    fill_lock: Mutex<()>,
    instance_lock: Mutex<()>,
}

impl CachingMigInfoProvider {
    pub fn new(
        cache: Arc<GceCache>,
        lister: Arc<dyn MigLister>,
        client: Arc<dyn AutoscalingGceClient>,
        config: InfoProviderConfig,
    ) -> Self {
        Self {
            cache,
            lister,
            client,
            config,
            fill_lock: Mutex::new(()),
            instance_lock: Mutex::new(()),
        }
    }

    /// Instances of `mig`, listed from the cloud when the cache has none.
    pub async fn get_mig_instances(&self, mig: &GroupRef) -> AutoscalerResult<Vec<GceInstance>> {
        if let Some(instances) = self.cache.get_mig_instances(mig) {
            return Ok(instances);
        }
        self.fill_mig_instances(mig).await?;
        Ok(self.cache.get_mig_instances(mig).unwrap_or_default())
    }

    /// Group owning `instance`, or `None` when it belongs to no registered group.
    pub async fn get_mig_for_instance(
        &self,
        instance: &InstanceRef,
    ) -> AutoscalerResult<Option<Mig>> {
        let _guard = self.instance_lock.lock().await;

        if let Some(cached) = self.cached_mig_for_instance(instance) {
            return cached;
        }

        let Some(candidate) = self.find_mig_with_matching_basename(instance).await else {
            return Ok(None);
        };
        self.fill_mig_instances(&candidate.gce_ref).await?;

        match self.cached_mig_for_instance(instance) {
            Some(found) => found,
            None => {
                debug!(instance = %instance, "Instance not found in any mig");
                self.cache.mark_instance_mig_unknown(instance);
                Ok(None)
            }
        }
    }

    /// Outer `None` means the cache knows nothing about the instance.
    fn cached_mig_for_instance(
        &self,
        instance: &InstanceRef,
    ) -> Option<AutoscalerResult<Option<Mig>>> {
        if let Some(mig_ref) = self.cache.get_mig_for_instance(instance) {
            return Some(match self.cache.get_mig(&mig_ref) {
                Some(mig) => Ok(Some(mig)),
                None => Err(Report::new(AutoscalerError::GroupDoesNotExist {
                    group: mig_ref.to_string(),
                })
                .attach_printable(format!(
                    "instance {instance} belongs to unregistered mig {mig_ref}"
                ))),
            });
        }
        if self.cache.is_mig_unknown_for_instance(instance) {
            return Some(Ok(None));
        }
        None
    }

    async fn find_mig_with_matching_basename(&self, instance: &InstanceRef) -> Option<Mig> {
        for mig in self.lister.get_migs() {
            let mig_ref = &mig.gce_ref;
            if mig_ref.project != instance.project || mig_ref.zone != instance.zone {
                continue;
            }
            match self.get_mig_basename(mig_ref).await {
                Ok(basename) if instance.name.starts_with(&basename) => return Some(mig),
                Ok(_) => {}
                Err(e) => debug!(mig = %mig_ref, "Cannot get basename: {e:?}"),
            }
        }
        None
    }

    /// Lists the instances of every registered group. A group whose listing fails keeps its
    /// previous entries. Returns the first failure after all groups were attempted.
    pub async fn regenerate_mig_instances_cache(&self) -> AutoscalerResult<()> {
        self.cache.invalidate_all_instances_from_unknown_mig();

        let migs = self.lister.get_migs();
        info!(count = migs.len(), "Regenerating instances cache for all migs");
        let results: Vec<AutoscalerResult<()>> = futures::stream::iter(migs)
            .map(|mig| async move { self.list_mig_instances(&mig.gce_ref).await })
            .buffer_unordered(self.config.concurrent_refreshes.max(1))
            .collect()
            .await;
        results.into_iter().collect()
    }

    async fn fill_mig_instances(&self, mig: &GroupRef) -> AutoscalerResult<()> {
        if let Some(updated) = self.cache.get_mig_instances_update_time(mig) {
            if updated.elapsed() < self.config.mig_instances_min_refresh_wait {
                debug!(mig = %mig, wait = ?self.config.mig_instances_min_refresh_wait, "Not regenerating mig instances cache, refreshed recently");
                return Ok(());
            }
        }
        self.list_mig_instances(mig).await
    }

    async fn list_mig_instances(&self, mig: &GroupRef) -> AutoscalerResult<()> {
        debug!(mig = %mig, "Regenerating mig instances cache");
        match self.client.fetch_mig_instances(mig).await {
            Ok(instances) => {
                self.cache.set_mig_instances(mig, instances, Instant::now());
                Ok(())
            }
            Err(report) => Err(self.mig_issue(mig, report)),
        }
    }

    pub async fn get_mig_target_size(&self, mig: &GroupRef) -> AutoscalerResult<i64> {
        self.resolve_mig_fact(
            mig,
            |cache, r| cache.get_mig_target_size(r),
            || self.client.fetch_mig_target_size(mig),
            |cache, r, size| cache.set_mig_target_size(r, size),
        )
        .await
    }

    pub async fn get_mig_basename(&self, mig: &GroupRef) -> AutoscalerResult<String> {
        self.resolve_mig_fact(
            mig,
            |cache, r| cache.get_mig_basename(r),
            || self.client.fetch_mig_basename(mig),
            |cache, r, name| cache.set_mig_basename(r, name),
        )
        .await
    }

    pub async fn get_list_managed_instances_results(
        &self,
        mig: &GroupRef,
    ) -> AutoscalerResult<String> {
        self.resolve_mig_fact(
            mig,
            |cache, r| cache.get_list_managed_instances_results(r),
            || self.client.fetch_list_managed_instances_results(mig),
            |cache, r, results| cache.set_list_managed_instances_results(r, results),
        )
        .await
    }

    pub async fn get_mig_instance_template_name(
        &self,
        mig: &GroupRef,
    ) -> AutoscalerResult<InstanceTemplateName> {
        self.resolve_mig_fact(
            mig,
            |cache, r| cache.get_mig_instance_template_name(r),
            || self.client.fetch_mig_template_name(mig),
            |cache, r, name| cache.set_mig_instance_template_name(r, name),
        )
        .await
    }

    /// Template body of `mig`; refetched only when the group now points at another template.
    pub async fn get_mig_instance_template(
        &self,
        mig: &GroupRef,
    ) -> AutoscalerResult<InstanceTemplate> {
        let template_name = self.get_mig_instance_template_name(mig).await?;
        if let Some(template) = self.cache.get_mig_instance_template(mig) {
            if template.name == template_name.name {
                return Ok(template);
            }
        }

        info!(mig = %mig, template = %template_name.name, "Instance template of mig changed");
        let template = self
            .client
            .fetch_mig_template(mig, &template_name.name, template_name.regional)
            .await
            .map_err(|report| AutoscalerError::from_cloud(report, mig))?;
        self.cache.set_mig_instance_template(mig, template.clone());
        Ok(template)
    }

    /// Parsed kube-env of the group's current template.
    pub async fn get_mig_kube_env(&self, mig: &GroupRef) -> AutoscalerResult<KubeEnv> {
        let template_name = self.get_mig_instance_template_name(mig).await?;
        if let Some(cached) = self.cache.get_mig_kube_env(mig) {
            if cached.template_name == template_name.name {
                return Ok(cached.kube_env);
            }
        }

        let template = self.get_mig_instance_template(mig).await?;
        let kube_env = KubeEnv::parse(&template.kube_env_value()?).map_err(|e| {
            Report::new(AutoscalerError::KubeEnv {
                message: e.to_string(),
            })
            .attach_printable(format!("template {}", template.name))
        })?;
        self.cache.set_mig_kube_env(
            mig,
            CachedKubeEnv {
                template_name: template.name.clone(),
                kube_env: kube_env.clone(),
            },
        );
        Ok(kube_env)
    }

    /// Machine shape named by the group's template.
    pub async fn get_mig_machine_type(&self, mig: &GroupRef) -> AutoscalerResult<MachineType> {
        let template = self.get_mig_instance_template(mig).await?;
        let machine_name = template.properties.machine_type.as_str();
        self.get_machine_type(&mig.zone, machine_name)
            .await
            .attach_printable_lazy(|| format!("machine type of mig {mig}"))
    }

    /// Custom shapes are parsed; known ones come from the cache, others are fetched and stored.
    pub async fn get_machine_type(&self, zone: &str, name: &str) -> AutoscalerResult<MachineType> {
        if MachineType::is_custom(name) {
            return MachineType::parse_custom(name);
        }
        if let Some(machine) = self.cache.get_machine(zone, name) {
            return Ok(machine);
        }
        let machine = self
            .client
            .fetch_machine_type(zone, name)
            .await
            .map_err(|report| {
                report.change_context(AutoscalerError::Cloud {
                    message: format!("cannot fetch machine type {name} in zone {zone}"),
                })
            })?;
        self.cache.add_machine(zone, machine.clone());
        Ok(machine)
    }

    async fn resolve_mig_fact<T, Fut>(
        &self,
        mig: &GroupRef,
        read: impl Fn(&GceCache, &GroupRef) -> Option<T>,
        fetch: impl FnOnce() -> Fut,
        write: impl FnOnce(&GceCache, &GroupRef, T),
    ) -> AutoscalerResult<T>
    where
        T: Clone,
        Fut: Future<Output = CloudResult<T>>,
    {
        if let Some(value) = read(&self.cache, mig) {
            return Ok(value);
        }

        let _guard = self.fill_lock.lock().await;
        if let Some(value) = read(&self.cache, mig) {
            return Ok(value);
        }
        let filled = self.fill_mig_info_cache().await;
        if filled.is_ok() {
            if let Some(value) = read(&self.cache, mig) {
                return Ok(value);
            }
        }

        match fetch().await {
            Ok(value) => {
                write(&self.cache, mig, value.clone());
                Ok(value)
            }
            Err(report) => Err(self.mig_issue(mig, report)),
        }
    }

    /// Lists all groups of the zones holding registered groups. Caller holds the fill lock.
    async fn fill_mig_info_cache(&self) -> AutoscalerResult<()> {
        let registered: HashSet<GroupRef> = self
            .lister
            .get_migs()
            .into_iter()
            .map(|mig| mig.gce_ref)
            .collect();
        let zones: Vec<String> = registered
            .iter()
            .map(|r| r.zone.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let listings = join_all(zones.iter().map(|zone| self.client.fetch_all_migs(zone))).await;

        let mut failed_zones = Vec::new();
        for (zone, listing) in zones.iter().zip(&listings) {
            if let Err(e) = listing {
                error!(zone = %zone, "Error listing migs from zone: {e:?}");
                failed_zones.push(zone.clone());
            }
        }
        if !failed_zones.is_empty() && failed_zones.len() == zones.len() {
            if let Some(report) = listings.into_iter().find_map(Result::err) {
                return Err(report.change_context(AutoscalerError::Cloud {
                    message: format!("listing migs failed in every zone: {failed_zones:?}"),
                }));
            }
            return Ok(());
        }

        for (zone, listing) in zones.iter().zip(listings) {
            let groups = match listing {
                Ok(groups) => groups,
                Err(report) => {
                    for mig in registered.iter().filter(|r| &r.zone == zone) {
                        self.lister.handle_mig_issue(mig, &report);
                    }
                    continue;
                }
            };
            for group in groups {
                let mig_ref = GceRef::new(self.config.project.as_str(), zone.as_str(), group.name);
                if !registered.contains(&mig_ref) {
                    continue;
                }
                self.cache.set_mig_target_size(&mig_ref, group.target_size);
                self.cache
                    .set_mig_basename(&mig_ref, group.base_instance_name);
                self.cache.set_list_managed_instances_results(
                    &mig_ref,
                    group.list_managed_instances_results,
                );
                match InstanceTemplateName::from_url(&group.instance_template) {
                    Some(name) => self.cache.set_mig_instance_template_name(&mig_ref, name),
                    None => error!(mig = %mig_ref, url = %group.instance_template, "Error parsing instance template url"),
                }
            }
        }
        Ok(())
    }

    fn mig_issue(&self, mig: &GroupRef, report: Report<CloudError>) -> Report<AutoscalerError> {
        self.lister.handle_mig_issue(mig, &report);
        AutoscalerError::from_cloud(report, mig)
    }
}
