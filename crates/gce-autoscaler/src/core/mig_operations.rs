//! Cloud-side operations on registered groups.
//!
//! [`MigOperations`] is the handle node groups and the manager share: it owns the cache, the info
//! provider and the cloud clients, and applies every mutation write-through so that a size read
//! after a successful resize reflects the resize.

use std::collections::HashSet;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::core::cache::GceCache;
use crate::core::errors::AutoscalerError;
use crate::core::errors::AutoscalerResult;
use crate::core::gce_ref::generate_mig_url;
use crate::core::gce_ref::parse_mig_url;
use crate::core::gce_ref::GroupRef;
use crate::core::gce_ref::InstanceRef;
use crate::core::info_provider::CachingMigInfoProvider;
use crate::core::options::NodeGroupAutoscalingOptions;
use crate::core::types::GceInstance;
use crate::core::types::Mig;
use crate::platform::gce::AutoscalingGceClient;
use crate::platform::gke::AutoscalingGkeClient;
use crate::platform::CloudError;
use crate::template::TemplateBuilder;

pub(crate) fn control_plane_error(
    report: Report<CloudError>,
    message: impl Into<String>,
) -> Report<AutoscalerError> {
    report.change_context(AutoscalerError::Cloud {
        message: message.into(),
    })
}

pub struct MigOperations {
    project: String,
    location: String,
    cache: Arc<GceCache>,
    info: Arc<CachingMigInfoProvider>,
    gce: Arc<dyn AutoscalingGceClient>,
    gke: Option<Arc<dyn AutoscalingGkeClient>>,
    templates: TemplateBuilder,
}

impl MigOperations {
    pub fn new(
        project: impl Into<String>,
        location: impl Into<String>,
        cache: Arc<GceCache>,
        info: Arc<CachingMigInfoProvider>,
        gce: Arc<dyn AutoscalingGceClient>,
    ) -> Self {
        Self {
            project: project.into(),
            location: location.into(),
            cache,
            info,
            gce,
            gke: None,
            templates: TemplateBuilder::default(),
        }
    }

    pub fn with_gke_client(mut self, gke: Arc<dyn AutoscalingGkeClient>) -> Self {
        self.gke = Some(gke);
        self
    }

    pub fn with_templates(mut self, templates: TemplateBuilder) -> Self {
        self.templates = templates;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn cache(&self) -> &Arc<GceCache> {
        &self.cache
    }

    pub fn info(&self) -> &Arc<CachingMigInfoProvider> {
        &self.info
    }

    pub fn gce(&self) -> &Arc<dyn AutoscalingGceClient> {
        &self.gce
    }

    pub(crate) fn gke(&self) -> AutoscalerResult<&Arc<dyn AutoscalingGkeClient>> {
        self.gke.as_ref().ok_or_else(|| {
            Report::new(AutoscalerError::NotImplemented {
                operation: "node pool management outside GKE".to_string(),
            })
        })
    }

    pub fn get_migs(&self) -> Vec<Mig> {
        self.cache.get_migs()
    }

    pub async fn get_mig_size(&self, mig: &GroupRef) -> AutoscalerResult<i64> {
        self.info.get_mig_target_size(mig).await
    }

    /// Resizes the group and records the new target size once the cloud accepted it.
    pub async fn set_mig_size(&self, mig: &GroupRef, size: i64) -> AutoscalerResult<()> {
        info!(mig = %generate_mig_url(mig), size, "Setting mig size");
        self.cache.invalidate_mig_target_size(mig);
        self.gce
            .resize_mig(mig, size)
            .await
            .map_err(|report| AutoscalerError::from_cloud(report, mig))?;
        self.cache.set_mig_target_size(mig, size);
        Ok(())
    }

    pub async fn get_mig_nodes(&self, mig: &GroupRef) -> AutoscalerResult<Vec<GceInstance>> {
        self.info.get_mig_instances(mig).await
    }

    pub async fn get_mig_for_instance(
        &self,
        instance: &InstanceRef,
    ) -> AutoscalerResult<Option<Mig>> {
        self.info.get_mig_for_instance(instance).await
    }

    /// Deletes instances that all belong to one registered group.
    pub async fn delete_instances(&self, instances: &[InstanceRef]) -> AutoscalerResult<()> {
        let Some(first) = instances.first() else {
            return Ok(());
        };
        let common = self.owning_mig(first).await?;
        for instance in &instances[1..] {
            let mig = self.owning_mig(instance).await?;
            if mig.gce_ref != common.gce_ref {
                return Err(Report::new(AutoscalerError::InstancesInDifferentGroups)
                    .attach_printable(format!(
                        "{instance} belongs to {}, {first} belongs to {}",
                        mig.gce_ref, common.gce_ref
                    )));
            }
        }

        self.cache.invalidate_mig_target_size(&common.gce_ref);
        self.gce
            .delete_instances(&common.gce_ref, instances)
            .await
            .map_err(|report| AutoscalerError::from_cloud(report, &common.gce_ref))
    }

    async fn owning_mig(&self, instance: &InstanceRef) -> AutoscalerResult<Mig> {
        self.get_mig_for_instance(instance).await?.ok_or_else(|| {
            Report::new(AutoscalerError::InvalidArgument {
                message: format!("{instance} doesn't belong to a known mig"),
            })
        })
    }

    /// Adds `delta` explicitly named instances to the group.
    pub async fn create_instances(&self, mig: &GroupRef, delta: i64) -> AutoscalerResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let existing: Vec<String> = self
            .get_mig_nodes(mig)
            .await?
            .iter()
            .map(GceInstance::provider_id)
            .collect();
        let base_name = self
            .info
            .get_mig_basename(mig)
            .await
            .attach_printable_lazy(|| {
                format!("can't upscale {mig}: failed to collect BaseInstanceName")
            })?;
        self.cache.invalidate_mig_target_size(mig);
        self.gce
            .create_instances(mig, &base_name, delta, &existing)
            .await
            .map_err(|report| AutoscalerError::from_cloud(report, mig))
    }

    /// Node a new member of `mig` would register as.
    ///
    /// Existing groups are described by their template; groups that exist only as an
    /// autoprovisioning request are described by their spec.
    pub async fn get_mig_template_node(&self, mig: &Mig) -> AutoscalerResult<Node> {
        let mig_ref = &mig.gce_ref;
        if mig.exist {
            let template = self.info.get_mig_instance_template(mig_ref).await?;
            let kube_env = self.info.get_mig_kube_env(mig_ref).await?;
            let machine = self.info.get_mig_machine_type(mig_ref).await?;
            let os_info = self
                .templates
                .mig_os_info(&generate_mig_url(mig_ref), &kube_env)?;
            return self.templates.build_node_from_template(
                mig, &os_info, &template, &kube_env, &machine, None,
            );
        }
        if let Some(spec) = mig.spec.as_ref().filter(|_| mig.autoprovisioned) {
            let machine = self
                .info
                .get_machine_type(&mig_ref.zone, &spec.machine_type)
                .await?;
            return self.templates.build_node_from_mig_spec(mig, &machine);
        }
        Err(Report::new(AutoscalerError::Template {
            message: format!("unable to get node info for {mig_ref}"),
        }))
    }

    /// Scale-down and provisioning settings of `mig`, with template overrides applied.
    pub fn get_mig_options(
        &self,
        mig: &Mig,
        defaults: NodeGroupAutoscalingOptions,
    ) -> NodeGroupAutoscalingOptions {
        match self.cache.get_autoscaling_options(&mig.gce_ref) {
            Some(options) => defaults.merged(&options, &mig.gce_ref.name),
            None => defaults,
        }
    }

    /// Registers `mig`; a new or changed group is checked for a buildable template node so
    /// that problems with scaling it from zero show up early.
    pub async fn register_mig(&self, mig: Mig) -> bool {
        let changed = self.cache.register_mig(mig.clone());
        if changed {
            if let Err(e) = self.get_mig_template_node(&mig).await {
                error!(mig = %mig.gce_ref, "Can't build node from template for {}, won't be able to scale from 0: {e:?}", mig.gce_ref);
            }
        }
        changed
    }

    /// Reconciles registered groups with the cluster's node pools.
    pub async fn refresh_node_pools(&self) -> AutoscalerResult<()> {
        let pools = self
            .gke()?
            .fetch_node_pools()
            .await
            .map_err(|report| control_plane_error(report, "cannot fetch node pools"))?;

        let mut existing = HashSet::new();
        let mut changed = false;
        for pool in pools {
            for url in &pool.instance_group_urls {
                let gce_ref = parse_mig_url(url)
                    .attach_printable_lazy(|| format!("node pool {}", pool.name))?;
                let mut mig = Mig::new(gce_ref, pool.min_node_count, pool.max_node_count);
                mig.autoprovisioned = pool.autoprovisioned;
                mig.node_pool_name = Some(pool.name.clone());
                existing.insert(mig.gce_ref.clone());
                if self.register_mig(mig).await {
                    changed = true;
                }
            }
        }
        for mig in self.cache.get_migs() {
            if !existing.contains(&mig.gce_ref) {
                self.cache.unregister_mig(&mig.gce_ref);
                changed = true;
            }
        }
        if changed {
            self.info.regenerate_mig_instances_cache().await?;
        }
        Ok(())
    }

    /// Creates the node pool an autoprovisioned group asks for and returns the registered group
    /// that now backs it.
    pub async fn create_node_pool(&self, mig: &Mig) -> AutoscalerResult<Mig> {
        let pool_name = mig.node_pool_name.clone().unwrap_or_default();
        self.gke()?
            .create_node_pool(mig)
            .await
            .map_err(|report| {
                control_plane_error(report, format!("cannot create node pool {pool_name}"))
            })?;
        self.refresh_node_pools().await?;
        self.cache
            .get_migs()
            .into_iter()
            .find(|m| m.node_pool_name.as_deref() == Some(pool_name.as_str()))
            .ok_or_else(|| {
                Report::new(AutoscalerError::GroupDoesNotExist { group: pool_name.clone() })
                    .attach_printable(format!("node pool {pool_name} not found"))
            })
    }

    pub async fn delete_node_pool(&self, mig: &Mig) -> AutoscalerResult<()> {
        if !mig.autoprovisioned {
            return Err(Report::new(AutoscalerError::NotAutoprovisioned {
                group: mig.gce_ref.to_string(),
            })
            .attach_printable("only autoprovisioned node pools can be deleted"));
        }
        let pool_name = mig.node_pool_name.clone().unwrap_or_default();
        debug!(pool = %pool_name, mig = %mig.gce_ref, "Deleting node pool");
        self.gke()?
            .delete_node_pool(&pool_name)
            .await
            .map_err(|report| {
                control_plane_error(report, format!("cannot delete node pool {pool_name}"))
            })?;
        self.refresh_node_pools().await
    }
}
