//! A registered group as seen by the outer autoscaling loop.

use std::fmt;
use std::sync::Arc;

use error_stack::Report;
use k8s_openapi::api::core::v1::Node;
use tracing::info;

use crate::core::errors::AutoscalerError;
use crate::core::errors::AutoscalerResult;
use crate::core::gce_ref::generate_mig_url;
use crate::core::gce_ref::GceRef;
use crate::core::gce_ref::InstanceRef;
use crate::core::mig_operations::MigOperations;
use crate::core::options::NodeGroupAutoscalingOptions;
use crate::core::types::GceInstance;
use crate::core::types::Mig;

/// Immutable group configuration plus the shared handle used for every cloud call.
#[derive(Clone)]
pub struct GceNodeGroup {
    mig: Mig,
    ops: Arc<MigOperations>,
}

impl fmt::Debug for GceNodeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GceNodeGroup")
            .field("mig", &self.mig)
            .finish_non_exhaustive()
    }
}

fn provider_ref(node: &Node) -> AutoscalerResult<InstanceRef> {
    let provider_id = node
        .spec
        .as_ref()
        .and_then(|spec| spec.provider_id.as_deref())
        .unwrap_or_default();
    GceRef::from_provider_id(provider_id)
}

fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

impl GceNodeGroup {
    pub fn new(mig: Mig, ops: Arc<MigOperations>) -> Self {
        Self { mig, ops }
    }

    pub fn mig(&self) -> &Mig {
        &self.mig
    }

    pub fn gce_ref(&self) -> &GceRef {
        &self.mig.gce_ref
    }

    /// Canonical group URL.
    pub fn id(&self) -> String {
        generate_mig_url(&self.mig.gce_ref)
    }

    pub fn debug(&self) -> String {
        format!("{} ({}:{})", self.id(), self.mig.min_size, self.mig.max_size)
    }

    pub fn min_size(&self) -> i64 {
        self.mig.min_size
    }

    pub fn max_size(&self) -> i64 {
        self.mig.max_size
    }

    pub fn exist(&self) -> bool {
        self.mig.exist
    }

    pub fn autoprovisioned(&self) -> bool {
        self.mig.autoprovisioned
    }

    /// Desired capacity; 0 for a group that only exists as an autoprovisioning request.
    pub async fn target_size(&self) -> AutoscalerResult<i64> {
        if !self.mig.exist {
            return Ok(0);
        }
        self.ops.get_mig_size(&self.mig.gce_ref).await
    }

    pub async fn increase_size(&self, delta: i64) -> AutoscalerResult<()> {
        if delta <= 0 {
            return Err(Report::new(AutoscalerError::SizeIncreaseMustBePositive));
        }
        let size = self.target_size().await?;
        if size + delta > self.mig.max_size {
            return Err(Report::new(AutoscalerError::SizeIncreaseTooLarge {
                desired: size + delta,
                max: self.mig.max_size,
            }));
        }
        self.ops.set_mig_size(&self.mig.gce_ref, size + delta).await
    }

    /// Lowers the target size without touching running instances.
    pub async fn decrease_target_size(&self, delta: i64) -> AutoscalerResult<()> {
        if delta >= 0 {
            return Err(Report::new(AutoscalerError::SizeDecreaseMustBeNegative));
        }
        let size = self.target_size().await?;
        let nodes = self.ops.get_mig_nodes(&self.mig.gce_ref).await?;
        if size + delta < nodes.len() as i64 {
            return Err(Report::new(AutoscalerError::DecreaseBelowExisting {
                target_size: size,
                delta,
                existing: nodes.len(),
            }));
        }
        self.ops.set_mig_size(&self.mig.gce_ref, size + delta).await
    }

    /// Whether `node` is an instance of this group. A node outside every registered group is an
    /// error rather than `false`.
    pub async fn belongs(&self, node: &Node) -> AutoscalerResult<bool> {
        let instance = provider_ref(node)?;
        let owner = self.ops.get_mig_for_instance(&instance).await?.ok_or_else(|| {
            Report::new(AutoscalerError::InvalidArgument {
                message: format!("{} doesn't belong to a known mig", node_name(node)),
            })
        })?;
        Ok(generate_mig_url(&owner.gce_ref) == self.id())
    }

    pub async fn delete_nodes(&self, nodes: &[Node]) -> AutoscalerResult<()> {
        let size = self.target_size().await?;
        if size <= self.mig.min_size {
            return Err(Report::new(AutoscalerError::MinSizeReached));
        }
        let mut refs = Vec::with_capacity(nodes.len());
        for node in nodes {
            if !self.belongs(node).await? {
                return Err(Report::new(AutoscalerError::NodeDoesNotBelong {
                    node: node_name(node).to_string(),
                    group: self.id(),
                }));
            }
            refs.push(provider_ref(node)?);
        }
        self.ops.delete_instances(&refs).await
    }

    /// Instances of the group with their state and creation errors.
    pub async fn nodes(&self) -> AutoscalerResult<Vec<GceInstance>> {
        self.ops.get_mig_nodes(&self.mig.gce_ref).await
    }

    pub async fn template_node(&self) -> AutoscalerResult<Node> {
        self.ops.get_mig_template_node(&self.mig).await
    }

    pub fn get_options(&self, defaults: NodeGroupAutoscalingOptions) -> NodeGroupAutoscalingOptions {
        self.ops.get_mig_options(&self.mig, defaults)
    }

    /// Materializes an autoprovisioning request as a node pool.
    pub async fn create(&self) -> AutoscalerResult<GceNodeGroup> {
        if self.mig.exist || !self.mig.autoprovisioned {
            return Err(Report::new(AutoscalerError::NotAutoprovisioned { group: self.id() })
                .attach_printable("Cannot create non-autoprovisioned node group"));
        }
        info!(pool = ?self.mig.node_pool_name, "Creating node pool");
        let mig = self.ops.create_node_pool(&self.mig).await?;
        Ok(GceNodeGroup::new(mig, self.ops.clone()))
    }

    /// Removes an empty autoprovisioned group together with its node pool.
    pub async fn delete(&self) -> AutoscalerResult<()> {
        if !self.mig.exist || !self.mig.autoprovisioned {
            return Err(Report::new(AutoscalerError::NotAutoprovisioned { group: self.id() })
                .attach_printable("Cannot delete non-autoprovisioned node group"));
        }
        let size = self.target_size().await?;
        if size != 0 {
            return Err(Report::new(AutoscalerError::InvalidArgument {
                message: format!("node group {} still has target size {size}", self.id()),
            }));
        }
        self.ops.delete_node_pool(&self.mig).await
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::NodeSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::core::mock::managed_group;
    use crate::core::mock::mig_ref;
    use crate::core::mock::operations;
    use crate::core::mock::running_instance;
    use crate::core::mock::FakeGceClient;
    use crate::core::mock::FakeGkeClient;

    fn node(instance: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(instance.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(mig_ref(instance).to_provider_id()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    struct Fixture {
        gce: Arc<FakeGceClient>,
        ops: Arc<MigOperations>,
    }

    /// Registers `ng1` (bounds 1..=5, target 3) with three running instances, and `ng2`.
    fn fixture() -> Fixture {
        let gce = Arc::new(FakeGceClient::new());
        let ops = Arc::new(operations(gce.clone(), None));
        ops.cache().register_mig(Mig::new(mig_ref("ng1"), 1, 5));
        ops.cache().register_mig(Mig::new(mig_ref("ng2"), 0, 5));
        gce.add_mig(managed_group("ng1", 3));
        gce.add_mig(managed_group("ng2", 1));
        gce.set_instances(
            &mig_ref("ng1"),
            ["ng1-a", "ng1-b", "ng1-c"].map(running_instance).to_vec(),
        );
        gce.set_instances(&mig_ref("ng2"), vec![running_instance("ng2-a")]);
        Fixture { gce, ops }
    }

    fn group(f: &Fixture, name: &str) -> GceNodeGroup {
        GceNodeGroup::new(f.ops.cache().get_mig(&mig_ref(name)).unwrap(), f.ops.clone())
    }

    #[test(tokio::test)]
    async fn identity_and_bounds() {
        let f = fixture();
        let ng1 = group(&f, "ng1");
        assert_eq!(
            ng1.id(),
            "https://content.googleapis.com/compute/v1/projects/p1/zones/us-central1-b/instanceGroups/ng1"
        );
        assert_eq!(ng1.debug(), format!("{} (1:5)", ng1.id()));
        assert_eq!((ng1.min_size(), ng1.max_size()), (1, 5));
        assert_eq!(ng1.target_size().await.unwrap(), 3);
    }

    #[test(tokio::test)]
    async fn increase_size_checks_bounds() {
        let f = fixture();
        let ng1 = group(&f, "ng1");

        let err = ng1.increase_size(0).await.unwrap_err();
        assert_eq!(err.current_context(), &AutoscalerError::SizeIncreaseMustBePositive);

        let err = ng1.increase_size(3).await.unwrap_err();
        assert_eq!(
            err.current_context().to_string(),
            "size increase too large - desired:6 max:5"
        );

        ng1.increase_size(2).await.unwrap();
        assert_eq!(ng1.target_size().await.unwrap(), 5);
        assert_eq!(f.gce.target_size(&mig_ref("ng1")), Some(5));
    }

    #[test(tokio::test)]
    async fn decrease_below_live_count() {
        let f = fixture();
        let ng1 = group(&f, "ng1");

        let err = ng1.decrease_target_size(-2).await.unwrap_err();
        assert_eq!(
            err.current_context().to_string(),
            "attempt to delete existing nodes targetSize=3 delta=-2 existingNodes=3"
        );
        assert_eq!(
            ng1.decrease_target_size(1).await.unwrap_err().current_context(),
            &AutoscalerError::SizeDecreaseMustBeNegative
        );
        assert_eq!(f.gce.target_size(&mig_ref("ng1")), Some(3));
    }

    #[test(tokio::test)]
    async fn decrease_drops_unfulfilled_capacity() {
        let f = fixture();
        f.gce.add_mig(managed_group("ng2", 4));
        let ng2 = group(&f, "ng2");
        ng2.decrease_target_size(-3).await.unwrap();
        assert_eq!(ng2.target_size().await.unwrap(), 1);
    }

    #[test(tokio::test)]
    async fn belongs_compares_group_ids() {
        let f = fixture();
        let ng1 = group(&f, "ng1");
        assert!(ng1.belongs(&node("ng1-a")).await.unwrap());
        assert!(!ng1.belongs(&node("ng2-a")).await.unwrap());
        assert!(ng1.belongs(&node("stranger")).await.is_err());
    }

    #[test(tokio::test)]
    async fn delete_nodes_of_own_group() {
        let f = fixture();
        let ng1 = group(&f, "ng1");

        let err = ng1.delete_nodes(&[node("ng2-a")]).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            AutoscalerError::NodeDoesNotBelong { .. }
        ));

        ng1.delete_nodes(&[node("ng1-a"), node("ng1-b")]).await.unwrap();
        assert_eq!(
            f.gce.deleted(),
            vec![(mig_ref("ng1"), vec![mig_ref("ng1-a"), mig_ref("ng1-b")])]
        );
    }

    #[test(tokio::test)]
    async fn delete_nodes_stops_at_min_size() {
        let f = fixture();
        f.gce.add_mig(managed_group("ng1", 1));
        let ng1 = group(&f, "ng1");
        let err = ng1.delete_nodes(&[node("ng1-a")]).await.unwrap_err();
        assert_eq!(err.current_context(), &AutoscalerError::MinSizeReached);
    }

    #[test(tokio::test)]
    async fn only_autoprovisioned_groups_are_created_or_deleted() {
        let f = fixture();
        let ng1 = group(&f, "ng1");
        assert!(matches!(
            ng1.create().await.unwrap_err().current_context(),
            AutoscalerError::NotAutoprovisioned { .. }
        ));
        assert!(matches!(
            ng1.delete().await.unwrap_err().current_context(),
            AutoscalerError::NotAutoprovisioned { .. }
        ));
    }

    #[test(tokio::test)]
    async fn autoprovisioned_group_lifecycle() {
        let gce = Arc::new(FakeGceClient::new());
        let gke = Arc::new(FakeGkeClient::new());
        let ops = Arc::new(operations(gce.clone(), Some(gke.clone())));
        gke.back_created_pools_with("nap-pool", vec![generate_mig_url(&mig_ref("nap-pool-grp"))]);
        gce.add_mig(managed_group("nap-pool-grp", 0));

        let mut request = Mig::new(mig_ref("nap-pool-temporary-mig"), 0, 1000);
        request.exist = false;
        request.autoprovisioned = true;
        request.node_pool_name = Some("nap-pool".to_string());
        let request = GceNodeGroup::new(request, ops.clone());
        assert_eq!(request.target_size().await.unwrap(), 0);

        let created = request.create().await.unwrap();
        assert!(created.exist());
        assert_eq!(created.gce_ref(), &mig_ref("nap-pool-grp"));
        assert!(created.autoprovisioned());
        assert_eq!(gke.created().len(), 1);

        created.delete().await.unwrap();
        assert_eq!(gke.deleted(), vec!["nap-pool".to_string()]);
    }
}
