//! Provider core: group identity, caching, info lookup, node groups and the manager.

pub mod cache;
pub mod errors;
pub mod gce_ref;
pub mod info_provider;
pub mod manager;
pub mod mig_operations;
#[cfg(test)]
pub mod mock;
pub mod node_group;
pub mod node_group_spec;
pub mod options;
pub mod provider;
pub mod types;

pub use errors::AutoscalerError;
pub use errors::AutoscalerResult;
pub use manager::GceManager;
pub use manager::ManagerConfig;
pub use manager::ManagerMode;
pub use node_group::GceNodeGroup;
pub use provider::GceCloudProvider;
