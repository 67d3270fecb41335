//! Container (GKE) control-plane client: node pools, cluster locations and autoprovisioning limits.

pub mod client;
pub mod rest;
pub mod wire;

pub use client::AutoscalingGkeClient;
pub use client::GkeClientConfig;
pub use client::NodePool;
pub use rest::GkeRestClient;
