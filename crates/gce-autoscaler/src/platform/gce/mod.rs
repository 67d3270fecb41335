//! Compute Engine REST client.

pub mod client;
pub mod error_info;
pub mod operation;
pub mod rest;
pub mod wire;

pub use client::AutoscalingGceClient;
pub use client::GceClientConfig;
pub use rest::GceRestClient;
