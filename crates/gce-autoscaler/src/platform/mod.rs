//! Adapters to the outside world: REST clients for the compute and container APIs, credentials,
//! call accounting and the Kubernetes client used by the daemon.

pub mod auth;
pub mod error;
pub mod gce;
pub mod gke;
pub mod kube_client;
pub mod metrics;
pub(crate) mod transport;

use serde::Deserialize;
use serde::Deserializer;

pub use error::CloudError;
pub use error::CloudResult;

/// Accepts both string and number formats for 64-bit integers; the REST APIs quote int64 values.
pub(crate) fn deserialize_i64_from_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrInt {
        String(String),
        Int(i64),
    }

    match StringOrInt::deserialize(deserializer)? {
        StringOrInt::String(s) => s.parse::<i64>().map_err(|e| {
            serde::de::Error::custom(format!("Failed to parse integer from string '{s}': {e}"))
        }),
        StringOrInt::Int(i) => Ok(i),
    }
}

/// Same as [`deserialize_i64_from_string`] for optional unsigned ids.
pub(crate) fn deserialize_optional_u64_from_string<'de, D>(
    deserializer: D,
) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrInt {
        String(String),
        Int(u64),
    }

    match Option::<StringOrInt>::deserialize(deserializer)? {
        None => Ok(None),
        Some(StringOrInt::String(s)) => s.parse::<u64>().map(Some).map_err(|e| {
            serde::de::Error::custom(format!("Failed to parse integer from string '{s}': {e}"))
        }),
        Some(StringOrInt::Int(i)) => Ok(Some(i)),
    }
}
