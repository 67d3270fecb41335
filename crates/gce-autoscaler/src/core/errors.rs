//! Error types surfaced by node groups, the manager and the provider.
//!
//! Every variant belongs to one of three kinds (see [`ErrorKind`]): deterministic validation
//! failures, structural problems with a group or its template, and transient cloud failures.

use core::error::Error;

use derive_more::Display;
use error_stack::Report;

use crate::core::gce_ref::GceRef;
use crate::platform::CloudError;

/// Result type for node-group and manager operations.
pub type AutoscalerResult<T> = Result<T, Report<AutoscalerError>>;

/// Coarse classification the outer loop uses to decide how to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Argument or bounds violation; retrying will not help.
    Validation,
    /// The group, its template or an identifier is malformed or missing.
    Structural,
    /// Transport, operation or deadline failure reported by the cloud.
    Transient,
}

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum AutoscalerError {
    #[display("size increase must be positive")]
    SizeIncreaseMustBePositive,
    #[display("size increase too large - desired:{desired} max:{max}")]
    SizeIncreaseTooLarge { desired: i64, max: i64 },
    #[display("size decrease must be negative")]
    SizeDecreaseMustBeNegative,
    #[display(
        "attempt to delete existing nodes targetSize={target_size} delta={delta} existingNodes={existing}"
    )]
    DecreaseBelowExisting {
        target_size: i64,
        delta: i64,
        existing: usize,
    },
    #[display("min size reached, nodes will not be deleted")]
    MinSizeReached,
    #[display("{node} belongs to a different group than {group}")]
    NodeDoesNotBelong { node: String, group: String },
    #[display("instances don't belong to the same group")]
    InstancesInDifferentGroups,
    #[display("node group {group} is not autoprovisioned")]
    NotAutoprovisioned { group: String },
    #[display("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[display("node group {group} does not exist")]
    GroupDoesNotExist { group: String },
    #[display("instance template {template} carries no kube-env")]
    TemplateMissingKubeEnv { template: String },
    #[display("unknown operating system {value:?} in kube-env")]
    UnknownOperatingSystem { value: String },
    #[display("wrong id: expected format gce://<project-id>/<zone>/<name>, got {id}")]
    MalformedProviderId { id: String },
    #[display("malformed resource url: {url}")]
    MalformedUrl { url: String },
    #[display("invalid node group spec: {message}")]
    MalformedSpec { message: String },
    #[display("invalid kube-env: {message}")]
    KubeEnv { message: String },
    #[display("cannot build node template: {message}")]
    Template { message: String },
    #[display("{operation} is not implemented")]
    NotImplemented { operation: String },
    #[display("cloud error: {message}")]
    Cloud { message: String },
}

impl Error for AutoscalerError {}

impl AutoscalerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SizeIncreaseMustBePositive
            | Self::SizeIncreaseTooLarge { .. }
            | Self::SizeDecreaseMustBeNegative
            | Self::DecreaseBelowExisting { .. }
            | Self::MinSizeReached
            | Self::NodeDoesNotBelong { .. }
            | Self::InstancesInDifferentGroups
            | Self::NotAutoprovisioned { .. }
            | Self::InvalidArgument { .. } => ErrorKind::Validation,
            Self::GroupDoesNotExist { .. }
            | Self::TemplateMissingKubeEnv { .. }
            | Self::UnknownOperatingSystem { .. }
            | Self::MalformedProviderId { .. }
            | Self::MalformedUrl { .. }
            | Self::MalformedSpec { .. }
            | Self::KubeEnv { .. }
            | Self::Template { .. }
            | Self::NotImplemented { .. } => ErrorKind::Structural,
            Self::Cloud { .. } => ErrorKind::Transient,
        }
    }

    /// Lifts a cloud client failure concerning `group` into the public error space.
    ///
    /// A missing group keeps its identity so callers can unregister it; everything else is
    /// transient.
    pub(crate) fn from_cloud(report: Report<CloudError>, group: &GceRef) -> Report<Self> {
        let context = match report.current_context() {
            CloudError::GroupDoesNotExist { .. } => Self::GroupDoesNotExist {
                group: group.to_string(),
            },
            other => Self::Cloud {
                message: other.to_string(),
            },
        };
        report.change_context(context)
    }
}
