//! Long-running operation tracking.

use std::future::Future;
use std::time::Duration;

use error_stack::Report;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::platform::gce::wire::OperationResource;
use crate::platform::CloudError;
use crate::platform::CloudResult;

/// Observable state of a long-running operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Running,
    Done,
    /// Reached `DONE` with an error payload; holds the marshaled payload.
    Failed { payload: String },
}

impl From<&OperationResource> for OperationState {
    fn from(op: &OperationResource) -> Self {
        match op.status.as_str() {
            "DONE" => match &op.error {
                Some(error) => Self::Failed {
                    payload: serde_json::to_string(error).unwrap_or_else(|e| {
                        format!("operation failed, but error couldn't be recovered: {e}")
                    }),
                },
                None => Self::Done,
            },
            "RUNNING" => Self::Running,
            _ => Self::Pending,
        }
    }
}

/// How often to poll and how long to wait in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Polls `poll` until the operation reaches a terminal state or the deadline passes.
///
/// The first poll happens immediately. Poll failures are logged and polling continues.
pub async fn wait_for_operation<F, Fut>(
    operation: &str,
    target: &str,
    policy: WaitPolicy,
    mut poll: F,
) -> CloudResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CloudResult<OperationState>>,
{
    let deadline = Instant::now() + policy.timeout;
    loop {
        debug!(operation = %operation, target = %target, "Waiting for operation");
        match poll().await {
            Ok(OperationState::Done) => return Ok(()),
            Ok(OperationState::Failed { payload }) => {
                return Err(Report::new(CloudError::OperationFailed {
                    operation: operation.to_string(),
                    target: target.to_string(),
                    payload,
                }));
            }
            Ok(state) => {
                debug!(operation = %operation, target = %target, ?state, "Operation not done yet");
            }
            Err(e) => {
                warn!(operation = %operation, target = %target, "Error while getting operation: {e:?}");
            }
        }

        if Instant::now() + policy.poll_interval >= deadline {
            break;
        }
        tokio::time::sleep(policy.poll_interval).await;
    }
    Err(Report::new(CloudError::OperationTimeout {
        operation: operation.to_string(),
        target: target.to_string(),
    }))
}
