//! Error reporting for provisioning attempts that exhausted their retries.

use log::error;

use crate::types::{NetworkId, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// Container name of the instance, `{type}.{discriminator}`.
    pub instance: String,
    pub network: NetworkId,
    /// Last node the attempt failed on.
    pub node: Option<NodeId>,
    pub error: String,
}

pub trait ErrorReporter: Send + Sync {
    fn report(&self, report: &FailureReport);
}

/// Reports through the process log.
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, report: &FailureReport) {
        match &report.node {
            Some(node) => error!(
                "Provisioning of {} for network {} failed on node {}: {}",
                report.instance, report.network, node, report.error
            ),
            None => error!(
                "Provisioning of {} for network {} failed: {}",
                report.instance, report.network, report.error
            ),
        }
    }
}
