use thiserror::Error;

/// CRD definitions for the Mk resource
pub mod resources;

/// Controller wiring: watch intake, work queue consumption, reconciliation
pub mod operator;

/// Deduplicating work queue of resource keys
pub mod queue;

/// Construction of the child objects derived from an Mk resource
pub mod children;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

#[cfg(test)]
pub mod fixtures;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("MalformedKey: {0}")]
    MalformedKey(String),

    #[error("Watch stream failed: {0}")]
    WatchFailed(#[source] kube::runtime::watcher::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }
}
