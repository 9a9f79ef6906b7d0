#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Kubeforge implements common functionality for the controller binary and
//! the Overlay reconciliation engine itself.

use std::{fmt, sync::Arc, sync::LazyLock};

use kube::{Resource, ResourceExt};

use api::v1::Overlay;

/// Prelude is the common types for the reconciliation modules.
pub(crate) mod prelude {
    pub use std::sync::Arc;

    pub use futures::prelude::*;
    pub use kube::{
        self, Resource, ResourceExt,
        runtime::events::{Event, EventType},
    };
    pub use tokio_util::sync::CancellationToken;
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use api::v1::Overlay;

    pub use crate::{CONTROLLER_NAME, Error, Health, OverlayKey, Result};
}

pub mod apply;
pub mod builder;
pub mod discovery;
pub mod dispatch;
pub mod http;
pub mod merge;
pub mod queue;
pub mod reconcile;
pub mod render;
pub mod source;

#[cfg(test)]
pub(crate) mod testing;

/// Error ...
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// TracingConfig indicates the error came from the tracing setup.
    #[error("tracing_subscriber error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),
    /// Tracing indicates the error came from installing the tracing subscriber.
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
    /// Kube is a generic error from the `kube` crate.
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    /// KubeConfig indicates the process was unable to infer a kubeconfig.
    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::InferConfigError),
    /// KubeConfigRead indicates the provided kubeconfig could not be loaded.
    #[error("kubeconfig error: {0}")]
    KubeConfigRead(#[from] kube::config::KubeconfigError),
    /// Io indicates some OS-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON indicates a JSON serialization failed.
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
    /// YAML indicates a YAML document failed to parse.
    #[error("yaml error: {0}")]
    YAML(#[from] serde_yaml::Error),
    /// AddrParse indicates the provided string failed to parse into an address.
    #[error("parse error: {0}")]
    AddrParse(#[from] ::http::uri::InvalidUri),
    /// Tokio indicates an error joining tasks.
    #[error("tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),

    /// Config indicates invalid or incomplete startup configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// CacheSync indicates the informer caches never became ready.
    #[error("failed to wait for caches to sync")]
    CacheSync,
    /// Discovery indicates no API endpoint serves the named resource.
    #[error("no resource mapping found for {0:?}")]
    Discovery(String),
    /// Merge indicates the merged document broke a shape invariant.
    #[error("merge error: {0}")]
    Merge(String),
    /// MissingMetadata indicates a required metadata field was absent.
    #[error("missing metadata on kubernetes object: {0}")]
    MissingMetadata(&'static str),
    /// Validation indicates the API server rejected a dry-run create.
    #[error("validation failed for {name}: {source}")]
    Validation {
        /// Name of the rejected object.
        name: String,
        /// The underlying API error.
        source: kube::Error,
    },
    /// Apply indicates a create or delete failed after validation.
    #[error("apply failed for {name}: {source}")]
    Apply {
        /// Name of the object that failed to converge.
        name: String,
        /// The underlying API error.
        source: kube::Error,
    },
}

/// Result typedef for the engine.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// OverlayKey identifies an Overlay by namespace and name.
///
/// This is the work queue's item type; identical keys coalesce.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct OverlayKey {
    /// Namespace the Overlay lives in.
    pub namespace: String,
    /// Name of the Overlay.
    pub name: String,
}

impl OverlayKey {
    /// New constructs a key from its parts.
    pub fn new<N: Into<String>, S: Into<String>>(namespace: N, name: S) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for OverlayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&Overlay> for OverlayKey {
    fn from(overlay: &Overlay) -> Self {
        Self::new(overlay.namespace().unwrap_or_default(), overlay.name_any())
    }
}

/// HealthSignal is a callback flipping one introspection flag.
///
/// Signals are invoked from worker tasks; the receiving side owns whatever
/// synchronization it needs.
pub type HealthSignal = Arc<dyn Fn(bool) + Send + Sync>;

/// Health publishes readiness and liveness transitions.
#[derive(Clone)]
pub struct Health {
    ready: HealthSignal,
    healthy: HealthSignal,
}

impl Health {
    /// New bundles the two callbacks handed to the builder.
    pub fn new(ready: HealthSignal, healthy: HealthSignal) -> Self {
        Self { ready, healthy }
    }

    /// Set_ready flips the readiness flag.
    pub fn set_ready(&self, up: bool) {
        (self.ready.as_ref())(up);
    }

    /// Set_healthy flips the liveness flag.
    pub fn set_healthy(&self, up: bool) {
        (self.healthy.as_ref())(up);
    }
}

impl fmt::Debug for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("health")
    }
}

/// Forge_annotation returns the provided argument as a name in the
/// controller's annotation space.
pub fn forge_annotation<S: AsRef<str>>(s: S) -> String {
    let mut out = String::from("kubeforge.sh/");
    out.push_str(s.as_ref());
    out
}

/// LAST_APPLIED_ANNOTATION carries the fingerprint of the configuration the
/// controller last applied to an object. It is the sole drift signal.
pub static LAST_APPLIED_ANNOTATION: LazyLock<String> =
    LazyLock::new(|| forge_annotation("last-applied-configuration"));

/// OVERRIDE_NAME_ANNOTATION, when present and non-empty on a produced object,
/// overrides the object's name.
pub static OVERRIDE_NAME_ANNOTATION: LazyLock<String> =
    LazyLock::new(|| forge_annotation("override-name"));

/// CONTROLLER_NAME is the name the controller uses whenever it needs a
/// human-readable default.
pub const CONTROLLER_NAME: &str = "kubeforge";

/// Overlay_kind is the owner kind dependent objects are matched against.
pub fn overlay_kind() -> &'static str {
    static KIND: LazyLock<String> = LazyLock::new(|| Overlay::kind(&()).into_owned());
    &KIND
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotations_are_namespaced() {
        assert_eq!(
            *LAST_APPLIED_ANNOTATION,
            "kubeforge.sh/last-applied-configuration"
        );
        assert_eq!(*OVERRIDE_NAME_ANNOTATION, "kubeforge.sh/override-name");
    }

    #[test]
    fn key_display() {
        let key = OverlayKey::new("default", "sample");
        assert_eq!(key.to_string(), "default/sample");
    }
}
