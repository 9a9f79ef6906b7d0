//! Builder assembles a [`Reconciler`] from its configuration, validating the
//! mandatory fields before any cluster connection is attempted.

use std::path::{Path, PathBuf};

use kube::{
    Client, Config,
    client::ClientBuilder,
    config::{KubeConfigOptions, Kubeconfig},
    discovery::ApiResource,
    runtime::{
        events::{Recorder, Reporter},
        reflector,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    Error, Health, HealthSignal, OverlayKey, Result,
    discovery::Resolver,
    queue::{RateLimitingQueue, default_rate_limiter},
    reconcile::Reconciler,
};

/// DEFAULT_WORKERS is the worker pool size unless configured otherwise.
pub const DEFAULT_WORKERS: usize = 2;

/// Watched_resources lists the built-in dependent resource endpoints.
fn watched_resources() -> Vec<ApiResource> {
    [
        ("Pod", "pods"),
        ("PersistentVolumeClaim", "persistentvolumeclaims"),
        ("ConfigMap", "configmaps"),
    ]
    .into_iter()
    .map(|(kind, plural)| ApiResource {
        group: String::new(),
        version: "v1".into(),
        api_version: "v1".into(),
        kind: kind.into(),
        plural: plural.into(),
    })
    .collect()
}

/// ReconcilerBuilder configures and constructs a [`Reconciler`].
///
/// Mandatory fields are the controller name, the working context, the worker
/// count, the source configuration path, and both health callbacks; the
/// kubeconfig path, API address, and namespace filter are optional.
#[derive(Default)]
pub struct ReconcilerBuilder {
    controller_name: Option<String>,
    working_context: Option<CancellationToken>,
    working_workers: Option<usize>,
    source_configuration: Option<PathBuf>,
    namespace_filter: Option<String>,
    kubernetes_config: Option<PathBuf>,
    kubernetes_address: Option<String>,
    update_readyz: Option<HealthSignal>,
    update_healthz: Option<HealthSignal>,
}

impl ReconcilerBuilder {
    /// New returns an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller_name sets the name used for events and field management.
    pub fn controller_name<S: Into<String>>(mut self, name: S) -> Self {
        self.controller_name = Some(name.into());
        self
    }

    /// Working_context sets the cancellation token bounding the run.
    pub fn working_context(mut self, token: CancellationToken) -> Self {
        self.working_context = Some(token);
        self
    }

    /// Working_workers sets the worker pool size.
    pub fn working_workers(mut self, count: usize) -> Self {
        self.working_workers = Some(count);
        self
    }

    /// Source_configuration sets the source template path.
    pub fn source_configuration<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.source_configuration = Some(path.into());
        self
    }

    /// Namespace_filter restricts the watches to one namespace.
    pub fn namespace_filter<S: Into<String>>(mut self, namespace: S) -> Self {
        self.namespace_filter = Some(namespace.into());
        self
    }

    /// Kubernetes_config points at an explicit kubeconfig file.
    pub fn kubernetes_config<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.kubernetes_config = Some(path.into());
        self
    }

    /// Kubernetes_address overrides the API server address.
    pub fn kubernetes_address<S: Into<String>>(mut self, address: S) -> Self {
        self.kubernetes_address = Some(address.into());
        self
    }

    /// Update_readyz sets the readiness callback.
    pub fn update_readyz(mut self, signal: HealthSignal) -> Self {
        self.update_readyz = Some(signal);
        self
    }

    /// Update_healthz sets the liveness callback.
    pub fn update_healthz(mut self, signal: HealthSignal) -> Self {
        self.update_healthz = Some(signal);
        self
    }

    /// Validate lists every missing mandatory field at once.
    fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.controller_name.is_none() {
            missing.push("controllerName");
        }
        if self.working_context.is_none() {
            missing.push("workingContext");
        }
        if self.working_workers.is_none() {
            missing.push("workingWorkers");
        }
        if self.source_configuration.is_none() {
            missing.push("sourceConfiguration");
        }
        if self.update_readyz.is_none() {
            missing.push("updateReadyz");
        }
        if self.update_healthz.is_none() {
            missing.push("updateHealthz");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "missing values in the following fields: {}",
                missing.join(", ")
            )))
        }
    }

    /// Build validates the configuration, connects to the cluster, and wires
    /// the reconciler's queue, caches, and event recorder.
    pub async fn build(self) -> Result<Reconciler> {
        info!("validate controller configuration");
        self.validate()?;
        let controller_name = self.controller_name.expect("validated");
        let cancel = self.working_context.expect("validated");
        let workers = self.working_workers.expect("validated");
        let source_configuration = self.source_configuration.expect("validated");
        let update_readyz = self.update_readyz.expect("validated");
        let update_healthz = self.update_healthz.expect("validated");

        info!("create kubernetes connection");
        let config = connection_config(
            self.kubernetes_config.as_deref(),
            self.kubernetes_address.as_deref(),
        )
        .await?;
        let client: Client = ClientBuilder::try_from(config)?.build();

        info!("create informer caches");
        let (overlays, overlay_writer) = reflector::store();

        info!("create workqueue");
        let queue = RateLimitingQueue::<OverlayKey>::new(default_rate_limiter());

        info!("create event recorder");
        let reporter = Reporter {
            controller: controller_name.clone(),
            instance: std::env::var("CONTROLLER_POD_NAME").ok(),
        };
        let recorder = Recorder::new(client.clone(), reporter);

        Ok(Reconciler {
            controller_name,
            resolver: Resolver::new(client.clone()),
            client,
            cancel,
            workers,
            source_configuration,
            namespace: self.namespace_filter,
            queue,
            overlays,
            overlay_writer,
            dependents: watched_resources(),
            recorder,
            health: Health::new(update_readyz, update_healthz),
        })
    }
}

/// Connection_config builds the client configuration: an explicit kubeconfig
/// and/or API address when given, otherwise inferred (in-cluster or local).
async fn connection_config(path: Option<&Path>, address: Option<&str>) -> Result<Config> {
    let mut config = match (path, address) {
        (Some(path), _) => {
            Config::from_custom_kubeconfig(
                Kubeconfig::read_from(path)?,
                &KubeConfigOptions::default(),
            )
            .await?
        }
        (None, Some(address)) => Config::new(address.parse()?),
        (None, None) => Config::infer().await?,
    };
    if let (Some(_), Some(address)) = (path, address) {
        config.cluster_url = address.parse()?;
    }
    Ok(config)
}
