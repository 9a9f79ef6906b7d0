//! Reconcile wires the engine together: informer plumbing, the worker pool,
//! and the per-key sync handler that converges the cluster onto the state an
//! Overlay describes.

use std::{
    collections::{HashMap, hash_map::Entry},
    path::PathBuf,
    pin::pin,
};

use kube::{
    Client,
    api::{Api, DynamicObject},
    discovery::{ApiResource, Scope},
    runtime::{
        WatchStreamExt,
        events::Recorder,
        reflector::{ObjectRef, Store, store::Writer},
        watcher,
    },
};
use metrics::counter;
use tokio::{
    task::JoinSet,
    time::{self, Duration, MissedTickBehavior},
};

use crate::{
    apply,
    discovery::Resolver,
    dispatch::Dispatcher,
    merge, prelude::*,
    queue::RateLimitingQueue,
    render, source,
};

/// OVERLAY_RESYNC is the period at which every cached Overlay is re-enqueued.
const OVERLAY_RESYNC: Duration = Duration::from_secs(5);

/// DEPENDENT_RESYNC is the forced relist period for dependent watches.
const DEPENDENT_RESYNC: Duration = Duration::from_secs(60);

/// Reconciler owns the work queue, the watch subscriptions, and the produced
/// object stream.
pub struct Reconciler {
    pub(crate) controller_name: String,
    pub(crate) client: Client,
    pub(crate) cancel: CancellationToken,
    pub(crate) workers: usize,
    pub(crate) source_configuration: PathBuf,
    pub(crate) namespace: Option<String>,
    pub(crate) queue: RateLimitingQueue<OverlayKey>,
    pub(crate) overlays: Store<Overlay>,
    pub(crate) overlay_writer: Writer<Overlay>,
    pub(crate) dependents: Vec<ApiResource>,
    pub(crate) resolver: Resolver,
    pub(crate) recorder: Recorder,
    pub(crate) health: Health,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("controller_name", &self.controller_name)
            .field("workers", &self.workers)
            .field("source_configuration", &self.source_configuration)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

/// SyncContext is the state one sync invocation reads.
pub(crate) struct SyncContext {
    pub(crate) controller_name: String,
    pub(crate) client: Client,
    pub(crate) source_configuration: PathBuf,
    pub(crate) resolver: Resolver,
    pub(crate) recorder: Recorder,
}

impl Reconciler {
    /// Run sets up the watch subscriptions, syncs the caches, and processes
    /// queue items until the working context is cancelled.
    ///
    /// Readiness flips on just before the workers start and off (with
    /// liveness) when this returns.
    pub async fn run(self) -> Result<()> {
        let Self {
            controller_name,
            client,
            cancel,
            workers,
            source_configuration,
            namespace,
            queue,
            overlays,
            overlay_writer,
            dependents,
            resolver,
            recorder,
            health,
        } = self;

        info!("starting controller");
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), overlays.clone()));
        let mut watches = JoinSet::new();

        // Overlay informer: reflects into the cache and enqueues every touch.
        {
            let api = match namespace.as_deref() {
                Some(ns) => Api::<Overlay>::namespaced(client.clone(), ns),
                None => Api::<Overlay>::all(client.clone()),
            };
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            watches.spawn(async move {
                let stream = watcher(api, watcher::Config::default())
                    .default_backoff()
                    .reflect(overlay_writer)
                    .touched_objects();
                let mut stream = pin!(stream);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        next = stream.next() => match next {
                            Some(Ok(overlay)) => dispatcher.enqueue(&overlay),
                            Some(Err(err)) => warn!(%err, "overlay watch error"),
                            None => break,
                        },
                    }
                }
            });
        }

        // Dependent informers: one watch per built-in resource, restarted on
        // the resync period so a full relist flows through the dispatcher.
        for resource in dependents {
            let api: Api<DynamicObject> = match namespace.as_deref() {
                Some(ns) => Api::namespaced_with(client.clone(), ns, &resource),
                None => Api::all_with(client.clone(), &resource),
            };
            let plural = resource.plural.clone();
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            watches.spawn(async move {
                loop {
                    let stream = watcher(api.clone(), watcher::Config::default()).default_backoff();
                    let mut stream = pin!(stream);
                    let mut relist = pin!(time::sleep(DEPENDENT_RESYNC));
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = &mut relist => break,
                            next = stream.next() => match next {
                                Some(Ok(watcher::Event::Apply(object) | watcher::Event::InitApply(object))) => {
                                    dispatcher.observe_dependent(&object);
                                }
                                Some(Ok(watcher::Event::Delete(object))) => {
                                    dispatcher.observe_dependent_delete(&object);
                                }
                                Some(Ok(watcher::Event::Init | watcher::Event::InitDone)) => {}
                                Some(Err(err)) => warn!(%err, resource = %plural, "dependent watch error"),
                                None => return,
                            },
                        }
                    }
                }
            });
        }

        // Resync tick: the level-trigger guarantee for the Overlay cache.
        {
            let overlays = overlays.clone();
            let queue = queue.clone();
            let cancel = cancel.clone();
            watches.spawn(async move {
                let mut tick = time::interval(OVERLAY_RESYNC);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            for overlay in overlays.state() {
                                queue.add(OverlayKey::from(overlay.as_ref()));
                            }
                        }
                    }
                }
            });
        }

        info!("waiting for informer caches to sync");
        tokio::select! {
            () = cancel.cancelled() => return Err(Error::CacheSync),
            ready = overlays.wait_until_ready() => ready.map_err(|_| Error::CacheSync)?,
        }

        info!(count = workers, "starting workers");
        health.set_ready(true);

        let ctx = Arc::new(SyncContext {
            controller_name,
            client,
            source_configuration,
            resolver,
            recorder,
        });
        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let queue = queue.clone();
            let ctx = ctx.clone();
            let overlays = overlays.clone();
            let health = health.clone();
            pool.spawn(async move {
                while let Some(key) = queue.get().await {
                    match sync(&ctx, &overlays, &key).await {
                        Ok(()) => {
                            health.set_healthy(true);
                            queue.forget(&key);
                            info!(worker, overlay = %key, "successfully synced");
                        }
                        Err(err) => {
                            health.set_healthy(false);
                            counter!("kubeforge_sync_errors_total").increment(1);
                            error!(worker, overlay = %key, %err, "error syncing; requeuing for later retry");
                            queue.add_rate_limited(key.clone());
                        }
                    }
                    queue.done(&key);
                }
            });
        }
        info!("started workers");

        cancel.cancelled().await;
        info!("shutting down workers");
        queue.shut_down();
        while pool.join_next().await.is_some() {}
        watches.abort_all();
        health.set_ready(false);
        health.set_healthy(false);
        Ok(())
    }
}

/// Sync compares the actual state with the state the keyed Overlay describes
/// and attempts to converge the two.
///
/// Per-object failures are recorded and skipped; the sync itself fails only
/// on whole-sync concerns (cache lookup, parsing, merging, discovery).
#[instrument(skip(ctx, overlays), fields(overlay = %key))]
pub(crate) async fn sync(
    ctx: &SyncContext,
    overlays: &Store<Overlay>,
    key: &OverlayKey,
) -> Result<()> {
    counter!("kubeforge_syncs_total").increment(1);

    let reference: ObjectRef<Overlay> = ObjectRef::new(&key.name).within(&key.namespace);
    let Some(overlay) = overlays.get(&reference) else {
        // Deleted; dependent cleanup rides on ownerReferences.
        debug!("overlay no longer in cache, nothing to do");
        return Ok(());
    };

    let payload = source::payload(&overlay)?;
    let template = source::load(&ctx.source_configuration).await?;
    let merged = merge::merge(template, payload);
    let objects = render::render(&overlay, &merged)?;

    let mut apis: HashMap<String, Api<DynamicObject>> = HashMap::new();
    for (resource, object) in objects {
        let api = match apis.entry(resource.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let (ar, caps) = ctx.resolver.resolve(&resource).await?;
                let api = match caps.scope {
                    Scope::Namespaced => {
                        Api::namespaced_with(ctx.client.clone(), &key.namespace, &ar)
                    }
                    Scope::Cluster => Api::all_with(ctx.client.clone(), &ar),
                };
                entry.insert(api)
            }
        };
        match apply::apply(api, &object, &ctx.controller_name).await {
            Ok(()) => counter!("kubeforge_objects_applied_total").increment(1),
            Err(err) => {
                counter!("kubeforge_objects_failed_total").increment(1);
                warn!(%err, object = %object.name_any(), resource = %resource, "failed to apply object");
            }
        }
    }

    ctx.recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: "Success".into(),
                note: Some("Success".into()),
                action: "Sync".into(),
                secondary: None,
            },
            &overlay.object_ref(&()),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use api::v1::OverlaySpec;
    use assert_json_diff::assert_json_include;
    use http::{Method, StatusCode};
    use kube::runtime::{events::Reporter, reflector};
    use serde_json::json;

    use super::*;
    use crate::testing::{self, json_response, mock_client, not_found, serve_one};

    fn overlay() -> Overlay {
        let mut o = Overlay::new("sample", OverlaySpec::default());
        o.meta_mut().namespace = Some("default".into());
        o.meta_mut().uid = Some("42".into());
        o
    }

    fn sync_context(client: Client, tag: &str) -> (SyncContext, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "kubeforge-sync-test-{tag}-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            concat!(
                "pods:\n",
                "  - apiVersion: v1\n",
                "    kind: Pod\n",
                "    metadata:\n",
                "      name: p1\n",
                "    spec:\n",
                "      containers:\n",
                "        - name: web\n",
                "          image: nginx\n",
            ),
        )
        .expect("write source template");

        let capabilities = kube::discovery::ApiCapabilities {
            scope: Scope::Namespaced,
            subresources: Vec::new(),
            operations: Vec::new(),
        };
        let resolver = crate::discovery::Resolver::with_cached(
            client.clone(),
            [("pods".to_string(), (testing::pods_resource(), capabilities))],
        );
        let recorder = Recorder::new(
            client.clone(),
            Reporter {
                controller: "kubeforge".into(),
                instance: None,
            },
        );
        (
            SyncContext {
                controller_name: "kubeforge".into(),
                client,
                source_configuration: path.clone(),
                resolver,
                recorder,
            },
            path,
        )
    }

    #[testing::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn missing_overlay_is_a_noop_success() {
        let (client, handle) = mock_client();
        let (ctx, path) = sync_context(client, "missing");
        let (store, _writer) = reflector::store::<Overlay>();

        sync(&ctx, &store, &OverlayKey::new("default", "gone"))
            .await
            .expect("noop sync");
        drop(handle);
        let _ = std::fs::remove_file(path);
    }

    #[testing::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn empty_overlay_creates_the_source_objects() {
        let (client, mut handle) = mock_client();
        let (ctx, path) = sync_context(client, "empty-overlay");
        let (store, mut writer) = reflector::store::<Overlay>();
        writer.apply_watcher_event(&watcher::Event::Apply(overlay()));

        let scenario = tokio::spawn(async move {
            let request = serve_one(&mut handle, |_| not_found("p1")).await;
            assert_eq!(request.method(), Method::GET);
            assert_eq!(request.uri().path(), "/api/v1/namespaces/default/pods/p1");

            let request = serve_one(&mut handle, |_| {
                json_response(StatusCode::CREATED, &json!({"kind": "Pod", "apiVersion": "v1"}))
            })
            .await;
            assert_eq!(request.method(), Method::POST);
            assert_eq!(request.uri().path(), "/api/v1/namespaces/default/pods");
            let body = request.into_body().collect_bytes().await.expect("body");
            let created: serde_json::Value = serde_json::from_slice(&body).expect("json body");
            assert_json_include!(
                actual: created.clone(),
                expected: json!({
                    "metadata": {
                        "name": "p1",
                        "namespace": "default",
                        "ownerReferences": [{
                            "apiVersion": "kubeforge.sh/v1",
                            "kind": "Overlay",
                            "name": "sample",
                            "uid": "42",
                            "controller": true,
                        }],
                    },
                })
            );
            assert!(
                created["metadata"]["annotations"]
                    ["kubeforge.sh/last-applied-configuration"]
                    .is_string()
            );

            // The success event closes out the sync.
            let request = serve_one(&mut handle, |_| {
                json_response(
                    StatusCode::CREATED,
                    &json!({
                        "kind": "Event",
                        "apiVersion": "events.k8s.io/v1",
                        "metadata": {"name": "sample.sync", "namespace": "default"},
                    }),
                )
            })
            .await;
            assert_eq!(request.method(), Method::POST);
            assert!(
                request
                    .uri()
                    .path()
                    .starts_with("/apis/events.k8s.io/v1/namespaces/default/events")
            );
        });

        sync(&ctx, &store, &OverlayKey::new("default", "sample"))
            .await
            .expect("sync");
        testing::timeout_after_1s(scenario).await;
        let _ = std::fs::remove_file(path);
    }
}
