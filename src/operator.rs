use std::{fmt::Debug, sync::Arc};

use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Secret, Service},
};
use kube::{
    api::{ListParams, PostParams},
    runtime::{
        reflector::{self, ObjectRef, Store},
        watcher,
    },
    Api, Client, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, field, info, instrument, warn, Span};

use crate::{
    children::{synthesize, Children},
    queue::WorkQueue,
    resources::Mk,
    telemetry, Error, Metrics, Result,
};

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a reconciler Context that can update State
    pub(crate) fn to_context(
        &self,
        client: Client,
        store: Store<Mk>,
        queue: Arc<WorkQueue>,
    ) -> Arc<Context> {
        Arc::new(Context {
            client,
            store,
            queue,
            metrics: Metrics::default().register(&self.registry).unwrap(),
            diagnostics: self.diagnostics.clone(),
        })
    }
}

/// A lifecycle notification for one Mk resource, reduced to its queue key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    Added(String),
    Deleted(String),
}

impl ResourceEvent {
    /// Reduce a raw watch event to the closed add/delete set the queue
    /// understands. A relist counts as an add for every listed object.
    pub fn from_watch(event: watcher::Event<Mk>) -> Vec<ResourceEvent> {
        match event {
            watcher::Event::Applied(mk) => vec![ResourceEvent::Added(object_key(&mk))],
            watcher::Event::Deleted(mk) => vec![ResourceEvent::Deleted(object_key(&mk))],
            watcher::Event::Restarted(mks) => mks
                .iter()
                .map(|mk| ResourceEvent::Added(object_key(mk)))
                .collect(),
        }
    }
}

/// Queue key for a resource: `namespace/name`.
pub fn object_key(mk: &Mk) -> String {
    format!("{}/{}", mk.namespace().unwrap_or_default(), mk.name_any())
}

/// Split a queue key back into `(namespace, name)`.
fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once('/') {
        Some((namespace, name))
            if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Ok((namespace, name))
        }
        _ => Err(Error::MalformedKey(key.to_string())),
    }
}

/// Everything a worker needs to turn a queue key into child objects
pub struct Context {
    /// Kubernetes client
    pub(crate) client: Client,

    /// Read handle of the watch cache
    pub(crate) store: Store<Mk>,

    /// The queue feeding the workers
    pub(crate) queue: Arc<WorkQueue>,

    /// Diagnostics read by the web server
    pub(crate) diagnostics: Arc<RwLock<Diagnostics>>,

    /// Prometheus metrics
    pub(crate) metrics: Metrics,
}

impl Context {
    /// Feed one watch notification into the queue.
    pub fn observe(&self, event: ResourceEvent) {
        match event {
            ResourceEvent::Added(key) => {
                debug!(%key, "queueing resource");
                self.queue.enqueue(key);
            }
            ResourceEvent::Deleted(key) => {
                // Deletes only clear in-flight tracking; the children stay in
                // place and no teardown pass is queued
                debug!(%key, "resource deleted, clearing from queue");
                self.queue.mark_done(&key);
            }
        }
    }

    /// Consume the queue until it shuts down.
    pub async fn run_worker(self: Arc<Self>) {
        while let Some(key) = self.queue.dequeue().await {
            self.process(&key).await;
        }
        debug!("worker stopped");
    }

    /// Handle one dequeued key and mark it done.
    ///
    /// The key is marked done unconditionally: failed child creates are
    /// logged but never retried.
    #[instrument(skip(self), fields(trace_id))]
    pub(crate) async fn process(&self, key: &str) {
        let trace_id = telemetry::get_trace_id();
        Span::current().record("trace_id", &field::display(&trace_id));
        let _timer = self.metrics.count_and_measure();
        self.diagnostics.write().await.last_event = Utc::now();

        if let Err(error) = self.reconcile(key).await {
            error!(%key, "reconcile failed: {error:?}");
            self.metrics.reconcile_failure(key, &error);
        }
        self.queue.mark_done(key);
    }

    /// Resolve a key against the cache and apply the derived children.
    pub(crate) async fn reconcile(&self, key: &str) -> Result<()> {
        let (namespace, name) = split_key(key)?;

        let Some(mk) = self.store.get(&ObjectRef::new(name).within(namespace)) else {
            // Deleted between enqueue and processing
            info!(%key, "resource no longer present, skipping");
            return Ok(());
        };

        info!(r#"Reconciling Mk "{namespace}/{name}""#);
        let children = synthesize(&mk);
        self.apply_children(namespace, children).await;
        Ok(())
    }

    /// Create the five children in their fixed order.
    ///
    /// Later objects reference earlier ones by their derived names, so the
    /// order is part of the contract. A failed create does not abort the
    /// pass; every error is logged and the remaining creates still run.
    async fn apply_children(&self, namespace: &str, children: Children) {
        let secrets = Api::<Secret>::namespaced(self.client.clone(), namespace);
        let deployments = Api::<Deployment>::namespaced(self.client.clone(), namespace);
        let services = Api::<Service>::namespaced(self.client.clone(), namespace);

        self.create_child(&secrets, &children.secret, "Secret").await;
        self.create_child(&deployments, &children.db_deployment, "Deployment")
            .await;
        self.create_child(&services, &children.db_service, "Service")
            .await;
        self.create_child(&deployments, &children.express_deployment, "Deployment")
            .await;
        self.create_child(&services, &children.express_service, "Service")
            .await;
    }

    async fn create_child<K>(&self, api: &Api<K>, child: &K, kind: &str)
    where
        K: kube::Resource + Clone + Debug + Serialize + DeserializeOwned,
    {
        let name = child.meta().name.clone().unwrap_or_default();
        let outcome = api
            .create(&PostParams::default(), child)
            .await
            .map(|_| ())
            .map_err(Error::KubeError);
        match outcome {
            Ok(()) => debug!("created {kind} {name}"),
            Err(error) => {
                self.metrics.child_create_failure(kind, &error);
                error!("failed to create {kind} {name}: {error}");
            }
        }
    }
}

pub struct MkController {
    state: State,
    workers: usize,
}

impl MkController {
    pub fn new(state: State) -> Self {
        Self { state, workers: 1 }
    }

    /// Use more than one queue consumer.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Initialize the controller and shared state (given the crd is installed)
    pub async fn run(self) -> Result<(), anyhow::Error> {
        // Get a k8s client for communicating with the cluster
        let client = Client::try_default()
            .await
            .expect("failed to create kube Client");

        let mks = Api::<Mk>::all(client.clone());

        // Test that we can actually query for our CRD (a.k.a. it is installed)
        if let Err(e) = mks.list(&ListParams::default().limit(1)).await {
            error!("CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            std::process::exit(1);
        }

        let (reader, writer) = reflector::store();
        let queue = Arc::new(WorkQueue::new());
        let ctx = self
            .state
            .to_context(client, reader.clone(), Arc::clone(&queue));

        // One watch stream keeps the cache current and feeds the queue
        let watching_config = watcher::Config::default().page_size(50).any_semantic();
        let mut changes = reflector::reflector(writer, watcher(mks, watching_config)).boxed();
        let mut intake = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                while let Some(event) = changes.try_next().await.map_err(Error::WatchFailed)? {
                    for change in ResourceEvent::from_watch(event) {
                        ctx.observe(change);
                    }
                }
                Ok::<(), Error>(())
            })
        };

        // Workers must not read the cache before the initial list has landed
        reader
            .wait_until_ready()
            .await
            .expect("watch stream dropped before initial sync");
        info!("cache synced, starting workers");

        let workers: Vec<_> = (0..self.workers)
            .map(|_| tokio::spawn(Arc::clone(&ctx).run_worker()))
            .collect();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, draining workers");
            }
            res = &mut intake => match res {
                Ok(Err(error)) => error!("watch stream failed: {error:?}"),
                Ok(Ok(())) => warn!("watch stream ended"),
                Err(error) => error!("watch task panicked: {error}"),
            },
        }

        queue.shutdown();
        intake.abort();
        for worker in workers {
            let _ = worker.await;
        }

        Ok(())
    }
}
