use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use kube::api::Api;
use kube::runtime::events::EventType;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, warn};

use pkg_types::{NamespaceQuota, NamespaceQuotaSpec};

use crate::cgroup::SliceManager;
use crate::k8s::{self, EventEmitter, StatusWriter};
use crate::limits;
use crate::metrics;
use crate::queue::WorkQueue;

/// A key that keeps failing is dropped after this many requeues; the next
/// event or the periodic resync reintroduces it.
const MAX_RETRIES: u32 = 5;
const RESYNC_PERIOD: Duration = Duration::from_secs(30);
const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Reconciles NamespaceQuota declarations into systemd slices on this node.
///
/// One watcher task feeds object keys into the work queue, one resync task
/// re-enqueues every known key each period, and a single worker drains the
/// queue. The single worker serializes all cgroup and systemd mutations, so
/// no two reconciles ever race on the host.
pub struct Controller {
    client: Client,
    slices: SliceManager,
    queue: WorkQueue,
    store: Store<NamespaceQuota>,
    writer: Mutex<Option<Writer<NamespaceQuota>>>,
    status: StatusWriter,
    events: EventEmitter,
}

impl Controller {
    pub fn new(client: Client, slices: SliceManager) -> Arc<Self> {
        let (store, writer) = reflector::store();
        Arc::new(Self {
            slices,
            queue: WorkQueue::new(),
            store,
            writer: Mutex::new(Some(writer)),
            status: StatusWriter::new(client.clone()),
            events: EventEmitter::new(client.clone()),
            client,
        })
    }

    /// Run until `shutdown` is called. Returns after the queue has drained.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let writer = self
            .writer
            .lock()
            .unwrap()
            .take()
            .context("controller is already running")?;

        info!("Starting controller");
        let watch_task = tokio::spawn(Arc::clone(&self).run_watcher(writer));

        // A failed initial list is not fatal: the watch keeps retrying and
        // keys flow in as soon as it comes up.
        info!("Waiting for initial cache sync");
        match tokio::time::timeout(CACHE_SYNC_TIMEOUT, self.store.wait_until_ready()).await {
            Ok(Ok(())) => info!("Cache synced"),
            Ok(Err(e)) => warn!("Cache sync aborted: {}", e),
            Err(_) => warn!("Cache sync timed out, continuing with an empty cache"),
        }

        let resync_task = tokio::spawn(Arc::clone(&self).run_resync());

        info!("Starting worker");
        self.run_worker().await;

        watch_task.abort();
        resync_task.abort();
        info!("Controller shut down");
        Ok(())
    }

    /// Stop the queue; the worker drains in-flight keys and `run` returns.
    pub fn shutdown(&self) {
        self.queue.shut_down();
    }

    async fn run_watcher(self: Arc<Self>, writer: Writer<NamespaceQuota>) {
        let api: Api<NamespaceQuota> = Api::all(self.client.clone());
        let stream = reflector(writer, watcher(api, watcher::Config::default()));
        let mut stream = stream.default_backoff().touched_objects().boxed();

        while let Some(item) = stream.next().await {
            match item {
                Ok(quota) => {
                    let key = quota.name_any();
                    debug!("Watch event for {}", key);
                    self.queue.add(&key);
                }
                Err(e) => warn!("NamespaceQuota watch error: {}", e),
            }
        }
    }

    /// Periodically re-enqueue every known key. This is what brings back
    /// keys that were dropped after exhausting their retries.
    async fn run_resync(self: Arc<Self>) {
        let mut interval = tokio::time::interval(RESYNC_PERIOD);
        interval.tick().await;
        loop {
            interval.tick().await;
            let state = self.store.state();
            debug!("Resync: re-enqueueing {} quotas", state.len());
            for quota in state {
                self.queue.add(&quota.name_any());
            }
        }
    }

    async fn run_worker(&self) {
        while let Some(key) = self.queue.get().await {
            match self.reconcile(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(e) => {
                    let attempts = self.queue.num_requeues(&key);
                    if attempts < MAX_RETRIES {
                        warn!(
                            "Error processing {} (attempt {}): {:#}, retrying",
                            key,
                            attempts + 1,
                            e
                        );
                        self.queue.add_rate_limited(&key);
                    } else {
                        error!("Max retries exceeded for {}, dropping: {:#}", key, e);
                        self.queue.forget(&key);
                    }
                }
            }
            self.queue.done(&key);
        }
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        debug!("Reconciling NamespaceQuota {}", key);

        // Always read the latest state from the cache; the queue only
        // carries keys, never per-event deltas.
        let Some(quota) = self.store.get(&ObjectRef::new(key)) else {
            return self.handle_delete(key).await;
        };

        if let Err(e) = quota.spec.validate() {
            error!("Failed to parse NamespaceQuota {}: {:#}", key, e);
            self.status
                .update(key, false, &format!("Parse error: {:#}", e))
                .await;
            self.events
                .emit_for_quota(
                    &quota,
                    EventType::Warning,
                    k8s::REASON_CGROUP_FAILED,
                    format!("Failed to parse NamespaceQuota: {:#}", e),
                )
                .await;
            return Err(e);
        }

        self.handle_quota(&quota).await
    }

    /// The declaration is gone; the key is the only handle left, so the
    /// slice is removed under that name. Absence of the slice is success.
    async fn handle_delete(&self, name: &str) -> Result<()> {
        info!("NamespaceQuota {} deleted, removing slice", name);

        match self.slices.remove_slice(name) {
            Ok(()) => {
                self.events
                    .emit_for_namespace(
                        name,
                        EventType::Normal,
                        k8s::REASON_CGROUP_REMOVED,
                        format!("Cgroup removed for deleted NamespaceQuota {}", name),
                    )
                    .await;
            }
            Err(e) => warn!("Failed to remove slice on delete of {}: {:#}", name, e),
        }

        Ok(())
    }

    async fn handle_quota(&self, quota: &NamespaceQuota) -> Result<()> {
        let name = quota.name_any();
        let spec = &quota.spec;

        if !spec.enabled {
            info!("Quota {} disabled, removing slice for {}", name, spec.namespace);
            if let Err(e) = self.slices.remove_slice(&spec.namespace) {
                warn!("Failed to remove slice for {}: {:#}", spec.namespace, e);
            }
            self.status.update(&name, true, "Quota disabled").await;
            self.events
                .emit_for_quota(
                    quota,
                    EventType::Normal,
                    k8s::REASON_QUOTA_DISABLED,
                    "Quota disabled, cgroup removed".to_string(),
                )
                .await;
            return Ok(());
        }

        info!(
            "Ensuring slice for {} (cpu={:?}, memory={:?})",
            spec.namespace, spec.cpu, spec.memory
        );
        if let Err(e) = self
            .slices
            .ensure_slice(&spec.namespace, &spec.cpu, &spec.memory)
            .await
        {
            error!("Failed to configure slice for {}: {:#}", spec.namespace, e);
            self.status
                .update(&name, false, &format!("Cgroup error: {:#}", e))
                .await;
            self.events
                .emit_for_quota(
                    quota,
                    EventType::Warning,
                    k8s::REASON_CGROUP_FAILED,
                    format!("Failed to configure cgroup: {:#}", e),
                )
                .await;
            return Err(e);
        }

        self.status
            .update(&name, true, "Cgroup configured successfully")
            .await;
        self.events
            .emit_for_quota(
                quota,
                EventType::Normal,
                k8s::REASON_CGROUP_CONFIGURED,
                format!(
                    "Cgroup configured with CPU={}, Memory={}",
                    spec.cpu, spec.memory
                ),
            )
            .await;

        self.refresh_metrics(spec);
        Ok(())
    }

    fn refresh_metrics(&self, spec: &NamespaceQuotaSpec) {
        let stats = self.slices.read_stats(&spec.namespace);
        let cpu_limit = if spec.cpu.is_empty() {
            0
        } else {
            limits::parse_cpu(&spec.cpu).unwrap_or(0)
        };
        let memory_limit = if spec.memory.is_empty() {
            0
        } else {
            limits::parse_memory(&spec.memory).unwrap_or(0)
        };
        metrics::update_namespace_metrics(&spec.namespace, &stats, cpu_limit, memory_limit);
    }
}
