use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Config};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use pkg_types::NamespaceQuota;

/// In-memory set of namespaces with an enabled quota, kept in sync with the
/// NamespaceQuota stream. Reads happen in the container-creation hot path,
/// so the lookup is a single shared-lock acquire on a hash set; all writes
/// come from the one watcher task.
pub struct QuotaCache {
    quotas: RwLock<HashSet<String>>,
    ready_tx: watch::Sender<bool>,
}

impl QuotaCache {
    pub fn new() -> Arc<Self> {
        let (ready_tx, _) = watch::channel(false);
        Arc::new(Self {
            quotas: RwLock::new(HashSet::new()),
            ready_tx,
        })
    }

    /// Whether the namespace has an enabled quota right now.
    pub fn has_quota(&self, namespace: &str) -> bool {
        self.quotas.read().unwrap().contains(namespace)
    }

    /// Snapshot of all quota-bearing namespaces, for startup logging.
    pub fn namespaces(&self) -> Vec<String> {
        self.quotas.read().unwrap().iter().cloned().collect()
    }

    /// Wait for the first full list to land. Timing out is not fatal: the
    /// cache starts empty and fills in as the watch comes up.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.ready_tx.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        )
    }

    /// Build a client and spawn the watcher task.
    pub async fn start(self: &Arc<Self>, kubeconfig: &str) -> Result<tokio::task::JoinHandle<()>> {
        let client = build_client(kubeconfig).await?;
        Ok(tokio::spawn(Arc::clone(self).run(client)))
    }

    async fn run(self: Arc<Self>, client: Client) {
        let api: Api<NamespaceQuota> = Api::all(client);
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        // Each (re)list rebuilds the set from scratch, which also clears any
        // entries whose delete we missed while disconnected.
        let mut relisted: HashSet<String> = HashSet::new();

        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Init) => relisted.clear(),
                Ok(watcher::Event::InitApply(quota)) => {
                    if !quota.spec.namespace.is_empty() && quota.spec.enabled {
                        relisted.insert(quota.spec.namespace.clone());
                    }
                }
                Ok(watcher::Event::InitDone) => {
                    let count = relisted.len();
                    *self.quotas.write().unwrap() = std::mem::take(&mut relisted);
                    self.ready_tx.send_replace(true);
                    info!("Quota cache synced: {} namespaces with quotas", count);
                }
                Ok(watcher::Event::Apply(quota)) => self.apply(&quota),
                Ok(watcher::Event::Delete(quota)) => self.remove(&quota),
                Err(e) => warn!("NamespaceQuota watch error: {}", e),
            }
        }
    }

    pub(crate) fn apply(&self, quota: &NamespaceQuota) {
        let ns = &quota.spec.namespace;
        if ns.is_empty() {
            return;
        }

        if quota.spec.enabled {
            if self.quotas.write().unwrap().insert(ns.clone()) {
                info!("Quota added for namespace {}", ns);
            } else {
                debug!("Quota updated for namespace {}", ns);
            }
        } else if self.quotas.write().unwrap().remove(ns) {
            info!("Quota disabled for namespace {}", ns);
        }
    }

    pub(crate) fn remove(&self, quota: &NamespaceQuota) {
        let ns = &quota.spec.namespace;
        if ns.is_empty() {
            return;
        }
        if self.quotas.write().unwrap().remove(ns) {
            info!("Quota removed for namespace {}", ns);
        }
    }
}

async fn build_client(kubeconfig: &str) -> Result<Client> {
    let config = if kubeconfig.is_empty() {
        Config::incluster().context("failed to load in-cluster config")?
    } else {
        let kc = Kubeconfig::read_from(kubeconfig)
            .with_context(|| format!("failed to read kubeconfig {}", kubeconfig))?;
        Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
            .await
            .context("failed to build config from kubeconfig")?
    };
    Client::try_from(config).context("failed to create Kubernetes client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::NamespaceQuotaSpec;

    fn quota(name: &str, namespace: &str, enabled: bool) -> NamespaceQuota {
        NamespaceQuota::new(
            name,
            NamespaceQuotaSpec {
                namespace: namespace.to_string(),
                cpu: String::new(),
                memory: String::new(),
                enabled,
            },
        )
    }

    #[test]
    fn apply_tracks_enabled_bit() {
        let cache = QuotaCache::new();

        cache.apply(&quota("q1", "tenant-a", true));
        assert!(cache.has_quota("tenant-a"));
        assert!(!cache.has_quota("tenant-z"));

        // enabled flipped to false drops the entry
        cache.apply(&quota("q1", "tenant-a", false));
        assert!(!cache.has_quota("tenant-a"));

        // and flipping back restores it
        cache.apply(&quota("q1", "tenant-a", true));
        assert!(cache.has_quota("tenant-a"));
    }

    #[test]
    fn disabled_quota_is_never_added() {
        let cache = QuotaCache::new();
        cache.apply(&quota("q1", "tenant-b", false));
        assert!(!cache.has_quota("tenant-b"));
        assert!(cache.namespaces().is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let cache = QuotaCache::new();
        cache.apply(&quota("q1", "tenant-a", true));

        cache.remove(&quota("q1", "tenant-a", true));
        assert!(!cache.has_quota("tenant-a"));
        cache.remove(&quota("q1", "tenant-a", true));
        assert!(!cache.has_quota("tenant-a"));
    }

    #[test]
    fn empty_namespace_is_ignored() {
        let cache = QuotaCache::new();
        cache.apply(&quota("q1", "", true));
        assert!(cache.namespaces().is_empty());
    }

    #[tokio::test]
    async fn wait_ready_times_out_before_sync() {
        let cache = QuotaCache::new();
        assert!(!cache.wait_ready(Duration::from_millis(10)).await);

        cache.ready_tx.send_replace(true);
        assert!(cache.wait_ready(Duration::from_millis(10)).await);
    }
}
