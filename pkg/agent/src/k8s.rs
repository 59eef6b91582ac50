use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Config, Resource};
use serde_json::json;
use tracing::{debug, warn};

use pkg_types::NamespaceQuota;

/// Component name stamped on emitted events.
pub const COMPONENT_NAME: &str = "namespace-isolator";

pub const REASON_CGROUP_CONFIGURED: &str = "CgroupConfigured";
pub const REASON_CGROUP_FAILED: &str = "CgroupFailed";
pub const REASON_CGROUP_REMOVED: &str = "CgroupRemoved";
pub const REASON_QUOTA_DISABLED: &str = "QuotaDisabled";

/// Build a client from an explicit kubeconfig path, or from the in-cluster
/// service account when the path is empty.
pub async fn build_client(kubeconfig: &str) -> Result<Client> {
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

/// Writes observed state back into NamespaceQuota status. Failures are
/// logged and swallowed: the next reconcile retries the write.
pub struct StatusWriter {
    api: Api<NamespaceQuota>,
}

impl StatusWriter {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    pub async fn update(&self, name: &str, ready: bool, message: &str) {
        let patch = json!({
            "status": {
                "ready": ready,
                "message": message,
                "lastUpdated": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            }
        });

        match self
            .api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => debug!("Status updated for {}: ready={} ({})", name, ready, message),
            Err(e) => warn!("Failed to update status for {}: {}", name, e),
        }
    }
}

/// Emits user-visible events against the API server. Emission is always
/// best-effort; a failed publish never fails a reconcile.
pub struct EventEmitter {
    recorder: Recorder,
}

impl EventEmitter {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: COMPONENT_NAME.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    pub async fn emit_for_quota(
        &self,
        quota: &NamespaceQuota,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        self.publish(quota.object_ref(&()), type_, reason, note).await;
    }

    /// Emit against a bare Namespace reference carrying the quota's name.
    /// Used on delete, when the quota object no longer exists to attach to.
    pub async fn emit_for_namespace(
        &self,
        name: &str,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let reference = ObjectReference {
            kind: Some("Namespace".to_string()),
            name: Some(name.to_string()),
            namespace: Some(name.to_string()),
            ..Default::default()
        };
        self.publish(reference, type_, reason, note).await;
    }

    async fn publish(
        &self,
        reference: ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            warn!("Failed to emit {} event: {}", reason, e);
        }
    }
}
