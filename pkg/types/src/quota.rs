use anyhow::{Result, bail};
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::validate::validate_namespace_name;

/// Desired per-namespace resource limits, enforced node-locally through a
/// systemd slice. Cluster-scoped: the object name is the cluster-unique key;
/// `spec.namespace` names the namespace whose containers are accounted
/// together.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize)]
#[kube(
    group = "brasa.cloud",
    version = "v1alpha1",
    kind = "NamespaceQuota",
    plural = "namespacequotas",
    status = "NamespaceQuotaStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceQuotaSpec {
    /// Target namespace name.
    pub namespace: String,
    /// CPU limit in cores (decimal, e.g. "4" or "0.5"). Empty = unconstrained.
    #[serde(default)]
    pub cpu: String,
    /// Memory limit with optional binary suffix (e.g. "8Gi", "512M").
    /// Empty = unconstrained.
    #[serde(default)]
    pub memory: String,
    /// When false the slice is removed and nothing is enforced.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceQuotaStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub message: String,
    /// RFC3339 timestamp of the last status write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl NamespaceQuotaSpec {
    /// Check the fields that cannot be validated by deserialization alone.
    /// The namespace ends up spliced into a slice unit name and passed to
    /// systemctl, so it must be a well-formed resource name.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            bail!("namespace field is required");
        }
        validate_namespace_name(&self.namespace)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn crd_metadata() {
        assert_eq!(NamespaceQuota::group(&()), "brasa.cloud");
        assert_eq!(NamespaceQuota::version(&()), "v1alpha1");
        assert_eq!(NamespaceQuota::kind(&()), "NamespaceQuota");
        assert_eq!(NamespaceQuota::plural(&()), "namespacequotas");
    }

    #[test]
    fn enabled_defaults_to_true() {
        let spec: NamespaceQuotaSpec = serde_json::from_str(
            r#"{"namespace": "tenant-a", "cpu": "4", "memory": "8Gi"}"#,
        )
        .unwrap();
        assert!(spec.enabled);
        assert_eq!(spec.cpu, "4");
        assert_eq!(spec.memory, "8Gi");
    }

    #[test]
    fn limits_default_to_empty() {
        let spec: NamespaceQuotaSpec =
            serde_json::from_str(r#"{"namespace": "tenant-a", "enabled": false}"#).unwrap();
        assert!(!spec.enabled);
        assert_eq!(spec.cpu, "");
        assert_eq!(spec.memory, "");
    }

    #[test]
    fn validate_rejects_missing_namespace() {
        let spec = NamespaceQuotaSpec {
            namespace: String::new(),
            cpu: "1".into(),
            memory: String::new(),
            enabled: true,
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn status_serializes_camel_case() {
        let status = NamespaceQuotaStatus {
            ready: true,
            message: "Cgroup configured successfully".into(),
            last_updated: Some("2026-01-01T00:00:00Z".into()),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["lastUpdated"], "2026-01-01T00:00:00Z");
        assert_eq!(json["ready"], true);
    }
}
