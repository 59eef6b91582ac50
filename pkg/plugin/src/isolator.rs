use std::sync::Arc;

use async_trait::async_trait;
use protobuf::MessageField;
use tracing::{debug, info};
use ttrpc::r#async::TtrpcContext;

use nri::api::{
    ConfigureRequest, ConfigureResponse, ContainerAdjustment, CreateContainerRequest,
    CreateContainerResponse, Empty, Event, LinuxContainerAdjustment, StateChangeEvent,
    StopContainerRequest, StopContainerResponse, SynchronizeRequest, SynchronizeResponse,
    UpdateContainerRequest, UpdateContainerResponse, UpdatePodSandboxRequest,
    UpdatePodSandboxResponse,
};
use nri::api_ttrpc::Plugin;
use nri::events_mask::EventMask;

use crate::cache::QuotaCache;

pub const DEFAULT_PLUGIN_NAME: &str = "namespace-isolator";
pub const DEFAULT_PLUGIN_IDX: &str = "10";

/// Must agree with the agent's --slice-prefix (minus the ".slice" suffix).
const SLICE_PREFIX: &str = "brasa";
/// Scope prefix containerd uses for CRI container scopes.
const RUNTIME_SCOPE_PREFIX: &str = "cri-containerd";

/// NRI plugin that reroutes containers into their namespace slice.
///
/// On every CreateContainer the pod's namespace is looked up in the quota
/// cache; on a hit the adjustment overrides the container's cgroup path so
/// the kernel accounts it under `<prefix>-<namespace>.slice`. Container
/// creation is never failed from here: a miss for a quota we have not seen
/// yet just means this container keeps the default placement.
pub struct IsolatorPlugin {
    cache: Arc<QuotaCache>,
}

impl IsolatorPlugin {
    pub fn new(cache: Arc<QuotaCache>) -> Self {
        Self { cache }
    }

    /// systemd cgroup path in "slice:prefix:name" form.
    fn cgroup_path_for(namespace: &str, container_id: &str) -> String {
        format!("{SLICE_PREFIX}-{namespace}.slice:{RUNTIME_SCOPE_PREFIX}:{container_id}")
    }
}

#[async_trait]
impl Plugin for IsolatorPlugin {
    async fn configure(
        &self,
        _ctx: &TtrpcContext,
        req: ConfigureRequest,
    ) -> ttrpc::Result<ConfigureResponse> {
        info!(
            "Plugin configured for runtime {} {}",
            req.runtime_name, req.runtime_version
        );

        let mut events = EventMask::new();
        events.set(&[Event::RUN_POD_SANDBOX, Event::CREATE_CONTAINER]);

        Ok(ConfigureResponse {
            events: events.raw_value(),
            special_fields: protobuf::SpecialFields::default(),
        })
    }

    async fn synchronize(
        &self,
        _ctx: &TtrpcContext,
        req: SynchronizeRequest,
    ) -> ttrpc::Result<SynchronizeResponse> {
        // Already-running containers keep their current placement; routing
        // applies only to containers created from here on.
        info!(
            "Synchronized with runtime: {} pods, {} containers",
            req.pods.len(),
            req.containers.len()
        );

        Ok(SynchronizeResponse {
            update: vec![],
            more: req.more,
            special_fields: protobuf::SpecialFields::default(),
        })
    }

    async fn create_container(
        &self,
        _ctx: &TtrpcContext,
        req: CreateContainerRequest,
    ) -> ttrpc::Result<CreateContainerResponse> {
        let namespace = req.pod.namespace.clone();

        if !self.cache.has_quota(&namespace) {
            return Ok(CreateContainerResponse::default());
        }

        let cgroup_path = Self::cgroup_path_for(&namespace, &req.container.id);
        info!(
            "Routing container {} (pod {}/{}) to {}",
            req.container.name, namespace, req.pod.name, cgroup_path
        );

        let mut linux = LinuxContainerAdjustment::new();
        linux.cgroups_path = cgroup_path;
        let mut adjust = ContainerAdjustment::new();
        adjust.linux = MessageField::some(linux);

        let mut resp = CreateContainerResponse::new();
        resp.adjust = MessageField::some(adjust);
        Ok(resp)
    }

    async fn update_container(
        &self,
        _ctx: &TtrpcContext,
        req: UpdateContainerRequest,
    ) -> ttrpc::Result<UpdateContainerResponse> {
        debug!("update_container: {}", req.container.id);
        Ok(UpdateContainerResponse::default())
    }

    async fn stop_container(
        &self,
        _ctx: &TtrpcContext,
        req: StopContainerRequest,
    ) -> ttrpc::Result<StopContainerResponse> {
        debug!("stop_container: {}", req.container.id);
        Ok(StopContainerResponse::default())
    }

    async fn update_pod_sandbox(
        &self,
        _ctx: &TtrpcContext,
        req: UpdatePodSandboxRequest,
    ) -> ttrpc::Result<UpdatePodSandboxResponse> {
        debug!("update_pod_sandbox: {}", req.pod.uid);
        Ok(UpdatePodSandboxResponse::default())
    }

    async fn state_change(
        &self,
        _ctx: &TtrpcContext,
        req: StateChangeEvent,
    ) -> ttrpc::Result<Empty> {
        if req.event.enum_value() == Ok(Event::RUN_POD_SANDBOX) {
            debug!("Pod sandbox created: {}/{}", req.pod.namespace, req.pod.name);
        } else {
            debug!("State change: {:?}", req.event);
        }
        Ok(Empty::default())
    }

    async fn shutdown(&self, _ctx: &TtrpcContext, _req: Empty) -> ttrpc::Result<Empty> {
        info!("Plugin shutdown requested");
        Ok(Empty::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nri::api::{Container, PodSandbox};
    use pkg_types::{NamespaceQuota, NamespaceQuotaSpec};
    use protobuf::SpecialFields;

    fn test_ctx() -> TtrpcContext {
        TtrpcContext {
            mh: ttrpc::MessageHeader::default(),
            metadata: std::collections::HashMap::<String, Vec<String>>::default(),
            timeout_nano: 5_000,
        }
    }

    fn cache_with(namespace: &str) -> Arc<QuotaCache> {
        let cache = QuotaCache::new();
        cache.apply(&NamespaceQuota::new(
            "q1",
            NamespaceQuotaSpec {
                namespace: namespace.to_string(),
                cpu: "4".to_string(),
                memory: "8Gi".to_string(),
                enabled: true,
            },
        ));
        cache
    }

    fn create_request(namespace: &str, container_id: &str) -> CreateContainerRequest {
        let mut pod = PodSandbox::new();
        pod.namespace = namespace.to_string();
        pod.name = "web".to_string();

        let mut container = Container::new();
        container.id = container_id.to_string();
        container.name = "app".to_string();

        let mut req = CreateContainerRequest::new();
        req.pod = MessageField::some(pod);
        req.container = MessageField::some(container);
        req
    }

    #[tokio::test]
    async fn configure_subscribes_to_pod_and_container_events() {
        let plugin = IsolatorPlugin::new(QuotaCache::new());

        let req = ConfigureRequest {
            config: String::new(),
            runtime_name: "containerd".into(),
            runtime_version: "2.0".into(),
            registration_timeout: 1000,
            request_timeout: 1000,
            special_fields: SpecialFields::default(),
        };
        let resp = plugin.configure(&test_ctx(), req).await.unwrap();

        let events = EventMask::from_raw(resp.events);
        assert!(events.is_set(Event::RUN_POD_SANDBOX));
        assert!(events.is_set(Event::CREATE_CONTAINER));
    }

    #[tokio::test]
    async fn routes_container_in_quota_namespace() {
        let plugin = IsolatorPlugin::new(cache_with("tenant-a"));

        let resp = plugin
            .create_container(&test_ctx(), create_request("tenant-a", "abc"))
            .await
            .unwrap();

        assert_eq!(
            resp.adjust.linux.cgroups_path,
            "brasa-tenant-a.slice:cri-containerd:abc"
        );
        assert!(resp.update.is_empty());
    }

    #[tokio::test]
    async fn no_adjustment_without_quota() {
        let plugin = IsolatorPlugin::new(cache_with("tenant-a"));

        let resp = plugin
            .create_container(&test_ctx(), create_request("tenant-z", "abc"))
            .await
            .unwrap();

        assert!(resp.adjust.is_none());
    }

    #[tokio::test]
    async fn synchronize_returns_no_updates() {
        let plugin = IsolatorPlugin::new(QuotaCache::new());

        let mut req = SynchronizeRequest::new();
        req.more = false;
        let resp = plugin.synchronize(&test_ctx(), req).await.unwrap();

        assert!(resp.update.is_empty());
        assert!(!resp.more);
    }
}
