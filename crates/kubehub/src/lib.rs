//! kapply kubehub: kube-rs backed `ResourceClient` (discovery, get, SSA, delete).

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PropagationPolicy},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client, Config,
};
use tracing::{debug, info};

use kapply_core::{ApplyOptions, ClientError, DeletePolicy, Document, ResourceClient, ResourceRef};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Kubeconfig selection for [`KubeClient::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions<'a> {
    pub kubeconfig: Option<&'a Path>,
    pub context: Option<&'a str>,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
}

/// `ResourceClient` over a kube `Client`. API resources are discovered once
/// per group/version/kind and cached; the client itself is cheap to share.
pub struct KubeClient {
    client: Client,
    resources: Mutex<HashMap<String, (ApiResource, bool)>>,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Mutex::new(HashMap::new()) }
    }

    /// Build from the given kubeconfig/context, falling back to in-cluster or
    /// `$KUBECONFIG` inference when neither is set.
    pub async fn connect(opts: ConnectOptions<'_>) -> Result<Self> {
        let kc_opts = KubeConfigOptions { context: opts.context.map(|s| s.to_string()), ..Default::default() };
        let mut config = match (opts.kubeconfig, opts.context) {
            (Some(path), _) => {
                let kubeconfig = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
                Config::from_custom_kubeconfig(kubeconfig, &kc_opts).await.context("loading kubeconfig")?
            }
            (None, Some(_)) => Config::from_kubeconfig(&kc_opts).await.context("loading kubeconfig context")?,
            (None, None) => Config::infer().await.context("inferring kube config")?,
        };
        config.connect_timeout = Some(opts.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT));
        config.read_timeout = Some(opts.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT));
        let client = Client::try_from(config).context("building kube client")?;
        info!(namespace = %client.default_namespace(), "kube client ready");
        Ok(Self::new(client))
    }

    async fn resource_for(&self, r: &ResourceRef) -> Result<(ApiResource, bool), ClientError> {
        let key = r.gvk_key();
        let cached = self.lock_cache().get(&key).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }
        let gvk = GroupVersionKind { group: r.group.clone(), version: r.version.clone(), kind: r.kind.clone() };
        let found = find_api_resource(self.client.clone(), &gvk).await?;
        debug!(gvk = %key, plural = %found.0.plural, namespaced = found.1, "discovered api resource");
        self.lock_cache().insert(key, found.clone());
        Ok(found)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, (ApiResource, bool)>> {
        self.resources.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn api_for(&self, r: &ResourceRef) -> Result<Api<DynamicObject>, ClientError> {
        let (ar, namespaced) = self.resource_for(r).await?;
        Ok(if namespaced {
            let ns = r.namespace.as_deref().unwrap_or_else(|| self.client.default_namespace());
            Api::namespaced_with(self.client.clone(), ns, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), ClientError> {
    let discovery = Discovery::new(client)
        .filter(&[gvk.group.as_str()])
        .run()
        .await
        .map_err(client_error)?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(ClientError::not_found(format!("GVK not served: {}/{}/{}", gvk.group, gvk.version, gvk.kind)))
}

/// Map kube failures onto the classifier's vocabulary.
pub fn client_error(e: kube::Error) -> ClientError {
    match e {
        kube::Error::Api(ae) => ClientError::Api { code: ae.code, reason: ae.reason, message: ae.message },
        kube::Error::SerdeError(e) => ClientError::Decode(e.to_string()),
        kube::Error::InferConfig(e) => ClientError::Config(e.to_string()),
        kube::Error::Auth(e) => ClientError::Config(e.to_string()),
        other => ClientError::Transport(other.to_string()),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

fn to_document(obj: &DynamicObject) -> Result<Document, ClientError> {
    let mut raw = serde_json::to_value(obj).map_err(|e| ClientError::Decode(e.to_string()))?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

fn propagation(policy: DeletePolicy) -> PropagationPolicy {
    match policy {
        DeletePolicy::Orphan => PropagationPolicy::Orphan,
        DeletePolicy::Background => PropagationPolicy::Background,
        DeletePolicy::Foreground => PropagationPolicy::Foreground,
    }
}

fn patch_params(opts: &ApplyOptions) -> PatchParams {
    let mut pp = PatchParams::apply(&opts.field_manager);
    if opts.force_conflicts {
        pp = pp.force();
    }
    if opts.dry_run {
        pp = pp.dry_run();
    }
    pp
}

#[async_trait::async_trait]
impl ResourceClient for KubeClient {
    async fn get(&self, reference: &ResourceRef) -> Result<Document, ClientError> {
        let api = self.api_for(reference).await?;
        let obj = api.get(&reference.name).await.map_err(client_error)?;
        to_document(&obj)
    }

    async fn apply(&self, reference: &ResourceRef, payload: &[u8], opts: &ApplyOptions) -> Result<Document, ClientError> {
        let api = self.api_for(reference).await?;
        let body: serde_json::Value = serde_json::from_slice(payload).map_err(|e| ClientError::Decode(e.to_string()))?;
        let pp = patch_params(opts);
        debug!(target_ref = %reference, manager = %opts.field_manager, force = opts.force_conflicts, dry_run = opts.dry_run, "server-side apply");
        let obj = api.patch(&reference.name, &pp, &Patch::Apply(&body)).await.map_err(client_error)?;
        to_document(&obj)
    }

    async fn delete(&self, reference: &ResourceRef, policy: DeletePolicy) -> Result<(), ClientError> {
        let api = self.api_for(reference).await?;
        let dp = DeleteParams { propagation_policy: Some(propagation(policy)), ..Default::default() };
        api.delete(&reference.name, &dp).await.map_err(client_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kapply_core::{classify, ErrorClass};
    use kube::error::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: format!("{reason} happened"), reason: reason.into(), code })
    }

    #[test]
    fn api_errors_keep_status_code() {
        let e = client_error(api_err(404, "NotFound"));
        assert_eq!(e, ClientError::api(404, "NotFound", "NotFound happened"));
        assert_eq!(classify(&e), ErrorClass::NotFound);
        assert_eq!(classify(&client_error(api_err(409, "Conflict"))), ErrorClass::Conflict);
        assert_eq!(classify(&client_error(api_err(422, "Invalid"))), ErrorClass::Rejected);
        assert_eq!(classify(&client_error(api_err(500, "InternalError"))), ErrorClass::Transient);
    }

    #[test]
    fn serde_errors_are_decode_failures() {
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(client_error(kube::Error::SerdeError(bad)), ClientError::Decode(_)));
    }

    #[test]
    fn patch_params_follow_apply_options() {
        let pp = patch_params(&ApplyOptions::new("tf"));
        assert_eq!(pp.field_manager.as_deref(), Some("tf"));
        assert!(!pp.force);
        assert!(!pp.dry_run);
        let pp = patch_params(&ApplyOptions::new("tf").force().dry_run());
        assert!(pp.force);
        assert!(pp.dry_run);
    }

    #[test]
    fn delete_policy_maps_to_propagation() {
        assert!(matches!(propagation(DeletePolicy::Orphan), PropagationPolicy::Orphan));
        assert!(matches!(propagation(DeletePolicy::Background), PropagationPolicy::Background));
        assert!(matches!(propagation(DeletePolicy::Foreground), PropagationPolicy::Foreground));
    }

    #[test]
    fn managed_fields_are_stripped() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "a", "managedFields": [{ "manager": "kubectl" }] },
            "data": { "k": "v" }
        }))
        .unwrap();
        let doc = to_document(&obj).unwrap();
        assert!(doc["metadata"].get("managedFields").is_none());
        assert_eq!(doc["data"]["k"], "v");
    }
}
