//! kapply core types: resource identity, apply/delete options, wait conditions,
//! and the `ResourceClient` contract every backend implements.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod condition;
pub mod duration;
pub mod error;
pub mod mock;

pub use condition::{evaluate, stringify, FieldPath, PathError};
pub use duration::{parse_duration, Timeout, UNBOUNDED_WAIT};
pub use error::{classify, ClientError, EngineError, ErrorClass};

/// Structured document (live object or desired state). Tagged tree of
/// null/bool/number/string/sequence/mapping.
pub type Document = Json;

pub mod prelude {
    pub use super::{
        ApplyOptions, ClientError, DeletePolicy, Document, EngineError, PollOutcome, ResourceClient,
        ResourceRef, Timeout, WaitCondition,
    };
}

/// Identifies one remote object by group/version/kind plus namespace and name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        let (group, version) = split_api_version(api_version);
        Self {
            group,
            version,
            kind: kind.to_string(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
        }
    }

    /// Derive the reference from a desired-state document. `ns_override` wins over
    /// `metadata.namespace` when given.
    pub fn from_document(doc: &Document, ns_override: Option<&str>) -> Result<Self, EngineError> {
        let api_version = doc
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::ValidationRejected("document missing apiVersion".into()))?;
        let kind = doc
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::ValidationRejected("document missing kind".into()))?;
        let meta = doc.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::ValidationRejected("document missing metadata.name".into()))?;
        let ns = ns_override.or_else(|| meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()));
        Ok(Self::new(api_version, kind, ns, name))
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// `v1/Kind` or `group/v1/Kind`.
    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk_key(), ns, self.name),
            None => write!(f, "{} {}", self.gvk_key(), self.name),
        }
    }
}

fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Server-side apply parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Field manager name that claims ownership of the applied fields.
    pub field_manager: String,
    /// Take over fields currently owned by another manager.
    pub force_conflicts: bool,
    /// Validate server-side without persisting.
    #[serde(default)]
    pub dry_run: bool,
}

impl ApplyOptions {
    pub fn new(field_manager: impl Into<String>) -> Self {
        Self { field_manager: field_manager.into(), force_conflicts: false, dry_run: false }
    }

    pub fn force(mut self) -> Self {
        self.force_conflicts = true;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Deletion propagation for dependents of the deleted object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    Orphan,
    #[default]
    Background,
    Foreground,
}

impl std::str::FromStr for DeletePolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "orphan" => Ok(Self::Orphan),
            "background" => Ok(Self::Background),
            "foreground" => Ok(Self::Foreground),
            other => Err(EngineError::ValidationRejected(format!(
                "unknown delete policy {other:?} (expect orphan, background or foreground)"
            ))),
        }
    }
}

/// A declarative check against live state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitCondition {
    /// Restricted JSONPath, e.g. `status.phase` or `status.conditions[0].status`.
    pub path: String,
    /// When absent the condition holds once `path` resolves to a non-empty value.
    pub expected_value: Option<String>,
    pub timeout: Timeout,
    pub poll_interval: Duration,
}

impl WaitCondition {
    pub fn new(path: impl Into<String>, timeout: Timeout, poll_interval: Duration) -> Self {
        Self { path: path.into(), expected_value: None, timeout, poll_interval }
    }

    pub fn expecting(mut self, value: impl Into<String>) -> Self {
        self.expected_value = Some(value.into());
        self
    }

    /// Parse `path` or `path=value` (the CLI `--wait` form).
    pub fn parse_spec(spec: &str, timeout: Timeout, poll_interval: Duration) -> Result<Self, EngineError> {
        let (path, expected) = match spec.split_once('=') {
            Some((p, v)) => (p.trim(), Some(v.to_string())),
            None => (spec.trim(), None),
        };
        FieldPath::parse(path).map_err(|e| EngineError::ValidationRejected(format!("wait condition {path:?}: {e}")))?;
        let mut c = Self::new(path, timeout, poll_interval);
        c.expected_value = expected;
        Ok(c)
    }
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.expected_value {
            Some(v) => write!(f, "{}={}", self.path, v),
            None => write!(f, "{}", self.path),
        }
    }
}

/// Result of a wait. `TimedOut` is an ordinary outcome, not a failure of the apply.
#[must_use]
#[derive(Debug)]
pub enum PollOutcome {
    Satisfied,
    TimedOut { unsatisfied: Vec<String> },
    Errored(EngineError),
}

impl PollOutcome {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, PollOutcome::Satisfied)
    }

    pub fn into_result(self) -> Result<(), EngineError> {
        match self {
            PollOutcome::Satisfied => Ok(()),
            PollOutcome::TimedOut { unsatisfied } => Err(EngineError::TimedOut { unsatisfied }),
            PollOutcome::Errored(e) => Err(e),
        }
    }
}

/// Capability to read, apply and delete one object on the control plane.
///
/// Implementations must be safe to share across concurrent invocations.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, reference: &ResourceRef) -> Result<Document, ClientError>;

    /// Server-side apply of a serialized (JSON) payload under `opts.field_manager`.
    async fn apply(&self, reference: &ResourceRef, payload: &[u8], opts: &ApplyOptions) -> Result<Document, ClientError>;

    async fn delete(&self, reference: &ResourceRef, policy: DeletePolicy) -> Result<(), ClientError>;
}

#[async_trait::async_trait]
impl<T: ResourceClient + ?Sized> ResourceClient for std::sync::Arc<T> {
    async fn get(&self, reference: &ResourceRef) -> Result<Document, ClientError> {
        (**self).get(reference).await
    }

    async fn apply(&self, reference: &ResourceRef, payload: &[u8], opts: &ApplyOptions) -> Result<Document, ClientError> {
        (**self).apply(reference, payload, opts).await
    }

    async fn delete(&self, reference: &ResourceRef, policy: DeletePolicy) -> Result<(), ClientError> {
        (**self).delete(reference, policy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_ref_from_document_splits_api_version() {
        let doc = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "prod" }
        });
        let r = ResourceRef::from_document(&doc, None).unwrap();
        assert_eq!(r.group, "apps");
        assert_eq!(r.version, "v1");
        assert_eq!(r.namespace.as_deref(), Some("prod"));
        assert_eq!(r.to_string(), "apps/v1/Deployment prod/web");

        let core = ResourceRef::from_document(
            &serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x"}}),
            Some("dev"),
        )
        .unwrap();
        assert_eq!(core.group, "");
        assert_eq!(core.gvk_key(), "v1/ConfigMap");
        assert_eq!(core.namespace.as_deref(), Some("dev"));
    }

    #[test]
    fn resource_ref_errors_are_friendly() {
        let e = ResourceRef::from_document(&serde_json::json!({"kind": "Foo"}), None).unwrap_err();
        assert!(e.to_string().contains("missing apiVersion"), "{}", e);
        let e = ResourceRef::from_document(&serde_json::json!({"apiVersion": "v1", "kind": "Foo"}), None).unwrap_err();
        assert!(e.to_string().contains("missing metadata.name"), "{}", e);
    }

    #[test]
    fn wait_spec_parses_path_and_value() {
        let c = WaitCondition::parse_spec("status.phase=Running", Timeout::Once, Duration::from_secs(1)).unwrap();
        assert_eq!(c.path, "status.phase");
        assert_eq!(c.expected_value.as_deref(), Some("Running"));
        let c = WaitCondition::parse_spec("status.loadBalancer.ingress[0].ip", Timeout::Once, Duration::from_secs(1)).unwrap();
        assert!(c.expected_value.is_none());
        assert!(WaitCondition::parse_spec("status.*", Timeout::Once, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn delete_policy_from_str() {
        assert_eq!("Foreground".parse::<DeletePolicy>().unwrap(), DeletePolicy::Foreground);
        assert_eq!("orphan".parse::<DeletePolicy>().unwrap(), DeletePolicy::Orphan);
        assert!("cascade".parse::<DeletePolicy>().is_err());
    }

    #[test]
    fn timed_out_outcome_maps_to_error() {
        let e = PollOutcome::TimedOut { unsatisfied: vec!["status.ready".into()] }.into_result().unwrap_err();
        assert!(matches!(e, EngineError::TimedOut { .. }));
        assert!(PollOutcome::Satisfied.into_result().is_ok());
    }
}
