//! In-memory `ResourceClient` for tests.
//!
//! Behaves like a tiny API server: applied objects are stored, field ownership
//! is tracked per manager (leaf paths, lists are atomic), and applying a field
//! owned by another manager with a different value fails with 409 unless
//! forced. Scripted responses, when queued, take precedence over that model.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde_json::{json, Map, Value as Json};

use crate::{ApplyOptions, ClientError, DeletePolicy, Document, ResourceClient, ResourceRef};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get: usize,
    pub apply: usize,
    pub delete: usize,
}

#[derive(Default)]
struct State {
    objects: HashMap<ResourceRef, Document>,
    owners: HashMap<ResourceRef, HashMap<String, String>>,
    get_script: VecDeque<Result<Document, ClientError>>,
    apply_script: VecDeque<Result<Document, ClientError>>,
    delete_script: VecDeque<Result<(), ClientError>>,
    calls: CallCounts,
    next_rv: u64,
    applied: Vec<(Vec<u8>, ApplyOptions)>,
    deleted: Vec<(ResourceRef, DeletePolicy)>,
}

#[derive(Default)]
pub struct MockClient {
    state: Mutex<State>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Seed a live object without any field ownership.
    pub fn insert(&self, reference: &ResourceRef, doc: Document) {
        self.lock().objects.insert(reference.clone(), doc);
    }

    /// Mark `path` (e.g. `spec.replicas`) as owned by `manager`.
    pub fn claim(&self, reference: &ResourceRef, path: &str, manager: &str) {
        self.lock().owners.entry(reference.clone()).or_default().insert(path.to_string(), manager.to_string());
    }

    pub fn push_get(&self, res: Result<Document, ClientError>) {
        self.lock().get_script.push_back(res);
    }

    pub fn push_gets(&self, items: impl IntoIterator<Item = Result<Document, ClientError>>) {
        self.lock().get_script.extend(items);
    }

    pub fn push_apply(&self, res: Result<Document, ClientError>) {
        self.lock().apply_script.push_back(res);
    }

    pub fn push_delete(&self, res: Result<(), ClientError>) {
        self.lock().delete_script.push_back(res);
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    pub fn object(&self, reference: &ResourceRef) -> Option<Document> {
        self.lock().objects.get(reference).cloned()
    }

    pub fn owner_of(&self, reference: &ResourceRef, path: &str) -> Option<String> {
        self.lock().owners.get(reference).and_then(|o| o.get(path)).cloned()
    }

    /// Raw payloads and options seen by `apply`, oldest first.
    pub fn applied(&self) -> Vec<(Vec<u8>, ApplyOptions)> {
        self.lock().applied.clone()
    }

    pub fn deleted(&self) -> Vec<(ResourceRef, DeletePolicy)> {
        self.lock().deleted.clone()
    }
}

fn leaves(v: &Json, prefix: &str, out: &mut Vec<(String, Json)>) {
    match v {
        Json::Object(map) if !map.is_empty() => {
            for (k, vv) in map.iter() {
                let p = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                leaves(vv, &p, out);
            }
        }
        other => out.push((prefix.to_string(), other.clone())),
    }
}

fn lookup<'a>(v: &'a Json, dotted: &str) -> Option<&'a Json> {
    dotted.split('.').try_fold(v, |cur, k| cur.get(k))
}

fn merge_into(dst: &mut Json, src: &Json) {
    match (dst, src) {
        (Json::Object(d), Json::Object(s)) => {
            for (k, sv) in s.iter() {
                match d.get_mut(k) {
                    Some(dv) if dv.is_object() && sv.is_object() => merge_into(dv, sv),
                    _ => {
                        d.insert(k.clone(), sv.clone());
                    }
                }
            }
        }
        (d, s) => *d = s.clone(),
    }
}

fn is_identity(path: &str) -> bool {
    matches!(path, "apiVersion" | "kind" | "metadata.name" | "metadata.namespace")
}

#[async_trait::async_trait]
impl ResourceClient for MockClient {
    async fn get(&self, reference: &ResourceRef) -> Result<Document, ClientError> {
        let mut st = self.lock();
        st.calls.get += 1;
        if let Some(res) = st.get_script.pop_front() {
            return res;
        }
        st.objects
            .get(reference)
            .cloned()
            .ok_or_else(|| ClientError::not_found(format!("{} not found", reference)))
    }

    async fn apply(&self, reference: &ResourceRef, payload: &[u8], opts: &ApplyOptions) -> Result<Document, ClientError> {
        let mut st = self.lock();
        st.calls.apply += 1;
        st.applied.push((payload.to_vec(), opts.clone()));
        if let Some(res) = st.apply_script.pop_front() {
            return res;
        }
        let body: Json = serde_json::from_slice(payload).map_err(|e| ClientError::Decode(e.to_string()))?;
        if !body.is_object() {
            return Err(ClientError::api(400, "BadRequest", "payload must be an object"));
        }

        let mut fields = Vec::new();
        leaves(&body, "", &mut fields);
        fields.retain(|(p, _)| !is_identity(p));

        let live = st.objects.get(reference).cloned();
        let owners = st.owners.get(reference).cloned().unwrap_or_default();
        let conflicts: Vec<String> = fields
            .iter()
            .filter_map(|(path, val)| {
                let owner = owners.get(path)?;
                let current = live.as_ref().and_then(|l| lookup(l, path));
                (owner != &opts.field_manager && current != Some(val))
                    .then(|| format!("conflict with \"{owner}\": .{path}"))
            })
            .collect();
        if !conflicts.is_empty() && !opts.force_conflicts {
            return Err(ClientError::api(409, "Conflict", format!("Apply failed with {} conflict(s): {}", conflicts.len(), conflicts.join(", "))));
        }

        let mut obj = live.clone().unwrap_or_else(|| json!({ "metadata": {} }));
        merge_into(&mut obj, &body);
        let rv_changed = live.as_ref().map(|l| {
            let mut probe = l.clone();
            merge_into(&mut probe, &body);
            &probe != l
        });
        let meta = obj
            .as_object_mut()
            .and_then(|o| o.entry("metadata").or_insert_with(|| Json::Object(Map::new())).as_object_mut())
            .ok_or_else(|| ClientError::api(400, "BadRequest", "metadata must be an object"))?;
        if live.is_none() {
            meta.insert("uid".into(), json!(format!("00000000-0000-0000-0000-{:012}", st.objects.len() + 1)));
            meta.insert("creationTimestamp".into(), json!("2024-01-01T00:00:00Z"));
            meta.insert("generation".into(), json!(1));
        }
        if live.is_none() || rv_changed == Some(true) {
            st.next_rv += 1;
        }
        let meta = obj.get_mut("metadata").and_then(|m| m.as_object_mut()).ok_or_else(|| ClientError::Decode("metadata".into()))?;
        meta.insert("resourceVersion".into(), json!(st.next_rv.to_string()));
        meta.insert("managedFields".into(), json!([{ "manager": opts.field_manager, "operation": "Apply" }]));

        if !opts.dry_run {
            let owned = st.owners.entry(reference.clone()).or_default();
            for (path, _) in fields {
                owned.insert(path, opts.field_manager.clone());
            }
            st.objects.insert(reference.clone(), obj.clone());
        }
        Ok(obj)
    }

    async fn delete(&self, reference: &ResourceRef, policy: DeletePolicy) -> Result<(), ClientError> {
        let mut st = self.lock();
        st.calls.delete += 1;
        st.deleted.push((reference.clone(), policy));
        if let Some(res) = st.delete_script.pop_front() {
            return res;
        }
        st.owners.remove(reference);
        match st.objects.remove(reference) {
            Some(_) => Ok(()),
            None => Err(ClientError::not_found(format!("{} not found", reference))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm() -> ResourceRef {
        ResourceRef::new("v1", "ConfigMap", Some("ns"), "a")
    }

    fn opts(manager: &str) -> ApplyOptions {
        ApplyOptions::new(manager)
    }

    #[tokio::test]
    async fn apply_stores_and_tracks_owner() {
        let c = MockClient::new();
        let body = br#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"a","namespace":"ns"},"data":{"k":"v"}}"#;
        let out = c.apply(&cm(), body, &opts("tf")).await.unwrap();
        assert_eq!(out["data"]["k"], "v");
        assert_eq!(out["metadata"]["resourceVersion"], "1");
        assert_eq!(c.owner_of(&cm(), "data.k").as_deref(), Some("tf"));
        assert_eq!(c.get(&cm()).await.unwrap()["data"]["k"], "v");
        assert_eq!(c.calls(), CallCounts { get: 1, apply: 1, delete: 0 });
    }

    #[tokio::test]
    async fn foreign_owned_field_conflicts_unless_forced() {
        let c = MockClient::new();
        c.insert(&cm(), json!({"metadata": {"name": "a"}, "data": {"k": "old"}}));
        c.claim(&cm(), "data.k", "kubectl");
        let body = br#"{"metadata":{"name":"a"},"data":{"k":"new"}}"#;
        let err = c.apply(&cm(), body, &opts("tf")).await.unwrap_err();
        assert!(matches!(err, ClientError::Api { code: 409, .. }));
        c.apply(&cm(), body, &opts("tf").force()).await.unwrap();
        assert_eq!(c.owner_of(&cm(), "data.k").as_deref(), Some("tf"));
    }

    #[tokio::test]
    async fn scripted_get_precedes_store() {
        let c = MockClient::new();
        c.push_get(Err(ClientError::Transport("boom".into())));
        assert!(matches!(c.get(&cm()).await, Err(ClientError::Transport(_))));
        assert!(c.get(&cm()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_missing_object_is_not_found() {
        let c = MockClient::new();
        let err = c.delete(&cm(), DeletePolicy::Foreground).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(c.deleted(), vec![(cm(), DeletePolicy::Foreground)]);
    }
}
