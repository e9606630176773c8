//! kapply apply engine: server-side apply with a named field manager, merged
//! state reconciliation, YAML desired-state parsing and diff summaries.

#![forbid(unsafe_code)]

use kapply_core::{ApplyOptions, Document, EngineError, ResourceClient, ResourceRef};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{info, warn};

/// Top-level subtrees of the server response that replace the caller's view.
const OVERLAY_KEYS: [&str; 3] = ["metadata", "spec", "status"];

fn max_payload_bytes() -> usize {
    std::env::var("KAPPLY_MAX_PAYLOAD_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_nodes() -> usize {
    std::env::var("KAPPLY_MAX_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

/// Whether `doc` has at least `max` nodes. Counting stops at the budget.
fn exceeds_node_budget(doc: &Json, max: usize) -> bool {
    let mut pending = vec![doc];
    let mut seen = 0usize;
    while let Some(node) = pending.pop() {
        seen += 1;
        if seen >= max {
            return true;
        }
        match node {
            Json::Object(fields) => pending.extend(fields.values()),
            Json::Array(items) => pending.extend(items.iter()),
            _ => {}
        }
    }
    false
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Outcome of a successful apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Applied {
    /// Caller's desired state with the server's metadata/spec/status overlaid.
    pub merged: Document,
    pub resource_version: Option<String>,
    pub dry_run: bool,
}

/// Parse one or more `---` separated YAML documents. Empty documents are skipped.
pub fn parse_documents(yaml: &str) -> Result<Vec<Document>, EngineError> {
    if yaml.len() > max_payload_bytes() {
        return Err(EngineError::ValidationRejected(format!("YAML payload too large (>{} bytes)", max_payload_bytes())));
    }
    let mut out = Vec::new();
    for (i, de) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(de)
            .map_err(|e| EngineError::ValidationRejected(format!("parsing YAML document {}: {}", i + 1, e)))?;
        if val.is_null() { continue; }
        let json = serde_json::to_value(val)
            .map_err(|e| EngineError::ValidationRejected(format!("converting YAML document {} to JSON: {}", i + 1, e)))?;
        out.push(json);
    }
    Ok(out)
}

/// Check that `desired` is a well-formed object for `target` and return the
/// payload to send: a copy with `metadata.name`/`namespace` filled from `target`.
pub fn prepare_payload(target: &ResourceRef, desired: &Document) -> Result<Document, EngineError> {
    let reject = |m: String| EngineError::ValidationRejected(format!("{}: {}", target, m));
    let obj = desired.as_object().ok_or_else(|| reject("desired state must be a mapping".into()))?;
    let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| reject("missing apiVersion".into()))?;
    let kind = obj.get("kind").and_then(|v| v.as_str()).ok_or_else(|| reject("missing kind".into()))?;
    if api_version != target.api_version() || kind != target.kind {
        return Err(reject(format!("document is {}/{}", api_version, kind)));
    }
    if let Some(meta) = obj.get("metadata") {
        if !meta.is_object() { return Err(reject("metadata must be a mapping".into())); }
        if let Some(name) = meta.get("name").and_then(|v| v.as_str()) {
            if name != target.name { return Err(reject(format!("metadata.name is {:?}", name))); }
        }
        if let (Some(ns), Some(want)) = (meta.get("namespace").and_then(|v| v.as_str()), target.namespace.as_deref()) {
            if ns != want { return Err(reject(format!("metadata.namespace is {:?}", ns))); }
        }
    }
    if exceeds_node_budget(desired, max_nodes()) {
        return Err(reject(format!("document too complex (>{} nodes)", max_nodes())));
    }
    let mut payload = desired.clone();
    ensure_metadata(&mut payload, &target.name, target.namespace.as_deref());
    Ok(payload)
}

fn ensure_metadata(v: &mut Json, name: &str, ns: Option<&str>) {
    let Some(root) = v.as_object_mut() else { return };
    let meta = root.entry("metadata").or_insert(Json::Object(serde_json::Map::new()));
    if let Some(obj) = meta.as_object_mut() {
        obj.entry("name").or_insert_with(|| Json::String(name.to_string()));
        if let Some(ns) = ns { obj.entry("namespace").or_insert_with(|| Json::String(ns.to_string())); }
    }
}

/// Overlay the authoritative response onto a copy of the desired state.
pub fn merge_response(desired: &Document, response: &Document) -> Document {
    let mut merged = desired.clone();
    if let (Some(dst), Some(src)) = (merged.as_object_mut(), response.as_object()) {
        for key in OVERLAY_KEYS {
            if let Some(v) = src.get(key) {
                dst.insert(key.to_string(), v.clone());
            }
        }
        if let Some(meta) = dst.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("managedFields");
        }
    }
    merged
}

/// Server-side apply `desired` to `target`. One client call, no retries; the
/// caller's document is never modified.
pub async fn apply<C>(client: &C, target: &ResourceRef, desired: &Document, opts: &ApplyOptions) -> Result<Applied, EngineError>
where
    C: ResourceClient + ?Sized,
{
    let t0 = std::time::Instant::now();
    counter!("apply_attempts", 1u64);
    let payload = prepare_payload(target, desired)?;
    let bytes = serde_json::to_vec(&payload).map_err(|e| EngineError::Fatal(format!("serializing desired state: {}", e)))?;
    if bytes.len() > max_payload_bytes() {
        return Err(EngineError::ValidationRejected(format!("{}: payload too large (>{} bytes)", target, max_payload_bytes())));
    }

    let response = match client.apply(target, &bytes, opts).await {
        Ok(doc) => doc,
        Err(e) => {
            let err = EngineError::from_client("server-side apply", e);
            match &err {
                EngineError::Conflict(msg) => {
                    counter!("apply_conflict", 1u64);
                    warn!(target_ref = %target, manager = %opts.field_manager, error = %msg, "apply conflict; re-run with force_conflicts to take ownership");
                }
                other => {
                    counter!("apply_err", 1u64);
                    warn!(target_ref = %target, error = %other, "apply failed");
                }
            }
            return Err(err);
        }
    };
    if !response.is_object() {
        counter!("apply_err", 1u64);
        return Err(EngineError::Fatal(format!("{}: apply response is not an object", target)));
    }

    let merged = merge_response(desired, &response);
    let resource_version = merged.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()).map(|s| s.to_string());
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    if opts.dry_run { counter!("apply_dry_ok", 1u64); } else { counter!("apply_ok", 1u64); }
    info!(target_ref = %target, manager = %opts.field_manager, force = opts.force_conflicts, dry_run = opts.dry_run, rv = ?resource_version, "applied");
    Ok(Applied { merged, resource_version, dry_run: opts.dry_run })
}

/// Summarize how `desired` differs from the live object (absent objects diff
/// against nothing).
pub async fn diff<C>(client: &C, target: &ResourceRef, desired: &Document) -> Result<DiffSummary, EngineError>
where
    C: ResourceClient + ?Sized,
{
    let payload = prepare_payload(target, desired)?;
    let live = match client.get(target).await {
        Ok(doc) => strip_noisy(doc),
        Err(e) if e.is_not_found() => Json::Null,
        Err(e) => return Err(EngineError::from_client("get live object", e)),
    };
    Ok(diff_summary(&strip_noisy(payload), &live))
}

/// Server bookkeeping under `metadata` that never counts as drift.
const SERVER_OWNED_METADATA: [&str; 5] = ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid"];

fn strip_noisy(mut doc: Json) -> Json {
    if let Some(root) = doc.as_object_mut() {
        root.remove("status");
        if let Some(meta) = root.get_mut("metadata").and_then(Json::as_object_mut) {
            for key in SERVER_OWNED_METADATA {
                meta.remove(key);
            }
        }
    }
    doc
}

/// Count keys/elements `target` adds, changes or drops relative to `base`.
/// Keys present only in `base` (server defaults) count as removes.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            // Whole document is new
            (Json::Object(ao), Json::Null) => s.adds += ao.len(),
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}
