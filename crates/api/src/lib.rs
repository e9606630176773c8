//! kapply public API façade (in-process).
//!
//! Frontends (the CLI, embedding providers) depend on [`Engine`] and
//! [`EngineConfig`] only; the apply and wait crates stay implementation detail.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use kapply_apply::{parse_documents, Applied, DiffSummary};
pub use kapply_core::{
    parse_duration, ApplyOptions, ClientError, DeletePolicy, Document, EngineError, PollOutcome, ResourceClient, ResourceRef, Timeout,
    WaitCondition,
};

pub const DEFAULT_FIELD_MANAGER: &str = "kapply";
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub type EngineResult<T> = Result<T, EngineError>;

/// Defaults applied when a caller does not say otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    pub field_manager: String,
    pub force_conflicts: bool,
    pub wait_timeout: Timeout,
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            force_conflicts: false,
            wait_timeout: Timeout::After(DEFAULT_WAIT_TIMEOUT),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Read `KAPPLY_FIELD_MANAGER`, `KAPPLY_FORCE_CONFLICTS`,
    /// `KAPPLY_WAIT_TIMEOUT` and `KAPPLY_POLL_INTERVAL`; unset or malformed
    /// values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(m) = get("KAPPLY_FIELD_MANAGER").filter(|s| !s.trim().is_empty()) {
            cfg.field_manager = m.trim().to_string();
        }
        if let Some(v) = get("KAPPLY_FORCE_CONFLICTS") {
            match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => cfg.force_conflicts = true,
                "0" | "false" | "no" | "off" | "" => cfg.force_conflicts = false,
                other => warn!(value = %other, "ignoring KAPPLY_FORCE_CONFLICTS"),
            }
        }
        if let Some(v) = get("KAPPLY_WAIT_TIMEOUT") {
            match Timeout::parse(&v) {
                Ok(t) => cfg.wait_timeout = t,
                Err(e) => warn!(value = %v, error = %e, "ignoring KAPPLY_WAIT_TIMEOUT"),
            }
        }
        if let Some(v) = get("KAPPLY_POLL_INTERVAL") {
            match parse_duration(&v) {
                Ok(d) => cfg.poll_interval = d,
                Err(e) => warn!(value = %v, error = %e, "ignoring KAPPLY_POLL_INTERVAL"),
            }
        }
        cfg
    }

    pub fn apply_options(&self) -> ApplyOptions {
        let opts = ApplyOptions::new(self.field_manager.clone());
        if self.force_conflicts { opts.force() } else { opts }
    }

    /// Copy with the wait timeout and poll interval replaced where given.
    pub fn with_timing(&self, timeout: Option<Timeout>, poll_interval: Option<Duration>) -> Self {
        Self {
            wait_timeout: timeout.unwrap_or(self.wait_timeout),
            poll_interval: poll_interval.unwrap_or(self.poll_interval),
            ..self.clone()
        }
    }

    /// Build a condition from `path` or `path=value` using the configured
    /// timeout and poll interval.
    pub fn condition(&self, spec: &str) -> EngineResult<WaitCondition> {
        WaitCondition::parse_spec(spec, self.wait_timeout, self.poll_interval)
    }
}

/// Apply-and-wait engine over one resource client. Stateless apart from its
/// configuration; every call runs to completion on the caller's task.
pub struct Engine<C> {
    client: C,
    config: EngineConfig,
}

impl<C: ResourceClient> Engine<C> {
    pub fn new(client: C, config: EngineConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn apply(&self, target: &ResourceRef, desired: &Document, opts: &ApplyOptions) -> EngineResult<Applied> {
        let t0 = Instant::now();
        info!(target_ref = %target, manager = %opts.field_manager, "api: apply start");
        let res = kapply_apply::apply(&self.client, target, desired, opts).await;
        info!(took_ms = %t0.elapsed().as_millis(), ok = res.is_ok(), "api: apply done");
        res
    }

    pub async fn wait_for_conditions(&self, target: &ResourceRef, conditions: &[WaitCondition]) -> PollOutcome {
        kapply_wait::wait_for_conditions(&self.client, target, conditions).await
    }

    pub async fn wait_for_deletion(&self, target: &ResourceRef, timeout: Timeout, poll_interval: Duration) -> PollOutcome {
        kapply_wait::wait_for_deletion(&self.client, target, timeout, poll_interval).await
    }

    /// Apply, then block until `conditions` hold. Dry runs skip the wait since
    /// nothing was persisted to converge.
    pub async fn apply_and_wait(
        &self,
        target: &ResourceRef,
        desired: &Document,
        opts: &ApplyOptions,
        conditions: &[WaitCondition],
    ) -> EngineResult<Applied> {
        let applied = self.apply(target, desired, opts).await?;
        if applied.dry_run {
            debug!(target_ref = %target, "dry run; skipping wait");
            return Ok(applied);
        }
        self.wait_for_conditions(target, conditions).await.into_result()?;
        Ok(applied)
    }

    /// Request deletion. Returns `false` when the object was already gone.
    pub async fn delete(&self, target: &ResourceRef, policy: DeletePolicy) -> EngineResult<bool> {
        info!(target_ref = %target, policy = ?policy, "api: delete start");
        match self.client.delete(target, policy).await {
            Ok(()) => {
                counter!("delete_ok", 1u64);
                info!(target_ref = %target, "delete requested");
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                info!(target_ref = %target, "already absent");
                Ok(false)
            }
            Err(e) => {
                counter!("delete_err", 1u64);
                Err(EngineError::from_client("delete", e))
            }
        }
    }

    /// Delete and block until the API no longer returns the object.
    pub async fn delete_and_wait(
        &self,
        target: &ResourceRef,
        policy: DeletePolicy,
        timeout: Timeout,
        poll_interval: Duration,
    ) -> EngineResult<()> {
        if !self.delete(target, policy).await? {
            return Ok(());
        }
        self.wait_for_deletion(target, timeout, poll_interval).await.into_result()
    }

    pub async fn diff(&self, target: &ResourceRef, desired: &Document) -> EngineResult<DiffSummary> {
        let t0 = Instant::now();
        let res = kapply_apply::diff(&self.client, target, desired).await;
        info!(target_ref = %target, took_ms = %t0.elapsed().as_millis(), ok = res.is_ok(), "api: diff done");
        res
    }
}
