//! kapply wait scheduler: bounded polling of live state.
//!
//! Two loops share one shape (get, evaluate, sleep, repeat until satisfied or
//! the deadline passes):
//! - [`wait_for_conditions`] after create/update: every condition must hold on
//!   the same fetched snapshot; "not found" only means "not yet".
//! - [`wait_for_deletion`] after delete: "not found" is success.
//!
//! Ticks are strictly sequential and any error other than "not found" ends the
//! wait at once. There is no cancellation handle; a wait ends by itself.

#![forbid(unsafe_code)]

use std::time::Duration;

use kapply_core::condition::evaluate_path;
use kapply_core::{EngineError, FieldPath, PollOutcome, ResourceClient, ResourceRef, Timeout, WaitCondition, UNBOUNDED_WAIT};
use metrics::counter;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Floor for poll intervals so a zero interval cannot hammer the API server.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Tracked<'a> {
    cond: &'a WaitCondition,
    path: FieldPath,
    /// Result of the single check for `Timeout::Once` conditions.
    settled: Option<bool>,
}

impl Tracked<'_> {
    fn once(&self) -> bool {
        self.cond.timeout.is_once()
    }
}

/// Deadline span for a condition set: the longest non-`Once` timeout.
pub fn overall_budget(conditions: &[WaitCondition]) -> Duration {
    conditions
        .iter()
        .filter(|c| !c.timeout.is_once())
        .map(|c| c.timeout.budget())
        .max()
        .unwrap_or(Duration::ZERO)
}

/// Poll `target` until every condition holds on one snapshot, or time runs out.
pub async fn wait_for_conditions<C>(client: &C, target: &ResourceRef, conditions: &[WaitCondition]) -> PollOutcome
where
    C: ResourceClient + ?Sized,
{
    if conditions.is_empty() {
        return PollOutcome::Satisfied;
    }
    let mut tracked = Vec::with_capacity(conditions.len());
    for cond in conditions {
        match FieldPath::parse(&cond.path) {
            Ok(path) => tracked.push(Tracked { cond, path, settled: None }),
            Err(e) => {
                return PollOutcome::Errored(EngineError::ValidationRejected(format!("wait condition {:?}: {}", cond.path, e)));
            }
        }
    }

    let start = Instant::now();
    let deadline = deadline_after(start, overall_budget(conditions));
    info!(target_ref = %target, conditions = conditions.len(), budget_ms = (deadline - start).as_millis() as u64, "waiting for conditions");

    let mut tick = 0u64;
    loop {
        tick += 1;
        counter!("wait_ticks", 1u64);
        let snapshot = match client.get(target).await {
            Ok(doc) => Some(doc),
            Err(e) if e.is_not_found() => {
                debug!(target_ref = %target, tick, "not found yet");
                None
            }
            Err(e) => {
                counter!("wait_errored", 1u64);
                return PollOutcome::Errored(EngineError::from_client("get during wait", e));
            }
        };

        let mut expired = false;
        let mut pending: Vec<&WaitCondition> = Vec::new();
        for t in tracked.iter_mut() {
            let met = match t.settled {
                Some(v) => v,
                None => snapshot
                    .as_ref()
                    .is_some_and(|doc| evaluate_path(doc, &t.path, t.cond.expected_value.as_deref())),
            };
            if t.once() {
                t.settled = Some(met);
                expired |= !met;
            }
            if !met {
                pending.push(t.cond);
            }
        }

        if pending.is_empty() {
            counter!("wait_satisfied", 1u64);
            info!(target_ref = %target, tick, elapsed_ms = start.elapsed().as_millis() as u64, "conditions satisfied");
            return PollOutcome::Satisfied;
        }
        let unsatisfied = || pending.iter().map(|c| c.to_string()).collect::<Vec<_>>();
        if expired {
            // A failed check-once condition can never become true again.
            return timed_out(target, tick, unsatisfied());
        }

        let pause = pending
            .iter()
            .map(|c| c.poll_interval.max(MIN_POLL_INTERVAL))
            .min()
            .unwrap_or(MIN_POLL_INTERVAL);
        if passes_deadline(pause, deadline) {
            return timed_out(target, tick, unsatisfied());
        }
        debug!(target_ref = %target, tick, pending = ?unsatisfied(), pause_ms = pause.as_millis() as u64, "conditions pending");
        sleep(pause).await;
    }
}

/// Poll `target` until the API reports it gone, or time runs out.
pub async fn wait_for_deletion<C>(client: &C, target: &ResourceRef, timeout: Timeout, poll_interval: Duration) -> PollOutcome
where
    C: ResourceClient + ?Sized,
{
    let start = Instant::now();
    let deadline = deadline_after(start, timeout.budget());
    let pause = poll_interval.max(MIN_POLL_INTERVAL);
    info!(target_ref = %target, budget_ms = timeout.budget().as_millis() as u64, "waiting for deletion");

    let mut tick = 0u64;
    loop {
        tick += 1;
        counter!("wait_ticks", 1u64);
        match client.get(target).await {
            Err(e) if e.is_not_found() => {
                counter!("wait_satisfied", 1u64);
                info!(target_ref = %target, tick, elapsed_ms = start.elapsed().as_millis() as u64, "deletion confirmed");
                return PollOutcome::Satisfied;
            }
            Err(e) => {
                counter!("wait_errored", 1u64);
                return PollOutcome::Errored(EngineError::from_client("get during delete wait", e));
            }
            Ok(_) => {}
        }
        if timeout.is_once() || passes_deadline(pause, deadline) {
            return timed_out(target, tick, vec![format!("{} deleted", target)]);
        }
        debug!(target_ref = %target, tick, "still present");
        sleep(pause).await;
    }
}

fn deadline_after(start: Instant, budget: Duration) -> Instant {
    start
        .checked_add(budget)
        .or_else(|| start.checked_add(UNBOUNDED_WAIT))
        .unwrap_or(start)
}

/// Whether sleeping `pause` from now would end past `deadline`.
fn passes_deadline(pause: Duration, deadline: Instant) -> bool {
    Instant::now().checked_add(pause).map_or(true, |next| next > deadline)
}

fn timed_out(target: &ResourceRef, tick: u64, unsatisfied: Vec<String>) -> PollOutcome {
    counter!("wait_timed_out", 1u64);
    warn!(target_ref = %target, ticks = tick, unsatisfied = ?unsatisfied, "wait timed out");
    PollOutcome::TimedOut { unsatisfied }
}
