//! The claim-pop work loop shared by every pipeline component.
//!
//! A component implements [`Worker`]: one `do_work_claim` that pops at most
//! one record from the LTA DB, processes it, and reports what happened as
//! data. The loop here decides what to do with the outcome; errors never
//! steer control flow inside a component.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::file_catalog::CatalogError;
use crate::lta_db::{DbError, LtaDbClient};
use crate::metrics::WORK_CYCLES;

/// What a single work cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// A record was claimed and fully processed (including the quarantine
    /// path: the record was handled, even if it is now quarantined).
    Processed,
    /// The pop came back empty; time for a vacation.
    Nothing,
}

/// How a work cycle failed. Configuration errors are not here: those abort
/// start-up before the loop ever runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum WorkErrorKind {
    /// Network timeouts, 5xx responses; retried inside the clients, fatal
    /// for the cycle once retries are exhausted.
    Transient,
    /// Malformed responses, rejected transitions, unknown statuses.
    Protocol,
    /// Checksum or file-count mismatches, missing archive locations.
    DataIntegrity,
    /// Disk full, unreadable warehouse files, failed deletes.
    Resource,
}

#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct WorkError {
    pub kind: WorkErrorKind,
    pub reason: String,
}

impl WorkError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            kind: WorkErrorKind::Transient,
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self {
            kind: WorkErrorKind::Protocol,
            reason: reason.into(),
        }
    }

    pub fn data_integrity(reason: impl Into<String>) -> Self {
        Self {
            kind: WorkErrorKind::DataIntegrity,
            reason: reason.into(),
        }
    }

    pub fn resource(reason: impl Into<String>) -> Self {
        Self {
            kind: WorkErrorKind::Resource,
            reason: reason.into(),
        }
    }
}

impl From<DbError> for WorkError {
    fn from(e: DbError) -> Self {
        if e.is_transient() {
            WorkError::transient(format!("LTA DB: {e}"))
        } else {
            WorkError::protocol(format!("LTA DB: {e}"))
        }
    }
}

impl From<CatalogError> for WorkError {
    fn from(e: CatalogError) -> Self {
        if e.is_transient() {
            WorkError::transient(format!("File Catalog: {e}"))
        } else {
            WorkError::protocol(format!("File Catalog: {e}"))
        }
    }
}

/// One pipeline component. Replicas of the same component share nothing but
/// the LTA DB; correctness comes from the server-side atomic pop.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Short component name, e.g. "picker".
    fn component(&self) -> &'static str;

    /// Claimant identity, `<component>-<instance uuid>`.
    fn claimant(&self) -> &str;

    /// Claim and process at most one record. Implementations quarantine the
    /// record themselves before returning an error.
    async fn do_work_claim(&self) -> Result<WorkOutcome, WorkError>;
}

/// Claimant identity for this process.
pub fn new_claimant(component: &str) -> String {
    format!("{component}-{}", Uuid::new_v4())
}

/// Reason string recorded on quarantined records.
pub fn quarantine_reason(claimant: &str, reason: &str) -> String {
    format!("BY:{claimant} REASON:{reason}")
}

/// Loop exit policy, straight from configuration.
#[derive(Debug, Clone, Copy)]
pub struct LoopPolicy {
    /// Sleep between cycles once the queue is drained.
    pub sleep: Duration,
    /// Exit after the first cycle, claimed or not.
    pub run_once_and_die: bool,
    /// Exit on the first empty pop.
    pub run_until_no_work: bool,
}

/// Liveness snapshot reported by the heartbeat task.
#[derive(Debug, Default, Clone)]
pub struct HeartbeatState {
    pub last_work_begin: Option<DateTime<Utc>>,
    pub last_work_end: Option<DateTime<Utc>>,
    pub ok: bool,
}

pub type SharedHeartbeat = Arc<Mutex<HeartbeatState>>;

/// Execute one work cycle, instrumented and counted.
pub async fn run_once(
    worker: &dyn Worker,
    heartbeat: Option<&SharedHeartbeat>,
) -> Result<WorkOutcome, WorkError> {
    if let Some(state) = heartbeat {
        let mut state = state.lock().expect("heartbeat lock poisoned");
        state.last_work_begin = Some(Utc::now());
    }
    let span = info_span!("work_cycle", component = worker.component());
    let result = worker.do_work_claim().instrument(span).await;
    let outcome_label = match &result {
        Ok(WorkOutcome::Processed) => "processed",
        Ok(WorkOutcome::Nothing) => "nothing",
        Err(_) => "error",
    };
    WORK_CYCLES
        .with_label_values(&[worker.component(), outcome_label])
        .inc();
    if let Some(state) = heartbeat {
        let mut state = state.lock().expect("heartbeat lock poisoned");
        state.last_work_end = Some(Utc::now());
        state.ok = result.is_ok();
    }
    result
}

/// Run the component loop until cancellation or the policy says otherwise.
pub async fn run(
    worker: &dyn Worker,
    policy: LoopPolicy,
    heartbeat: Option<SharedHeartbeat>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    info!(
        "starting {} work loop as '{}'",
        worker.component(),
        worker.claimant()
    );
    loop {
        // Claim until the queue drains.
        loop {
            if cancel.is_cancelled() {
                info!("{} work loop cancelled", worker.component());
                return Ok(());
            }
            match run_once(worker, heartbeat.as_ref()).await {
                Ok(WorkOutcome::Processed) => {
                    if policy.run_once_and_die {
                        info!("{}: single cycle complete, exiting", worker.component());
                        return Ok(());
                    }
                }
                Ok(WorkOutcome::Nothing) => {
                    if policy.run_once_and_die || policy.run_until_no_work {
                        info!("{}: no work left, exiting", worker.component());
                        return Ok(());
                    }
                    break;
                }
                Err(e) => {
                    let kind: &'static str = e.kind.into();
                    error!("{} work cycle failed ({kind}): {e}", worker.component());
                    if policy.run_once_and_die {
                        return Ok(());
                    }
                    break;
                }
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(policy.sleep) => {}
            _ = cancel.cancelled() => {
                info!("{} work loop cancelled", worker.component());
                return Ok(());
            }
        }
    }
}

/// Periodically report liveness to the LTA DB status endpoint. Failures are
/// logged and flip `ok` until the next successful cycle; they never stop
/// the worker.
pub fn spawn_heartbeat(
    db: Arc<LtaDbClient>,
    component: &'static str,
    interval: Duration,
    state: SharedHeartbeat,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return,
            }
            let snapshot = state.lock().expect("heartbeat lock poisoned").clone();
            let body = json!({
                component: {
                    "timestamp": Utc::now(),
                    "last_work_begin": snapshot.last_work_begin,
                    "last_work_end": snapshot.last_work_end,
                    "ok": snapshot.ok,
                }
            });
            if let Err(e) = db.post_status(component, &body).await {
                error!("unable to report {component} status: {e}");
                state.lock().expect("heartbeat lock poisoned").ok = false;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedWorker {
        cycles: AtomicU32,
        script: Vec<Result<WorkOutcome, WorkErrorKind>>,
        claimant: String,
    }

    impl ScriptedWorker {
        fn new(script: Vec<Result<WorkOutcome, WorkErrorKind>>) -> Self {
            Self {
                cycles: AtomicU32::new(0),
                script,
                claimant: new_claimant("scripted"),
            }
        }
    }

    #[async_trait]
    impl Worker for ScriptedWorker {
        fn component(&self) -> &'static str {
            "scripted"
        }

        fn claimant(&self) -> &str {
            &self.claimant
        }

        async fn do_work_claim(&self) -> Result<WorkOutcome, WorkError> {
            let n = self.cycles.fetch_add(1, Ordering::SeqCst) as usize;
            match self.script.get(n) {
                Some(Ok(outcome)) => Ok(*outcome),
                Some(Err(kind)) => Err(WorkError {
                    kind: *kind,
                    reason: "scripted failure".into(),
                }),
                None => Ok(WorkOutcome::Nothing),
            }
        }
    }

    fn drain_policy() -> LoopPolicy {
        LoopPolicy {
            sleep: Duration::from_millis(1),
            run_once_and_die: false,
            run_until_no_work: true,
        }
    }

    #[tokio::test]
    async fn run_until_no_work_drains_the_queue() {
        let worker = ScriptedWorker::new(vec![
            Ok(WorkOutcome::Processed),
            Ok(WorkOutcome::Processed),
            Ok(WorkOutcome::Nothing),
        ]);
        let cancel = CancellationToken::new();
        run(&worker, drain_policy(), None, &cancel).await.unwrap();
        assert_eq!(worker.cycles.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_once_and_die_stops_after_one_claim() {
        let worker = ScriptedWorker::new(vec![
            Ok(WorkOutcome::Processed),
            Ok(WorkOutcome::Processed),
        ]);
        let cancel = CancellationToken::new();
        let policy = LoopPolicy {
            sleep: Duration::from_millis(1),
            run_once_and_die: true,
            run_until_no_work: false,
        };
        run(&worker, policy, None, &cancel).await.unwrap();
        assert_eq!(worker.cycles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_failed_cycle_does_not_kill_a_draining_loop() {
        let worker = ScriptedWorker::new(vec![
            Err(WorkErrorKind::Transient),
            Ok(WorkOutcome::Processed),
            Ok(WorkOutcome::Nothing),
        ]);
        let cancel = CancellationToken::new();
        run(&worker, drain_policy(), None, &cancel).await.unwrap();
        assert_eq!(worker.cycles.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let worker = ScriptedWorker::new(vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = LoopPolicy {
            sleep: Duration::from_secs(3600),
            run_once_and_die: false,
            run_until_no_work: false,
        };
        run(&worker, policy, None, &cancel).await.unwrap();
        assert_eq!(worker.cycles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn heartbeat_state_tracks_cycle_results() {
        let worker = ScriptedWorker::new(vec![Ok(WorkOutcome::Processed)]);
        let state: SharedHeartbeat = Arc::new(Mutex::new(HeartbeatState::default()));
        let outcome = run_once(&worker, Some(&state)).await.unwrap();
        assert_eq!(outcome, WorkOutcome::Processed);
        let snapshot = state.lock().unwrap().clone();
        assert!(snapshot.ok);
        assert!(snapshot.last_work_begin.is_some());
        assert!(snapshot.last_work_end.is_some());
    }

    #[test]
    fn quarantine_reason_carries_claimant_and_text() {
        let reason = quarantine_reason("picker-abc123", "File Catalog returned zero files");
        assert_eq!(
            reason,
            "BY:picker-abc123 REASON:File Catalog returned zero files"
        );
    }

    #[test]
    fn claimants_are_unique_per_instance() {
        let a = new_claimant("bundler");
        let b = new_claimant("bundler");
        assert!(a.starts_with("bundler-"));
        assert_ne!(a, b);
    }
}
