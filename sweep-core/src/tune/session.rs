use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::history::{SqliteSweepStore, SweepRunRecord};
use crate::sweep::{CancelToken, PipelineEvaluator};

use super::engine::{AutoTuner, TuneOutcome};
use super::error::{TuneError, TuneResult};
use super::request::{AutoTuneRequest, TuneLimits};
use super::status::{SessionMode, StatusReporter, StatusSnapshot};

struct ActiveSession {
    id: Uuid,
    reporter: StatusReporter,
    cancel: CancelToken,
    task: JoinHandle<()>,
    outcome: watch::Receiver<Option<TuneOutcome>>,
}

impl ActiveSession {
    fn is_running(&self) -> bool {
        !self.task.is_finished() && self.reporter.phase().termination().is_none()
    }
}

/// Owns the tuning sessions of every registered target.
///
/// At most one session runs per target. A start request while one is
/// running is rejected with [`TuneError::AlreadyRunning`]; the finished
/// session stays readable until the next one replaces it.
pub struct TuningService {
    evaluators: RwLock<HashMap<String, Arc<dyn PipelineEvaluator>>>,
    sessions: Mutex<HashMap<String, ActiveSession>>,
    limits: TuneLimits,
    history: Option<SqliteSweepStore>,
}

impl TuningService {
    pub fn new(limits: TuneLimits) -> Self {
        Self {
            evaluators: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            limits,
            history: None,
        }
    }

    /// Records every finished session in `store`.
    pub fn with_history(mut self, store: SqliteSweepStore) -> Self {
        self.history = Some(store);
        self
    }

    pub fn limits(&self) -> &TuneLimits {
        &self.limits
    }

    pub fn register(&self, target: impl Into<String>, evaluator: Arc<dyn PipelineEvaluator>) {
        let target = target.into();
        debug!(target: "tune.session", device = %target, "evaluator registered");
        self.evaluators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target, evaluator);
    }

    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self
            .evaluators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        targets.sort();
        targets
    }

    fn evaluator(&self, target: &str) -> TuneResult<Arc<dyn PipelineEvaluator>> {
        self.evaluators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .cloned()
            .ok_or_else(|| TuneError::UnknownTarget(target.to_string()))
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, ActiveSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a multi-round auto-tune session on a background task.
    pub fn start_auto(&self, target: &str, request: AutoTuneRequest) -> TuneResult<Uuid> {
        self.start(target, request, SessionMode::Auto)
    }

    /// Starts a single sweep over the request's space; no narrowing.
    pub fn start_sweep(&self, target: &str, mut request: AutoTuneRequest) -> TuneResult<Uuid> {
        request.max_rounds = 1;
        self.start(target, request, SessionMode::Sweep)
    }

    fn start(&self, target: &str, request: AutoTuneRequest, mode: SessionMode) -> TuneResult<Uuid> {
        request.validate(&self.limits)?;
        let evaluator = self.evaluator(target)?;

        let mut sessions = self.sessions();
        if let Some(existing) = sessions.get(target) {
            if existing.is_running() {
                return Err(TuneError::AlreadyRunning {
                    target: target.to_string(),
                    session_id: existing.id,
                });
            }
        }

        let session_id = Uuid::new_v4();
        let reporter = StatusReporter::new();
        reporter.begin_session(session_id, mode, request.max_rounds);
        let cancel = CancelToken::new();
        let tuner = AutoTuner::new(evaluator, request.clone())
            .with_limits(self.limits)
            .with_session(session_id, mode)
            .with_reporter(reporter.clone())
            .with_cancel(cancel.clone());

        let (sender, outcome) = watch::channel(None);
        let history = self.history.clone();
        let device = target.to_string();
        let task = tokio::spawn(async move {
            let outcome = tuner.run().await;
            if let Some(store) = history {
                record_history(store, &device, &request, &outcome).await;
            }
            sender.send_replace(Some(outcome));
        });

        info!(
            target: "tune.session",
            device = %target,
            session = %session_id,
            mode = mode.as_str(),
            "tuning session accepted"
        );
        sessions.insert(
            target.to_string(),
            ActiveSession {
                id: session_id,
                reporter,
                cancel,
                task,
                outcome,
            },
        );
        Ok(session_id)
    }

    /// Current status of `target`; idle when no session has run yet.
    pub fn status(&self, target: &str) -> TuneResult<StatusSnapshot> {
        self.evaluator(target)?;
        Ok(self
            .sessions()
            .get(target)
            .map(|session| session.reporter.snapshot())
            .unwrap_or_default())
    }

    /// Requests cancellation; returns whether a running session was found.
    pub fn cancel(&self, target: &str) -> TuneResult<bool> {
        self.evaluator(target)?;
        let sessions = self.sessions();
        match sessions.get(target) {
            Some(session) if session.is_running() => {
                info!(
                    target: "tune.session",
                    device = %target,
                    session = %session.id,
                    "cancellation requested"
                );
                session.cancel.cancel();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Waits for the latest session of `target` to finish.
    pub async fn wait(&self, target: &str) -> TuneResult<Option<TuneOutcome>> {
        self.evaluator(target)?;
        let mut receiver = {
            let sessions = self.sessions();
            match sessions.get(target) {
                Some(session) => session.outcome.clone(),
                None => return Ok(None),
            }
        };
        let outcome = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TuneError::TaskFailed {
                target: target.to_string(),
                reason: "session task ended without an outcome".to_string(),
            })?;
        Ok(outcome.clone())
    }
}

async fn record_history(
    store: SqliteSweepStore,
    target: &str,
    request: &AutoTuneRequest,
    outcome: &TuneOutcome,
) {
    let record = SweepRunRecord::from_outcome(target, request, outcome);
    let session = outcome.session_id;
    match tokio::task::spawn_blocking(move || store.record_run(&record)).await {
        Ok(Ok(())) => debug!(target: "tune.session", session = %session, "run history recorded"),
        Ok(Err(err)) => warn!(
            target: "tune.session",
            session = %session,
            error = %err,
            "failed to record run history"
        ),
        Err(err) => warn!(
            target: "tune.session",
            session = %session,
            error = %err,
            "run history task aborted"
        ),
    }
}
