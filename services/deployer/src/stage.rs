//! Step reporting.
//!
//! A stage brackets each user-visible operation in a named step and reports
//! when it starts and how it ends. Step bodies return [`StepError::Skipped`]
//! when the thing they act on is already gone; the stage records that and
//! reports success to the caller.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use thiserror::Error;
use tracing::{info, warn};

/// Outcome of a step body that did not finish normally.
#[derive(Debug, Error)]
pub enum StepError {
    /// Nothing to do. Reported, but not a failure.
    #[error("{0}")]
    Skipped(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Body of a step.
pub type StepFuture<'a> = BoxFuture<'a, Result<(), StepError>>;

/// Boxes an async block as a step body.
pub fn step<'a>(body: impl Future<Output = Result<(), StepError>> + Send + 'a) -> StepFuture<'a> {
    Box::pin(body)
}

/// Reporter that runs step bodies.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Runs `step` as a step called `name`.
    ///
    /// A skipped step returns `Ok(())`. A failed step is reported before its
    /// error is returned unchanged.
    async fn perform_step(&self, name: &str, step: StepFuture<'_>) -> anyhow::Result<()>;
}

/// State a step was in when an event was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Started,
    Finished,
    Skipped,
    Failed,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded step transition.
#[derive(Debug, Clone)]
pub struct StepEvent {
    pub stage: String,
    pub step: String,
    pub index: usize,
    pub state: StepState,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// Stage that logs each step and keeps the event history in memory.
pub struct EventLoggerStage {
    name: String,
    history: Mutex<Vec<StepEvent>>,
    steps: Mutex<usize>,
}

impl EventLoggerStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            history: Mutex::new(Vec::new()),
            steps: Mutex::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every event recorded so far, oldest first.
    pub fn events(&self) -> Vec<StepEvent> {
        self.history().clone()
    }

    /// Names of the steps that have started, in order.
    pub fn step_names(&self) -> Vec<String> {
        self.history()
            .iter()
            .filter(|e| e.state == StepState::Started)
            .map(|e| e.step.clone())
            .collect()
    }

    /// Final state of the most recent step called `step`, if it has ended.
    pub fn outcome(&self, step: &str) -> Option<StepState> {
        self.history()
            .iter()
            .rev()
            .find(|e| e.step == step && e.state != StepState::Started)
            .map(|e| e.state)
    }

    fn history(&self) -> MutexGuard<'_, Vec<StepEvent>> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_index(&self) -> usize {
        let mut steps = self
            .steps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *steps += 1;
        *steps
    }

    fn record(&self, step: &str, index: usize, state: StepState, message: Option<String>) {
        self.history().push(StepEvent {
            stage: self.name.clone(),
            step: step.to_string(),
            index,
            state,
            message,
            at: Utc::now(),
        });
    }
}

#[async_trait]
impl Stage for EventLoggerStage {
    async fn perform_step(&self, name: &str, step: StepFuture<'_>) -> anyhow::Result<()> {
        let index = self.next_index();
        info!(stage = %self.name, step = %name, index, "Step started");
        self.record(name, index, StepState::Started, None);

        let started = Utc::now();
        let result = step.await;
        let elapsed_ms = (Utc::now() - started).num_milliseconds();

        match result {
            Ok(()) => {
                info!(stage = %self.name, step = %name, index, elapsed_ms, "Step finished");
                self.record(name, index, StepState::Finished, None);
                Ok(())
            }
            Err(StepError::Skipped(reason)) => {
                info!(stage = %self.name, step = %name, index, reason = %reason, "Step skipped");
                self.record(name, index, StepState::Skipped, Some(reason));
                Ok(())
            }
            Err(StepError::Failed(err)) => {
                warn!(stage = %self.name, step = %name, index, error = %format!("{err:#}"), "Step failed");
                self.record(name, index, StepState::Failed, Some(format!("{err:#}")));
                Err(err)
            }
        }
    }
}
