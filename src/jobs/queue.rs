use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tracing::Instrument;
use uuid::Uuid;

use super::{Event, JobFunction, StepContext};
use crate::config::AgentSettings;
use crate::store::{JobRun, RunStatus, Store, StoreResult};

#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Runs executing at the same time.
    pub concurrency: usize,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl QueueOptions {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            concurrency: settings.worker_concurrency,
            max_retries: settings.max_retries,
            ..Self::default()
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// A registered function as reported by the webhook.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionInfo {
    pub id: String,
    pub trigger: String,
}

struct Runner {
    store: Store,
    functions: Vec<Arc<dyn JobFunction>>,
    options: QueueOptions,
    active: Mutex<HashSet<Uuid>>,
}

/// Removes a run from the active set when its worker finishes.
struct ActiveGuard<'a> {
    runner: &'a Runner,
    run_id: Uuid,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.runner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.run_id);
    }
}

impl Runner {
    fn claim(&self, run_id: Uuid) -> Option<ActiveGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.insert(run_id).then(|| ActiveGuard {
            runner: self,
            run_id,
        })
    }

    /// Run one attempt of `run_id`. Returns the backoff before the next
    /// attempt when the run failed and has retries left.
    async fn process(&self, run_id: Uuid) -> anyhow::Result<Option<Duration>> {
        let Some(_guard) = self.claim(run_id) else {
            tracing::debug!(%run_id, "Run is already being processed");
            return Ok(None);
        };

        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Run {} does not exist", run_id))?;
        if run.status.is_finished() {
            return Ok(None);
        }

        let Some(function) = self
            .functions
            .iter()
            .find(|f| f.id() == run.function_id)
            .cloned()
        else {
            let error = format!("No function registered with id {}", run.function_id);
            tracing::error!(%run_id, "{}", error);
            self.store
                .record_run_failure(run_id, &error, RunStatus::Failed)
                .await?;
            return Ok(None);
        };

        let event = Event {
            id: run.event_id,
            name: run.event_name.clone(),
            data: run.event_data.clone(),
            ts: run.created_at,
        };
        let span = tracing::info_span!("job_run", %run_id, function = %function.id());

        self.attempt(&run, function.as_ref(), &event)
            .instrument(span)
            .await
    }

    async fn attempt(
        &self,
        run: &JobRun,
        function: &dyn JobFunction,
        event: &Event,
    ) -> anyhow::Result<Option<Duration>> {
        let attempt = run.attempts;
        self.store.mark_run_running(run.id).await?;
        tracing::info!(attempt, "Starting run attempt");

        let step = StepContext::new(run.id, attempt, self.store.clone());
        match function.run(event, &step).await {
            Ok(output) => {
                self.store.complete_run(run.id, output).await?;
                tracing::info!(attempt, "Run completed");
                Ok(None)
            }
            Err(e) => {
                let error = format!("{:#}", e);
                if attempt >= self.options.max_retries {
                    self.store
                        .record_run_failure(run.id, &error, RunStatus::Failed)
                        .await?;
                    tracing::error!(attempt, error = %error, "Run failed, retries exhausted");
                    return Ok(None);
                }

                self.store
                    .record_run_failure(run.id, &error, RunStatus::Queued)
                    .await?;
                let delay = self.options.backoff(attempt);
                tracing::warn!(attempt, error = %error, ?delay, "Run attempt failed, retrying");
                Ok(Some(delay))
            }
        }
    }
}

/// Hand queued runs to workers, at most `concurrency` at a time.
///
/// A worker gives its permit back as soon as the attempt ends. A retry waits
/// out its backoff without a permit and is then sent through `retry`, which
/// does not keep the channel open once every `JobQueue` is gone.
async fn dispatch(
    runner: Arc<Runner>,
    mut rx: mpsc::UnboundedReceiver<Uuid>,
    retry: mpsc::WeakUnboundedSender<Uuid>,
) {
    let permits = Arc::new(Semaphore::new(runner.options.concurrency.max(1)));

    while let Some(run_id) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let runner = runner.clone();
        let retry = retry.clone();
        tokio::spawn(async move {
            let backoff = match runner.process(run_id).await {
                Ok(backoff) => backoff,
                Err(e) => {
                    tracing::error!(%run_id, "Job worker error: {:#}", e);
                    None
                }
            };
            drop(permit);

            if let Some(delay) = backoff {
                tokio::time::sleep(delay).await;
                let sent = retry.upgrade().map(|tx| tx.send(run_id).is_ok());
                if sent != Some(true) {
                    tracing::warn!(%run_id, "Job dispatcher has stopped; run stays queued");
                }
            }
        });
    }

    tracing::debug!("Job dispatcher stopped");
}

/// Handle for sending events to background functions.
///
/// The dispatcher task stops once every handle is dropped.
#[derive(Clone)]
pub struct JobQueue {
    runner: Arc<Runner>,
    tx: mpsc::UnboundedSender<Uuid>,
}

impl JobQueue {
    /// Spawn the dispatcher. Must be called inside a Tokio runtime.
    pub fn start(store: Store, functions: Vec<Arc<dyn JobFunction>>, options: QueueOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = Arc::new(Runner {
            store,
            functions,
            options,
            active: Mutex::new(HashSet::new()),
        });
        tokio::spawn(dispatch(runner.clone(), rx, tx.downgrade()));
        Self { runner, tx }
    }

    pub fn functions(&self) -> Vec<FunctionInfo> {
        self.runner
            .functions
            .iter()
            .map(|f| FunctionInfo {
                id: f.id().to_string(),
                trigger: f.trigger().to_string(),
            })
            .collect()
    }

    /// Persist one run per function triggered by `event` and queue them.
    pub async fn send(&self, event: Event) -> StoreResult<Vec<Uuid>> {
        let mut ids = Vec::new();
        for function in self
            .runner
            .functions
            .iter()
            .filter(|f| f.trigger() == event.name)
        {
            let now = Utc::now();
            let run = JobRun {
                id: Uuid::new_v4(),
                function_id: function.id().to_string(),
                event_id: event.id,
                event_name: event.name.clone(),
                event_data: event.data.clone(),
                status: RunStatus::Queued,
                attempts: 0,
                output: None,
                error: None,
                created_at: now,
                updated_at: now,
            };
            self.runner.store.insert_run(&run).await?;
            tracing::info!(run_id = %run.id, function = %run.function_id, event = %event.name, "Queued run");
            self.enqueue(run.id);
            ids.push(run.id);
        }

        if ids.is_empty() {
            tracing::warn!(event = %event.name, "No function is triggered by event");
        }
        Ok(ids)
    }

    /// Re-queue every run that has not finished.
    pub async fn resync(&self) -> StoreResult<usize> {
        let runs = self.runner.store.unfinished_runs().await?;
        for run in &runs {
            self.enqueue(run.id);
        }
        if !runs.is_empty() {
            tracing::info!(count = runs.len(), "Re-queued unfinished runs");
        }
        Ok(runs.len())
    }

    fn enqueue(&self, run_id: Uuid) {
        if self.tx.send(run_id).is_err() {
            tracing::warn!(%run_id, "Job dispatcher has stopped; run stays queued");
        }
    }
}
