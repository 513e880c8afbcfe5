//! Memoized steps within a job run.
//!
//! A step's output is stored the first time it completes. When a failed run
//! is retried, the function body executes again from the top, and every step
//! that already completed returns its stored output instead of running.
//! Step ids are derived from names in call order (`terminal`, `terminal:1`,
//! ...), so the function must call its steps in a deterministic order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::store::Store;

pub struct StepContext {
    run_id: Uuid,
    attempt: u32,
    store: Store,
    counters: Mutex<HashMap<String, u32>>,
}

impl StepContext {
    pub fn new(run_id: Uuid, attempt: u32, store: Store) -> Self {
        Self {
            run_id,
            attempt,
            store,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Zero-based attempt number of the current execution.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn next_step_id(&self, name: &str) -> String {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let seen = counters.entry(name.to_string()).or_insert(0);
        let id = if *seen == 0 {
            name.to_string()
        } else {
            format!("{}:{}", name, seen)
        };
        *seen += 1;
        id
    }

    /// Run `work` as the step `name`, or replay its stored output.
    ///
    /// `work` is not polled when the step is replayed.
    pub async fn run<T, Fut>(&self, name: &str, work: Fut) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let step_id = self.next_step_id(name);

        if let Some(saved) = self.store.load_step(self.run_id, &step_id).await? {
            tracing::debug!(run_id = %self.run_id, step = %step_id, "Replaying memoized step");
            return serde_json::from_value(saved)
                .with_context(|| format!("Stored output of step {} does not match", step_id));
        }

        tracing::debug!(run_id = %self.run_id, step = %step_id, "Running step");
        let output = work
            .await
            .with_context(|| format!("Step {} failed", step_id))?;
        self.store
            .save_step(self.run_id, &step_id, serde_json::to_value(&output)?)
            .await?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JobRun, RunStatus};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn store_with_run() -> (Store, Uuid) {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let run = JobRun {
            id: Uuid::new_v4(),
            function_id: "f".to_string(),
            event_id: Uuid::new_v4(),
            event_name: "e".to_string(),
            event_data: serde_json::Value::Null,
            status: RunStatus::Running,
            attempts: 0,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_run(&run).await.unwrap();
        (store, run.id)
    }

    #[tokio::test]
    async fn test_repeated_names_are_numbered() {
        let (store, run_id) = store_with_run().await;
        let step = StepContext::new(run_id, 0, store.clone());

        for i in 0..3 {
            let out: u32 = step.run("terminal", async move { Ok(i) }).await.unwrap();
            assert_eq!(out, i);
        }

        assert_eq!(store.load_step(run_id, "terminal").await.unwrap(), Some(0.into()));
        assert_eq!(store.load_step(run_id, "terminal:2").await.unwrap(), Some(2.into()));
    }

    #[tokio::test]
    async fn test_unit_step_is_memoized() {
        let (store, run_id) = store_with_run().await;
        let executions = AtomicU32::new(0);

        for attempt in 0..2 {
            let step = StepContext::new(run_id, attempt, store.clone());
            step.run("noop", async {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.load_step(run_id, "noop").await.unwrap(),
            Some(serde_json::Value::Null)
        );
    }

    #[tokio::test]
    async fn test_completed_steps_replay_on_next_attempt() {
        let (store, run_id) = store_with_run().await;
        let executions = AtomicU32::new(0);

        let first = StepContext::new(run_id, 0, store.clone());
        let id: String = first
            .run("get-sandbox-id", async {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok("sbx-1".to_string())
            })
            .await
            .unwrap();
        let failed: anyhow::Result<String> = first
            .run("save-to-db", async { anyhow::bail!("database unavailable") })
            .await;
        assert!(failed.is_err());

        let second = StepContext::new(run_id, 1, store.clone());
        let replayed: String = second
            .run("get-sandbox-id", async {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok("sbx-2".to_string())
            })
            .await
            .unwrap();
        assert_eq!(replayed, id);
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        // The failed step was not stored and runs again.
        let saved: String = second
            .run("save-to-db", async { Ok("ok".to_string()) })
            .await
            .unwrap();
        assert_eq!(saved, "ok");
    }
}
