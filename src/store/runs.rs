use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::{json_column, parsed_column, uuid_column, JobRun, RunStatus, Store, StoreError, StoreResult};

const RUN_COLUMNS: &str = "id, function_id, event_id, event_name, event_data, status, attempts, \
                           output, error, created_at, updated_at";

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRun> {
    Ok(JobRun {
        id: uuid_column(row, 0)?,
        function_id: row.get(1)?,
        event_id: uuid_column(row, 2)?,
        event_name: row.get(3)?,
        event_data: json_column(row, 4)?,
        status: parsed_column(row, 5)?,
        attempts: row.get(6)?,
        output: match row.get_ref(7)? {
            rusqlite::types::ValueRef::Null => None,
            _ => Some(json_column(row, 7)?),
        },
        error: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl Store {
    pub async fn insert_run(&self, run: &JobRun) -> StoreResult<()> {
        let run = run.clone();
        self.call(move |conn| {
            let output = run.output.as_ref().map(serde_json::to_string).transpose()?;
            conn.execute(
                &format!("INSERT INTO job_runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                params![
                    run.id.to_string(),
                    run.function_id,
                    run.event_id.to_string(),
                    run.event_name,
                    serde_json::to_string(&run.event_data)?,
                    run.status.as_str(),
                    run.attempts,
                    output,
                    run.error,
                    run.created_at,
                    run.updated_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_run(&self, id: Uuid) -> StoreResult<Option<JobRun>> {
        self.call(move |conn| {
            let run = conn
                .query_row(
                    &format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE id = ?1"),
                    params![id.to_string()],
                    run_from_row,
                )
                .optional()?;
            Ok(run)
        })
        .await
    }

    /// Runs that were queued or interrupted mid-flight, oldest first.
    pub async fn unfinished_runs(&self) -> StoreResult<Vec<JobRun>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM job_runs WHERE status IN ('queued', 'running')
                 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let runs = stmt
                .query_map([], run_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(runs)
        })
        .await
    }

    pub async fn mark_run_running(&self, id: Uuid) -> StoreResult<()> {
        self.update_run(id, move |conn, now| {
            conn.execute(
                "UPDATE job_runs SET status = 'running', updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), now],
            )
        })
        .await
    }

    pub async fn complete_run(&self, id: Uuid, output: serde_json::Value) -> StoreResult<()> {
        let output = serde_json::to_string(&output)?;
        self.update_run(id, move |conn, now| {
            conn.execute(
                "UPDATE job_runs SET status = 'completed', output = ?2, error = NULL, updated_at = ?3
                 WHERE id = ?1",
                params![id.to_string(), output, now],
            )
        })
        .await
    }

    /// Count a failed attempt; `status` is `Queued` when another attempt follows.
    pub async fn record_run_failure(
        &self,
        id: Uuid,
        error: &str,
        status: RunStatus,
    ) -> StoreResult<()> {
        let error = error.to_string();
        self.update_run(id, move |conn, now| {
            conn.execute(
                "UPDATE job_runs SET status = ?2, attempts = attempts + 1, error = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id.to_string(), status.as_str(), error, now],
            )
        })
        .await
    }

    async fn update_run<F>(&self, id: Uuid, f: F) -> StoreResult<()>
    where
        F: FnOnce(&rusqlite::Connection, chrono::DateTime<Utc>) -> rusqlite::Result<usize>
            + Send
            + 'static,
    {
        self.call(move |conn| {
            if f(&*conn, Utc::now())? == 0 {
                return Err(StoreError::NotFound { entity: "Run", id });
            }
            Ok(())
        })
        .await
    }

    /// Memoized output of a step, if that step already completed for the run.
    pub async fn load_step(
        &self,
        run_id: Uuid,
        step_id: &str,
    ) -> StoreResult<Option<serde_json::Value>> {
        let step_id = step_id.to_string();
        self.call(move |conn| {
            let output = conn
                .query_row(
                    "SELECT output FROM step_results WHERE run_id = ?1 AND step_id = ?2",
                    params![run_id.to_string(), step_id],
                    |row| json_column(row, 0),
                )
                .optional()?;
            Ok(output)
        })
        .await
    }

    pub async fn save_step(
        &self,
        run_id: Uuid,
        step_id: &str,
        output: serde_json::Value,
    ) -> StoreResult<()> {
        let step_id = step_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO step_results (run_id, step_id, output, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id.to_string(), step_id, output.to_string(), Utc::now()],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queued_run() -> JobRun {
        let now = Utc::now();
        JobRun {
            id: Uuid::new_v4(),
            function_id: "code-agent".to_string(),
            event_id: Uuid::new_v4(),
            event_name: "code-agent/run".to_string(),
            event_data: json!({"value": "hi"}),
            status: RunStatus::Queued,
            attempts: 0,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let run = queued_run();
        store.insert_run(&run).await.unwrap();
        assert_eq!(store.unfinished_runs().await.unwrap().len(), 1);

        store.mark_run_running(run.id).await.unwrap();
        store
            .record_run_failure(run.id, "boom", RunStatus::Queued)
            .await
            .unwrap();
        let loaded = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.attempts, 1);
        assert_eq!(loaded.error.as_deref(), Some("boom"));
        assert_eq!(loaded.status, RunStatus::Queued);

        store.complete_run(run.id, json!({"ok": true})).await.unwrap();
        let loaded = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.output, Some(json!({"ok": true})));
        assert!(loaded.error.is_none());
        assert!(store.unfinished_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_steps_are_keyed_per_run() {
        let store = Store::open_in_memory().unwrap();
        let a = queued_run();
        let b = queued_run();
        store.insert_run(&a).await.unwrap();
        store.insert_run(&b).await.unwrap();

        store.save_step(a.id, "get-sandbox-id", json!("sbx-1")).await.unwrap();
        assert_eq!(
            store.load_step(a.id, "get-sandbox-id").await.unwrap(),
            Some(json!("sbx-1"))
        );
        assert_eq!(store.load_step(b.id, "get-sandbox-id").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_null_json_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let mut run = queued_run();
        run.event_data = serde_json::Value::Null;
        store.insert_run(&run).await.unwrap();

        store.save_step(run.id, "noop", serde_json::Value::Null).await.unwrap();
        assert_eq!(
            store.load_step(run.id, "noop").await.unwrap(),
            Some(serde_json::Value::Null)
        );

        store.complete_run(run.id, serde_json::Value::Null).await.unwrap();
        let loaded = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.event_data, serde_json::Value::Null);
        assert_eq!(loaded.output, Some(serde_json::Value::Null));
    }

    #[tokio::test]
    async fn test_update_missing_run() {
        let store = Store::open_in_memory().unwrap();
        let err = store.mark_run_running(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "Run", .. }));
    }
}
