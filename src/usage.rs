//! Per-caller generation credits.
//!
//! A fixed window: the first consumption opens a window of `window` length
//! with `limit` points; once the window expires the next consumption opens a
//! fresh one.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::UsageConfig;
use crate::store::{Store, StoreError, UsageRecord};

/// Points charged for one generation request.
pub const GENERATION_COST: u32 = 1;

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("You have run out of credits")]
    Exhausted { ms_before_next: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatus {
    pub remaining_points: u32,
    pub consumed_points: u32,
    pub ms_before_next: u64,
}

pub struct UsageTracker {
    store: Store,
    limit: u32,
    window: Duration,
    /// Serializes read-modify-write on the ledger.
    lock: Mutex<()>,
}

impl UsageTracker {
    pub fn new(store: Store, config: &UsageConfig) -> Self {
        Self {
            store,
            limit: config.free_credits,
            window: config.window,
            lock: Mutex::new(()),
        }
    }

    /// Charge one generation to `key`.
    pub async fn consume(&self, key: &str) -> Result<UsageStatus, UsageError> {
        self.consume_at(key, GENERATION_COST, Utc::now()).await
    }

    pub async fn status(&self, key: &str) -> Result<UsageStatus, UsageError> {
        let record = self.store.get_usage(key).await?;
        Ok(self.status_of(record.as_ref(), Utc::now()))
    }

    async fn consume_at(
        &self,
        key: &str,
        cost: u32,
        now: DateTime<Utc>,
    ) -> Result<UsageStatus, UsageError> {
        let _guard = self.lock.lock().await;

        let current = self
            .store
            .get_usage(key)
            .await?
            .filter(|r| r.expire > now)
            .unwrap_or_else(|| UsageRecord {
                key: key.to_string(),
                points: 0,
                expire: now + self.window_delta(),
            });

        if current.points.saturating_add(cost) > self.limit {
            let status = self.status_of(Some(&current), now);
            tracing::info!(key, "Credit limit reached");
            return Err(UsageError::Exhausted {
                ms_before_next: status.ms_before_next,
            });
        }

        let updated = UsageRecord {
            points: current.points + cost,
            ..current
        };
        self.store.put_usage(updated.clone()).await?;
        Ok(self.status_of(Some(&updated), now))
    }

    fn window_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::days(365))
    }

    fn status_of(&self, record: Option<&UsageRecord>, now: DateTime<Utc>) -> UsageStatus {
        match record.filter(|r| r.expire > now) {
            Some(r) => UsageStatus {
                remaining_points: self.limit.saturating_sub(r.points),
                consumed_points: r.points,
                ms_before_next: (r.expire - now).num_milliseconds().max(0) as u64,
            },
            None => UsageStatus {
                remaining_points: self.limit,
                consumed_points: 0,
                ms_before_next: 0,
            },
        }
    }
}
