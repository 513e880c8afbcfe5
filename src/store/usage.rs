use rusqlite::{params, OptionalExtension};

use super::{Store, StoreResult, UsageRecord};

impl Store {
    pub async fn get_usage(&self, key: &str) -> StoreResult<Option<UsageRecord>> {
        let key = key.to_string();
        self.call(move |conn| {
            let record = conn
                .query_row(
                    "SELECT key, points, expire FROM usage WHERE key = ?1",
                    params![key],
                    |row| {
                        Ok(UsageRecord {
                            key: row.get(0)?,
                            points: row.get(1)?,
                            expire: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    pub async fn put_usage(&self, record: UsageRecord) -> StoreResult<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO usage (key, points, expire) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET points = excluded.points, expire = excluded.expire",
                params![record.key, record.points, record.expire],
            )?;
            Ok(())
        })
        .await
    }
}
