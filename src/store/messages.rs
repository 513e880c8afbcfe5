use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::{
    parsed_column, uuid_column, Fragment, Message, NewMessage, Store, StoreError, StoreResult,
};

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_column(row, 0)?,
        project_id: uuid_column(row, 1)?,
        content: row.get(2)?,
        role: parsed_column(row, 3)?,
        message_type: parsed_column(row, 4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        fragment: None,
    })
}

/// Fragment columns start at `offset` in a joined row; `None` when the join missed.
fn fragment_from_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Option<Fragment>> {
    let id: Option<String> = row.get(offset)?;
    if id.is_none() {
        return Ok(None);
    }
    let files: serde_json::Value = row.get(offset + 4)?;
    let files: BTreeMap<String, String> = serde_json::from_value(files).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            offset + 4,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })?;
    Ok(Some(Fragment {
        id: uuid_column(row, offset)?,
        message_id: uuid_column(row, offset + 1)?,
        sandbox_url: row.get(offset + 2)?,
        title: row.get(offset + 3)?,
        files,
        created_at: row.get(offset + 5)?,
        updated_at: row.get(offset + 6)?,
    }))
}

impl Store {
    /// Insert a message (and its fragment, if any) and touch the project.
    pub async fn create_message(&self, new: NewMessage) -> StoreResult<Message> {
        self.call(move |conn| {
            let now = Utc::now();
            let tx = conn.transaction()?;

            let touched = tx.execute(
                "UPDATE projects SET updated_at = ?1 WHERE id = ?2",
                params![now, new.project_id.to_string()],
            )?;
            if touched == 0 {
                return Err(StoreError::NotFound {
                    entity: "Project",
                    id: new.project_id,
                });
            }

            let message_id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO messages (id, project_id, content, role, type, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    message_id.to_string(),
                    new.project_id.to_string(),
                    new.content,
                    new.role.as_str(),
                    new.message_type.as_str(),
                    now
                ],
            )?;

            let fragment = match new.fragment {
                Some(fragment) => {
                    let fragment_id = Uuid::new_v4();
                    tx.execute(
                        "INSERT INTO fragments (id, message_id, sandbox_url, title, files, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                        params![
                            fragment_id.to_string(),
                            message_id.to_string(),
                            fragment.sandbox_url,
                            fragment.title,
                            serde_json::to_value(&fragment.files)?,
                            now
                        ],
                    )?;
                    Some(Fragment {
                        id: fragment_id,
                        message_id,
                        sandbox_url: fragment.sandbox_url,
                        title: fragment.title,
                        files: fragment.files,
                        created_at: now,
                        updated_at: now,
                    })
                }
                None => None,
            };

            tx.commit()?;

            Ok(Message {
                id: message_id,
                project_id: new.project_id,
                content: new.content,
                role: new.role,
                message_type: new.message_type,
                created_at: now,
                updated_at: now,
                fragment,
            })
        })
        .await
    }

    /// Every message of a project with its fragment, oldest first.
    pub async fn list_messages(&self, project_id: Uuid) -> StoreResult<Vec<Message>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.project_id, m.content, m.role, m.type, m.created_at, m.updated_at,
                        f.id, f.message_id, f.sandbox_url, f.title, f.files, f.created_at, f.updated_at
                 FROM messages m
                 LEFT JOIN fragments f ON f.message_id = m.id
                 WHERE m.project_id = ?1
                 ORDER BY m.created_at ASC, m.rowid ASC",
            )?;
            let messages = stmt
                .query_map(params![project_id.to_string()], |row| {
                    let mut message = message_from_row(row)?;
                    message.fragment = fragment_from_row(row, 7)?;
                    Ok(message)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await
    }

    /// The newest `limit` messages of a project, newest first, without fragments.
    pub async fn recent_messages(&self, project_id: Uuid, limit: usize) -> StoreResult<Vec<Message>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, content, role, type, created_at, updated_at
                 FROM messages WHERE project_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2",
            )?;
            let messages = stmt
                .query_map(params![project_id.to_string(), limit as i64], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await
    }
}
