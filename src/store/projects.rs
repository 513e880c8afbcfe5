use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::{uuid_column, Project, Store, StoreResult};

const PROJECT_COLUMNS: &str = "id, name, user_id, created_at, updated_at";

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: uuid_column(row, 0)?,
        name: row.get(1)?,
        user_id: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

impl Store {
    pub async fn create_project(&self, user_id: &str, name: &str) -> StoreResult<Project> {
        let now = Utc::now();
        let project = Project {
            id: Uuid::new_v4(),
            name: name.to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        let row = project.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO projects (id, name, user_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.id.to_string(),
                    row.name,
                    row.user_id,
                    row.created_at,
                    row.updated_at
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(project)
    }

    /// Fetch a project owned by `user_id`.
    pub async fn get_project(&self, user_id: &str, id: Uuid) -> StoreResult<Option<Project>> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let project = conn
                .query_row(
                    &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1 AND user_id = ?2"),
                    params![id.to_string(), user_id],
                    project_from_row,
                )
                .optional()?;
            Ok(project)
        })
        .await
    }

    /// All projects of `user_id`, most recently updated first.
    pub async fn list_projects(&self, user_id: &str) -> StoreResult<Vec<Project>> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROJECT_COLUMNS} FROM projects WHERE user_id = ?1
                 ORDER BY updated_at DESC, rowid DESC"
            ))?;
            let projects = stmt
                .query_map(params![user_id], project_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(projects)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_projects_are_scoped_to_owner() {
        let store = Store::open_in_memory().unwrap();
        let mine = store.create_project("alice", "quiet-owl").await.unwrap();
        store.create_project("bob", "brave-fox").await.unwrap();

        assert!(store.get_project("bob", mine.id).await.unwrap().is_none());
        assert!(store.get_project("alice", mine.id).await.unwrap().is_some());

        let listed = store.list_projects("alice").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "quiet-owl");
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let store = Store::open_in_memory().unwrap();
        store.create_project("alice", "first").await.unwrap();
        store.create_project("alice", "second").await.unwrap();

        let names: Vec<String> = store
            .list_projects("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["second", "first"]);
    }
}
