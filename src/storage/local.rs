//! Local embedded storage backed by SQLite.
//!
//! Single implicit owner, no permission layer, no change feed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{StorageAdapter, SubscriptionHandle, TaskFilter};
use crate::config::StorageMode;
use crate::error::{Error, Result};
use crate::model::{
    ActivityAction, ActivityRecord, NewProject, NewTask, Project, ProjectPatch, ProjectShare, Tag,
    TagScope, Task, TaskPatch, TaskTagLink,
};

/// Owner id of every row in a local database.
pub const LOCAL_OWNER: &str = "local";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  title TEXT NOT NULL,
  description TEXT,
  completed INTEGER NOT NULL DEFAULT 0,
  completed_at TEXT,
  date TEXT,
  project_id TEXT,
  attachments_json TEXT NOT NULL DEFAULT '[]',
  sort_order REAL NOT NULL DEFAULT 0,
  flagged INTEGER NOT NULL DEFAULT 0,
  deleted INTEGER NOT NULL DEFAULT 0,
  deleted_at TEXT,
  abandoned INTEGER NOT NULL DEFAULT 0,
  abandoned_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS tasks_project_idx ON tasks(project_id);
CREATE INDEX IF NOT EXISTS tasks_state_idx ON tasks(deleted, abandoned);
CREATE TABLE IF NOT EXISTS projects (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  name TEXT NOT NULL,
  icon TEXT NOT NULL DEFAULT '',
  color TEXT NOT NULL DEFAULT '',
  sort_order INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tags (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  name TEXT NOT NULL,
  project_id TEXT,
  created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS task_tags (
  task_id TEXT NOT NULL,
  tag_id TEXT NOT NULL,
  PRIMARY KEY (task_id, tag_id)
);
CREATE TABLE IF NOT EXISTS task_activities (
  id TEXT PRIMARY KEY,
  task_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  action TEXT NOT NULL,
  metadata_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS task_activities_task_idx ON task_activities(task_id, created_at);
"#;

const TASK_COLUMNS: &str = "id, user_id, title, description, completed, completed_at, date, \
     project_id, attachments_json, sort_order, flagged, deleted, deleted_at, abandoned, \
     abandoned_at, created_at, updated_at";

const TAG_COLUMNS: &str = "id, user_id, name, project_id, created_at";

const PROJECT_COLUMNS: &str = "id, user_id, name, icon, color, sort_order, created_at, updated_at";

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn ts_opt(value: &Option<DateTime<Utc>>) -> Option<String> {
    value.as_ref().map(ts)
}

fn date_opt(value: &Option<NaiveDate>) -> Option<String> {
    value.map(|date| date.format("%Y-%m-%d").to_string())
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| conversion_error(idx, err))
}

fn parse_ts_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|value| value.with_timezone(&Utc))
            .map_err(|err| conversion_error(idx, err))
    })
    .transpose()
}

fn parse_date_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|err| conversion_error(idx, err)))
        .transpose()
}

fn map_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let attachments_json: String = row.get(8)?;
    Ok(Task {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        completed: row.get(4)?,
        completed_at: parse_ts_opt(row, 5)?,
        date: parse_date_opt(row, 6)?,
        project_id: row.get(7)?,
        attachments: serde_json::from_str(&attachments_json).map_err(|err| conversion_error(8, err))?,
        sort_order: row.get(9)?,
        flagged: row.get(10)?,
        deleted: row.get(11)?,
        deleted_at: parse_ts_opt(row, 12)?,
        abandoned: row.get(13)?,
        abandoned_at: parse_ts_opt(row, 14)?,
        created_at: parse_ts(row, 15)?,
        updated_at: parse_ts(row, 16)?,
    })
}

fn map_tag(row: &Row<'_>) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        project_id: row.get(3)?,
        created_at: parse_ts(row, 4)?,
    })
}

fn map_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        icon: row.get(3)?,
        color: row.get(4)?,
        sort_order: row.get(5)?,
        created_at: parse_ts(row, 6)?,
        updated_at: parse_ts(row, 7)?,
    })
}

fn map_activity(row: &Row<'_>) -> rusqlite::Result<ActivityRecord> {
    let action: String = row.get(3)?;
    let metadata: String = row.get(4)?;
    Ok(ActivityRecord {
        id: row.get(0)?,
        task_id: row.get(1)?,
        user_id: row.get(2)?,
        action: ActivityAction::parse(&action).ok_or_else(|| {
            conversion_error(3, std::io::Error::other(format!("unknown action '{action}'")))
        })?,
        metadata: serde_json::from_str(&metadata).map_err(|err| conversion_error(4, err))?,
        created_at: parse_ts(row, 5)?,
    })
}

fn write_task(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO tasks ({TASK_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        ),
        params![
            task.id,
            task.user_id,
            task.title,
            task.description,
            task.completed,
            ts_opt(&task.completed_at),
            date_opt(&task.date),
            task.project_id,
            serde_json::to_string(&task.attachments)?,
            task.sort_order,
            task.flagged,
            task.deleted,
            ts_opt(&task.deleted_at),
            task.abandoned,
            ts_opt(&task.abandoned_at),
            ts(&task.created_at),
            ts(&task.updated_at),
        ],
    )?;
    Ok(())
}

fn write_tag(conn: &Connection, tag: &Tag) -> Result<()> {
    conn.execute(
        &format!("INSERT OR REPLACE INTO tags ({TAG_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
        params![tag.id, tag.user_id, tag.name, tag.project_id, ts(&tag.created_at)],
    )?;
    Ok(())
}

fn write_project(conn: &Connection, project: &Project) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO projects ({PROJECT_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ),
        params![
            project.id,
            project.user_id,
            project.name,
            project.icon,
            project.color,
            project.sort_order,
            ts(&project.created_at),
            ts(&project.updated_at),
        ],
    )?;
    Ok(())
}

fn get_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
    Ok(conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            map_task,
        )
        .optional()?)
}

fn get_tag(conn: &Connection, id: &str) -> Result<Option<Tag>> {
    Ok(conn
        .query_row(
            &format!("SELECT {TAG_COLUMNS} FROM tags WHERE id = ?1"),
            params![id],
            map_tag,
        )
        .optional()?)
}

fn get_project(conn: &Connection, id: &str) -> Result<Option<Project>> {
    Ok(conn
        .query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
            params![id],
            map_project,
        )
        .optional()?)
}

fn validate_tag_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::Validation("tag name cannot be empty".to_string()));
    }
    Ok(name)
}

/// SQLite-backed [`StorageAdapter`].
pub struct LocalAdapter {
    conn: Mutex<Connection>,
    owner: String,
}

impl LocalAdapter {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn)
    }

    /// Throwaway database, used by tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            owner: LOCAL_OWNER.to_string(),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Transient("local database connection poisoned".to_string()))
    }
}

#[async_trait]
impl StorageAdapter for LocalAdapter {
    fn mode(&self) -> StorageMode {
        StorageMode::Local
    }

    fn owner_id(&self) -> &str {
        &self.owner
    }

    async fn create_task(&self, task: NewTask) -> Result<Task> {
        task.validate()?;
        let task = task.into_task(Uuid::new_v4().to_string(), self.owner.clone(), Utc::now());
        let conn = self.conn()?;
        write_task(&conn, &task)?;
        Ok(task)
    }

    async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<Task> {
        patch.validate()?;
        let conn = self.conn()?;
        let mut task =
            get_task(&conn, id)?.ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        patch.apply_to(&mut task);
        task.validate()?;
        task.updated_at = Utc::now();
        write_task(&conn, &task)?;
        Ok(task)
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM task_tags WHERE task_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut conditions = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(deleted) = filter.deleted {
            conditions.push("deleted = ?");
            values.push((deleted as i64).into());
        }
        if let Some(abandoned) = filter.abandoned {
            conditions.push("abandoned = ?");
            values.push((abandoned as i64).into());
        }
        if let Some(scope) = &filter.scope {
            conditions.push("project_id = ?");
            values.push(scope.clone().into());
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks {where_clause} ORDER BY sort_order ASC, created_at ASC"
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(params_from_iter(values), map_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    async fn put_task(&self, task: &Task) -> Result<()> {
        task.validate()?;
        let conn = self.conn()?;
        write_task(&conn, task)
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY sort_order ASC, created_at ASC"
        ))?;
        let projects = stmt
            .query_map([], map_project)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    async fn create_project(&self, project: NewProject) -> Result<Project> {
        if project.name.trim().is_empty() {
            return Err(Error::Validation("project name cannot be empty".to_string()));
        }
        let now = Utc::now();
        let project = Project {
            id: Uuid::new_v4().to_string(),
            user_id: self.owner.clone(),
            name: project.name.trim().to_string(),
            icon: project.icon,
            color: project.color,
            sort_order: project.sort_order,
            created_at: now,
            updated_at: now,
        };
        let conn = self.conn()?;
        write_project(&conn, &project)?;
        Ok(project)
    }

    async fn update_project(&self, id: &str, patch: &ProjectPatch) -> Result<Project> {
        let conn = self.conn()?;
        let mut project =
            get_project(&conn, id)?.ok_or_else(|| Error::NotFound(format!("project {id}")))?;
        patch.apply_to(&mut project);
        if project.name.trim().is_empty() {
            return Err(Error::Validation("project name cannot be empty".to_string()));
        }
        project.updated_at = Utc::now();
        write_project(&conn, &project)?;
        Ok(project)
    }

    async fn delete_project(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM task_tags WHERE tag_id IN (SELECT id FROM tags WHERE project_id = ?1)",
            params![id],
        )?;
        tx.execute("DELETE FROM tags WHERE project_id = ?1", params![id])?;
        tx.execute(
            "UPDATE tasks SET project_id = NULL, updated_at = ?2 WHERE project_id = ?1",
            params![id, ts(&Utc::now())],
        )?;
        let removed = tx.execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    async fn put_project(&self, project: &Project) -> Result<()> {
        let conn = self.conn()?;
        write_project(&conn, project)
    }

    async fn share_project(&self, _share: &ProjectShare) -> Result<()> {
        Err(Error::Validation(
            "sharing requires a signed-in remote session".to_string(),
        ))
    }

    async fn unshare_project(&self, _project_id: &str, _user_id: &str) -> Result<bool> {
        Err(Error::Validation(
            "sharing requires a signed-in remote session".to_string(),
        ))
    }

    async fn list_tags(&self, scope: Option<&TagScope>) -> Result<Vec<Tag>> {
        let conn = self.conn()?;
        let base = format!("SELECT {TAG_COLUMNS} FROM tags");
        let order = "ORDER BY created_at ASC, id ASC";
        let tags = match scope {
            None => {
                let mut stmt = conn.prepare(&format!("{base} {order}"))?;
                let rows = stmt.query_map([], map_tag)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            Some(TagScope::Global) => {
                let mut stmt = conn.prepare(&format!("{base} WHERE project_id IS NULL {order}"))?;
                let rows = stmt.query_map([], map_tag)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            Some(TagScope::Project(project_id)) => {
                let mut stmt = conn.prepare(&format!("{base} WHERE project_id = ?1 {order}"))?;
                let rows = stmt.query_map(params![project_id], map_tag)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(tags)
    }

    async fn create_tag(&self, name: &str, scope: &TagScope) -> Result<Tag> {
        let name = validate_tag_name(name)?;
        let tag = Tag {
            id: Uuid::new_v4().to_string(),
            user_id: self.owner.clone(),
            name: name.to_string(),
            project_id: scope.project_id().map(str::to_string),
            created_at: Utc::now(),
        };
        let conn = self.conn()?;
        write_tag(&conn, &tag)?;
        Ok(tag)
    }

    async fn rename_tag(&self, id: &str, name: &str) -> Result<Tag> {
        let name = validate_tag_name(name)?;
        let conn = self.conn()?;
        let mut tag = get_tag(&conn, id)?.ok_or_else(|| Error::NotFound(format!("tag {id}")))?;
        tag.name = name.to_string();
        write_tag(&conn, &tag)?;
        Ok(tag)
    }

    async fn delete_tag(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM task_tags WHERE tag_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM tags WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    async fn reassign_tag_scope(&self, id: &str, scope: &TagScope) -> Result<Tag> {
        let conn = self.conn()?;
        let mut tag = get_tag(&conn, id)?.ok_or_else(|| Error::NotFound(format!("tag {id}")))?;
        tag.project_id = scope.project_id().map(str::to_string);
        write_tag(&conn, &tag)?;
        Ok(tag)
    }

    async fn put_tag(&self, tag: &Tag) -> Result<()> {
        validate_tag_name(&tag.name)?;
        let conn = self.conn()?;
        write_tag(&conn, tag)
    }

    async fn tags_for_tasks(&self, ids: &[String]) -> Result<HashMap<String, Vec<Tag>>> {
        let mut by_task: HashMap<String, Vec<Tag>> = HashMap::new();
        if ids.is_empty() {
            return Ok(by_task);
        }
        let conn = self.conn()?;
        // Bounded IN lists keep us under SQLite's variable limit.
        for chunk in ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT tt.task_id, t.id, t.user_id, t.name, t.project_id, t.created_at \
                 FROM task_tags tt JOIN tags t ON t.id = tt.tag_id \
                 WHERE tt.task_id IN ({placeholders}) ORDER BY t.created_at ASC, t.id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                let task_id: String = row.get(0)?;
                let tag = Tag {
                    id: row.get(1)?,
                    user_id: row.get(2)?,
                    name: row.get(3)?,
                    project_id: row.get(4)?,
                    created_at: parse_ts(row, 5)?,
                };
                Ok((task_id, tag))
            })?;
            for row in rows {
                let (task_id, tag) = row?;
                by_task.entry(task_id).or_default().push(tag);
            }
        }
        Ok(by_task)
    }

    async fn attach_tag(&self, task_id: &str, tag_id: &str) -> Result<()> {
        let conn = self.conn()?;
        if get_task(&conn, task_id)?.is_none() {
            return Err(Error::NotFound(format!("task {task_id}")));
        }
        if get_tag(&conn, tag_id)?.is_none() {
            return Err(Error::NotFound(format!("tag {tag_id}")));
        }
        conn.execute(
            "INSERT OR IGNORE INTO task_tags (task_id, tag_id) VALUES (?1, ?2)",
            params![task_id, tag_id],
        )?;
        Ok(())
    }

    async fn detach_tag(&self, task_id: &str, tag_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM task_tags WHERE task_id = ?1 AND tag_id = ?2",
            params![task_id, tag_id],
        )?;
        Ok(removed > 0)
    }

    async fn list_task_tags(&self) -> Result<Vec<TaskTagLink>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT task_id, tag_id FROM task_tags ORDER BY task_id, tag_id")?;
        let links = stmt
            .query_map([], |row| {
                Ok(TaskTagLink {
                    task_id: row.get(0)?,
                    tag_id: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(links)
    }

    async fn record_activity(&self, record: &ActivityRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO task_activities (id, task_id, user_id, action, metadata_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.task_id,
                record.user_id,
                record.action.as_str(),
                serde_json::to_string(&record.metadata)?,
                ts(&record.created_at),
            ],
        )?;
        Ok(())
    }

    async fn list_activity(&self, task_id: &str) -> Result<Vec<ActivityRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, user_id, action, metadata_json, created_at \
             FROM task_activities WHERE task_id = ?1 ORDER BY created_at DESC, id DESC",
        )?;
        let records = stmt
            .query_map(params![task_id], map_activity)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn subscribe_to_changes(
        &self,
        _owner_id: &str,
        _project_ids: &[String],
    ) -> Result<SubscriptionHandle> {
        Ok(SubscriptionHandle::inert())
    }
}
