use crate::errors::{AppError, AppResult};
use crate::models::{EngineSettings, ListTasksFilter, Project, Recurrence, Tag, Task, TaskStatus};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");
const ENGINE_SETTINGS_KEY: &str = "engine";

const TASK_COLUMNS: &str = "id, owner_id, title, description, status, priority, due_date, due_time, project_id,
     recurrence, spawned_from_id, completed_at, deleted_at, created_at, updated_at, revision";
const PROJECT_COLUMNS: &str =
    "id, owner_id, name, parent_id, color, archived_at, deleted_at, created_at, updated_at";
const TAG_COLUMNS: &str = "id, owner_id, name, color, deleted_at, created_at, updated_at";

/// Whether a transaction scope keeps or discards its effects.
pub enum TxOutcome<T> {
    Commit(T),
    Rollback(T),
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.ensure_default_settings()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    /// Runs `f` on the connection in autocommit mode.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> AppResult<T>) -> AppResult<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Runs `f` inside one transaction. An `Err` from `f` rolls back and propagates.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> AppResult<TxOutcome<T>>,
    ) -> AppResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        match f(&tx)? {
            TxOutcome::Commit(value) => {
                tx.commit()?;
                Ok(value)
            }
            TxOutcome::Rollback(value) => {
                tx.rollback()?;
                Ok(value)
            }
        }
    }

    pub fn get_settings(&self) -> AppResult<EngineSettings> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                [ENGINE_SETTINGS_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(EngineSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<EngineSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let next: EngineSettings = serde_json::from_value(merged)
            .map_err(|error| AppError::Validation(format!("invalid settings: {}", error)))?;
        if next.max_batch_operations == 0 {
            return Err(AppError::Validation("maxBatchOperations must be at least 1".to_string()));
        }
        if next.default_priority > crate::models::MAX_PRIORITY {
            return Err(AppError::Validation("defaultPriority must be between 0 and 4".to_string()));
        }

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![ENGINE_SETTINGS_KEY, serde_json::to_string(&next)?, Utc::now().to_rfc3339()],
        )?;
        Ok(next)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value_json, updated_at) VALUES (?1, ?2, ?3)",
            params![
                ENGINE_SETTINGS_KEY,
                serde_json::to_string(&EngineSettings::default())?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

// ─── Tasks ──────────────────────────────────────────────────────────────

pub fn insert_task(conn: &Connection, task: &Task) -> AppResult<()> {
    conn.execute(
        "INSERT INTO tasks (
           id, owner_id, title, description, status, priority, due_date, due_time, project_id,
           recurrence, spawned_from_id, completed_at, deleted_at, created_at, updated_at, revision
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            task.id,
            task.owner_id,
            task.title,
            task.description,
            task.status.as_str(),
            task.priority,
            task.due_date.map(format_date),
            task.due_time.map(format_clock),
            task.project_id,
            task.recurrence.map(Recurrence::as_str),
            task.spawned_from_id,
            task.completed_at.map(|value| value.to_rfc3339()),
            task.deleted_at.map(|value| value.to_rfc3339()),
            task.created_at.to_rfc3339(),
            task.updated_at.to_rfc3339(),
            task.revision,
        ],
    )?;
    replace_task_tags(conn, &task.id, &task.tag_ids)
}

/// Writes every column of `task` back to its row. Restores soft-deleted rows too.
pub fn write_task(conn: &Connection, task: &Task) -> AppResult<()> {
    let changed = conn.execute(
        "UPDATE tasks SET
           title = ?3, description = ?4, status = ?5, priority = ?6, due_date = ?7, due_time = ?8,
           project_id = ?9, recurrence = ?10, spawned_from_id = ?11, completed_at = ?12,
           deleted_at = ?13, updated_at = ?14, revision = ?15
         WHERE id = ?1 AND owner_id = ?2",
        params![
            task.id,
            task.owner_id,
            task.title,
            task.description,
            task.status.as_str(),
            task.priority,
            task.due_date.map(format_date),
            task.due_time.map(format_clock),
            task.project_id,
            task.recurrence.map(Recurrence::as_str),
            task.spawned_from_id,
            task.completed_at.map(|value| value.to_rfc3339()),
            task.deleted_at.map(|value| value.to_rfc3339()),
            task.updated_at.to_rfc3339(),
            task.revision,
        ],
    )?;
    if changed == 0 {
        return Err(AppError::not_found("Task", &task.id));
    }
    replace_task_tags(conn, &task.id, &task.tag_ids)
}

pub fn find_task(conn: &Connection, owner_id: &str, task_id: &str, include_deleted: bool) -> AppResult<Option<Task>> {
    let query = format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1 AND owner_id = ?2{}",
        if include_deleted { "" } else { " AND deleted_at IS NULL" }
    );
    let task = conn
        .query_row(&query, params![task_id, owner_id], parse_task_row)
        .optional()?;
    match task {
        Some(mut task) => {
            task.tag_ids = load_task_tag_ids(conn, &task.id)?;
            Ok(Some(task))
        }
        None => Ok(None),
    }
}

pub fn list_tasks(conn: &Connection, owner_id: &str, filter: &ListTasksFilter) -> AppResult<Vec<Task>> {
    let mut query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE owner_id = ? AND deleted_at IS NULL");
    let mut params_vec: Vec<String> = vec![owner_id.to_string()];

    if let Some(status) = filter.status {
        query.push_str(" AND status = ?");
        params_vec.push(status.as_str().to_string());
    }
    if filter.exclude_completed {
        query.push_str(" AND status <> ?");
        params_vec.push(TaskStatus::Completed.as_str().to_string());
    }
    if let Some(project_id) = &filter.project_id {
        query.push_str(" AND project_id = ?");
        params_vec.push(project_id.clone());
    }
    if let Some(tag_id) = &filter.tag_id {
        query.push_str(" AND EXISTS (SELECT 1 FROM task_tags tt WHERE tt.task_id = tasks.id AND tt.tag_id = ?)");
        params_vec.push(tag_id.clone());
    }
    if let Some(due_on) = filter.due_on {
        query.push_str(" AND due_date = ?");
        params_vec.push(format_date(due_on));
    }
    if let Some(due_before) = filter.due_before {
        query.push_str(" AND due_date IS NOT NULL AND due_date < ?");
        params_vec.push(format_date(due_before));
    }
    if let Some(due_after) = filter.due_after {
        query.push_str(" AND due_date IS NOT NULL AND due_date > ?");
        params_vec.push(format_date(due_after));
    }
    query.push_str(" ORDER BY due_date IS NULL, due_date ASC, priority ASC, created_at ASC");

    let mut statement = conn.prepare(&query)?;
    let rows = statement.query_map(rusqlite::params_from_iter(params_vec.iter()), parse_task_row)?;
    let mut result = Vec::new();
    for row in rows {
        let mut task = row?;
        task.tag_ids = load_task_tag_ids(conn, &task.id)?;
        result.push(task);
    }
    Ok(result)
}

fn load_task_tag_ids(conn: &Connection, task_id: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT tag_id FROM task_tags WHERE task_id = ?1 ORDER BY position ASC")?;
    let rows = stmt.query_map([task_id], |row| row.get::<_, String>(0))?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

fn replace_task_tags(conn: &Connection, task_id: &str, tag_ids: &[String]) -> AppResult<()> {
    conn.execute("DELETE FROM task_tags WHERE task_id = ?1", [task_id])?;
    for (position, tag_id) in tag_ids.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO task_tags (task_id, tag_id, position) VALUES (?1, ?2, ?3)",
            params![task_id, tag_id, position as i64],
        )?;
    }
    Ok(())
}

// ─── Projects ───────────────────────────────────────────────────────────

pub fn insert_project(conn: &Connection, project: &Project) -> AppResult<()> {
    conn.execute(
        "INSERT INTO projects (id, owner_id, name, parent_id, color, archived_at, deleted_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            project.id,
            project.owner_id,
            project.name,
            project.parent_id,
            project.color,
            project.archived_at.map(|value| value.to_rfc3339()),
            project.deleted_at.map(|value| value.to_rfc3339()),
            project.created_at.to_rfc3339(),
            project.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn write_project(conn: &Connection, project: &Project) -> AppResult<()> {
    let changed = conn.execute(
        "UPDATE projects SET name = ?3, parent_id = ?4, color = ?5, archived_at = ?6, deleted_at = ?7, updated_at = ?8
         WHERE id = ?1 AND owner_id = ?2",
        params![
            project.id,
            project.owner_id,
            project.name,
            project.parent_id,
            project.color,
            project.archived_at.map(|value| value.to_rfc3339()),
            project.deleted_at.map(|value| value.to_rfc3339()),
            project.updated_at.to_rfc3339(),
        ],
    )?;
    if changed == 0 {
        return Err(AppError::not_found("Project", &project.id));
    }
    Ok(())
}

pub fn find_project(
    conn: &Connection,
    owner_id: &str,
    project_id: &str,
    include_deleted: bool,
) -> AppResult<Option<Project>> {
    let query = format!(
        "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1 AND owner_id = ?2{}",
        if include_deleted { "" } else { " AND deleted_at IS NULL" }
    );
    conn.query_row(&query, params![project_id, owner_id], parse_project_row)
        .optional()
        .map_err(AppError::from)
}

pub fn list_projects(conn: &Connection, owner_id: &str, include_archived: bool) -> AppResult<Vec<Project>> {
    let query = format!(
        "SELECT {PROJECT_COLUMNS} FROM projects WHERE owner_id = ?1 AND deleted_at IS NULL{} ORDER BY created_at ASC",
        if include_archived { "" } else { " AND archived_at IS NULL" }
    );
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map([owner_id], parse_project_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

// ─── Tags ───────────────────────────────────────────────────────────────

pub fn insert_tag(conn: &Connection, tag: &Tag) -> AppResult<()> {
    conn.execute(
        "INSERT INTO tags (id, owner_id, name, color, deleted_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            tag.id,
            tag.owner_id,
            tag.name,
            tag.color,
            tag.deleted_at.map(|value| value.to_rfc3339()),
            tag.created_at.to_rfc3339(),
            tag.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn write_tag(conn: &Connection, tag: &Tag) -> AppResult<()> {
    let changed = conn.execute(
        "UPDATE tags SET name = ?3, color = ?4, deleted_at = ?5, updated_at = ?6 WHERE id = ?1 AND owner_id = ?2",
        params![
            tag.id,
            tag.owner_id,
            tag.name,
            tag.color,
            tag.deleted_at.map(|value| value.to_rfc3339()),
            tag.updated_at.to_rfc3339(),
        ],
    )?;
    if changed == 0 {
        return Err(AppError::not_found("Tag", &tag.id));
    }
    Ok(())
}

pub fn find_tag(conn: &Connection, owner_id: &str, tag_id: &str, include_deleted: bool) -> AppResult<Option<Tag>> {
    let query = format!(
        "SELECT {TAG_COLUMNS} FROM tags WHERE id = ?1 AND owner_id = ?2{}",
        if include_deleted { "" } else { " AND deleted_at IS NULL" }
    );
    conn.query_row(&query, params![tag_id, owner_id], parse_tag_row)
        .optional()
        .map_err(AppError::from)
}

/// Case-insensitive over the full Unicode range; SQLite's NOCASE folds ASCII only.
pub fn find_tag_by_name(conn: &Connection, owner_id: &str, name: &str) -> AppResult<Option<Tag>> {
    let wanted = name.to_lowercase();
    Ok(list_tags(conn, owner_id)?
        .into_iter()
        .filter(|tag| tag.name.to_lowercase() == wanted)
        .min_by(|left, right| left.created_at.cmp(&right.created_at)))
}

pub fn list_tags(conn: &Connection, owner_id: &str) -> AppResult<Vec<Tag>> {
    let query = format!(
        "SELECT {TAG_COLUMNS} FROM tags WHERE owner_id = ?1 AND deleted_at IS NULL ORDER BY name COLLATE NOCASE ASC"
    );
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map([owner_id], parse_tag_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

// ─── Undo tokens ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UndoRow {
    pub token: String,
    pub owner_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub snapshot_json: String,
    pub created_at: DateTime<Utc>,
    pub expires_at_ms: i64,
}

pub fn insert_undo_row(conn: &Connection, row: &UndoRow) -> AppResult<()> {
    conn.execute(
        "INSERT INTO undo_tokens (token, owner_id, entity_type, entity_id, operation, snapshot_json, created_at, expires_at_ms, consumed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
        params![
            row.token,
            row.owner_id,
            row.entity_type,
            row.entity_id,
            row.operation,
            row.snapshot_json,
            row.created_at.to_rfc3339(),
            row.expires_at_ms,
        ],
    )?;
    Ok(())
}

/// Marks the token consumed if, and only if, it is live and owned by `owner_id`.
/// Returns `None` when the guarded update touched no row.
pub fn consume_undo_row(conn: &Connection, owner_id: &str, token: &str, now_ms: i64) -> AppResult<Option<UndoRow>> {
    conn.query_row(
        "UPDATE undo_tokens SET consumed = 1
         WHERE token = ?1 AND owner_id = ?2 AND consumed = 0 AND expires_at_ms > ?3
         RETURNING token, owner_id, entity_type, entity_id, operation, snapshot_json, created_at, expires_at_ms",
        params![token, owner_id, now_ms],
        |row| {
            Ok(UndoRow {
                token: row.get(0)?,
                owner_id: row.get(1)?,
                entity_type: row.get(2)?,
                entity_id: row.get(3)?,
                operation: row.get(4)?,
                snapshot_json: row.get(5)?,
                created_at: parse_time(&row.get::<_, String>(6)?)?,
                expires_at_ms: row.get(7)?,
            })
        },
    )
    .optional()
    .map_err(AppError::from)
}

pub fn purge_expired_undo_rows(conn: &Connection, now_ms: i64) -> AppResult<usize> {
    let removed = conn.execute("DELETE FROM undo_tokens WHERE expires_at_ms <= ?1", [now_ms])?;
    Ok(removed)
}

// ─── Row parsing ────────────────────────────────────────────────────────

fn parse_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: parse_status(&row.get::<_, String>(4)?)?,
        priority: row.get(5)?,
        due_date: row
            .get::<_, Option<String>>(6)?
            .map(|raw| parse_date(&raw))
            .transpose()?,
        due_time: row
            .get::<_, Option<String>>(7)?
            .map(|raw| parse_clock(&raw))
            .transpose()?,
        project_id: row.get(8)?,
        tag_ids: Vec::new(),
        recurrence: row
            .get::<_, Option<String>>(9)?
            .map(|raw| parse_recurrence(&raw))
            .transpose()?,
        spawned_from_id: row.get(10)?,
        completed_at: parse_optional_time(row.get(11)?)?,
        deleted_at: parse_optional_time(row.get(12)?)?,
        created_at: parse_time(&row.get::<_, String>(13)?)?,
        updated_at: parse_time(&row.get::<_, String>(14)?)?,
        revision: row.get(15)?,
    })
}

fn parse_project_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        parent_id: row.get(3)?,
        color: row.get(4)?,
        archived_at: parse_optional_time(row.get(5)?)?,
        deleted_at: parse_optional_time(row.get(6)?)?,
        created_at: parse_time(&row.get::<_, String>(7)?)?,
        updated_at: parse_time(&row.get::<_, String>(8)?)?,
    })
}

fn parse_tag_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        color: row.get(3)?,
        deleted_at: parse_optional_time(row.get(4)?)?,
        created_at: parse_time(&row.get::<_, String>(5)?)?,
        updated_at: parse_time(&row.get::<_, String>(6)?)?,
    })
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_status(raw: &str) -> rusqlite::Result<TaskStatus> {
    TaskStatus::parse(raw).ok_or_else(|| conversion_error(format!("unknown task status '{}'", raw)))
}

fn parse_recurrence(raw: &str) -> rusqlite::Result<Recurrence> {
    Recurrence::parse(raw).ok_or_else(|| conversion_error(format!("unknown recurrence '{}'", raw)))
}

fn parse_date(raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|error| conversion_error(error.to_string()))
}

fn parse_clock(raw: &str) -> rusqlite::Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S").map_err(|error| conversion_error(error.to_string()))
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(error.to_string()))
}

fn parse_optional_time(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|value| parse_time(&value)).transpose()
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn format_clock(time: NaiveTime) -> String {
    time.format("%H:%M:%S").to_string()
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
