use crate::batch::run_batch;
use crate::db::{Database, TxOutcome};
use crate::errors::{AppError, AppResult};
use crate::models::{
    BatchRequest, BatchResult, Caller, CreateProjectRequest, CreateTagRequest, CreateTaskRequest, CreatedTask,
    EngineSettings, EntityType, ListTasksFilter, Mutation, ParseSummary, ParsedCommand, Project, RequestScope,
    RestoredEntity, Tag, Task, TaskStatus, UpdateProjectRequest, UpdateTagRequest, UpdateTaskRequest,
};
use crate::parser::{parse_command, ParseContext};
use crate::undo::{apply_inverse, Change, UndoLedger};
use crate::{db, projects, tags, tasks};
use chrono::{DateTime, NaiveTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Source of "now" for expiry and relative dates.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Owner-scoped facade over parsing, entity mutations, batches and undo.
pub struct Engine {
    db: Arc<Database>,
    settings: RwLock<EngineSettings>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(db_path: &Path) -> AppResult<Arc<Self>> {
        Self::with_clock(db_path, Arc::new(SystemClock))
    }

    pub fn with_clock(db_path: &Path, clock: Arc<dyn Clock>) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(db_path)?);
        let settings = db.get_settings()?;
        tracing::info!(
            db_path = %db.path().display(),
            undo_ttl_seconds = settings.undo_ttl_seconds,
            max_batch_operations = settings.max_batch_operations,
            "task engine ready"
        );
        Ok(Arc::new(Self {
            db,
            settings: RwLock::new(settings),
            clock,
        }))
    }

    // ─── Parsing ────────────────────────────────────────────────────────

    /// Parses without creating a task. Tags referenced in the text are still
    /// created, so the preview and a later create agree on ids.
    pub fn parse(&self, caller: &Caller, input: &str) -> AppResult<ParsedCommand> {
        let settings = self.settings()?;
        let owner_id = owner_of(caller)?;
        let today = self.clock.now().date_naive();
        self.db.with_transaction(|tx| {
            let parsed = parse_command(
                tx,
                &ParseContext {
                    owner_id,
                    today,
                    default_tag_color: &settings.default_tag_color,
                },
                input,
            )?;
            Ok(TxOutcome::Commit(parsed))
        })
    }

    // ─── Tasks ──────────────────────────────────────────────────────────

    pub fn create_task(&self, caller: &Caller, request: CreateTaskRequest) -> AppResult<CreatedTask> {
        let mutation = self.mutate(caller, |conn, scope| tasks::create_task(conn, scope, request))?;
        Ok(CreatedTask {
            task: mutation.entity,
            parse_result: None,
            undo_token: mutation.undo_token,
        })
    }

    pub fn create_task_from_text(&self, caller: &Caller, input_text: &str) -> AppResult<CreatedTask> {
        let settings = self.settings()?;
        let scope = self.scope(caller, &settings)?;
        let ledger = UndoLedger::new(settings.undo_ttl_seconds);
        self.db.with_transaction(|tx| {
            let (change, parsed) = tasks::create_task_from_text(tx, &scope, input_text)?;
            let undo_token = ledger.record(tx, scope.owner_id, &change.step, scope.now)?;
            Ok(TxOutcome::Commit(CreatedTask {
                task: change.entity,
                parse_result: Some(ParseSummary {
                    warnings: parsed.warnings,
                    highlights: parsed.highlights,
                }),
                undo_token,
            }))
        })
    }

    pub fn update_task(&self, caller: &Caller, task_id: &str, request: UpdateTaskRequest) -> AppResult<Mutation<Task>> {
        self.mutate(caller, |conn, scope| tasks::update_task(conn, scope, task_id, request))
    }

    pub fn delete_task(&self, caller: &Caller, task_id: &str) -> AppResult<Mutation<Task>> {
        self.mutate(caller, |conn, scope| tasks::delete_task(conn, scope, task_id))
    }

    pub fn set_task_status(&self, caller: &Caller, task_id: &str, status: TaskStatus) -> AppResult<Mutation<Task>> {
        self.mutate(caller, |conn, scope| tasks::set_task_status(conn, scope, task_id, status))
    }

    pub fn complete_task(&self, caller: &Caller, task_id: &str) -> AppResult<Mutation<Task>> {
        self.set_task_status(caller, task_id, TaskStatus::Completed)
    }

    pub fn reopen_task(&self, caller: &Caller, task_id: &str) -> AppResult<Mutation<Task>> {
        self.set_task_status(caller, task_id, TaskStatus::Pending)
    }

    pub fn reschedule_task(
        &self,
        caller: &Caller,
        task_id: &str,
        due_date: &str,
        due_time: Option<NaiveTime>,
    ) -> AppResult<Mutation<Task>> {
        self.mutate(caller, |conn, scope| {
            tasks::reschedule_task(conn, scope, task_id, due_date, due_time)
        })
    }

    pub fn move_task(&self, caller: &Caller, task_id: &str, project_id: Option<&str>) -> AppResult<Mutation<Task>> {
        self.mutate(caller, |conn, scope| tasks::move_task(conn, scope, task_id, project_id))
    }

    pub fn get_task(&self, caller: &Caller, task_id: &str) -> AppResult<Task> {
        let owner_id = owner_of(caller)?;
        self.db.with_conn(|conn| tasks::get_task(conn, owner_id, task_id))
    }

    pub fn list_tasks(&self, caller: &Caller, filter: &ListTasksFilter) -> AppResult<Vec<Task>> {
        let owner_id = owner_of(caller)?;
        self.db.with_conn(|conn| tasks::list_tasks(conn, owner_id, filter))
    }

    // ─── Projects ───────────────────────────────────────────────────────

    pub fn create_project(&self, caller: &Caller, request: CreateProjectRequest) -> AppResult<Mutation<Project>> {
        self.mutate(caller, |conn, scope| projects::create_project(conn, scope, request))
    }

    pub fn update_project(
        &self,
        caller: &Caller,
        project_id: &str,
        request: UpdateProjectRequest,
    ) -> AppResult<Mutation<Project>> {
        self.mutate(caller, |conn, scope| projects::update_project(conn, scope, project_id, request))
    }

    pub fn archive_project(&self, caller: &Caller, project_id: &str) -> AppResult<Mutation<Project>> {
        self.mutate(caller, |conn, scope| projects::archive_project(conn, scope, project_id))
    }

    pub fn unarchive_project(&self, caller: &Caller, project_id: &str) -> AppResult<Mutation<Project>> {
        self.mutate(caller, |conn, scope| projects::unarchive_project(conn, scope, project_id))
    }

    pub fn delete_project(&self, caller: &Caller, project_id: &str) -> AppResult<Mutation<Project>> {
        self.mutate(caller, |conn, scope| projects::delete_project(conn, scope, project_id))
    }

    pub fn list_projects(&self, caller: &Caller, include_archived: bool) -> AppResult<Vec<Project>> {
        let owner_id = owner_of(caller)?;
        self.db.with_conn(|conn| db::list_projects(conn, owner_id, include_archived))
    }

    // ─── Tags ───────────────────────────────────────────────────────────

    pub fn create_tag(&self, caller: &Caller, request: CreateTagRequest) -> AppResult<Mutation<Tag>> {
        self.mutate(caller, |conn, scope| tags::create_tag(conn, scope, request))
    }

    pub fn update_tag(&self, caller: &Caller, tag_id: &str, request: UpdateTagRequest) -> AppResult<Mutation<Tag>> {
        self.mutate(caller, |conn, scope| tags::update_tag(conn, scope, tag_id, request))
    }

    pub fn delete_tag(&self, caller: &Caller, tag_id: &str) -> AppResult<Mutation<Tag>> {
        self.mutate(caller, |conn, scope| tags::delete_tag(conn, scope, tag_id))
    }

    pub fn list_tags(&self, caller: &Caller) -> AppResult<Vec<Tag>> {
        let owner_id = owner_of(caller)?;
        self.db.with_conn(|conn| db::list_tags(conn, owner_id))
    }

    // ─── Batch & undo ───────────────────────────────────────────────────

    pub fn batch(&self, caller: &Caller, request: BatchRequest) -> AppResult<BatchResult> {
        let settings = self.settings()?;
        let scope = self.scope(caller, &settings)?;
        let ledger = UndoLedger::new(settings.undo_ttl_seconds);
        run_batch(&self.db, &scope, &ledger, request)
    }

    /// Redeems `token` and reverses its mutation in one transaction. Any failure
    /// rolls back, leaving the token redeemable.
    pub fn undo(&self, caller: &Caller, token: &str) -> AppResult<RestoredEntity> {
        self.redeem(caller, token, None)
    }

    /// Like [`Engine::undo`], but only for tokens recorded against `entity_type`.
    pub fn undo_resource(&self, caller: &Caller, entity_type: EntityType, token: &str) -> AppResult<RestoredEntity> {
        self.redeem(caller, token, Some(entity_type))
    }

    // ─── Settings ───────────────────────────────────────────────────────

    pub fn settings(&self) -> AppResult<EngineSettings> {
        self.settings
            .read()
            .map(|guard| guard.clone())
            .map_err(|_| AppError::Internal("settings lock poisoned".to_string()))
    }

    pub fn update_settings(&self, patch: serde_json::Value) -> AppResult<EngineSettings> {
        let next = self.db.update_settings(patch)?;
        let mut guard = self
            .settings
            .write()
            .map_err(|_| AppError::Internal("settings lock poisoned".to_string()))?;
        *guard = next.clone();
        tracing::info!(
            undo_ttl_seconds = next.undo_ttl_seconds,
            max_batch_operations = next.max_batch_operations,
            "engine settings updated"
        );
        Ok(next)
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn scope<'a>(&self, caller: &'a Caller, settings: &'a EngineSettings) -> AppResult<RequestScope<'a>> {
        Ok(RequestScope {
            owner_id: owner_of(caller)?,
            now: self.clock.now(),
            settings,
        })
    }

    fn mutate<T>(
        &self,
        caller: &Caller,
        apply: impl FnOnce(&Connection, &RequestScope<'_>) -> AppResult<Change<T>>,
    ) -> AppResult<Mutation<T>> {
        let settings = self.settings()?;
        let scope = self.scope(caller, &settings)?;
        let ledger = UndoLedger::new(settings.undo_ttl_seconds);
        self.db.with_transaction(|tx| {
            let conn: &Connection = tx;
            let change = apply(conn, &scope)?;
            let undo_token = ledger.record(tx, scope.owner_id, &change.step, scope.now)?;
            Ok(TxOutcome::Commit(Mutation {
                entity: change.entity,
                undo_token,
            }))
        })
    }

    fn redeem(&self, caller: &Caller, token: &str, expected: Option<EntityType>) -> AppResult<RestoredEntity> {
        let settings = self.settings()?;
        let owner_id = owner_of(caller)?;
        let now = self.clock.now();
        let ledger = UndoLedger::new(settings.undo_ttl_seconds);

        let restored = self.db.with_transaction(|tx| {
            let entry = ledger.redeem(tx, owner_id, token.trim(), now)?;
            if expected.is_some_and(|expected| expected != entry.entity_type) {
                return Err(AppError::InvalidUndoToken);
            }
            let restored = apply_inverse(tx, owner_id, &entry.step, now)?;
            Ok(TxOutcome::Commit(restored))
        });
        match &restored {
            Ok(entity) => tracing::info!(
                owner_id = %owner_id,
                entity_type = entity.entity_type().as_str(),
                "undo applied"
            ),
            Err(error) => tracing::warn!(owner_id = %owner_id, error = %error, "undo rejected"),
        }
        restored
    }
}

fn owner_of(caller: &Caller) -> AppResult<&str> {
    let owner_id = caller.user_id.trim();
    if owner_id.is_empty() {
        return Err(AppError::Validation("caller userId is required".to_string()));
    }
    Ok(owner_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_caller_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::new(&dir.path().join("engine.db")).expect("engine");
        let error = engine.list_tasks(&Caller::new("  "), &ListTasksFilter::default());
        assert_eq!(error.expect_err("blank caller").code(), "VALIDATION_ERROR");
    }

    #[test]
    fn settings_updates_are_visible_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::new(&dir.path().join("engine.db")).expect("engine");
        let updated = engine
            .update_settings(serde_json::json!({"maxBatchOperations": 5}))
            .expect("update");
        assert_eq!(updated.max_batch_operations, 5);
        assert_eq!(engine.settings().expect("settings").max_batch_operations, 5);
        assert_eq!(engine.settings().expect("settings").undo_ttl_seconds, 60);

        let rejected = engine.update_settings(serde_json::json!({"defaultPriority": 9}));
        assert!(rejected.is_err());
    }
}
