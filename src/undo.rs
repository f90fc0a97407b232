use crate::db::{self, UndoRow};
use crate::errors::{AppError, AppResult};
use crate::models::{EntityType, Project, RestoredEntity, Tag, Task, UndoOperation};
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const MAX_TTL_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Identity and bookkeeping fields; never restored by an inverse.
const UNTRACKED_FIELDS: &[&str] = &["id", "ownerId", "createdAt", "updatedAt", "revision"];

/// Prior state needed to reverse one mutation. State snapshots list the
/// top-level fields the mutation changed; only those are written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum UndoSnapshot {
    TaskCreated { task_id: String },
    TaskState {
        before: Task,
        fields: Vec<String>,
        spawned_task_id: Option<String>,
    },
    ProjectCreated { project_id: String },
    ProjectState { before: Project, fields: Vec<String> },
    TagCreated { tag_id: String },
    TagState { before: Tag, fields: Vec<String> },
    Batch { steps: Vec<UndoStep> },
}

impl UndoSnapshot {
    pub fn task_state(before: Task, after: &Task, spawned_task_id: Option<String>) -> AppResult<Self> {
        let fields = changed_fields(&before, after)?;
        Ok(Self::TaskState {
            before,
            fields,
            spawned_task_id,
        })
    }

    pub fn project_state(before: Project, after: &Project) -> AppResult<Self> {
        let fields = changed_fields(&before, after)?;
        Ok(Self::ProjectState { before, fields })
    }

    pub fn tag_state(before: Tag, after: &Tag) -> AppResult<Self> {
        let fields = changed_fields(&before, after)?;
        Ok(Self::TagState { before, fields })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoStep {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: UndoOperation,
    pub snapshot: UndoSnapshot,
}

impl UndoStep {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>, operation: UndoOperation, snapshot: UndoSnapshot) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            operation,
            snapshot,
        }
    }
}

/// An applied mutation and the step that reverses it. The caller records the
/// step in the same transaction.
#[derive(Debug, Clone)]
pub struct Change<T> {
    pub entity: T,
    pub step: UndoStep,
}

/// A redeemed ledger entry, consumed and ready to be reversed.
#[derive(Debug, Clone)]
pub struct UndoEntry {
    pub token: String,
    pub entity_type: EntityType,
    pub step: UndoStep,
}

/// Owner-scoped, single-use, expiring undo tokens backed by the `undo_tokens` table.
#[derive(Debug, Clone, Copy)]
pub struct UndoLedger {
    ttl: Duration,
}

impl UndoLedger {
    pub fn new(ttl_seconds: u64) -> Self {
        let ttl_seconds = ttl_seconds.clamp(1, MAX_TTL_SECONDS) as i64;
        Self {
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    pub fn record(&self, conn: &Connection, owner_id: &str, step: &UndoStep, now: DateTime<Utc>) -> AppResult<String> {
        let bytes: [u8; 32] = rand::random();
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
        let expires_at = now + self.ttl;

        db::insert_undo_row(
            conn,
            &UndoRow {
                token: token.clone(),
                owner_id: owner_id.to_string(),
                entity_type: step.entity_type.as_str().to_string(),
                entity_id: step.entity_id.clone(),
                operation: step.operation.as_str().to_string(),
                snapshot_json: serde_json::to_string(&step.snapshot)?,
                created_at: now,
                expires_at_ms: expires_at.timestamp_millis(),
            },
        )?;
        tracing::debug!(
            owner_id = %owner_id,
            entity_type = step.entity_type.as_str(),
            entity_id = %step.entity_id,
            operation = step.operation.as_str(),
            "recorded undo entry"
        );
        Ok(token)
    }

    /// Consumes `token` for `owner_id`. Unknown, expired, consumed and foreign
    /// tokens all fail the same way.
    pub fn redeem(&self, conn: &Connection, owner_id: &str, token: &str, now: DateTime<Utc>) -> AppResult<UndoEntry> {
        let now_ms = now.timestamp_millis();
        let purged = db::purge_expired_undo_rows(conn, now_ms)?;
        if purged > 0 {
            tracing::debug!(purged, "purged expired undo entries");
        }

        let row = db::consume_undo_row(conn, owner_id, token, now_ms)?.ok_or(AppError::InvalidUndoToken)?;
        let entity_type = EntityType::parse(&row.entity_type)
            .ok_or_else(|| AppError::Internal(format!("unknown entity type '{}' in undo ledger", row.entity_type)))?;
        let operation = UndoOperation::parse(&row.operation)
            .ok_or_else(|| AppError::Internal(format!("unknown operation '{}' in undo ledger", row.operation)))?;
        let snapshot: UndoSnapshot = serde_json::from_str(&row.snapshot_json)?;

        Ok(UndoEntry {
            token: row.token,
            entity_type,
            step: UndoStep {
                entity_type,
                entity_id: row.entity_id,
                operation,
                snapshot,
            },
        })
    }
}

/// Reverses one step. Batches reverse their steps newest first.
pub fn apply_inverse(conn: &Connection, owner_id: &str, step: &UndoStep, now: DateTime<Utc>) -> AppResult<RestoredEntity> {
    match &step.snapshot {
        UndoSnapshot::TaskCreated { task_id } => {
            let mut task = required_task(conn, owner_id, task_id)?;
            task.deleted_at = Some(now);
            task.updated_at = now;
            task.revision += 1;
            db::write_task(conn, &task)?;
            Ok(RestoredEntity::Task(task))
        }
        UndoSnapshot::TaskState {
            before,
            fields,
            spawned_task_id,
        } => {
            let current = required_task(conn, owner_id, &before.id)?;
            let mut restored = restore_fields(&current, before, fields)?;
            restored.revision = current.revision + 1;
            restored.updated_at = now;
            db::write_task(conn, &restored)?;

            if let Some(spawned_id) = spawned_task_id {
                retire_pristine_follow_up(conn, owner_id, spawned_id, now)?;
            }
            Ok(RestoredEntity::Task(restored))
        }
        UndoSnapshot::ProjectCreated { project_id } => {
            let mut project = required_project(conn, owner_id, project_id)?;
            project.deleted_at = Some(now);
            project.updated_at = now;
            db::write_project(conn, &project)?;
            Ok(RestoredEntity::Project(project))
        }
        UndoSnapshot::ProjectState { before, fields } => {
            let current = required_project(conn, owner_id, &before.id)?;
            let mut restored = restore_fields(&current, before, fields)?;
            restored.updated_at = now;
            db::write_project(conn, &restored)?;
            Ok(RestoredEntity::Project(restored))
        }
        UndoSnapshot::TagCreated { tag_id } => {
            let mut tag = required_tag(conn, owner_id, tag_id)?;
            tag.deleted_at = Some(now);
            tag.updated_at = now;
            db::write_tag(conn, &tag)?;
            Ok(RestoredEntity::Tag(tag))
        }
        UndoSnapshot::TagState { before, fields } => {
            let current = required_tag(conn, owner_id, &before.id)?;
            let mut restored = restore_fields(&current, before, fields)?;
            restored.updated_at = now;
            db::write_tag(conn, &restored)?;
            Ok(RestoredEntity::Tag(restored))
        }
        UndoSnapshot::Batch { steps } => {
            let mut restored = Vec::with_capacity(steps.len());
            for inner in steps.iter().rev() {
                restored.push(apply_inverse(conn, owner_id, inner, now)?);
            }
            Ok(RestoredEntity::Batch(restored))
        }
    }
}

fn retire_pristine_follow_up(conn: &Connection, owner_id: &str, task_id: &str, now: DateTime<Utc>) -> AppResult<()> {
    match db::find_task(conn, owner_id, task_id, true)? {
        Some(mut follow_up) if follow_up.is_pristine() => {
            follow_up.deleted_at = Some(now);
            follow_up.updated_at = now;
            follow_up.revision += 1;
            db::write_task(conn, &follow_up)
        }
        Some(_) => {
            tracing::info!(task_id = %task_id, "keeping edited recurring follow-up on undo");
            Ok(())
        }
        None => Ok(()),
    }
}

fn changed_fields<T: Serialize>(before: &T, after: &T) -> AppResult<Vec<String>> {
    let before = as_object(before)?;
    let after = as_object(after)?;
    Ok(after
        .iter()
        .filter(|(key, _)| !UNTRACKED_FIELDS.contains(&key.as_str()))
        .filter(|(key, value)| before.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect())
}

/// `current` with each listed field put back to its value in `before`.
fn restore_fields<T: Serialize + DeserializeOwned>(current: &T, before: &T, fields: &[String]) -> AppResult<T> {
    let prior = as_object(before)?;
    let mut merged = as_object(current)?;
    for field in fields {
        merged.insert(field.clone(), prior.get(field).cloned().unwrap_or(Value::Null));
    }
    Ok(serde_json::from_value(Value::Object(merged))?)
}

fn as_object<T: Serialize>(value: &T) -> AppResult<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::Internal("snapshot is not an object".to_string())),
    }
}

fn required_task(conn: &Connection, owner_id: &str, task_id: &str) -> AppResult<Task> {
    db::find_task(conn, owner_id, task_id, true)?.ok_or_else(|| AppError::not_found("Task", task_id))
}

fn required_project(conn: &Connection, owner_id: &str, project_id: &str) -> AppResult<Project> {
    db::find_project(conn, owner_id, project_id, true)?.ok_or_else(|| AppError::not_found("Project", project_id))
}

fn required_tag(conn: &Connection, owner_id: &str, tag_id: &str) -> AppResult<Tag> {
    db::find_tag(conn, owner_id, tag_id, true)?.ok_or_else(|| AppError::not_found("Tag", tag_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::TaskStatus;

    fn sample_task(owner: &str, id: &str, now: DateTime<Utc>) -> Task {
        Task {
            id: id.to_string(),
            owner_id: owner.to_string(),
            title: "Water plants".to_string(),
            description: None,
            status: TaskStatus::Pending,
            priority: 3,
            due_date: None,
            due_time: None,
            project_id: None,
            tag_ids: Vec::new(),
            recurrence: None,
            spawned_from_id: None,
            completed_at: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
            revision: 1,
        }
    }

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("undo.db")).expect("db");
        (dir, db)
    }

    fn created_step(task_id: &str) -> UndoStep {
        UndoStep::new(
            EntityType::Task,
            task_id,
            UndoOperation::Create,
            UndoSnapshot::TaskCreated {
                task_id: task_id.to_string(),
            },
        )
    }

    #[test]
    fn tokens_are_url_safe_and_unique() {
        let (_dir, db) = open();
        let ledger = UndoLedger::new(60);
        let now = Utc::now();
        let tokens: Vec<String> = (0..8)
            .map(|_| {
                db.with_conn(|conn| ledger.record(conn, "alice", &created_step("t1"), now))
                    .expect("record")
            })
            .collect();
        for token in &tokens {
            assert_eq!(token.len(), 43);
            assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
        let mut deduped = tokens.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), tokens.len());
    }

    #[test]
    fn redeems_exactly_once() {
        let (_dir, db) = open();
        let ledger = UndoLedger::new(60);
        let now = Utc::now();
        let token = db
            .with_conn(|conn| ledger.record(conn, "alice", &created_step("t1"), now))
            .expect("record");

        let entry = db
            .with_conn(|conn| ledger.redeem(conn, "alice", &token, now))
            .expect("first redemption");
        assert_eq!(entry.entity_type, EntityType::Task);
        assert_eq!(entry.step.operation, UndoOperation::Create);

        let second = db.with_conn(|conn| ledger.redeem(conn, "alice", &token, now));
        assert!(matches!(second, Err(AppError::InvalidUndoToken)));
    }

    #[test]
    fn foreign_unknown_and_expired_tokens_look_alike() {
        let (_dir, db) = open();
        let ledger = UndoLedger::new(60);
        let now = Utc::now();
        let token = db
            .with_conn(|conn| ledger.record(conn, "alice", &created_step("t1"), now))
            .expect("record");

        let foreign = db.with_conn(|conn| ledger.redeem(conn, "bob", &token, now));
        let unknown = db.with_conn(|conn| ledger.redeem(conn, "alice", "no-such-token", now));
        let expired = db.with_conn(|conn| ledger.redeem(conn, "alice", &token, now + Duration::seconds(61)));
        for outcome in [foreign, unknown, expired] {
            let error = outcome.expect_err("must be rejected");
            assert_eq!(error.code(), "INVALID_UNDO_TOKEN");
        }
    }

    #[test]
    fn failed_redemption_inside_transaction_leaves_token_live() {
        let (_dir, db) = open();
        let ledger = UndoLedger::new(60);
        let now = Utc::now();
        let token = db
            .with_conn(|conn| ledger.record(conn, "alice", &created_step("missing-task"), now))
            .expect("record");

        let result = db.with_transaction(|tx| {
            let entry = ledger.redeem(tx, "alice", &token, now)?;
            apply_inverse(tx, "alice", &entry.step, now).map(crate::db::TxOutcome::Commit)
        });
        assert_eq!(result.expect_err("task is missing").code(), "NOT_FOUND");

        let retry = db.with_conn(|conn| ledger.redeem(conn, "alice", &token, now));
        assert!(retry.is_ok());
    }

    #[test]
    fn restoring_state_bumps_revision_and_retires_pristine_follow_up() {
        let (_dir, db) = open();
        let now = Utc::now();
        let before = sample_task("alice", "t1", now);
        let mut completed = before.clone();
        completed.status = TaskStatus::Completed;
        completed.completed_at = Some(now);
        completed.revision = 2;
        let mut follow_up = sample_task("alice", "t2", now);
        follow_up.spawned_from_id = Some("t1".to_string());

        db.with_conn(|conn| {
            db::insert_task(conn, &completed)?;
            db::insert_task(conn, &follow_up)
        })
        .expect("seed");

        let step = UndoStep::new(
            EntityType::Task,
            "t1",
            UndoOperation::StatusChange,
            UndoSnapshot::task_state(before.clone(), &completed, Some("t2".to_string())).expect("snapshot"),
        );
        let restored = db
            .with_conn(|conn| apply_inverse(conn, "alice", &step, now))
            .expect("inverse");
        match restored {
            RestoredEntity::Task(task) => {
                assert_eq!(task.status, TaskStatus::Pending);
                assert_eq!(task.revision, 3);
            }
            other => panic!("unexpected entity {other:?}"),
        }

        let spawned = db
            .with_conn(|conn| db::find_task(conn, "alice", "t2", true))
            .expect("lookup")
            .expect("follow-up row");
        assert!(spawned.deleted_at.is_some());
    }

    #[test]
    fn snapshot_serializes_with_kind_tag() {
        let snapshot = UndoSnapshot::TagCreated {
            tag_id: "tag-1".to_string(),
        };
        let value = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(value["kind"], "tagCreated");
        assert_eq!(value["tagId"], "tag-1");
    }
}
