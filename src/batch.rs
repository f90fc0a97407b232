use crate::db::{Database, TxOutcome};
use crate::errors::{AppError, AppResult};
use crate::models::{
    BatchMode, BatchOperation, BatchOperationResult, BatchRequest, BatchResult, CreateTaskRequest, EntityType,
    RequestScope, Task, TaskStatus, UndoOperation, UpdateTaskRequest,
};
use crate::tasks;
use crate::undo::{Change, UndoLedger, UndoSnapshot, UndoStep};
use chrono::NaiveTime;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

pub const NOT_EXECUTED: &str = "NOT_EXECUTED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAction {
    Create,
    Update,
    Delete,
    Complete,
    Reopen,
    Reschedule,
    Move,
}

impl BatchAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Complete => "complete",
            Self::Reopen => "reopen",
            Self::Reschedule => "reschedule",
            Self::Move => "move",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "complete" => Some(Self::Complete),
            "reopen" => Some(Self::Reopen),
            "reschedule" => Some(Self::Reschedule),
            "move" => Some(Self::Move),
            _ => None,
        }
    }

    pub fn requires_target(self) -> bool {
        !matches!(self, Self::Create)
    }
}

#[derive(Debug, Clone)]
struct PlannedOperation {
    index: usize,
    action: BatchAction,
    target_id: Option<String>,
    payload: Map<String, Value>,
}

impl PlannedOperation {
    fn target(&self) -> AppResult<&str> {
        self.target_id
            .as_deref()
            .ok_or_else(|| AppError::Validation(format!("Operation {} requires targetId", self.index)))
    }

    fn succeeded(&self, task: &Task) -> BatchOperationResult {
        BatchOperationResult {
            index: self.index,
            success: true,
            action: self.action.as_str().to_string(),
            target_id: self.target_id.clone(),
            produced_id: (self.action == BatchAction::Create).then(|| task.id.clone()),
            error_code: None,
            error: None,
        }
    }

    fn failed(&self, code: &str, message: String) -> BatchOperationResult {
        BatchOperationResult {
            index: self.index,
            success: false,
            action: self.action.as_str().to_string(),
            target_id: self.target_id.clone(),
            produced_id: None,
            error_code: Some(code.to_string()),
            error: Some(message),
        }
    }
}

/// Validates and runs a batch of task operations for the scope's owner.
///
/// Request-level problems (empty, oversized, unknown action, missing target)
/// reject the whole batch before anything runs. Everything after that is
/// reported per operation.
pub fn run_batch(
    db: &Database,
    scope: &RequestScope<'_>,
    ledger: &UndoLedger,
    request: BatchRequest,
) -> AppResult<BatchResult> {
    let mode = if request.atomic { BatchMode::Atomic } else { BatchMode::Partial };
    let planned = plan(request.operations, scope.settings.max_batch_operations)?;

    let result = match mode {
        BatchMode::Partial => run_partial(db, scope, ledger, &planned)?,
        BatchMode::Atomic => run_atomic(db, scope, ledger, &planned)?,
    };
    tracing::info!(
        owner_id = %scope.owner_id,
        mode = ?result.mode,
        total = result.total_operations,
        succeeded = result.successful_operations,
        failed = result.failed_operations,
        rolled_back = result.rolled_back,
        "batch executed"
    );
    Ok(result)
}

fn plan(operations: Vec<BatchOperation>, limit: usize) -> AppResult<Vec<PlannedOperation>> {
    if operations.is_empty() {
        return Err(AppError::Validation("Batch must contain at least one operation".to_string()));
    }
    if operations.len() > limit {
        return Err(AppError::BatchSizeLimitExceeded {
            count: operations.len(),
            limit,
        });
    }

    operations
        .into_iter()
        .enumerate()
        .map(|(index, operation)| {
            let action = BatchAction::parse(&operation.action).ok_or_else(|| {
                AppError::Validation(format!("Operation {}: unknown action '{}'", index, operation.action))
            })?;
            let target_id = operation
                .target_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty());
            if action.requires_target() && target_id.is_none() {
                return Err(AppError::Validation(format!(
                    "Operation {}: action '{}' requires targetId",
                    index,
                    action.as_str()
                )));
            }
            Ok(PlannedOperation {
                index,
                action,
                target_id,
                payload: operation.payload,
            })
        })
        .collect()
}

fn run_partial(
    db: &Database,
    scope: &RequestScope<'_>,
    ledger: &UndoLedger,
    planned: &[PlannedOperation],
) -> AppResult<BatchResult> {
    let mut results = Vec::with_capacity(planned.len());
    let mut steps = Vec::new();

    for operation in planned {
        let outcome = db.with_transaction(|tx| Ok(TxOutcome::Commit(apply(tx, scope, operation)?)));
        match outcome {
            Ok(change) => {
                results.push(operation.succeeded(&change.entity));
                steps.push(change.step);
            }
            Err(error) => {
                tracing::warn!(index = operation.index, error = %error, "batch operation failed");
                results.push(operation.failed(error.code(), error.message()));
            }
        }
    }

    let undo_token = if steps.is_empty() {
        None
    } else {
        let step = batch_step(steps);
        Some(db.with_conn(|conn| ledger.record(conn, scope.owner_id, &step, scope.now))?)
    };
    Ok(summarize(BatchMode::Partial, results, false, undo_token))
}

fn run_atomic(
    db: &Database,
    scope: &RequestScope<'_>,
    ledger: &UndoLedger,
    planned: &[PlannedOperation],
) -> AppResult<BatchResult> {
    db.with_transaction(|tx| {
        let mut results = Vec::with_capacity(planned.len());
        let mut steps = Vec::with_capacity(planned.len());

        for (position, operation) in planned.iter().enumerate() {
            match apply(tx, scope, operation) {
                Ok(change) => {
                    results.push(operation.succeeded(&change.entity));
                    steps.push(change.step);
                }
                Err(error) => {
                    tracing::warn!(index = operation.index, error = %error, "atomic batch stopped");
                    results.push(operation.failed(error.code(), error.message()));
                    for skipped in &planned[position + 1..] {
                        results.push(skipped.failed(
                            NOT_EXECUTED,
                            format!("Not executed: operation {} failed", operation.index),
                        ));
                    }
                    return Ok(TxOutcome::Rollback(summarize(BatchMode::Atomic, results, true, None)));
                }
            }
        }

        let token = ledger.record(tx, scope.owner_id, &batch_step(steps), scope.now)?;
        Ok(TxOutcome::Commit(summarize(BatchMode::Atomic, results, false, Some(token))))
    })
}

fn apply(conn: &Connection, scope: &RequestScope<'_>, operation: &PlannedOperation) -> AppResult<Change<Task>> {
    match operation.action {
        BatchAction::Create => {
            let text = string_field(&operation.payload, &["input_text", "inputText"]);
            match text {
                Some(text) => tasks::create_task_from_text(conn, scope, text).map(|(change, _)| change),
                None => tasks::create_task(conn, scope, payload_as::<CreateTaskRequest>(operation)?),
            }
        }
        BatchAction::Update => {
            tasks::update_task(conn, scope, operation.target()?, payload_as::<UpdateTaskRequest>(operation)?)
        }
        BatchAction::Delete => tasks::delete_task(conn, scope, operation.target()?),
        BatchAction::Complete => tasks::set_task_status(conn, scope, operation.target()?, TaskStatus::Completed),
        BatchAction::Reopen => tasks::set_task_status(conn, scope, operation.target()?, TaskStatus::Pending),
        BatchAction::Reschedule => {
            let due_date = string_field(&operation.payload, &["due_date", "dueDate"]).ok_or_else(|| {
                AppError::Validation(format!("Operation {}: reschedule requires due_date", operation.index))
            })?;
            let due_time = match string_field(&operation.payload, &["due_time", "dueTime"]) {
                Some(raw) => Some(parse_clock(raw)?),
                None => None,
            };
            tasks::reschedule_task(conn, scope, operation.target()?, due_date, due_time)
        }
        BatchAction::Move => {
            let project_id = string_field(&operation.payload, &["project_id", "projectId"]);
            tasks::move_task(conn, scope, operation.target()?, project_id)
        }
    }
}

fn batch_step(steps: Vec<UndoStep>) -> UndoStep {
    UndoStep::new(
        EntityType::Batch,
        Uuid::new_v4().to_string(),
        UndoOperation::Batch,
        UndoSnapshot::Batch { steps },
    )
}

fn summarize(
    mode: BatchMode,
    results: Vec<BatchOperationResult>,
    rolled_back: bool,
    undo_token: Option<String>,
) -> BatchResult {
    let successful_operations = results.iter().filter(|result| result.success).count();
    let failed_operations = results.len() - successful_operations;
    BatchResult {
        mode,
        total_operations: results.len(),
        successful_operations,
        failed_operations,
        overall_success: failed_operations == 0 && !rolled_back,
        rolled_back,
        results,
        undo_token,
    }
}

fn payload_as<T: DeserializeOwned>(operation: &PlannedOperation) -> AppResult<T> {
    serde_json::from_value(Value::Object(operation.payload.clone())).map_err(|error| {
        AppError::Validation(format!(
            "Operation {}: invalid {} payload: {}",
            operation.index,
            operation.action.as_str(),
            error
        ))
    })
}

fn string_field<'a>(payload: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
}

fn parse_clock(raw: &str) -> AppResult<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| AppError::Validation(format!("Invalid time '{}' (expected HH:MM)", raw)))
}
