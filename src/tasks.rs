use crate::dates::{resolve_exact, ResolvedDate};
use crate::db;
use crate::errors::{AppError, AppResult};
use crate::models::{
    CreateTaskRequest, EntityType, ListTasksFilter, ParsedCommand, Recurrence, RequestScope, Task, TaskStatus,
    UndoOperation, UpdateTaskRequest, MAX_PRIORITY,
};
use crate::parser::{parse_command, ParseContext};
use crate::projects::required_project;
use crate::tags::required_tag;
use crate::undo::{Change, UndoSnapshot, UndoStep};
use chrono::{Days, Months, NaiveDate, NaiveTime};
use rusqlite::Connection;
use uuid::Uuid;

pub const MAX_TITLE_LEN: usize = 500;

pub fn create_task(conn: &Connection, scope: &RequestScope<'_>, request: CreateTaskRequest) -> AppResult<Change<Task>> {
    let title = validate_title(&request.title)?;
    let priority = validate_priority(request.priority.unwrap_or(scope.settings.default_priority))?;

    let (due_date, due_time) = match request.due_date.as_deref().map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => {
            let resolved = resolve_due(raw, scope)?;
            (Some(resolved.date), request.due_time.or(resolved.time))
        }
        None if request.due_time.is_some() => {
            return Err(AppError::Validation("dueTime requires dueDate".to_string()));
        }
        None => (None, None),
    };

    let project_id = match request.project_id.as_deref() {
        Some(project_id) => Some(active_project_id(conn, scope, project_id)?),
        None => None,
    };
    let tag_ids = checked_tag_ids(conn, scope, &request.tag_ids)?;

    let task = Task {
        id: Uuid::new_v4().to_string(),
        owner_id: scope.owner_id.to_string(),
        title,
        description: normalize_description(request.description),
        status: TaskStatus::Pending,
        priority,
        due_date,
        due_time,
        project_id,
        tag_ids,
        recurrence: request.recurrence,
        spawned_from_id: None,
        completed_at: None,
        deleted_at: None,
        created_at: scope.now,
        updated_at: scope.now,
        revision: 1,
    };
    db::insert_task(conn, &task)?;
    tracing::info!(owner_id = %scope.owner_id, task_id = %task.id, "created task");

    let step = UndoStep::new(
        EntityType::Task,
        &task.id,
        UndoOperation::Create,
        UndoSnapshot::TaskCreated { task_id: task.id.clone() },
    );
    Ok(Change { entity: task, step })
}

/// Parses `input` and creates a task from the result. Tags referenced in the
/// text are created on the way, so callers run this inside a transaction.
pub fn create_task_from_text(
    conn: &Connection,
    scope: &RequestScope<'_>,
    input: &str,
) -> AppResult<(Change<Task>, ParsedCommand)> {
    let parsed = parse_command(
        conn,
        &ParseContext {
            owner_id: scope.owner_id,
            today: scope.today(),
            default_tag_color: &scope.settings.default_tag_color,
        },
        input,
    )?;
    if parsed.title.is_empty() {
        return Err(AppError::Validation("Title is required".to_string()));
    }

    let request = CreateTaskRequest {
        title: parsed.title.clone(),
        description: None,
        priority: parsed.priority,
        due_date: parsed.due_date.map(|date| date.format("%Y-%m-%d").to_string()),
        due_time: parsed.due_time,
        project_id: parsed.project.as_ref().map(|project| project.id.clone()),
        tag_ids: parsed.tags.iter().map(|tag| tag.id.clone()).collect(),
        recurrence: None,
    };
    let change = create_task(conn, scope, request)?;
    Ok((change, parsed))
}

pub fn update_task(
    conn: &Connection,
    scope: &RequestScope<'_>,
    task_id: &str,
    request: UpdateTaskRequest,
) -> AppResult<Change<Task>> {
    let before = required_task(conn, scope.owner_id, task_id)?;
    let mut task = before.clone();

    if let Some(title) = request.title {
        task.title = validate_title(&title)?;
    }
    if let Some(description) = request.description {
        task.description = normalize_description(Some(description));
    }
    if let Some(priority) = request.priority {
        task.priority = validate_priority(priority)?;
    }
    if let Some(raw) = request.due_date {
        let raw = raw.trim();
        if raw.is_empty() {
            task.due_date = None;
            task.due_time = None;
        } else {
            let resolved = resolve_due(raw, scope)?;
            task.due_date = Some(resolved.date);
            task.due_time = resolved.time.or(task.due_time);
        }
    }
    if let Some(due_time) = request.due_time {
        if task.due_date.is_none() {
            return Err(AppError::Validation("dueTime requires dueDate".to_string()));
        }
        task.due_time = Some(due_time);
    }
    if let Some(project_id) = request.project_id {
        task.project_id = match project_id.trim() {
            "" => None,
            project_id => Some(active_project_id(conn, scope, project_id)?),
        };
    }
    if let Some(tag_ids) = request.tag_ids {
        task.tag_ids = checked_tag_ids(conn, scope, &tag_ids)?;
    }
    if let Some(recurrence) = request.recurrence {
        task.recurrence = Some(recurrence);
    }

    commit_state(conn, scope, before, task, UndoOperation::Update, None)
}

pub fn delete_task(conn: &Connection, scope: &RequestScope<'_>, task_id: &str) -> AppResult<Change<Task>> {
    let before = required_task(conn, scope.owner_id, task_id)?;
    let mut task = before.clone();
    task.deleted_at = Some(scope.now);
    commit_state(conn, scope, before, task, UndoOperation::Delete, None)
}

/// Moves a task between statuses. Completing a recurring task spawns its next
/// occurrence; the snapshot remembers it so an undo can retire it again.
pub fn set_task_status(
    conn: &Connection,
    scope: &RequestScope<'_>,
    task_id: &str,
    status: TaskStatus,
) -> AppResult<Change<Task>> {
    let before = required_task(conn, scope.owner_id, task_id)?;
    if before.status == status {
        return Err(AppError::Validation(format!("Task is already {}", status.as_str())));
    }

    let mut task = before.clone();
    task.status = status;
    let mut spawned_task_id = None;
    if status == TaskStatus::Completed {
        task.completed_at = Some(scope.now);
        if let Some(recurrence) = task.recurrence {
            let follow_up = spawn_follow_up(conn, scope, &task, recurrence)?;
            spawned_task_id = Some(follow_up.id);
        }
    } else {
        task.completed_at = None;
    }

    commit_state(conn, scope, before, task, UndoOperation::StatusChange, spawned_task_id)
}

/// Sets a new due date from an ISO date or a date phrase. Without an explicit
/// or spoken time the existing time of day is kept.
pub fn reschedule_task(
    conn: &Connection,
    scope: &RequestScope<'_>,
    task_id: &str,
    due_date: &str,
    due_time: Option<NaiveTime>,
) -> AppResult<Change<Task>> {
    let before = required_task(conn, scope.owner_id, task_id)?;
    let raw = due_date.trim();
    if raw.is_empty() {
        return Err(AppError::Validation("due_date is required".to_string()));
    }
    let resolved = resolve_due(raw, scope)?;

    let mut task = before.clone();
    task.due_date = Some(resolved.date);
    task.due_time = due_time.or(resolved.time).or(before.due_time);
    commit_state(conn, scope, before, task, UndoOperation::Reschedule, None)
}

/// Moves a task into `project_id`, or out of any project when `None`.
pub fn move_task(
    conn: &Connection,
    scope: &RequestScope<'_>,
    task_id: &str,
    project_id: Option<&str>,
) -> AppResult<Change<Task>> {
    let before = required_task(conn, scope.owner_id, task_id)?;
    let mut task = before.clone();
    task.project_id = match project_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(project_id) => Some(active_project_id(conn, scope, project_id)?),
        None => None,
    };
    commit_state(conn, scope, before, task, UndoOperation::Move, None)
}

pub fn get_task(conn: &Connection, owner_id: &str, task_id: &str) -> AppResult<Task> {
    required_task(conn, owner_id, task_id)
}

pub fn list_tasks(conn: &Connection, owner_id: &str, filter: &ListTasksFilter) -> AppResult<Vec<Task>> {
    db::list_tasks(conn, owner_id, filter)
}

/// Due date one `recurrence` interval after `from`.
pub fn next_due(from: NaiveDate, recurrence: Recurrence) -> Option<NaiveDate> {
    match recurrence {
        Recurrence::Daily => from.checked_add_days(Days::new(1)),
        Recurrence::Weekly => from.checked_add_days(Days::new(7)),
        Recurrence::Monthly => from.checked_add_months(Months::new(1)),
        Recurrence::Yearly => from.checked_add_months(Months::new(12)),
    }
}

fn spawn_follow_up(conn: &Connection, scope: &RequestScope<'_>, task: &Task, recurrence: Recurrence) -> AppResult<Task> {
    let base = task.due_date.unwrap_or_else(|| scope.today());
    let due_date = next_due(base, recurrence)
        .ok_or_else(|| AppError::Validation(format!("Cannot schedule the next {} occurrence", recurrence.as_str())))?;

    let follow_up = Task {
        id: Uuid::new_v4().to_string(),
        owner_id: task.owner_id.clone(),
        title: task.title.clone(),
        description: task.description.clone(),
        status: TaskStatus::Pending,
        priority: task.priority,
        due_date: Some(due_date),
        due_time: task.due_time,
        project_id: task.project_id.clone(),
        tag_ids: task.tag_ids.clone(),
        recurrence: Some(recurrence),
        spawned_from_id: Some(task.id.clone()),
        completed_at: None,
        deleted_at: None,
        created_at: scope.now,
        updated_at: scope.now,
        revision: 1,
    };
    db::insert_task(conn, &follow_up)?;
    tracing::info!(
        task_id = %task.id,
        follow_up_id = %follow_up.id,
        due_date = %due_date,
        "spawned recurring follow-up"
    );
    Ok(follow_up)
}

fn commit_state(
    conn: &Connection,
    scope: &RequestScope<'_>,
    before: Task,
    mut task: Task,
    operation: UndoOperation,
    spawned_task_id: Option<String>,
) -> AppResult<Change<Task>> {
    task.revision = before.revision + 1;
    task.updated_at = scope.now;
    db::write_task(conn, &task)?;
    tracing::debug!(
        task_id = %task.id,
        revision = task.revision,
        operation = operation.as_str(),
        "task updated"
    );

    let snapshot = UndoSnapshot::task_state(before, &task, spawned_task_id)?;
    let step = UndoStep::new(EntityType::Task, &task.id, operation, snapshot);
    Ok(Change { entity: task, step })
}

pub fn required_task(conn: &Connection, owner_id: &str, task_id: &str) -> AppResult<Task> {
    db::find_task(conn, owner_id, task_id, false)?.ok_or_else(|| AppError::not_found("Task", task_id))
}

fn resolve_due(raw: &str, scope: &RequestScope<'_>) -> AppResult<ResolvedDate> {
    resolve_exact(raw, scope.today())
        .ok_or_else(|| AppError::Validation(format!("Could not understand date '{}'", raw)))
}

fn active_project_id(conn: &Connection, scope: &RequestScope<'_>, project_id: &str) -> AppResult<String> {
    let project = required_project(conn, scope.owner_id, project_id)?;
    if project.archived_at.is_some() {
        return Err(AppError::Validation(format!("Project '{}' is archived", project.name)));
    }
    Ok(project.id)
}

fn checked_tag_ids(conn: &Connection, scope: &RequestScope<'_>, tag_ids: &[String]) -> AppResult<Vec<String>> {
    let mut checked: Vec<String> = Vec::with_capacity(tag_ids.len());
    for tag_id in tag_ids {
        let tag = required_tag(conn, scope.owner_id, tag_id)?;
        if !checked.contains(&tag.id) {
            checked.push(tag.id);
        }
    }
    Ok(checked)
}

fn validate_title(raw: &str) -> AppResult<String> {
    let title = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        return Err(AppError::Validation("Title is required".to_string()));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(AppError::Validation(format!("Title must be at most {} characters", MAX_TITLE_LEN)));
    }
    Ok(title)
}

fn validate_priority(priority: u8) -> AppResult<u8> {
    if priority > MAX_PRIORITY {
        return Err(AppError::Validation(format!(
            "Priority must be between 0 and {}",
            MAX_PRIORITY
        )));
    }
    Ok(priority)
}

fn normalize_description(description: Option<String>) -> Option<String> {
    description
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
