use crate::errors::{AppError, AppResult};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

static HEX_COLOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#[0-9A-Fa-f]{6}$").expect("valid color regex"));

/// Identity of the user issuing a request. Every owner-scoped call takes one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caller {
    pub user_id: String,
}

impl Caller {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Recurrence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "yearly" => Some(Self::Yearly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
    Project,
    Tag,
    Batch,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Project => "project",
            Self::Tag => "tag",
            Self::Batch => "batch",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "task" | "tasks" => Some(Self::Task),
            "project" | "projects" => Some(Self::Project),
            "tag" | "tags" => Some(Self::Tag),
            "batch" => Some(Self::Batch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UndoOperation {
    Create,
    Update,
    Delete,
    Archive,
    Unarchive,
    StatusChange,
    Reschedule,
    Move,
    Batch,
}

impl UndoOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Archive => "archive",
            Self::Unarchive => "unarchive",
            Self::StatusChange => "statusChange",
            Self::Reschedule => "reschedule",
            Self::Move => "move",
            Self::Batch => "batch",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "archive" => Some(Self::Archive),
            "unarchive" => Some(Self::Unarchive),
            "statusChange" => Some(Self::StatusChange),
            "reschedule" => Some(Self::Reschedule),
            "move" => Some(Self::Move),
            "batch" => Some(Self::Batch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: u8,
    pub due_date: Option<NaiveDate>,
    pub due_time: Option<NaiveTime>,
    pub project_id: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
    pub recurrence: Option<Recurrence>,
    pub spawned_from_id: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: i64,
}

impl Task {
    /// A follow-up nobody has touched since it was spawned.
    pub fn is_pristine(&self) -> bool {
        self.revision == 1 && self.status == TaskStatus::Pending && self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub color: String,
    pub archived_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub color: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/* ----------------------------- Command parsing ----------------------------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub id: String,
    pub name: String,
    pub full_path: String,
    pub color: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HighlightKind {
    Date,
    Project,
    Tag,
    Priority,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Highlight {
    #[serde(rename = "type")]
    pub kind: HighlightKind,
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub value: Option<String>,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ParsedCommand {
    pub title: String,
    pub due_date: Option<NaiveDate>,
    pub due_time: Option<NaiveTime>,
    pub has_time: bool,
    pub project: Option<EntityRef>,
    pub tags: Vec<EntityRef>,
    pub priority: Option<u8>,
    pub highlights: Vec<Highlight>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseSummary {
    pub warnings: Vec<String>,
    pub highlights: Vec<Highlight>,
}

/* ------------------------------ Task requests ------------------------------ */

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    #[serde(default)]
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<u8>,
    /// ISO date or a natural-language phrase.
    pub due_date: Option<String>,
    pub due_time: Option<NaiveTime>,
    pub project_id: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
    pub recurrence: Option<Recurrence>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<u8>,
    pub due_date: Option<String>,
    pub due_time: Option<NaiveTime>,
    pub project_id: Option<String>,
    pub tag_ids: Option<Vec<String>>,
    pub recurrence: Option<Recurrence>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksFilter {
    pub status: Option<TaskStatus>,
    pub project_id: Option<String>,
    pub tag_id: Option<String>,
    pub due_on: Option<NaiveDate>,
    pub due_before: Option<NaiveDate>,
    pub due_after: Option<NaiveDate>,
    /// Drops completed tasks; with `due_before = today` this is the overdue view.
    #[serde(default)]
    pub exclude_completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTask {
    pub task: Task,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_result: Option<ParseSummary>,
    #[serde(skip_serializing)]
    pub undo_token: String,
}

/// The entity produced by a mutation together with the token that reverses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation<T> {
    pub entity: T,
    pub undo_token: String,
}

/* ---------------------------- Project/tag requests ---------------------------- */

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub name: String,
    pub parent_id: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTagRequest {
    pub name: String,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTagRequest {
    pub name: Option<String>,
    pub color: Option<String>,
}

/* ---------------------------------- Batch ---------------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    #[default]
    Partial,
    Atomic,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperation {
    pub action: String,
    #[serde(alias = "taskId")]
    pub target_id: Option<String>,
    #[serde(default, alias = "data")]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub operations: Vec<BatchOperation>,
    #[serde(default)]
    pub atomic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperationResult {
    pub index: usize,
    pub success: bool,
    pub action: String,
    pub target_id: Option<String>,
    pub produced_id: Option<String>,
    pub error_code: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub mode: BatchMode,
    pub total_operations: usize,
    pub successful_operations: usize,
    pub failed_operations: usize,
    pub overall_success: bool,
    pub rolled_back: bool,
    pub results: Vec<BatchOperationResult>,
    #[serde(skip_serializing)]
    pub undo_token: Option<String>,
}

/* ----------------------------------- Undo ----------------------------------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entityType", content = "entity", rename_all = "snake_case")]
pub enum RestoredEntity {
    Task(Task),
    Project(Project),
    Tag(Tag),
    Batch(Vec<RestoredEntity>),
}

impl RestoredEntity {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Task(_) => EntityType::Task,
            Self::Project(_) => EntityType::Project,
            Self::Tag(_) => EntityType::Tag,
            Self::Batch(_) => EntityType::Batch,
        }
    }
}

/* --------------------------------- Settings --------------------------------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub undo_ttl_seconds: u64,
    pub max_batch_operations: usize,
    pub default_priority: u8,
    pub default_tag_color: String,
    pub default_project_color: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            undo_ttl_seconds: 60,
            max_batch_operations: 100,
            default_priority: 3,
            default_tag_color: "#808080".to_string(),
            default_project_color: "#4A90D9".to_string(),
        }
    }
}

pub const MAX_PRIORITY: u8 = 4;

/// Owner, clock and settings shared by every mutation within one request.
#[derive(Debug, Clone, Copy)]
pub struct RequestScope<'a> {
    pub owner_id: &'a str,
    pub now: DateTime<Utc>,
    pub settings: &'a EngineSettings,
}

impl RequestScope<'_> {
    pub fn today(&self) -> NaiveDate {
        self.now.date_naive()
    }
}

/// `#RRGGBB`, upper-cased; falls back to `default` when absent.
pub fn normalize_color(raw: Option<&str>, default: &str) -> AppResult<String> {
    let color = raw.map(str::trim).filter(|value| !value.is_empty()).unwrap_or(default);
    if !HEX_COLOR.is_match(color) {
        return Err(AppError::Validation(format!("Color '{}' must look like #RRGGBB", color)));
    }
    Ok(color.to_ascii_uppercase())
}
