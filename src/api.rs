use crate::engine::Engine;
use crate::errors::{AppError, AppResult};
use crate::models::{
    BatchRequest, Caller, CreateProjectRequest, CreateTagRequest, CreateTaskRequest, EntityType, ListTasksFilter,
    Mutation, TaskStatus, UpdateProjectRequest, UpdateTagRequest, UpdateTaskRequest,
};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every operation the engine answers, tagged by `op`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ApiRequest {
    Parse {
        #[serde(alias = "text")]
        input: String,
    },
    CreateTask {
        #[serde(default, alias = "input_text")]
        input_text: Option<String>,
        #[serde(default, alias = "parse_natural_language")]
        parse_natural_language: bool,
        #[serde(flatten)]
        fields: CreateTaskRequest,
    },
    UpdateTask {
        id: String,
        #[serde(flatten)]
        patch: UpdateTaskRequest,
    },
    DeleteTask {
        id: String,
    },
    SetTaskStatus {
        id: String,
        status: TaskStatus,
    },
    CompleteTask {
        id: String,
    },
    ReopenTask {
        id: String,
    },
    MoveTask {
        id: String,
        #[serde(default, alias = "project_id")]
        project_id: Option<String>,
    },
    RescheduleTask {
        id: String,
        #[serde(alias = "due_date")]
        due_date: String,
        #[serde(default, alias = "due_time")]
        due_time: Option<NaiveTime>,
    },
    GetTask {
        id: String,
    },
    ListTasks {
        #[serde(flatten)]
        filter: ListTasksFilter,
    },
    CreateProject {
        #[serde(flatten)]
        request: CreateProjectRequest,
    },
    UpdateProject {
        id: String,
        #[serde(flatten)]
        patch: UpdateProjectRequest,
    },
    ArchiveProject {
        id: String,
    },
    UnarchiveProject {
        id: String,
    },
    DeleteProject {
        id: String,
    },
    ListProjects {
        #[serde(default)]
        include_archived: bool,
    },
    CreateTag {
        #[serde(flatten)]
        request: CreateTagRequest,
    },
    UpdateTag {
        id: String,
        #[serde(flatten)]
        patch: UpdateTagRequest,
    },
    DeleteTag {
        id: String,
    },
    ListTags {},
    Batch {
        #[serde(flatten)]
        request: BatchRequest,
    },
    Undo {
        token: String,
    },
    UndoResource {
        resource: String,
        token: String,
    },
    GetSettings {},
    UpdateSettings {
        #[serde(default)]
        patch: Value,
    },
}

impl ApiRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse",
            Self::CreateTask { .. } => "createTask",
            Self::UpdateTask { .. } => "updateTask",
            Self::DeleteTask { .. } => "deleteTask",
            Self::SetTaskStatus { .. } => "setTaskStatus",
            Self::CompleteTask { .. } => "completeTask",
            Self::ReopenTask { .. } => "reopenTask",
            Self::MoveTask { .. } => "moveTask",
            Self::RescheduleTask { .. } => "rescheduleTask",
            Self::GetTask { .. } => "getTask",
            Self::ListTasks { .. } => "listTasks",
            Self::CreateProject { .. } => "createProject",
            Self::UpdateProject { .. } => "updateProject",
            Self::ArchiveProject { .. } => "archiveProject",
            Self::UnarchiveProject { .. } => "unarchiveProject",
            Self::DeleteProject { .. } => "deleteProject",
            Self::ListProjects { .. } => "listProjects",
            Self::CreateTag { .. } => "createTag",
            Self::UpdateTag { .. } => "updateTag",
            Self::DeleteTag { .. } => "deleteTag",
            Self::ListTags {} => "listTags",
            Self::Batch { .. } => "batch",
            Self::Undo { .. } => "undo",
            Self::UndoResource { .. } => "undoResource",
            Self::GetSettings {} => "getSettings",
            Self::UpdateSettings { .. } => "updateSettings",
        }
    }
}

/// One request on the wire: who is asking, and what.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCall {
    pub user_id: String,
    pub request: ApiRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub undo_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub status: u16,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ApiErrorBody>,
    pub meta: ResponseMeta,
}

impl ApiResponse {
    fn ok(status: u16, data: Value, undo_token: Option<String>) -> Self {
        Self {
            status,
            success: true,
            data: Some(data),
            error: None,
            meta: ResponseMeta { op: None, undo_token },
        }
    }

    pub fn from_error(error: &AppError) -> Self {
        Self {
            status: error.status(),
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                code: error.code().to_string(),
                message: error.message(),
                details: error.details(),
            }),
            meta: ResponseMeta::default(),
        }
    }
}

/// Parses one JSON line into an [`ApiCall`] and answers it. Malformed input
/// becomes a `VALIDATION_ERROR` envelope.
pub fn handle_json(engine: &Engine, raw: &str) -> ApiResponse {
    match serde_json::from_str::<ApiCall>(raw) {
        Ok(call) => dispatch(engine, &Caller::new(call.user_id), call.request),
        Err(error) => ApiResponse::from_error(&AppError::Validation(format!("malformed request: {}", error))),
    }
}

pub fn dispatch(engine: &Engine, caller: &Caller, request: ApiRequest) -> ApiResponse {
    let op = request.name();
    let mut response = match route(engine, caller, request) {
        Ok(response) => response,
        Err(error) => {
            if error.status() >= 500 {
                tracing::error!(op, user_id = %caller.user_id, error = %error, "request failed");
            } else {
                tracing::debug!(op, user_id = %caller.user_id, error = %error, "request rejected");
            }
            ApiResponse::from_error(&error)
        }
    };
    response.meta.op = Some(op.to_string());
    response
}

fn route(engine: &Engine, caller: &Caller, request: ApiRequest) -> AppResult<ApiResponse> {
    match request {
        ApiRequest::Parse { input } => Ok(ApiResponse::ok(200, to_value(engine.parse(caller, &input)?)?, None)),
        ApiRequest::CreateTask {
            input_text,
            parse_natural_language,
            fields,
        } => {
            let natural = input_text
                .as_deref()
                .map(str::trim)
                .filter(|text| !text.is_empty() && (parse_natural_language || fields.title.trim().is_empty()));
            let created = match natural {
                Some(text) => engine.create_task_from_text(caller, text)?,
                None => engine.create_task(caller, fields)?,
            };
            let undo_token = created.undo_token.clone();
            Ok(ApiResponse::ok(201, to_value(&created)?, Some(undo_token)))
        }
        ApiRequest::UpdateTask { id, patch } => mutation(200, engine.update_task(caller, &id, patch)?),
        ApiRequest::DeleteTask { id } => mutation(200, engine.delete_task(caller, &id)?),
        ApiRequest::SetTaskStatus { id, status } => mutation(200, engine.set_task_status(caller, &id, status)?),
        ApiRequest::CompleteTask { id } => mutation(200, engine.complete_task(caller, &id)?),
        ApiRequest::ReopenTask { id } => mutation(200, engine.reopen_task(caller, &id)?),
        ApiRequest::MoveTask { id, project_id } => {
            mutation(200, engine.move_task(caller, &id, project_id.as_deref())?)
        }
        ApiRequest::RescheduleTask { id, due_date, due_time } => {
            mutation(200, engine.reschedule_task(caller, &id, &due_date, due_time)?)
        }
        ApiRequest::GetTask { id } => Ok(ApiResponse::ok(200, to_value(engine.get_task(caller, &id)?)?, None)),
        ApiRequest::ListTasks { filter } => {
            Ok(ApiResponse::ok(200, to_value(engine.list_tasks(caller, &filter)?)?, None))
        }
        ApiRequest::CreateProject { request } => mutation(201, engine.create_project(caller, request)?),
        ApiRequest::UpdateProject { id, patch } => mutation(200, engine.update_project(caller, &id, patch)?),
        ApiRequest::ArchiveProject { id } => mutation(200, engine.archive_project(caller, &id)?),
        ApiRequest::UnarchiveProject { id } => mutation(200, engine.unarchive_project(caller, &id)?),
        ApiRequest::DeleteProject { id } => mutation(200, engine.delete_project(caller, &id)?),
        ApiRequest::ListProjects { include_archived } => Ok(ApiResponse::ok(
            200,
            to_value(engine.list_projects(caller, include_archived)?)?,
            None,
        )),
        ApiRequest::CreateTag { request } => mutation(201, engine.create_tag(caller, request)?),
        ApiRequest::UpdateTag { id, patch } => mutation(200, engine.update_tag(caller, &id, patch)?),
        ApiRequest::DeleteTag { id } => mutation(200, engine.delete_tag(caller, &id)?),
        ApiRequest::ListTags {} => Ok(ApiResponse::ok(200, to_value(engine.list_tags(caller)?)?, None)),
        ApiRequest::Batch { request } => {
            let result = engine.batch(caller, request)?;
            let status = if result.failed_operations > 0 { 207 } else { 200 };
            let undo_token = result.undo_token.clone();
            Ok(ApiResponse::ok(status, to_value(&result)?, undo_token))
        }
        ApiRequest::Undo { token } => Ok(ApiResponse::ok(200, to_value(engine.undo(caller, &token)?)?, None)),
        ApiRequest::UndoResource { resource, token } => {
            let entity_type = EntityType::parse(&resource)
                .filter(|entity_type| *entity_type != EntityType::Batch)
                .ok_or_else(|| AppError::Validation(format!("Unknown undo resource '{}'", resource)))?;
            let restored = to_value(engine.undo_resource(caller, entity_type, &token)?)?;
            let entity = restored.get("entity").cloned().unwrap_or(Value::Null);
            Ok(ApiResponse::ok(200, entity, None))
        }
        ApiRequest::GetSettings {} => Ok(ApiResponse::ok(200, to_value(engine.settings()?)?, None)),
        ApiRequest::UpdateSettings { patch } => {
            if !patch.is_object() {
                return Err(AppError::Validation("settings patch must be an object".to_string()));
            }
            Ok(ApiResponse::ok(200, to_value(engine.update_settings(patch)?)?, None))
        }
    }
}

fn mutation<T: Serialize>(status: u16, mutation: Mutation<T>) -> AppResult<ApiResponse> {
    Ok(ApiResponse::ok(status, to_value(&mutation.entity)?, Some(mutation.undo_token)))
}

fn to_value<T: Serialize>(value: T) -> AppResult<Value> {
    serde_json::to_value(value).map_err(AppError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn engine() -> (tempfile::TempDir, Arc<Engine>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::new(&dir.path().join("api.db")).expect("engine");
        (dir, engine)
    }

    fn call(engine: &Engine, user: &str, request: Value) -> ApiResponse {
        handle_json(engine, &json!({"userId": user, "request": request}).to_string())
    }

    #[test]
    fn parse_accepts_text_alias() {
        let (_dir, engine) = engine();
        let response = call(&engine, "alice", json!({"op": "parse", "text": "Buy milk tomorrow p2"}));
        assert_eq!(response.status, 200);
        let data = response.data.expect("data");
        assert_eq!(data["title"], "Buy milk");
        assert_eq!(data["priority"], 2);
        assert_eq!(data["has_time"], false);
        assert_eq!(data["highlights"][0]["type"], "date");
    }

    #[test]
    fn mutations_put_undo_token_in_meta() {
        let (_dir, engine) = engine();
        let created = call(
            &engine,
            "alice",
            json!({"op": "createTask", "input_text": "Call mom @family p1", "parse_natural_language": true}),
        );
        assert_eq!(created.status, 201);
        assert!(created.success);
        let data = created.data.expect("data");
        assert_eq!(data["task"]["title"], "Call mom");
        assert_eq!(data["task"]["priority"], 1);
        assert!(data["parseResult"]["warnings"].as_array().expect("warnings").is_empty());
        assert!(data.get("undoToken").is_none());
        let token = created.meta.undo_token.expect("undo token");

        let undone = call(&engine, "alice", json!({"op": "undo", "token": token}));
        assert_eq!(undone.status, 200);
        assert_eq!(undone.data.expect("data")["entityType"], "task");

        let replay = call(&engine, "alice", json!({"op": "undo", "token": token}));
        assert_eq!(replay.status, 400);
        assert_eq!(replay.error.expect("error").code, "INVALID_UNDO_TOKEN");
    }

    #[test]
    fn unknown_ops_and_missing_fields_are_validation_errors() {
        let (_dir, engine) = engine();
        for request in [json!({"op": "explode"}), json!({"op": "getTask"}), json!("nope")] {
            let response = call(&engine, "alice", request);
            assert_eq!(response.status, 400);
            assert_eq!(response.error.expect("error").code, "VALIDATION_ERROR");
        }
    }

    #[test]
    fn batch_with_failures_reports_multi_status() {
        let (_dir, engine) = engine();
        let response = call(
            &engine,
            "alice",
            json!({"op": "batch", "operations": [
                {"action": "create", "payload": {"title": "One"}},
                {"action": "complete", "taskId": "missing"}
            ]}),
        );
        assert_eq!(response.status, 207);
        let data = response.data.expect("data");
        assert_eq!(data["successfulOperations"], 1);
        assert_eq!(data["failedOperations"], 1);
        assert!(data.get("undoToken").is_none());
        assert!(response.meta.undo_token.is_some());
    }

    #[test]
    fn oversized_batch_carries_reason() {
        let (_dir, engine) = engine();
        let operations: Vec<Value> = (0..101)
            .map(|i| json!({"action": "create", "payload": {"title": format!("Task {i}")}}))
            .collect();
        let response = call(&engine, "alice", json!({"op": "batch", "operations": operations}));
        assert_eq!(response.status, 400);
        let error = response.error.expect("error");
        assert_eq!(error.code, "VALIDATION_ERROR");
        assert_eq!(error.details.expect("details")["reason"], "BATCH_SIZE_LIMIT_EXCEEDED");
    }

    #[test]
    fn not_found_maps_to_404() {
        let (_dir, engine) = engine();
        let response = call(&engine, "alice", json!({"op": "getTask", "id": "nope"}));
        assert_eq!(response.status, 404);
        assert_eq!(response.meta.op.as_deref(), Some("getTask"));
    }
}
