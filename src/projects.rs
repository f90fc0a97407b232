use crate::db;
use crate::errors::{AppError, AppResult};
use crate::models::{
    normalize_color, CreateProjectRequest, EntityType, Project, RequestScope, UndoOperation, UpdateProjectRequest,
};
use crate::undo::{Change, UndoSnapshot, UndoStep};
use rusqlite::Connection;
use uuid::Uuid;

pub const MAX_PROJECT_NAME_LEN: usize = 100;

pub fn create_project(
    conn: &Connection,
    scope: &RequestScope<'_>,
    request: CreateProjectRequest,
) -> AppResult<Change<Project>> {
    let name = validate_name(&request.name)?;
    let parent_id = match request.parent_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
        Some(parent_id) => Some(required_project(conn, scope.owner_id, parent_id)?.id),
        None => None,
    };
    ensure_unique_sibling(conn, scope.owner_id, parent_id.as_deref(), &name, None)?;

    let project = Project {
        id: Uuid::new_v4().to_string(),
        owner_id: scope.owner_id.to_string(),
        name,
        parent_id,
        color: normalize_color(request.color.as_deref(), &scope.settings.default_project_color)?,
        archived_at: None,
        deleted_at: None,
        created_at: scope.now,
        updated_at: scope.now,
    };
    db::insert_project(conn, &project)?;

    let step = UndoStep::new(
        EntityType::Project,
        &project.id,
        UndoOperation::Create,
        UndoSnapshot::ProjectCreated {
            project_id: project.id.clone(),
        },
    );
    Ok(Change { entity: project, step })
}

pub fn update_project(
    conn: &Connection,
    scope: &RequestScope<'_>,
    project_id: &str,
    request: UpdateProjectRequest,
) -> AppResult<Change<Project>> {
    let before = required_project(conn, scope.owner_id, project_id)?;
    let mut project = before.clone();

    if let Some(name) = request.name {
        let name = validate_name(&name)?;
        ensure_unique_sibling(conn, scope.owner_id, project.parent_id.as_deref(), &name, Some(&project.id))?;
        project.name = name;
    }
    if let Some(color) = request.color {
        project.color = normalize_color(Some(&color), &scope.settings.default_project_color)?;
    }

    commit_state(conn, scope, before, project, UndoOperation::Update)
}

pub fn archive_project(conn: &Connection, scope: &RequestScope<'_>, project_id: &str) -> AppResult<Change<Project>> {
    let before = required_project(conn, scope.owner_id, project_id)?;
    if before.archived_at.is_some() {
        return Err(AppError::Validation(format!("Project '{}' is already archived", before.name)));
    }
    let mut project = before.clone();
    project.archived_at = Some(scope.now);
    commit_state(conn, scope, before, project, UndoOperation::Archive)
}

pub fn unarchive_project(conn: &Connection, scope: &RequestScope<'_>, project_id: &str) -> AppResult<Change<Project>> {
    let before = required_project(conn, scope.owner_id, project_id)?;
    if before.archived_at.is_none() {
        return Err(AppError::Validation(format!("Project '{}' is not archived", before.name)));
    }
    let mut project = before.clone();
    project.archived_at = None;
    commit_state(conn, scope, before, project, UndoOperation::Unarchive)
}

/// Soft delete. Refused while active sub-projects remain; tasks keep their link.
pub fn delete_project(conn: &Connection, scope: &RequestScope<'_>, project_id: &str) -> AppResult<Change<Project>> {
    let before = required_project(conn, scope.owner_id, project_id)?;
    let has_children = db::list_projects(conn, scope.owner_id, true)?
        .iter()
        .any(|project| project.parent_id.as_deref() == Some(before.id.as_str()));
    if has_children {
        return Err(AppError::Validation(format!(
            "Project '{}' still has sub-projects",
            before.name
        )));
    }
    let mut project = before.clone();
    project.deleted_at = Some(scope.now);
    commit_state(conn, scope, before, project, UndoOperation::Delete)
}

/// Owner-scoped lookup of a live (possibly archived) project.
pub fn required_project(conn: &Connection, owner_id: &str, project_id: &str) -> AppResult<Project> {
    db::find_project(conn, owner_id, project_id, false)?.ok_or_else(|| AppError::not_found("Project", project_id))
}

fn commit_state(
    conn: &Connection,
    scope: &RequestScope<'_>,
    before: Project,
    mut project: Project,
    operation: UndoOperation,
) -> AppResult<Change<Project>> {
    project.updated_at = scope.now;
    db::write_project(conn, &project)?;
    let snapshot = UndoSnapshot::project_state(before, &project)?;
    let step = UndoStep::new(EntityType::Project, &project.id, operation, snapshot);
    Ok(Change { entity: project, step })
}

fn validate_name(raw: &str) -> AppResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(AppError::Validation("Project name is required".to_string()));
    }
    if name.contains('/') {
        return Err(AppError::Validation("Project name cannot contain '/'".to_string()));
    }
    if name.chars().count() > MAX_PROJECT_NAME_LEN {
        return Err(AppError::Validation(format!(
            "Project name must be at most {} characters",
            MAX_PROJECT_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

fn ensure_unique_sibling(
    conn: &Connection,
    owner_id: &str,
    parent_id: Option<&str>,
    name: &str,
    except_id: Option<&str>,
) -> AppResult<()> {
    let wanted = name.to_lowercase();
    let clash = db::list_projects(conn, owner_id, true)?.into_iter().find(|project| {
        project.parent_id.as_deref() == parent_id
            && project.name.to_lowercase() == wanted
            && Some(project.id.as_str()) != except_id
    });
    match clash {
        Some(existing) => Err(AppError::Validation(format!("Project '{}' already exists", existing.name))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::EngineSettings;
    use chrono::Utc;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("projects.db")).expect("db");
        (dir, db)
    }

    fn create(db: &Database, scope: &RequestScope<'_>, name: &str, parent_id: Option<&str>) -> AppResult<Project> {
        db.with_conn(|conn| {
            create_project(
                conn,
                scope,
                CreateProjectRequest {
                    name: name.to_string(),
                    parent_id: parent_id.map(str::to_string),
                    color: None,
                },
            )
        })
        .map(|change| change.entity)
    }

    #[test]
    fn nested_projects_use_default_color() {
        let (_dir, db) = open();
        let settings = EngineSettings::default();
        let scope = RequestScope {
            owner_id: "alice",
            now: Utc::now(),
            settings: &settings,
        };
        let work = create(&db, &scope, "Work", None).expect("work");
        let meetings = create(&db, &scope, "Meetings", Some(&work.id)).expect("meetings");
        assert_eq!(meetings.parent_id.as_deref(), Some(work.id.as_str()));
        assert_eq!(meetings.color, "#4A90D9");

        assert!(create(&db, &scope, "a/b", None).is_err());
        assert!(create(&db, &scope, "work", None).is_err());
        assert!(create(&db, &scope, "Meetings", None).is_ok());
    }

    #[test]
    fn foreign_parent_is_not_found() {
        let (_dir, db) = open();
        let settings = EngineSettings::default();
        let alice = RequestScope {
            owner_id: "alice",
            now: Utc::now(),
            settings: &settings,
        };
        let bob = RequestScope { owner_id: "bob", ..alice };
        let work = create(&db, &alice, "Work", None).expect("work");
        let error = create(&db, &bob, "Sneaky", Some(&work.id)).expect_err("foreign parent");
        assert_eq!(error.code(), "NOT_FOUND");
    }

    #[test]
    fn archive_round_trip_and_delete_guard() {
        let (_dir, db) = open();
        let settings = EngineSettings::default();
        let scope = RequestScope {
            owner_id: "alice",
            now: Utc::now(),
            settings: &settings,
        };
        let work = create(&db, &scope, "Work", None).expect("work");
        create(&db, &scope, "Meetings", Some(&work.id)).expect("meetings");

        let archived = db
            .with_conn(|conn| archive_project(conn, &scope, &work.id))
            .expect("archive");
        assert!(archived.entity.archived_at.is_some());
        assert!(db.with_conn(|conn| archive_project(conn, &scope, &work.id)).is_err());

        let restored = db
            .with_conn(|conn| unarchive_project(conn, &scope, &work.id))
            .expect("unarchive");
        assert!(restored.entity.archived_at.is_none());

        let refused = db.with_conn(|conn| delete_project(conn, &scope, &work.id));
        assert_eq!(refused.expect_err("has children").code(), "VALIDATION_ERROR");
    }
}
