use crate::db;
use crate::errors::{AppError, AppResult};
use crate::models::{normalize_color, CreateTagRequest, EntityType, RequestScope, Tag, UndoOperation, UpdateTagRequest};
use crate::undo::{Change, UndoSnapshot, UndoStep};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;
use uuid::Uuid;

pub const MAX_TAG_NAME_LEN: usize = 50;

static TAG_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w-]+$").expect("valid tag name regex"));

pub fn create_tag(conn: &Connection, scope: &RequestScope<'_>, request: CreateTagRequest) -> AppResult<Change<Tag>> {
    let name = validate_name(&request.name)?;
    ensure_unique_name(conn, scope.owner_id, &name, None)?;

    let tag = Tag {
        id: Uuid::new_v4().to_string(),
        owner_id: scope.owner_id.to_string(),
        name,
        color: normalize_color(request.color.as_deref(), &scope.settings.default_tag_color)?,
        deleted_at: None,
        created_at: scope.now,
        updated_at: scope.now,
    };
    db::insert_tag(conn, &tag)?;

    let step = UndoStep::new(
        EntityType::Tag,
        &tag.id,
        UndoOperation::Create,
        UndoSnapshot::TagCreated { tag_id: tag.id.clone() },
    );
    Ok(Change { entity: tag, step })
}

pub fn update_tag(
    conn: &Connection,
    scope: &RequestScope<'_>,
    tag_id: &str,
    request: UpdateTagRequest,
) -> AppResult<Change<Tag>> {
    let before = required_tag(conn, scope.owner_id, tag_id)?;
    let mut tag = before.clone();

    if let Some(name) = request.name {
        let name = validate_name(&name)?;
        ensure_unique_name(conn, scope.owner_id, &name, Some(&tag.id))?;
        tag.name = name;
    }
    if let Some(color) = request.color {
        tag.color = normalize_color(Some(&color), &scope.settings.default_tag_color)?;
    }
    tag.updated_at = scope.now;
    db::write_tag(conn, &tag)?;

    let snapshot = UndoSnapshot::tag_state(before, &tag)?;
    let step = UndoStep::new(EntityType::Tag, &tag.id, UndoOperation::Update, snapshot);
    Ok(Change { entity: tag, step })
}

/// Soft delete. Tasks keep their tag links so an undo restores them intact.
pub fn delete_tag(conn: &Connection, scope: &RequestScope<'_>, tag_id: &str) -> AppResult<Change<Tag>> {
    let before = required_tag(conn, scope.owner_id, tag_id)?;
    let mut tag = before.clone();
    tag.deleted_at = Some(scope.now);
    tag.updated_at = scope.now;
    db::write_tag(conn, &tag)?;

    let snapshot = UndoSnapshot::tag_state(before, &tag)?;
    let step = UndoStep::new(EntityType::Tag, &tag.id, UndoOperation::Delete, snapshot);
    Ok(Change { entity: tag, step })
}

pub fn required_tag(conn: &Connection, owner_id: &str, tag_id: &str) -> AppResult<Tag> {
    db::find_tag(conn, owner_id, tag_id, false)?.ok_or_else(|| AppError::not_found("Tag", tag_id))
}

fn validate_name(raw: &str) -> AppResult<String> {
    let name = raw.trim().trim_start_matches('@');
    if name.is_empty() {
        return Err(AppError::Validation("Tag name is required".to_string()));
    }
    if name.chars().count() > MAX_TAG_NAME_LEN {
        return Err(AppError::Validation(format!(
            "Tag name must be at most {} characters",
            MAX_TAG_NAME_LEN
        )));
    }
    if !TAG_NAME.is_match(name) {
        return Err(AppError::Validation(format!(
            "Tag name '{}' may only contain letters, digits, '_' and '-'",
            name
        )));
    }
    Ok(name.to_string())
}

fn ensure_unique_name(conn: &Connection, owner_id: &str, name: &str, except_id: Option<&str>) -> AppResult<()> {
    match db::find_tag_by_name(conn, owner_id, name)? {
        Some(existing) if Some(existing.id.as_str()) != except_id => {
            Err(AppError::Validation(format!("Tag '{}' already exists", existing.name)))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::EngineSettings;
    use chrono::Utc;

    fn scope<'a>(owner: &'a str, settings: &'a EngineSettings) -> RequestScope<'a> {
        RequestScope {
            owner_id: owner,
            now: Utc::now(),
            settings,
        }
    }

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("tags.db")).expect("db");
        (dir, db)
    }

    #[test]
    fn create_applies_default_color_and_rejects_duplicates() {
        let (_dir, db) = open();
        let settings = EngineSettings::default();
        let scope = scope("alice", &settings);

        let created = db
            .with_conn(|conn| {
                create_tag(
                    conn,
                    &scope,
                    CreateTagRequest {
                        name: "@urgent".to_string(),
                        color: None,
                    },
                )
            })
            .expect("create");
        assert_eq!(created.entity.name, "urgent");
        assert_eq!(created.entity.color, "#808080");
        assert_eq!(created.step.operation, UndoOperation::Create);

        let duplicate = db.with_conn(|conn| {
            create_tag(
                conn,
                &scope,
                CreateTagRequest {
                    name: "URGENT".to_string(),
                    color: None,
                },
            )
        });
        assert_eq!(duplicate.expect_err("duplicate").code(), "VALIDATION_ERROR");

        let umlaut = |name: &str| {
            db.with_conn(|conn| {
                create_tag(
                    conn,
                    &scope,
                    CreateTagRequest {
                        name: name.to_string(),
                        color: None,
                    },
                )
            })
        };
        umlaut("Äpfel").expect("create");
        assert_eq!(umlaut("äpfel").expect_err("case variant").code(), "VALIDATION_ERROR");
    }

    #[test]
    fn rejects_names_that_cannot_be_referenced() {
        let (_dir, db) = open();
        let settings = EngineSettings::default();
        let scope = scope("alice", &settings);
        let too_long = "x".repeat(MAX_TAG_NAME_LEN + 1);
        for name in ["", "two words", too_long.as_str()] {
            let result = db.with_conn(|conn| {
                create_tag(
                    conn,
                    &scope,
                    CreateTagRequest {
                        name: name.to_string(),
                        color: None,
                    },
                )
            });
            assert!(result.is_err(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn other_owners_tags_are_not_found() {
        let (_dir, db) = open();
        let settings = EngineSettings::default();
        let tag = db
            .with_conn(|conn| {
                create_tag(
                    conn,
                    &scope("alice", &settings),
                    CreateTagRequest {
                        name: "home".to_string(),
                        color: Some("#00ff00".to_string()),
                    },
                )
            })
            .expect("create")
            .entity;
        assert_eq!(tag.color, "#00FF00");

        let result = db.with_conn(|conn| delete_tag(conn, &scope("bob", &settings), &tag.id));
        assert_eq!(result.expect_err("foreign").code(), "NOT_FOUND");
    }

    #[test]
    fn delete_snapshots_prior_state() {
        let (_dir, db) = open();
        let settings = EngineSettings::default();
        let scope = scope("alice", &settings);
        let tag = db
            .with_conn(|conn| {
                create_tag(
                    conn,
                    &scope,
                    CreateTagRequest {
                        name: "home".to_string(),
                        color: None,
                    },
                )
            })
            .expect("create")
            .entity;

        let deleted = db.with_conn(|conn| delete_tag(conn, &scope, &tag.id)).expect("delete");
        assert!(deleted.entity.deleted_at.is_some());
        match deleted.step.snapshot {
            UndoSnapshot::TagState { before, fields } => {
                assert!(before.deleted_at.is_none());
                assert_eq!(fields, vec!["deletedAt".to_string()]);
            }
            other => panic!("unexpected snapshot {other:?}"),
        }
        assert!(db.with_conn(|conn| db::list_tags(conn, "alice")).expect("list").is_empty());
    }
}
