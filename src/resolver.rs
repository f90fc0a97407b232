use crate::db;
use crate::errors::AppResult;
use crate::models::{EntityRef, Project, Tag};
use crate::tags::MAX_TAG_NAME_LEN;
use chrono::Utc;
use rusqlite::Connection;
use std::collections::HashMap;
use uuid::Uuid;

/// Outcome of resolving a `#project` or `@tag` reference for one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(EntityRef),
    Missing(String),
}

/// Case-insensitive lookup among the owner's active projects, by simple name or by
/// `/`-delimited path. Foreign and missing projects produce the same warning.
pub fn resolve_project(conn: &Connection, owner_id: &str, reference: &str) -> AppResult<Resolution> {
    let projects = db::list_projects(conn, owner_id, true)?;
    let paths = project_paths(&projects);
    let wanted = reference.trim_matches('/').to_lowercase();
    let by_path = wanted.contains('/');

    let mut candidates: Vec<(&Project, &String)> = projects
        .iter()
        .filter(|project| project.archived_at.is_none())
        .filter_map(|project| paths.get(&project.id).map(|path| (project, path)))
        .filter(|(project, path)| {
            if by_path {
                path.to_lowercase() == wanted
            } else {
                project.name.to_lowercase() == wanted
            }
        })
        .collect();
    candidates.sort_by(|(left, left_path), (right, right_path)| {
        depth(left_path)
            .cmp(&depth(right_path))
            .then(left.created_at.cmp(&right.created_at))
    });

    Ok(match candidates.first() {
        Some((project, path)) => Resolution::Found(EntityRef {
            id: project.id.clone(),
            name: project.name.clone(),
            full_path: (*path).clone(),
            color: project.color.clone(),
        }),
        None => Resolution::Missing(format!("Project '{}' not found", reference)),
    })
}

/// Case-insensitive lookup among the owner's tags; an absent tag is created.
pub fn resolve_tag(conn: &Connection, owner_id: &str, name: &str, default_color: &str) -> AppResult<Resolution> {
    if name.chars().count() > MAX_TAG_NAME_LEN {
        return Ok(Resolution::Missing(format!(
            "Tag '{}' is longer than {} characters",
            name, MAX_TAG_NAME_LEN
        )));
    }

    if let Some(existing) = db::find_tag_by_name(conn, owner_id, name)? {
        return Ok(Resolution::Found(tag_ref(&existing)));
    }

    let now = Utc::now();
    let tag = Tag {
        id: Uuid::new_v4().to_string(),
        owner_id: owner_id.to_string(),
        name: name.to_string(),
        color: default_color.to_string(),
        deleted_at: None,
        created_at: now,
        updated_at: now,
    };
    db::insert_tag(conn, &tag)?;
    tracing::debug!(owner_id = %owner_id, tag_id = %tag.id, "auto-created tag from command");
    Ok(Resolution::Found(tag_ref(&tag)))
}

pub fn tag_ref(tag: &Tag) -> EntityRef {
    EntityRef {
        id: tag.id.clone(),
        name: tag.name.clone(),
        full_path: tag.name.clone(),
        color: tag.color.clone(),
    }
}

/// `/`-joined ancestor names for every project, keyed by id.
pub fn project_paths(projects: &[Project]) -> HashMap<String, String> {
    let by_id: HashMap<&str, &Project> = projects.iter().map(|project| (project.id.as_str(), project)).collect();
    let mut paths = HashMap::with_capacity(projects.len());
    for project in projects {
        let mut segments = vec![project.name.as_str()];
        let mut cursor = project.parent_id.as_deref();
        while let Some(parent_id) = cursor {
            // Corrupt parent links must not loop forever.
            if segments.len() > projects.len() {
                break;
            }
            match by_id.get(parent_id) {
                Some(parent) => {
                    segments.push(parent.name.as_str());
                    cursor = parent.parent_id.as_deref();
                }
                None => break,
            }
        }
        segments.reverse();
        paths.insert(project.id.clone(), segments.join("/"));
    }
    paths
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}
