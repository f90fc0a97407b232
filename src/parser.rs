use crate::dates::{find_date_phrases, resolve_phrase};
use crate::errors::AppResult;
use crate::models::{Highlight, HighlightKind, ParsedCommand, MAX_PRIORITY};
use crate::resolver::{resolve_project, resolve_tag, Resolution};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;
use std::ops::Range;

static PRIORITY_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:^|\s)(p(\d+))\b").expect("valid priority regex"));
static TAG_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|\s)(@([\w-]+))").expect("valid tag regex"));
static PROJECT_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)(#([\w-]+(?:/[\w-]+)*))").expect("valid project regex"));

const MULTIPLE_DATES: &str = "Multiple dates found; using the first one";
const MULTIPLE_PRIORITIES: &str = "Multiple priorities found; using the first one";
const MULTIPLE_PROJECTS: &str = "Multiple projects found; using the first one";

/// Per-request inputs the parser needs besides the text itself.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    pub owner_id: &'a str,
    pub today: NaiveDate,
    pub default_tag_color: &'a str,
}

#[derive(Debug, Clone)]
struct Candidate {
    kind: HighlightKind,
    span: Range<usize>,
    body: Range<usize>,
}

/// Extracts due date, project, tags and priority from `input`.
///
/// Resolution problems never fail the parse: they surface as invalid highlights
/// paired with warnings. Only storage errors are returned as `Err`.
pub fn parse_command(conn: &Connection, ctx: &ParseContext<'_>, input: &str) -> AppResult<ParsedCommand> {
    let mut parsed = ParsedCommand::default();
    if input.trim().is_empty() {
        return Ok(parsed);
    }

    let mut stripped: Vec<Range<usize>> = Vec::new();
    for candidate in scan(input) {
        let text = &input[candidate.span.clone()];
        let body = &input[candidate.body.clone()];
        let (value, valid, warning, strip) = match candidate.kind {
            HighlightKind::Priority => match body.parse::<u8>().ok().filter(|value| *value <= MAX_PRIORITY) {
                Some(priority) if parsed.priority.is_none() => {
                    parsed.priority = Some(priority);
                    (Some(priority.to_string()), true, None, true)
                }
                Some(priority) => (Some(priority.to_string()), false, Some(MULTIPLE_PRIORITIES.to_string()), true),
                None => (
                    None,
                    false,
                    Some(format!("Invalid priority '{}' (expected p0-p{})", text, MAX_PRIORITY)),
                    true,
                ),
            },
            HighlightKind::Tag => match resolve_tag(conn, ctx.owner_id, body, ctx.default_tag_color)? {
                Resolution::Found(tag) => {
                    let id = tag.id.clone();
                    if !parsed.tags.iter().any(|existing| existing.id == tag.id) {
                        parsed.tags.push(tag);
                    }
                    (Some(id), true, None, true)
                }
                Resolution::Missing(warning) => (None, false, Some(warning), true),
            },
            HighlightKind::Project => {
                if parsed.project.is_some() {
                    (None, false, Some(MULTIPLE_PROJECTS.to_string()), true)
                } else {
                    match resolve_project(conn, ctx.owner_id, body)? {
                        Resolution::Found(project) => {
                            let id = project.id.clone();
                            parsed.project = Some(project);
                            (Some(id), true, None, true)
                        }
                        // Unresolved hashtags stay in the title text.
                        Resolution::Missing(warning) => (None, false, Some(warning), false),
                    }
                }
            }
            HighlightKind::Date => match resolve_phrase(text, ctx.today) {
                Some(resolved) if parsed.due_date.is_none() => {
                    parsed.due_date = Some(resolved.date);
                    parsed.due_time = resolved.time;
                    parsed.has_time = resolved.has_time();
                    (Some(resolved.display_value()), true, None, true)
                }
                Some(resolved) => (Some(resolved.display_value()), false, Some(MULTIPLE_DATES.to_string()), true),
                None => (None, false, Some(format!("Could not understand date '{}'", text)), true),
            },
        };

        if let Some(warning) = warning {
            parsed.warnings.push(warning);
        }
        if strip {
            stripped.push(candidate.span.clone());
        }
        parsed.highlights.push(Highlight {
            kind: candidate.kind,
            text: text.to_string(),
            start: candidate.span.start,
            end: candidate.span.end,
            value,
            valid,
        });
    }

    parsed.title = strip_spans(input, &stripped);
    Ok(parsed)
}

/// All token candidates in input order. Overlaps keep the earliest, then the longest.
fn scan(input: &str) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for (pattern, kind) in [
        (&*PRIORITY_TOKEN, HighlightKind::Priority),
        (&*TAG_TOKEN, HighlightKind::Tag),
        (&*PROJECT_TOKEN, HighlightKind::Project),
    ] {
        for captures in pattern.captures_iter(input) {
            if let (Some(span), Some(body)) = (captures.get(1), captures.get(2)) {
                candidates.push(Candidate {
                    kind,
                    span: span.range(),
                    body: body.range(),
                });
            }
        }
    }
    for span in find_date_phrases(input) {
        candidates.push(Candidate {
            kind: HighlightKind::Date,
            body: span.clone(),
            span,
        });
    }

    candidates.sort_by(|left, right| {
        left.span
            .start
            .cmp(&right.span.start)
            .then(right.span.len().cmp(&left.span.len()))
    });

    let mut accepted: Vec<Candidate> = Vec::with_capacity(candidates.len());
    let mut covered_until = 0usize;
    for candidate in candidates {
        if candidate.span.start < covered_until {
            continue;
        }
        covered_until = candidate.span.end;
        accepted.push(candidate);
    }
    accepted
}

fn strip_spans(input: &str, spans: &[Range<usize>]) -> String {
    let mut remaining = String::with_capacity(input.len());
    let mut cursor = 0usize;
    for span in spans {
        remaining.push_str(&input[cursor..span.start]);
        remaining.push(' ');
        cursor = span.end;
    }
    remaining.push_str(&input[cursor..]);
    remaining.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, Database};
    use crate::models::Project;
    use chrono::{NaiveTime, Utc};

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Database,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");
        let now = Utc::now();
        let work = Project {
            id: "p-work".to_string(),
            owner_id: "alice".to_string(),
            name: "Work".to_string(),
            parent_id: None,
            color: "#222222".to_string(),
            archived_at: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        let meetings = Project {
            id: "p-meetings".to_string(),
            name: "Meetings".to_string(),
            parent_id: Some("p-work".to_string()),
            ..work.clone()
        };
        db.with_conn(|conn| {
            db::insert_project(conn, &work)?;
            db::insert_project(conn, &meetings)
        })
        .expect("seed");
        Fixture { _dir: dir, db }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 15).expect("valid date")
    }

    fn parse(fixture: &Fixture, owner: &str, input: &str) -> ParsedCommand {
        let ctx = ParseContext {
            owner_id: owner,
            today: today(),
            default_tag_color: "#808080",
        };
        fixture
            .db
            .with_conn(|conn| parse_command(conn, &ctx, input))
            .expect("parse")
    }

    #[test]
    fn strips_relative_date_from_title() {
        let fixture = fixture();
        let parsed = parse(&fixture, "alice", "Buy groceries tomorrow");
        assert_eq!(parsed.title, "Buy groceries");
        assert_eq!(parsed.due_date, NaiveDate::from_ymd_opt(2026, 1, 16));
        assert!(!parsed.has_time);
        assert_eq!(parsed.highlights.len(), 1);
        assert_eq!(parsed.highlights[0].kind, HighlightKind::Date);
        assert!(parsed.highlights[0].valid);
        assert_eq!(parsed.highlights[0].start, 14);
        assert_eq!(parsed.highlights[0].end, 22);
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn tag_references_fold_non_ascii_case() {
        let fixture = fixture();
        let parsed = parse(&fixture, "alice", "Buy fruit @Äpfel @äpfel");
        assert_eq!(parsed.title, "Buy fruit");
        assert_eq!(parsed.tags.len(), 1);
        assert_eq!(parsed.tags[0].name, "Äpfel");

        let again = parse(&fixture, "alice", "More fruit @ÄPFEL");
        assert_eq!(again.tags[0].id, parsed.tags[0].id);
        let stored = fixture.db.with_conn(|conn| db::list_tags(conn, "alice")).expect("tags");
        assert_eq!(stored.len(), 1);
    }

    #[test]
    fn extracts_every_token_class_in_one_pass() {
        let fixture = fixture();
        let parsed = parse(&fixture, "alice", "p1 Review PR @code tomorrow at 10am #work/meetings @Code");
        assert_eq!(parsed.title, "Review PR");
        assert_eq!(parsed.priority, Some(1));
        assert_eq!(parsed.due_time, NaiveTime::from_hms_opt(10, 0, 0));
        assert!(parsed.has_time);
        assert_eq!(parsed.project.as_ref().map(|p| p.id.as_str()), Some("p-meetings"));
        assert_eq!(parsed.tags.len(), 1);
        assert_eq!(parsed.highlights.len(), 5);
        assert!(parsed.highlights.iter().all(|h| h.valid));
        assert!(parsed.warnings.is_empty());

        let kinds: Vec<HighlightKind> = parsed.highlights.iter().map(|h| h.kind).collect();
        assert_eq!(
            kinds,
            vec![
                HighlightKind::Priority,
                HighlightKind::Tag,
                HighlightKind::Date,
                HighlightKind::Project,
                HighlightKind::Tag
            ]
        );
    }

    #[test]
    fn unknown_project_keeps_text_and_warns() {
        let fixture = fixture();
        let parsed = parse(&fixture, "alice", "Task #nonexistent");
        assert!(parsed.project.is_none());
        assert_eq!(parsed.title, "Task #nonexistent");
        assert_eq!(parsed.warnings.len(), 1);
        assert!(parsed.warnings[0].contains("not found"));
        assert_eq!(parsed.highlights.len(), 1);
        assert_eq!(parsed.highlights[0].kind, HighlightKind::Project);
        assert!(!parsed.highlights[0].valid);
    }

    #[test]
    fn other_tenants_projects_are_invisible() {
        let fixture = fixture();
        let parsed = parse(&fixture, "bob", "Task #work");
        assert!(parsed.project.is_none());
        assert_eq!(parsed.warnings, vec!["Project 'work' not found".to_string()]);
    }

    #[test]
    fn out_of_range_priority_is_flagged() {
        let fixture = fixture();
        let parsed = parse(&fixture, "alice", "Task p10");
        assert_eq!(parsed.priority, None);
        assert_eq!(parsed.title, "Task");
        assert_eq!(parsed.warnings.len(), 1);
        assert!(parsed.warnings[0].contains("priority"));
        assert_eq!(parsed.highlights.len(), 1);
        assert_eq!(parsed.highlights[0].kind, HighlightKind::Priority);
        assert!(!parsed.highlights[0].valid);
    }

    #[test]
    fn first_date_wins_and_later_dates_warn() {
        let fixture = fixture();
        let parsed = parse(&fixture, "alice", "Ship it today or tomorrow or 2026-02-01");
        assert_eq!(parsed.due_date, Some(today()));
        assert_eq!(parsed.title, "Ship it or or");
        assert_eq!(parsed.warnings.len(), 2);
        assert!(parsed.warnings.iter().all(|w| w.starts_with("Multiple dates found")));
        let valid: Vec<bool> = parsed.highlights.iter().map(|h| h.valid).collect();
        assert_eq!(valid, vec![true, false, false]);
    }

    #[test]
    fn impossible_date_is_reported_not_raised() {
        let fixture = fixture();
        let parsed = parse(&fixture, "alice", "Pay rent 2026-02-30");
        assert!(parsed.due_date.is_none());
        assert_eq!(parsed.warnings.len(), 1);
        assert!(parsed.warnings[0].contains("2026-02-30"));
        assert!(!parsed.highlights[0].valid);
    }

    #[test]
    fn blank_input_yields_empty_command() {
        let fixture = fixture();
        for input in ["", "   ", "\t\n"] {
            let parsed = parse(&fixture, "alice", input);
            assert_eq!(parsed, ParsedCommand::default());
        }
    }

    #[test]
    fn metadata_only_input_leaves_empty_title() {
        let fixture = fixture();
        let parsed = parse(&fixture, "alice", "tomorrow @home p2");
        assert_eq!(parsed.title, "");
        assert_eq!(parsed.priority, Some(2));
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn markers_inside_words_are_ignored() {
        let fixture = fixture();
        let parsed = parse(&fixture, "alice", "Email bob@example.com about issue#12 and help2");
        assert!(parsed.highlights.is_empty());
        assert_eq!(parsed.title, "Email bob@example.com about issue#12 and help2");
    }

    #[test]
    fn warnings_only_accompany_invalid_highlights() {
        let fixture = fixture();
        for input in [
            "Plan trip next friday @travel",
            "Fix #nothing p9 today today",
            "in 3 days p0 #Work",
        ] {
            let parsed = parse(&fixture, "alice", input);
            let all_valid = parsed.highlights.iter().all(|h| h.valid);
            if all_valid {
                assert!(parsed.warnings.is_empty(), "{input}");
            }
            let invalid = parsed.highlights.iter().filter(|h| !h.valid).count();
            assert_eq!(invalid, parsed.warnings.len(), "{input}");
        }
    }
}
