use std::collections::HashSet;

use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{canvas_client, db_conn, required_i64, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::sync;

fn stored_canvas_ids(conn: &Connection, table: &str) -> Result<HashSet<i64>, HandlerErr> {
    let sql = format!("SELECT canvas_id FROM {}", table);
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map([], |r| r.get::<_, i64>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

fn require_course(conn: &Connection, canvas_id: i64) -> Result<(), HandlerErr> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM courses WHERE canvas_id = ?",
            [canvas_id],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "course not found"));
    }
    Ok(())
}

/// Courses the teacher could import: fetched live, minus what is already
/// stored, newest first. Courses without a start date are noise from old
/// terms and are dropped.
fn handle_sync_courses(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let client = match canvas_client(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };

    let stored = match stored_canvas_ids(conn, "courses") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let fetched = match client.get_courses() {
        Ok(v) => v,
        Err(e) => return err(&req.id, "canvas_request_failed", e.to_string(), None),
    };

    let mut courses: Vec<(String, Value)> = fetched
        .into_iter()
        .filter(|c| !stored.contains(&c.id))
        .filter_map(|c| {
            let start_at = c.start_at?;
            let year = start_at.get(0..4).unwrap_or_default().to_string();
            let item = json!({
                "id": c.id,
                "name": format!("{} - {}", year, c.name),
                "startAt": start_at
            });
            Some((start_at, item))
        })
        .collect();
    courses.sort_by(|a, b| b.0.cmp(&a.0));
    let items: Vec<Value> = courses.into_iter().map(|(_, v)| v).collect();

    ok(
        &req.id,
        json!({
            "results": items.len(),
            "courses": items
        }),
    )
}

/// Outcome links in the Canvas course that are not yet attached locally.
fn handle_sync_outcomes(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let course_canvas_id = match required_i64(&req.params, "courseId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_course(conn, course_canvas_id) {
        return e.response(&req.id);
    }
    let client = match canvas_client(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };

    // The same Canvas outcome may serve several courses, so filter against
    // this course's attachments, not the outcomes table.
    let attached: HashSet<i64> = match sync::course_outcome_ids(conn, course_canvas_id) {
        Ok(v) => v.into_iter().collect(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let fetched = match client.get_outcome_links(course_canvas_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "canvas_request_failed", e.to_string(), None),
    };

    let outcomes: Vec<Value> = fetched
        .into_iter()
        .filter(|o| !attached.contains(&o.id))
        .map(|o| json!({ "id": o.id, "name": o.title }))
        .collect();

    ok(
        &req.id,
        json!({
            "message": format!("Found {} outcomes", outcomes.len()),
            "outcomes": outcomes
        }),
    )
}

/// Canvas assignments not yet stored locally.
fn handle_sync_assignments(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let course_canvas_id = match required_i64(&req.params, "courseId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_course(conn, course_canvas_id) {
        return e.response(&req.id);
    }
    let client = match canvas_client(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };

    let stored = match stored_canvas_ids(conn, "assignments") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let fetched = match client.get_assignments(course_canvas_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "canvas_request_failed", e.to_string(), None),
    };

    let assignments: Vec<Value> = fetched
        .into_iter()
        .filter(|a| !stored.contains(&a.id))
        .map(|a| {
            json!({
                "id": a.id,
                "name": a.name,
                "pointsPossible": a.points_possible
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "message": format!("Found {} assignments", assignments.len()),
            "assignments": assignments
        }),
    )
}

/// Pull outcome results for every outcome attached to the course and store
/// the new attempts.
fn handle_sync_attempts(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let course_canvas_id = match required_i64(&req.params, "courseId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_course(conn, course_canvas_id) {
        return e.response(&req.id);
    }

    let outcome_ids = match sync::course_outcome_ids(conn, course_canvas_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if outcome_ids.is_empty() {
        return ok(
            &req.id,
            json!({
                "message": "Sync at least one outcome from Canvas before importing results.",
                "error": true
            }),
        );
    }

    let client = match canvas_client(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let results = match client.get_outcome_results(course_canvas_id, &outcome_ids) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "canvas_request_failed", e.to_string(), None),
    };
    let stored = match sync::record_attempts(conn, course_canvas_id, &results) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_write_failed", e.to_string(), None),
    };

    let message = if stored > 0 {
        format!("Stored {} new attempts.", stored)
    } else {
        "There were no new Outcome attempts.".to_string()
    };
    ok(
        &req.id,
        json!({
            "message": message,
            "stored": stored,
            "error": false
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "sync.courses" => Some(handle_sync_courses(state, req)),
        "sync.outcomes" => Some(handle_sync_outcomes(state, req)),
        "sync.assignments" => Some(handle_sync_assignments(state, req)),
        "sync.attempts" => Some(handle_sync_attempts(state, req)),
        _ => None,
    }
}
