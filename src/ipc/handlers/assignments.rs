use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_f64, required_i64, required_str};
use crate::ipc::types::{AppState, Request};

fn handle_assignments_import(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let course_canvas_id = match required_i64(&req.params, "courseId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let canvas_id = match required_i64(&req.params, "canvasId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = match required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let points_possible = match required_f64(&req.params, "pointsPossible") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // Assignments cannot be orphans; they attach to the course on import.
    let course_id: Option<String> = match conn
        .query_row(
            "SELECT id FROM courses WHERE canvas_id = ?",
            [course_canvas_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(course_id) = course_id else {
        return err(&req.id, "not_found", "course not found", None);
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM assignments WHERE canvas_id = ?",
            [canvas_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_some() {
        return err(
            &req.id,
            "conflict",
            "Assignment already exists. Please select a different assignment.",
            None,
        );
    }

    let assignment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO assignments(id, canvas_id, name, points_possible) VALUES(?, ?, ?, ?)",
        (&assignment_id, canvas_id, &name, points_possible),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }
    if let Err(e) = conn.execute(
        "INSERT INTO course_assignments(course_id, assignment_id) VALUES(?, ?)",
        (&course_id, &assignment_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "course_assignments" })),
        );
    }

    ok(
        &req.id,
        json!({
            "assignmentId": assignment_id,
            "canvasId": canvas_id,
            "name": name,
            "pointsPossible": points_possible,
            "message": "Import successful"
        }),
    )
}

fn handle_assignments_get(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let canvas_id = match required_i64(&req.params, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let row = conn
        .query_row(
            "SELECT a.id, a.canvas_id, a.name, a.points_possible, o.canvas_id, o.name, c.canvas_id
             FROM assignments a
             LEFT JOIN assignment_outcome ao ON ao.assignment_id = a.id
             LEFT JOIN outcomes o ON o.id = ao.outcome_id
             LEFT JOIN course_assignments ca ON ca.assignment_id = a.id
             LEFT JOIN courses c ON c.id = ca.course_id
             WHERE a.canvas_id = ?",
            [canvas_id],
            |r| {
                let id: String = r.get(0)?;
                let canvas_id: i64 = r.get(1)?;
                let name: String = r.get(2)?;
                let points_possible: Option<f64> = r.get(3)?;
                let watching_canvas_id: Option<i64> = r.get(4)?;
                let watching_name: Option<String> = r.get(5)?;
                let course_canvas_id: Option<i64> = r.get(6)?;
                Ok(json!({
                    "id": id,
                    "canvasId": canvas_id,
                    "name": name,
                    "pointsPossible": points_possible,
                    "courseCanvasId": course_canvas_id,
                    "watching": watching_canvas_id.map(|oid| json!({
                        "canvasId": oid,
                        "name": watching_name
                    }))
                }))
            },
        )
        .optional();

    let mut assignment = match row {
        Ok(Some(a)) => a,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "Assignment not found. Check the Assignment ID and try again.",
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Grades already computed and persisted for this assignment.
    let mut stmt = match conn.prepare(
        "SELECT ua.user_canvas_id, u.name, ua.score, ua.occurred
         FROM user_assignments ua
         JOIN users u ON u.canvas_id = ua.user_canvas_id
         WHERE ua.assignment_canvas_id = ?
         ORDER BY u.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mastery = stmt
        .query_map([canvas_id], |r| {
            let user_canvas_id: i64 = r.get(0)?;
            let name: String = r.get(1)?;
            let score: Option<f64> = r.get(2)?;
            let occurred: Option<String> = r.get(3)?;
            Ok(json!({
                "userCanvasId": user_canvas_id,
                "name": name,
                "score": score,
                "occurred": occurred
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match mastery {
        Ok(rows) => assignment["mastery"] = json!(rows),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    ok(&req.id, json!({ "assignment": assignment }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "assignments.import" => Some(handle_assignments_import(state, req)),
        "assignments.get" => Some(handle_assignments_get(state, req)),
        _ => None,
    }
}
