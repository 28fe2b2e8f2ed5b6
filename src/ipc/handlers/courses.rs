use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::calc::{self, MasteryCalculation};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    canvas_client, db_conn, effective_canvas_config, required_i64, required_str,
    teacher_preferences, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::sync;

struct CourseRow {
    id: String,
    canvas_id: i64,
    name: String,
    updated_at: Option<String>,
}

fn course_by_canvas_id(conn: &Connection, canvas_id: i64) -> Result<Option<CourseRow>, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, canvas_id, name, updated_at FROM courses WHERE canvas_id = ?",
            [canvas_id],
            |r| {
                Ok(CourseRow {
                    id: r.get(0)?,
                    canvas_id: r.get(1)?,
                    name: r.get(2)?,
                    updated_at: r.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Outcomes attached to a course, each with its watching assignment.
pub fn course_outcomes_json(
    conn: &Connection,
    course_canvas_id: i64,
) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT o.id, o.canvas_id, o.name, a.canvas_id, a.name
         FROM outcomes o
         JOIN course_outcomes co ON co.outcome_id = o.id
         JOIN courses c ON c.id = co.course_id
         LEFT JOIN assignment_outcome ao ON ao.outcome_id = o.id
         LEFT JOIN assignments a ON a.id = ao.assignment_id
         WHERE c.canvas_id = ?
         ORDER BY o.name",
    )?;
    let rows = stmt
        .query_map([course_canvas_id], |r| {
            let id: String = r.get(0)?;
            let canvas_id: i64 = r.get(1)?;
            let name: String = r.get(2)?;
            let alignment_canvas_id: Option<i64> = r.get(3)?;
            let alignment_name: Option<String> = r.get(4)?;
            Ok(json!({
                "id": id,
                "canvasId": canvas_id,
                "name": name,
                "alignment": alignment_canvas_id.map(|aid| json!({
                    "canvasId": aid,
                    "name": alignment_name
                }))
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn course_assignments_json(
    conn: &Connection,
    course_canvas_id: i64,
) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT a.id, a.canvas_id, a.name, a.points_possible, o.canvas_id, o.name
         FROM assignments a
         JOIN course_assignments ca ON ca.assignment_id = a.id
         JOIN courses c ON c.id = ca.course_id
         LEFT JOIN assignment_outcome ao ON ao.assignment_id = a.id
         LEFT JOIN outcomes o ON o.id = ao.outcome_id
         WHERE c.canvas_id = ?
         ORDER BY a.name",
    )?;
    let rows = stmt
        .query_map([course_canvas_id], |r| {
            let id: String = r.get(0)?;
            let canvas_id: i64 = r.get(1)?;
            let name: String = r.get(2)?;
            let points_possible: Option<f64> = r.get(3)?;
            let watching_canvas_id: Option<i64> = r.get(4)?;
            let watching_name: Option<String> = r.get(5)?;
            Ok(json!({
                "id": id,
                "canvasId": canvas_id,
                "name": name,
                "pointsPossible": points_possible,
                "watching": watching_canvas_id.map(|oid| json!({
                    "canvasId": oid,
                    "name": watching_name
                }))
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Student roster with each student's mastery score on every outcome in
/// the course, computed with the given method.
pub fn roster_with_scores(
    conn: &Connection,
    course_canvas_id: i64,
    method: MasteryCalculation,
) -> Result<Vec<Value>, HandlerErr> {
    let outcome_ids = sync::course_outcome_ids(conn, course_canvas_id)?;
    let students = sync::course_students(conn, course_canvas_id)?;

    let mut rows = Vec::with_capacity(students.len());
    for student in students {
        let mut scores = Vec::with_capacity(outcome_ids.len());
        for &outcome_canvas_id in &outcome_ids {
            let score = calc::user_outcome_score(conn, outcome_canvas_id, student.canvas_id, method)?;
            scores.push(json!({
                "outcomeCanvasId": outcome_canvas_id,
                "score": score
            }));
        }
        rows.push(json!({
            "canvasId": student.canvas_id,
            "name": student.name,
            "scores": scores
        }));
    }
    Ok(rows)
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "courses": [] }));
    };

    // Include counts so the dashboard can render without extra round trips.
    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.canvas_id,
           c.name,
           c.updated_at,
           (SELECT COUNT(*) FROM user_courses uc
              JOIN users u ON u.id = uc.user_id
              WHERE uc.course_id = c.id AND u.user_type_id = 3) AS student_count,
           (SELECT COUNT(*) FROM course_outcomes co WHERE co.course_id = c.id) AS outcome_count,
           (SELECT COUNT(*) FROM course_assignments ca WHERE ca.course_id = c.id) AS assignment_count
         FROM courses c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let canvas_id: i64 = row.get(1)?;
            let name: String = row.get(2)?;
            let updated_at: Option<String> = row.get(3)?;
            let student_count: i64 = row.get(4)?;
            let outcome_count: i64 = row.get(5)?;
            let assignment_count: i64 = row.get(6)?;
            Ok(json!({
                "id": id,
                "canvasId": canvas_id,
                "name": name,
                "updatedAt": updated_at,
                "studentCount": student_count,
                "outcomeCount": outcome_count,
                "assignmentCount": assignment_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_courses_import(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
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

    match course_by_canvas_id(conn, canvas_id) {
        Ok(Some(existing)) => {
            return err(
                &req.id,
                "conflict",
                format!("{} already exists.", existing.name),
                None,
            )
        }
        Ok(None) => {}
        Err(e) => return e.response(&req.id),
    }

    let course_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, canvas_id, name) VALUES(?, ?, ?)",
        (&course_id, canvas_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    // Store all students as users and enroll them in the course. Without a
    // Canvas connection the course still imports; the roster can be synced
    // later.
    let enrollment = if effective_canvas_config(state).is_some() {
        let client = match canvas_client(state) {
            Ok(c) => c,
            Err(e) => return e.response(&req.id),
        };
        let enrollments = match client.get_enrollments(canvas_id) {
            Ok(v) => v,
            Err(e) => {
                return err(
                    &req.id,
                    "canvas_request_failed",
                    e.to_string(),
                    Some(json!({ "stored": true })),
                )
            }
        };
        match sync::enroll_students(conn, canvas_id, &enrollments) {
            Ok(s) => Some(s),
            Err(e) => return err(&req.id, "db_write_failed", e.to_string(), None),
        }
    } else {
        None
    };

    ok(
        &req.id,
        json!({
            "courseId": course_id,
            "canvasId": canvas_id,
            "name": name,
            "enrollmentsSynced": enrollment.map(|s| s.enrolled),
            "newUsers": enrollment.map(|s| s.new_users)
        }),
    )
}

fn handle_courses_get(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let canvas_id = match required_i64(&req.params, "canvasId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let course = match course_by_canvas_id(conn, canvas_id) {
        Ok(Some(c)) => c,
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return e.response(&req.id),
    };

    let (method, _) = teacher_preferences(conn);
    let outcomes = match course_outcomes_json(conn, canvas_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let assignments = match course_assignments_json(conn, canvas_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let students = match roster_with_scores(conn, canvas_id, method) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let has_alignment = outcomes.iter().any(|o| !o["alignment"].is_null());

    ok(
        &req.id,
        json!({
            "course": {
                "id": course.id,
                "canvasId": course.canvas_id,
                "name": course.name,
                "updatedAt": course.updated_at,
                "outcomes": outcomes,
                "assignments": assignments
            },
            "students": students,
            "hasAlignment": has_alignment
        }),
    )
}

fn handle_courses_delete(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let canvas_id = match required_i64(&req.params, "canvasId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let course = match course_by_canvas_id(conn, canvas_id) {
        Ok(Some(c)) => c,
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return e.response(&req.id),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Only the course and its associations go; users, outcomes, assignments
    // and attempts survive for other courses.
    for (sql, table) in [
        ("DELETE FROM user_courses WHERE course_id = ?", "user_courses"),
        ("DELETE FROM course_outcomes WHERE course_id = ?", "course_outcomes"),
        (
            "DELETE FROM course_assignments WHERE course_id = ?",
            "course_assignments",
        ),
        ("DELETE FROM courses WHERE id = ?", "courses"),
    ] {
        if let Err(e) = tx.execute(sql, [&course.id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "message": "Course deleted." }))
}

fn handle_courses_enrollments(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let canvas_id = match required_i64(&req.params, "canvasId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match course_by_canvas_id(conn, canvas_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return e.response(&req.id),
    }

    let (method, _) = teacher_preferences(conn);
    match roster_with_scores(conn, canvas_id, method) {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_courses_outcomes(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let canvas_id = match required_i64(&req.params, "canvasId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match course_by_canvas_id(conn, canvas_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return e.response(&req.id),
    }

    match course_outcomes_json(conn, canvas_id) {
        Ok(outcomes) => ok(&req.id, json!({ "outcomes": outcomes })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_courses_assignments(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let canvas_id = match required_i64(&req.params, "canvasId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match course_by_canvas_id(conn, canvas_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return e.response(&req.id),
    }

    match course_assignments_json(conn, canvas_id) {
        Ok(assignments) => ok(&req.id, json!({ "assignments": assignments })),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.import" => Some(handle_courses_import(state, req)),
        "courses.get" => Some(handle_courses_get(state, req)),
        "courses.delete" => Some(handle_courses_delete(state, req)),
        "courses.enrollments" => Some(handle_courses_enrollments(state, req)),
        "courses.outcomes" => Some(handle_courses_outcomes(state, req)),
        "courses.assignments" => Some(handle_courses_assignments(state, req)),
        _ => None,
    }
}
