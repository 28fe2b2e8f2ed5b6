use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::calc::{self, MasteryCalculation};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::courses::course_outcomes_json;
use crate::ipc::helpers::{
    canvas_client, db_conn, effective_canvas_config, optional_str, required_i64, required_str,
    teacher_preferences, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::sync;

struct OutcomeRow {
    id: String,
    canvas_id: i64,
    name: String,
}

fn outcome_by_canvas_id(conn: &Connection, canvas_id: i64) -> Result<Option<OutcomeRow>, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, canvas_id, name FROM outcomes WHERE canvas_id = ?",
            [canvas_id],
            |r| {
                Ok(OutcomeRow {
                    id: r.get(0)?,
                    canvas_id: r.get(1)?,
                    name: r.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn course_local_id(conn: &Connection, canvas_id: i64) -> Result<Option<String>, HandlerErr> {
    let id = conn
        .query_row(
            "SELECT id FROM courses WHERE canvas_id = ?",
            [canvas_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

fn outcome_attached(
    conn: &Connection,
    course_id: &str,
    outcome_id: &str,
) -> Result<bool, HandlerErr> {
    let attached: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM course_outcomes WHERE course_id = ? AND outcome_id = ?",
            (course_id, outcome_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(attached.is_some())
}

fn calc_method_param(
    conn: &Connection,
    params: &Value,
) -> Result<MasteryCalculation, HandlerErr> {
    match optional_str(params, "calcMethod") {
        Some(name) => MasteryCalculation::from_name(&name).ok_or_else(|| {
            HandlerErr::new("bad_params", format!("unknown calculation method: {}", name))
        }),
        None => Ok(teacher_preferences(conn).0),
    }
}

fn handle_outcomes_import(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let course_canvas_id = match required_i64(&req.params, "courseId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let outcome_canvas_id = match required_i64(&req.params, "outcomeId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = match required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let course_id = match course_local_id(conn, course_canvas_id) {
        Ok(Some(id)) => id,
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return e.response(&req.id),
    };

    // Other courses may already track the same outcome; reuse the row.
    let outcome = match outcome_by_canvas_id(conn, outcome_canvas_id) {
        Ok(Some(o)) => o,
        Ok(None) => {
            let id = Uuid::new_v4().to_string();
            if let Err(e) = conn.execute(
                "INSERT INTO outcomes(id, canvas_id, name) VALUES(?, ?, ?)",
                (&id, outcome_canvas_id, &name),
            ) {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "outcomes" })),
                );
            }
            OutcomeRow {
                id,
                canvas_id: outcome_canvas_id,
                name: name.clone(),
            }
        }
        Err(e) => return e.response(&req.id),
    };

    match outcome_attached(conn, &course_id, &outcome.id) {
        Ok(true) => {
            return err(
                &req.id,
                "conflict",
                format!("{} is already imported to the course.", outcome.name),
                None,
            )
        }
        Ok(false) => {}
        Err(e) => return e.response(&req.id),
    }
    if let Err(e) = conn.execute(
        "INSERT INTO course_outcomes(course_id, outcome_id) VALUES(?, ?)",
        (&course_id, &outcome.id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "course_outcomes" })),
        );
    }

    // Pull this outcome's results right away so scores show up with the
    // import, the way the web flow did.
    let attempts_synced = if effective_canvas_config(state).is_some() {
        let client = match canvas_client(state) {
            Ok(c) => c,
            Err(e) => return e.response(&req.id),
        };
        let results = match client.get_outcome_results(course_canvas_id, &[outcome_canvas_id]) {
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
        match sync::record_attempts(conn, course_canvas_id, &results) {
            Ok(n) => Some(n),
            Err(e) => return err(&req.id, "db_write_failed", e.to_string(), None),
        }
    } else {
        None
    };

    let message = match attempts_synced {
        Some(0) => "There were no new Outcome attempts.".to_string(),
        Some(n) => format!("Stored {} new attempts.", n),
        None => format!("Imported {} to the course.", outcome.name),
    };

    ok(
        &req.id,
        json!({
            "outcome": {
                "id": outcome.id,
                "canvasId": outcome.canvas_id,
                "name": outcome.name
            },
            "attemptsSynced": attempts_synced,
            "message": message
        }),
    )
}

fn handle_outcomes_get(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let outcome_canvas_id = match required_i64(&req.params, "outcomeId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let row = conn
        .query_row(
            "SELECT o.id, o.canvas_id, o.name, a.canvas_id, a.name
             FROM outcomes o
             LEFT JOIN assignment_outcome ao ON ao.outcome_id = o.id
             LEFT JOIN assignments a ON a.id = ao.assignment_id
             WHERE o.canvas_id = ?",
            [outcome_canvas_id],
            |r| {
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
            },
        )
        .optional();

    match row {
        Ok(Some(outcome)) => ok(&req.id, json!({ "outcome": outcome })),
        Ok(None) => err(
            &req.id,
            "not_found",
            "Outcome not found. Check the outcome ID and try again.",
            None,
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_outcomes_remove(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let course_canvas_id = match required_i64(&req.params, "courseId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let outcome_canvas_id = match required_i64(&req.params, "outcomeId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let course_id = match course_local_id(conn, course_canvas_id) {
        Ok(Some(id)) => id,
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return e.response(&req.id),
    };
    let outcome = match outcome_by_canvas_id(conn, outcome_canvas_id) {
        Ok(Some(o)) => o,
        Ok(None) => return err(&req.id, "not_found", "outcome not found", None),
        Err(e) => return e.response(&req.id),
    };

    // Only the course association goes; the outcome row and student
    // attempts stay, other courses may rely on them.
    if let Err(e) = conn.execute(
        "DELETE FROM course_outcomes WHERE course_id = ? AND outcome_id = ?",
        (&course_id, &outcome.id),
    ) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "course_outcomes" })),
        );
    }

    ok(
        &req.id,
        json!({ "message": format!("Removed {} from the course.", outcome.name) }),
    )
}

fn handle_outcomes_scores(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let course_canvas_id = match required_i64(&req.params, "courseId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let outcome_canvas_id = match required_i64(&req.params, "outcomeId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let method = match calc_method_param(conn, &req.params) {
        Ok(m) => m,
        Err(e) => return e.response(&req.id),
    };

    let course_id = match course_local_id(conn, course_canvas_id) {
        Ok(Some(id)) => id,
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return e.response(&req.id),
    };
    let outcome = match outcome_by_canvas_id(conn, outcome_canvas_id) {
        Ok(Some(o)) => o,
        Ok(None) => return err(&req.id, "not_found", "outcome not found", None),
        Err(e) => return e.response(&req.id),
    };
    match outcome_attached(conn, &course_id, &outcome.id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "outcome is not in the course", None),
        Err(e) => return e.response(&req.id),
    }

    let students = match sync::course_students(conn, course_canvas_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut scores = Vec::with_capacity(students.len());
    for student in students {
        let score =
            match calc::user_outcome_score(conn, outcome_canvas_id, student.canvas_id, method) {
                Ok(s) => s,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
        scores.push(json!({
            "canvasId": student.canvas_id,
            "name": student.name,
            "score": score
        }));
    }

    ok(
        &req.id,
        json!({ "calcMethod": method.name(), "scores": scores }),
    )
}

fn handle_outcomes_align(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let course_canvas_id = match required_i64(&req.params, "courseId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let outcome_canvas_id = match required_i64(&req.params, "outcomeId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let assignment_canvas_id = match required_i64(&req.params, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    if let Err(e) = match course_local_id(conn, course_canvas_id) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(HandlerErr::new("not_found", "course not found")),
        Err(e) => Err(e),
    } {
        return e.response(&req.id);
    }

    let assignment: Option<(String, String)> = match conn
        .query_row(
            "SELECT id, name FROM assignments WHERE canvas_id = ?",
            [assignment_canvas_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((assignment_id, assignment_name)) = assignment else {
        return err(
            &req.id,
            "not_found",
            format!("No assignment with ID {} found.", assignment_canvas_id),
            None,
        );
    };

    let outcome = match outcome_by_canvas_id(conn, outcome_canvas_id) {
        Ok(Some(o)) => o,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                format!("No outcome with ID {} found.", outcome_canvas_id),
                None,
            )
        }
        Err(e) => return e.response(&req.id),
    };

    // Re-aligning to the same outcome is a conflict; switching to another
    // outcome replaces the watch.
    let current: Option<String> = match conn
        .query_row(
            "SELECT outcome_id FROM assignment_outcome WHERE assignment_id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if current.as_deref() == Some(outcome.id.as_str()) {
        return err(
            &req.id,
            "conflict",
            format!(
                "Assignment {} is already aligned to Outcome {}.",
                assignment_name, outcome.name
            ),
            None,
        );
    }
    if let Err(e) = conn.execute(
        "INSERT INTO assignment_outcome(assignment_id, outcome_id) VALUES(?, ?)
         ON CONFLICT(assignment_id) DO UPDATE SET outcome_id = excluded.outcome_id",
        (&assignment_id, &outcome.id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assignment_outcome" })),
        );
    }

    let outcomes = match course_outcomes_json(conn, course_canvas_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let has_alignment = outcomes.iter().any(|o| !o["alignment"].is_null());
    ok(
        &req.id,
        json!({ "outcomes": outcomes, "hasAlignment": has_alignment }),
    )
}

fn handle_outcomes_unalign(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let course_canvas_id = match required_i64(&req.params, "courseId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let outcome_canvas_id = match required_i64(&req.params, "outcomeId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let outcome = match outcome_by_canvas_id(conn, outcome_canvas_id) {
        Ok(Some(o)) => o,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                format!("No outcome with ID {} found.", outcome_canvas_id),
                None,
            )
        }
        Err(e) => return e.response(&req.id),
    };

    let removed = match conn.execute(
        "DELETE FROM assignment_outcome WHERE outcome_id = ?",
        [&outcome.id],
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "assignment_outcome" })),
            )
        }
    };
    if removed == 0 {
        return err(
            &req.id,
            "no_alignment",
            "outcome is not aligned to an assignment",
            None,
        );
    }

    let outcomes = match course_outcomes_json(conn, course_canvas_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let has_alignment = outcomes.iter().any(|o| !o["alignment"].is_null());
    ok(
        &req.id,
        json!({ "outcomes": outcomes, "hasAlignment": has_alignment }),
    )
}

fn handle_outcomes_attempts(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let course_canvas_id = match required_i64(&req.params, "courseId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let user_canvas_id = match required_i64(&req.params, "userId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let outcome_canvas_id = match required_i64(&req.params, "outcomeId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    if let Err(e) = match course_local_id(conn, course_canvas_id) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(HandlerErr::new("not_found", "course not found")),
        Err(e) => Err(e),
    } {
        return e.response(&req.id);
    }
    let outcome = match outcome_by_canvas_id(conn, outcome_canvas_id) {
        Ok(Some(o)) => o,
        Ok(None) => return err(&req.id, "not_found", "outcome not found", None),
        Err(e) => return e.response(&req.id),
    };

    let student: Option<String> = match conn
        .query_row(
            "SELECT u.name
             FROM users u
             JOIN user_courses uc ON uc.user_id = u.id
             JOIN courses c ON c.id = uc.course_id
             WHERE c.canvas_id = ? AND u.canvas_id = ?",
            (course_canvas_id, user_canvas_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(student) = student else {
        return err(&req.id, "not_found", "user is not enrolled in the course", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT score, success, occurred FROM outcome_attempts
         WHERE outcome_canvas_id = ? AND user_canvas_id = ?
         ORDER BY occurred, attempt_canvas_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let attempts = stmt
        .query_map((outcome_canvas_id, user_canvas_id), |r| {
            let score: f64 = r.get(0)?;
            let success: Option<bool> = r.get(1)?;
            let occurred: Option<String> = r.get(2)?;
            Ok(json!({
                "score": score,
                "success": success,
                "occurred": occurred
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let attempts = match attempts {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let scores: Vec<Value> = attempts.iter().map(|a| a["score"].clone()).collect();

    ok(
        &req.id,
        json!({
            "student": student,
            "outcome": { "canvasId": outcome.canvas_id, "name": outcome.name },
            "attempts": attempts,
            "scores": scores
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "outcomes.import" => Some(handle_outcomes_import(state, req)),
        "outcomes.get" => Some(handle_outcomes_get(state, req)),
        "outcomes.remove" => Some(handle_outcomes_remove(state, req)),
        "outcomes.scores" => Some(handle_outcomes_scores(state, req)),
        "outcomes.align" => Some(handle_outcomes_align(state, req)),
        "outcomes.unalign" => Some(handle_outcomes_unalign(state, req)),
        "outcomes.attempts" => Some(handle_outcomes_attempts(state, req)),
        _ => None,
    }
}
