use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::info;

use crate::calc::MasteryCalculation;
use crate::canvas::CanvasClient;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    canvas_client, db_conn, required_i64, teacher_preferences, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::sync::{self, AlignedAssignment};

struct PushReport {
    assignment_canvas_id: i64,
    assignment_name: String,
    outcome_canvas_id: i64,
    graded: usize,
    skipped: usize,
    posted: usize,
}

impl PushReport {
    fn to_json(&self) -> Value {
        json!({
            "assignmentCanvasId": self.assignment_canvas_id,
            "name": self.assignment_name,
            "outcomeCanvasId": self.outcome_canvas_id,
            "graded": self.graded,
            "skipped": self.skipped,
            "posted": self.posted
        })
    }
}

/// Run the passback workflow for one aligned assignment: plan, persist
/// locally, then send each grade to the gradebook.
fn push_aligned(
    conn: &Connection,
    client: Option<&CanvasClient>,
    aligned: &AlignedAssignment,
    method: MasteryCalculation,
    cutoff: f64,
) -> Result<PushReport, HandlerErr> {
    info!(
        assignment = %aligned.assignment_name,
        outcome = %aligned.outcome_name,
        "assignment is aligned, computing grades"
    );

    let updates = sync::plan_assignment_grades(conn, aligned, method, cutoff)?;
    let graded = sync::apply_grade_updates(conn, &updates)?;
    let skipped = updates.iter().filter(|u| u.grade.is_none()).count();

    let mut posted = 0usize;
    for update in &updates {
        let Some(grade) = update.grade else {
            continue;
        };
        let Some(client) = client else {
            // Nothing to send without a connection; the caller only omits
            // the client when the plan is empty.
            continue;
        };
        info!(
            student = %update.user_name,
            grade,
            assignment = aligned.assignment_canvas_id,
            "posting grade"
        );
        client
            .put_submission_grade(
                aligned.course_canvas_id,
                aligned.assignment_canvas_id,
                update.user_canvas_id,
                grade,
            )
            .map_err(|e| {
                HandlerErr::with_details(
                    "canvas_request_failed",
                    e.to_string(),
                    json!({
                        "assignmentCanvasId": aligned.assignment_canvas_id,
                        "userCanvasId": update.user_canvas_id,
                        "gradedLocally": graded
                    }),
                )
            })?;
        posted += 1;
    }

    Ok(PushReport {
        assignment_canvas_id: aligned.assignment_canvas_id,
        assignment_name: aligned.assignment_name.clone(),
        outcome_canvas_id: aligned.outcome_canvas_id,
        graded,
        skipped,
        posted,
    })
}

/// The client is only required when at least one grade will be sent, so a
/// course with nothing to post works without a configured connection.
fn client_if_needed(
    state: &AppState,
    needs_posts: bool,
) -> Result<Option<CanvasClient>, HandlerErr> {
    if needs_posts {
        Ok(Some(canvas_client(state)?))
    } else {
        Ok(None)
    }
}

fn handle_grades_push(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let course_canvas_id = match required_i64(&req.params, "courseId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let aligned = match sync::aligned_assignments(conn, course_canvas_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (method, cutoff) = teacher_preferences(conn);

    // Plan everything first so the connection requirement depends on
    // whether there is anything to send.
    let mut needs_posts = false;
    for a in &aligned {
        let updates = match sync::plan_assignment_grades(conn, a, method, cutoff) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        needs_posts = needs_posts || updates.iter().any(|u| u.grade.is_some());
    }
    let client = match client_if_needed(state, needs_posts) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };

    let mut reports = Vec::with_capacity(aligned.len());
    for a in &aligned {
        match push_aligned(conn, client.as_ref(), a, method, cutoff) {
            Ok(r) => reports.push(r.to_json()),
            Err(e) => return e.response(&req.id),
        }
    }

    ok(
        &req.id,
        json!({
            "message": "All student scores updated",
            "assignments": reports
        }),
    )
}

fn handle_grades_push_assignment(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let assignment_canvas_id = match required_i64(&req.params, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let aligned = match sync::alignment_for(conn, assignment_canvas_id) {
        Ok(Some(a)) => a,
        Ok(None) => {
            return err(
                &req.id,
                "no_alignment",
                "assignment is not aligned to an outcome",
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (method, cutoff) = teacher_preferences(conn);

    let updates = match sync::plan_assignment_grades(conn, &aligned, method, cutoff) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let needs_posts = updates.iter().any(|u| u.grade.is_some());
    let client = match client_if_needed(state, needs_posts) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };

    match push_aligned(conn, client.as_ref(), &aligned, method, cutoff) {
        Ok(r) => ok(
            &req.id,
            json!({ "message": "Success", "assignment": r.to_json() }),
        ),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "grades.push" => Some(handle_grades_push(state, req)),
        "grades.pushAssignment" => Some(handle_grades_push_assignment(state, req)),
        _ => None,
    }
}
