use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use crate::calc::{self, MasteryCalculation};
use crate::canvas::{CanvasEnrollment, OutcomeResult};

/// Student user type, seeded at database creation.
pub const STUDENT_TYPE_ID: i64 = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct EnrollmentSync {
    pub new_users: usize,
    pub enrolled: usize,
}

/// Store fetched student enrollments and attach them to the course. New
/// students are created as type-3 users; known users are only linked.
pub fn enroll_students(
    conn: &Connection,
    course_canvas_id: i64,
    enrollments: &[CanvasEnrollment],
) -> anyhow::Result<EnrollmentSync> {
    let course_id: Option<String> = conn
        .query_row(
            "SELECT id FROM courses WHERE canvas_id = ?",
            [course_canvas_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(course_id) = course_id else {
        anyhow::bail!("course {} is not stored", course_canvas_id);
    };

    let tx = conn.unchecked_transaction()?;
    let mut sync = EnrollmentSync::default();
    for enrollment in enrollments {
        let user_id: Option<String> = tx
            .query_row(
                "SELECT id FROM users WHERE canvas_id = ?",
                [enrollment.user_id],
                |r| r.get(0),
            )
            .optional()?;
        let user_id = match user_id {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO users(id, canvas_id, user_type_id, name, email)
                     VALUES(?, ?, ?, ?, NULL)",
                    (&id, enrollment.user_id, STUDENT_TYPE_ID, &enrollment.user.sortable_name),
                )?;
                sync.new_users += 1;
                id
            }
        };
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO user_courses(course_id, user_id) VALUES(?, ?)",
            (&course_id, &user_id),
        )?;
        sync.enrolled += inserted;
    }
    tx.commit()?;

    info!(
        course = course_canvas_id,
        new_users = sync.new_users,
        enrolled = sync.enrolled,
        "enrollment sync finished"
    );
    Ok(sync)
}

/// Canvas timestamps arrive as RFC 3339; normalize for lexicographic sort.
fn normalize_occurred(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Some(dt.with_timezone(&Utc).to_rfc3339()),
        Err(_) => Some(raw.to_string()),
    }
}

/// Record fetched outcome results as attempts. Results without a score are
/// skipped (a teacher can score a rubric and later remove that score), as
/// are results already stored and results for users or outcomes we do not
/// track. Stamps the course when anything new was stored.
pub fn record_attempts(
    conn: &Connection,
    course_canvas_id: i64,
    results: &[OutcomeResult],
) -> anyhow::Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut stored = 0usize;

    for attempt in results {
        let Some(score) = attempt.score else {
            debug!(attempt = attempt.id, "skipping unscored result");
            continue;
        };
        let (Ok(user_canvas_id), Ok(outcome_canvas_id)) = (
            attempt.links.user.parse::<i64>(),
            attempt.links.learning_outcome.parse::<i64>(),
        ) else {
            debug!(attempt = attempt.id, "skipping result with malformed links");
            continue;
        };

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM outcome_attempts WHERE attempt_canvas_id = ?",
                [attempt.id],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_some() {
            continue;
        }

        // The attempt table holds foreign keys against users and outcomes;
        // results for rows we do not track are dropped, not errors.
        let user_known: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM users WHERE canvas_id = ?",
                [user_canvas_id],
                |r| r.get(0),
            )
            .optional()?;
        let outcome_known: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM outcomes WHERE canvas_id = ?",
                [outcome_canvas_id],
                |r| r.get(0),
            )
            .optional()?;
        if user_known.is_none() || outcome_known.is_none() {
            debug!(
                attempt = attempt.id,
                user = user_canvas_id,
                outcome = outcome_canvas_id,
                "skipping result for untracked user or outcome"
            );
            continue;
        }

        tx.execute(
            "INSERT INTO outcome_attempts(
                id, user_canvas_id, outcome_canvas_id, attempt_canvas_id,
                success, score, occurred
             ) VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                user_canvas_id,
                outcome_canvas_id,
                attempt.id,
                attempt.mastery,
                score,
                normalize_occurred(attempt.submitted_or_assessed_at.as_deref()),
            ),
        )?;
        stored += 1;
    }

    if stored > 0 {
        tx.execute(
            "UPDATE courses SET updated_at = ? WHERE canvas_id = ?",
            (Utc::now().to_rfc3339(), course_canvas_id),
        )?;
    }
    tx.commit()?;

    info!(course = course_canvas_id, stored, "attempt sync finished");
    Ok(stored)
}

/// Canvas ids of the outcomes attached to a course.
pub fn course_outcome_ids(conn: &Connection, course_canvas_id: i64) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT o.canvas_id
         FROM outcomes o
         JOIN course_outcomes co ON co.outcome_id = o.id
         JOIN courses c ON c.id = co.course_id
         WHERE c.canvas_id = ?
         ORDER BY o.canvas_id",
    )?;
    let rows = stmt
        .query_map([course_canvas_id], |r| r.get(0))?
        .collect::<Result<Vec<_>, _>>();
    rows
}

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub canvas_id: i64,
    pub name: String,
}

/// Students enrolled in a course, roster order.
pub fn course_students(conn: &Connection, course_canvas_id: i64) -> rusqlite::Result<Vec<StudentRow>> {
    let mut stmt = conn.prepare(
        "SELECT u.canvas_id, u.name
         FROM users u
         JOIN user_courses uc ON uc.user_id = u.id
         JOIN courses c ON c.id = uc.course_id
         WHERE c.canvas_id = ? AND u.user_type_id = ?
         ORDER BY u.name",
    )?;
    let rows = stmt
        .query_map((course_canvas_id, STUDENT_TYPE_ID), |r| {
            Ok(StudentRow {
                canvas_id: r.get(0)?,
                name: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>();
    rows
}

#[derive(Debug, Clone)]
pub struct AlignedAssignment {
    pub assignment_canvas_id: i64,
    pub assignment_name: String,
    pub points_possible: f64,
    pub outcome_canvas_id: i64,
    pub outcome_name: String,
    pub course_canvas_id: i64,
}

const ALIGNED_SELECT: &str = "SELECT a.canvas_id, a.name, COALESCE(a.points_possible, 0),
        o.canvas_id, o.name, c.canvas_id
 FROM assignments a
 JOIN assignment_outcome ao ON ao.assignment_id = a.id
 JOIN outcomes o ON o.id = ao.outcome_id
 JOIN course_assignments ca ON ca.assignment_id = a.id
 JOIN courses c ON c.id = ca.course_id";

fn aligned_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<AlignedAssignment> {
    Ok(AlignedAssignment {
        assignment_canvas_id: r.get(0)?,
        assignment_name: r.get(1)?,
        points_possible: r.get(2)?,
        outcome_canvas_id: r.get(3)?,
        outcome_name: r.get(4)?,
        course_canvas_id: r.get(5)?,
    })
}

/// Every assignment in the course that watches an outcome.
pub fn aligned_assignments(
    conn: &Connection,
    course_canvas_id: i64,
) -> rusqlite::Result<Vec<AlignedAssignment>> {
    let sql = format!("{} WHERE c.canvas_id = ? ORDER BY a.canvas_id", ALIGNED_SELECT);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([course_canvas_id], |r| aligned_from_row(r))?
        .collect::<Result<Vec<_>, _>>();
    rows
}

/// A single assignment's alignment, or None when it watches nothing.
pub fn alignment_for(
    conn: &Connection,
    assignment_canvas_id: i64,
) -> rusqlite::Result<Option<AlignedAssignment>> {
    let sql = format!("{} WHERE a.canvas_id = ?", ALIGNED_SELECT);
    conn.query_row(&sql, [assignment_canvas_id], |r| aligned_from_row(r))
        .optional()
}

#[derive(Debug, Clone)]
pub struct GradeUpdate {
    pub assignment_canvas_id: i64,
    pub user_canvas_id: i64,
    pub user_name: String,
    pub mastery: Option<f64>,
    pub grade: Option<f64>,
}

/// Compute the passback plan for one aligned assignment: each enrolled
/// student's mastery score against the cutoff. Students without attempts
/// carry no grade and are skipped by apply and post.
pub fn plan_assignment_grades(
    conn: &Connection,
    aligned: &AlignedAssignment,
    method: MasteryCalculation,
    cutoff: f64,
) -> anyhow::Result<Vec<GradeUpdate>> {
    let students = course_students(conn, aligned.course_canvas_id)?;
    let mut updates = Vec::with_capacity(students.len());
    for student in students {
        let mastery =
            calc::user_outcome_score(conn, aligned.outcome_canvas_id, student.canvas_id, method)?;
        let grade = mastery.map(|score| calc::passback_grade(score, cutoff, aligned.points_possible));
        updates.push(GradeUpdate {
            assignment_canvas_id: aligned.assignment_canvas_id,
            user_canvas_id: student.canvas_id,
            user_name: student.name,
            mastery,
            grade,
        });
    }
    Ok(updates)
}

/// Persist computed grades locally, one row per student and assignment.
pub fn apply_grade_updates(conn: &Connection, updates: &[GradeUpdate]) -> anyhow::Result<usize> {
    let now = Utc::now().to_rfc3339();
    let tx = conn.unchecked_transaction()?;
    let mut applied = 0usize;
    for update in updates {
        let Some(grade) = update.grade else {
            continue;
        };
        tx.execute(
            "INSERT INTO user_assignments(id, user_canvas_id, assignment_canvas_id, score, occurred)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(user_canvas_id, assignment_canvas_id)
             DO UPDATE SET score = excluded.score, occurred = excluded.occurred",
            (
                Uuid::new_v4().to_string(),
                update.user_canvas_id,
                update.assignment_canvas_id,
                grade,
                &now,
            ),
        )?;
        applied += 1;
    }
    tx.commit()?;
    Ok(applied)
}
