use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

use crate::calc::MasteryCalculation;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, optional_str, required_i64, teacher_preferences, HandlerErr, PREFS_SETTINGS_KEY,
};
use crate::ipc::types::{AppState, Request};

fn enrollments_json(conn: &Connection, user_canvas_id: i64) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT c.canvas_id, c.name
         FROM courses c
         JOIN user_courses uc ON uc.course_id = c.id
         JOIN users u ON u.id = uc.user_id
         WHERE u.canvas_id = ?
         ORDER BY c.name",
    )?;
    let rows = stmt
        .query_map([user_canvas_id], |r| {
            let canvas_id: i64 = r.get(0)?;
            let name: String = r.get(1)?;
            Ok(json!({ "canvasId": canvas_id, "name": name }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_users_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "users": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT u.id, u.canvas_id, u.name, u.email, t.name
         FROM users u
         JOIN user_types t ON t.id = u.user_type_id
         ORDER BY u.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let canvas_id: i64 = r.get(1)?;
            let name: String = r.get(2)?;
            let email: Option<String> = r.get(3)?;
            let user_type: String = r.get(4)?;
            Ok(json!({
                "id": id,
                "canvasId": canvas_id,
                "name": name,
                "email": email,
                "userType": user_type
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_get(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let user_canvas_id = match required_i64(&req.params, "userId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let user = conn
        .query_row(
            "SELECT u.id, u.canvas_id, u.name, u.email, t.name
             FROM users u
             JOIN user_types t ON t.id = u.user_type_id
             WHERE u.canvas_id = ?",
            [user_canvas_id],
            |r| {
                let id: String = r.get(0)?;
                let canvas_id: i64 = r.get(1)?;
                let name: String = r.get(2)?;
                let email: Option<String> = r.get(3)?;
                let user_type: String = r.get(4)?;
                Ok(json!({
                    "id": id,
                    "canvasId": canvas_id,
                    "name": name,
                    "email": email,
                    "userType": user_type
                }))
            },
        )
        .optional();
    let mut user = match user {
        Ok(Some(u)) => u,
        Ok(None) => return err(&req.id, "not_found", "user not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match enrollments_json(conn, user_canvas_id) {
        Ok(enrollments) => {
            user["enrollments"] = json!(enrollments);
            ok(&req.id, json!({ "user": user }))
        }
        Err(e) => e.response(&req.id),
    }
}

fn handle_users_courses(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let user_canvas_id = match required_i64(&req.params, "userId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM users WHERE canvas_id = ?",
            [user_canvas_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "user not found", None);
    }

    match enrollments_json(conn, user_canvas_id) {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_prefs_get(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let (method, cutoff) = teacher_preferences(conn);
    ok(
        &req.id,
        json!({
            "calculationMethod": method.name(),
            "masteryScore": cutoff
        }),
    )
}

fn handle_prefs_update(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };

    let (mut method, mut cutoff) = teacher_preferences(conn);
    if let Some(name) = optional_str(&req.params, "calculationMethod") {
        match MasteryCalculation::from_name(&name) {
            Some(m) => method = m,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown calculation method: {}", name),
                    None,
                )
            }
        }
    }
    if let Some(raw) = req.params.get("masteryScore") {
        match raw.as_f64() {
            Some(v) => cutoff = v,
            None => return err(&req.id, "bad_params", "masteryScore must be a number", None),
        }
    }

    let value = json!({
        "calculationMethod": method.name(),
        "masteryScore": cutoff
    });
    if let Err(e) = db::settings_set_json(conn, PREFS_SETTINGS_KEY, &value) {
        return err(&req.id, "db_write_failed", e.to_string(), None);
    }
    ok(&req.id, value)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "users.list" => Some(handle_users_list(state, req)),
        "users.get" => Some(handle_users_get(state, req)),
        "users.courses" => Some(handle_users_courses(state, req)),
        "prefs.get" => Some(handle_prefs_get(state, req)),
        "prefs.update" => Some(handle_prefs_update(state, req)),
        _ => None,
    }
}
