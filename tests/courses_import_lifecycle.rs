use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_masteryd");
    let mut child = Command::new(exe)
        .env_remove("CANVAS_BASE_URL")
        .env_remove("CANVAS_TOKEN")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn masteryd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn seed_student(workspace: &Path, course_canvas_id: i64, user_canvas_id: i64, name: &str) {
    let conn = rusqlite::Connection::open(workspace.join("masteryhelper.sqlite3"))
        .expect("open workspace db");
    let course_id: String = conn
        .query_row(
            "SELECT id FROM courses WHERE canvas_id = ?",
            [course_canvas_id],
            |r| r.get(0),
        )
        .expect("course row");
    let user_id = format!("seed-user-{}", user_canvas_id);
    conn.execute(
        "INSERT INTO users(id, canvas_id, user_type_id, name) VALUES(?, ?, 3, ?)",
        (&user_id, user_canvas_id, name),
    )
    .expect("insert user");
    conn.execute(
        "INSERT INTO user_courses(course_id, user_id) VALUES(?, ?)",
        (&course_id, &user_id),
    )
    .expect("enroll user");
}

#[test]
fn course_import_is_offline_tolerant_and_conflicts_on_duplicate() {
    let workspace = temp_dir("masteryd-course-import");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.import",
        json!({ "canvasId": 999, "name": "Algebra 1" }),
    );
    assert_eq!(imported["canvasId"], 999);
    // No Canvas connection: the course stores, the roster sync is deferred.
    assert!(imported["enrollmentsSynced"].is_null());

    let duplicate = request(
        &mut stdin,
        &mut reader,
        "3",
        "courses.import",
        json!({ "canvasId": 999, "name": "Algebra 1 again" }),
    );
    assert_eq!(duplicate["ok"], false);
    assert_eq!(error_code(&duplicate), "conflict");

    seed_student(&workspace, 999, 11, "Doe, Jane");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "outcomes.import",
        json!({ "courseId": 999, "outcomeId": 500, "name": "Linear equations" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.import",
        json!({ "courseId": 999, "canvasId": 700, "name": "Quiz 1", "pointsPossible": 10.0 }),
    );

    let listed = request_ok(&mut stdin, &mut reader, "6", "courses.list", json!({}));
    let courses = listed["courses"].as_array().expect("courses array");
    assert_eq!(courses.len(), 1);
    assert_eq!(courses[0]["studentCount"], 1);
    assert_eq!(courses[0]["outcomeCount"], 1);
    assert_eq!(courses[0]["assignmentCount"], 1);

    let missing = request(
        &mut stdin,
        &mut reader,
        "7",
        "courses.get",
        json!({ "canvasId": 12345 }),
    );
    assert_eq!(error_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn course_delete_keeps_users_outcomes_and_assignments() {
    let workspace = temp_dir("masteryd-course-delete");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.import",
        json!({ "canvasId": 999, "name": "Algebra 1" }),
    );
    seed_student(&workspace, 999, 11, "Doe, Jane");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "outcomes.import",
        json!({ "courseId": 999, "outcomeId": 500, "name": "Linear equations" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assignments.import",
        json!({ "courseId": 999, "canvasId": 700, "name": "Quiz 1", "pointsPossible": 10.0 }),
    );

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "courses.delete",
        json!({ "canvasId": 999 }),
    );
    assert_eq!(deleted["message"], "Course deleted.");

    let listed = request_ok(&mut stdin, &mut reader, "6", "courses.list", json!({}));
    assert_eq!(listed["courses"].as_array().map(|c| c.len()), Some(0));

    // Shared rows survive the course: another course may use them.
    let users = request_ok(&mut stdin, &mut reader, "7", "users.list", json!({}));
    assert_eq!(users["users"].as_array().map(|u| u.len()), Some(1));
    let outcome = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "outcomes.get",
        json!({ "outcomeId": 500 }),
    );
    assert_eq!(outcome["outcome"]["canvasId"], 500);
    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "assignments.get",
        json!({ "assignmentId": 700 }),
    );
    assert_eq!(assignment["assignment"]["canvasId"], 700);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn data_methods_require_a_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    // Listing endpoints tolerate the missing workspace.
    let listed = request_ok(&mut stdin, &mut reader, "1", "courses.list", json!({}));
    assert_eq!(listed["courses"].as_array().map(|c| c.len()), Some(0));

    let imported = request(
        &mut stdin,
        &mut reader,
        "2",
        "courses.import",
        json!({ "canvasId": 999, "name": "Algebra 1" }),
    );
    assert_eq!(error_code(&imported), "no_workspace");

    let pushed = request(
        &mut stdin,
        &mut reader,
        "3",
        "grades.push",
        json!({ "courseId": 999 }),
    );
    assert_eq!(error_code(&pushed), "no_workspace");

    drop(stdin);
    let _ = child.wait();
}
