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

fn error_message(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn ws_conn(workspace: &Path) -> rusqlite::Connection {
    rusqlite::Connection::open(workspace.join("masteryhelper.sqlite3")).expect("open workspace db")
}

fn alignment_of<'a>(outcomes: &'a serde_json::Value, canvas_id: i64) -> &'a serde_json::Value {
    outcomes
        .as_array()
        .expect("outcomes array")
        .iter()
        .find(|o| o["canvasId"] == canvas_id)
        .expect("outcome present")
        .get("alignment")
        .expect("alignment field")
}

#[test]
fn alignment_watch_replace_and_unwatch() {
    let workspace = temp_dir("masteryd-alignment");
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
        "outcomes.import",
        json!({ "courseId": 999, "outcomeId": 501, "name": "Quadratics" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.import",
        json!({ "courseId": 999, "canvasId": 700, "name": "Quiz 1", "pointsPossible": 10.0 }),
    );

    let missing_assignment = request(
        &mut stdin,
        &mut reader,
        "6",
        "outcomes.align",
        json!({ "courseId": 999, "outcomeId": 500, "assignmentId": 12345 }),
    );
    assert_eq!(error_code(&missing_assignment), "not_found");
    assert_eq!(
        error_message(&missing_assignment),
        "No assignment with ID 12345 found."
    );

    let missing_outcome = request(
        &mut stdin,
        &mut reader,
        "7",
        "outcomes.align",
        json!({ "courseId": 999, "outcomeId": 600, "assignmentId": 700 }),
    );
    assert_eq!(error_code(&missing_outcome), "not_found");
    assert_eq!(error_message(&missing_outcome), "No outcome with ID 600 found.");

    let aligned = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "outcomes.align",
        json!({ "courseId": 999, "outcomeId": 500, "assignmentId": 700 }),
    );
    assert_eq!(aligned["hasAlignment"], true);
    assert_eq!(alignment_of(&aligned["outcomes"], 500)["canvasId"], 700);

    let again = request(
        &mut stdin,
        &mut reader,
        "9",
        "outcomes.align",
        json!({ "courseId": 999, "outcomeId": 500, "assignmentId": 700 }),
    );
    assert_eq!(error_code(&again), "conflict");

    // Switching the watch to another outcome replaces it.
    let switched = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "outcomes.align",
        json!({ "courseId": 999, "outcomeId": 501, "assignmentId": 700 }),
    );
    assert!(alignment_of(&switched["outcomes"], 500).is_null());
    assert_eq!(alignment_of(&switched["outcomes"], 501)["canvasId"], 700);

    let unaligned = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "outcomes.unalign",
        json!({ "courseId": 999, "outcomeId": 501 }),
    );
    assert_eq!(unaligned["hasAlignment"], false);

    let nothing_to_unalign = request(
        &mut stdin,
        &mut reader,
        "12",
        "outcomes.unalign",
        json!({ "courseId": 999, "outcomeId": 501 }),
    );
    assert_eq!(error_code(&nothing_to_unalign), "no_alignment");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn outcome_remove_detaches_but_keeps_attempts() {
    let workspace = temp_dir("masteryd-outcome-remove");
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
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "outcomes.import",
        json!({ "courseId": 999, "outcomeId": 500, "name": "Linear equations" }),
    );

    let duplicate = request(
        &mut stdin,
        &mut reader,
        "4",
        "outcomes.import",
        json!({ "courseId": 999, "outcomeId": 500, "name": "Linear equations" }),
    );
    assert_eq!(error_code(&duplicate), "conflict");

    {
        let conn = ws_conn(&workspace);
        conn.execute(
            "INSERT INTO users(id, canvas_id, user_type_id, name) VALUES('seed-u11', 11, 3, 'Doe, Jane')",
            [],
        )
        .expect("insert user");
        conn.execute(
            "INSERT INTO outcome_attempts(
                id, user_canvas_id, outcome_canvas_id, attempt_canvas_id, success, score, occurred
             ) VALUES('seed-a1', 11, 500, 9001, 1, 3.0, '2021-03-04T17:46:29+00:00')",
            [],
        )
        .expect("insert attempt");
    }

    let removed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "outcomes.remove",
        json!({ "courseId": 999, "outcomeId": 500 }),
    );
    assert_eq!(removed["message"], "Removed Linear equations from the course.");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "courses.outcomes",
        json!({ "canvasId": 999 }),
    );
    assert_eq!(listed["outcomes"].as_array().map(|o| o.len()), Some(0));

    // The outcome row and its attempts survive the detach.
    let outcome = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "outcomes.get",
        json!({ "outcomeId": 500 }),
    );
    assert_eq!(outcome["outcome"]["canvasId"], 500);
    {
        let conn = ws_conn(&workspace);
        let attempts: i64 = conn
            .query_row("SELECT COUNT(*) FROM outcome_attempts", [], |r| r.get(0))
            .expect("count attempts");
        assert_eq!(attempts, 1);
    }

    // Detached means it can be imported again.
    let reimported = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "outcomes.import",
        json!({ "courseId": 999, "outcomeId": 500, "name": "Linear equations" }),
    );
    assert_eq!(reimported["outcome"]["canvasId"], 500);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
