use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("masteryhelper.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_types(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            canvas_id INTEGER NOT NULL UNIQUE,
            user_type_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            email TEXT,
            FOREIGN KEY(user_type_id) REFERENCES user_types(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_type ON users(user_type_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            canvas_id INTEGER NOT NULL UNIQUE,
            name TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    // Workspaces created before attempt syncing stamped courses may lack updated_at.
    ensure_courses_updated_at(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS outcomes(
            id TEXT PRIMARY KEY,
            canvas_id INTEGER NOT NULL UNIQUE,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            canvas_id INTEGER NOT NULL UNIQUE,
            name TEXT NOT NULL,
            points_possible REAL
        )",
        [],
    )?;
    ensure_assignments_points_possible(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_courses(
            course_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            PRIMARY KEY(course_id, user_id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_courses_user ON user_courses(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_outcomes(
            course_id TEXT NOT NULL,
            outcome_id TEXT NOT NULL,
            PRIMARY KEY(course_id, outcome_id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(outcome_id) REFERENCES outcomes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_outcomes_outcome ON course_outcomes(outcome_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_assignments(
            course_id TEXT NOT NULL,
            assignment_id TEXT NOT NULL,
            PRIMARY KEY(course_id, assignment_id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(assignment_id) REFERENCES assignments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_assignments_assignment ON course_assignments(assignment_id)",
        [],
    )?;

    // An assignment watches at most one outcome.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignment_outcome(
            assignment_id TEXT PRIMARY KEY,
            outcome_id TEXT NOT NULL,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            FOREIGN KEY(outcome_id) REFERENCES outcomes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignment_outcome_outcome ON assignment_outcome(outcome_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS outcome_attempts(
            id TEXT PRIMARY KEY,
            user_canvas_id INTEGER NOT NULL,
            outcome_canvas_id INTEGER NOT NULL,
            attempt_canvas_id INTEGER NOT NULL UNIQUE,
            success INTEGER,
            score REAL NOT NULL,
            occurred TEXT,
            FOREIGN KEY(user_canvas_id) REFERENCES users(canvas_id)
                ON UPDATE CASCADE ON DELETE CASCADE,
            FOREIGN KEY(outcome_canvas_id) REFERENCES outcomes(canvas_id)
                ON UPDATE CASCADE ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_outcome_attempts_user ON outcome_attempts(user_canvas_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_outcome_attempts_outcome ON outcome_attempts(outcome_canvas_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_assignments(
            id TEXT PRIMARY KEY,
            user_canvas_id INTEGER NOT NULL,
            assignment_canvas_id INTEGER NOT NULL,
            score REAL,
            occurred TEXT,
            UNIQUE(user_canvas_id, assignment_canvas_id),
            FOREIGN KEY(user_canvas_id) REFERENCES users(canvas_id)
                ON UPDATE CASCADE ON DELETE CASCADE,
            FOREIGN KEY(assignment_canvas_id) REFERENCES assignments(canvas_id)
                ON UPDATE CASCADE ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_assignments_assignment ON user_assignments(assignment_canvas_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    seed_user_types(&conn)?;

    Ok(conn)
}

fn seed_user_types(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO user_types(id, name) VALUES (1, 'Admin'), (2, 'Teacher'), (3, 'Student')",
        [],
    )?;
    Ok(())
}

fn ensure_courses_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "courses", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE courses ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn ensure_assignments_points_possible(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "assignments", "points_possible")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE assignments ADD COLUMN points_possible REAL", [])?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, value.to_string()),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
