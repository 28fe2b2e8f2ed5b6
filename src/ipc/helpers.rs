use rusqlite::Connection;
use serde_json::Value;

use crate::calc::{self, MasteryCalculation};
use crate::canvas::{CanvasClient, CanvasConfig, CanvasError};
use crate::db;
use crate::ipc::error::err;
use crate::ipc::types::AppState;

pub const CANVAS_SETTINGS_KEY: &str = "canvas.connection";
pub const PREFS_SETTINGS_KEY: &str = "teacher.preferences";

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: &'static str, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

impl From<anyhow::Error> for HandlerErr {
    fn from(e: anyhow::Error) -> Self {
        Self::new("db_write_failed", e.to_string())
    }
}

impl From<CanvasError> for HandlerErr {
    fn from(e: CanvasError) -> Self {
        Self::new("canvas_request_failed", e.to_string())
    }
}

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// The Canvas connection configured for the session, with the environment
/// as the non-interactive fallback.
pub fn effective_canvas_config(state: &AppState) -> Option<CanvasConfig> {
    state.canvas.clone().or_else(CanvasConfig::from_env)
}

pub fn canvas_client(state: &AppState) -> Result<CanvasClient, HandlerErr> {
    let config = effective_canvas_config(state).ok_or_else(|| {
        HandlerErr::new(
            "canvas_not_configured",
            "configure the Canvas connection first",
        )
    })?;
    Ok(CanvasClient::new(config))
}

pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn required_f64(params: &Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// The teacher's scoring preferences, with the first-login defaults when
/// nothing has been saved yet.
pub fn teacher_preferences(conn: &Connection) -> (MasteryCalculation, f64) {
    let stored = db::settings_get_json(conn, PREFS_SETTINGS_KEY)
        .ok()
        .flatten();
    let method = stored
        .as_ref()
        .and_then(|v| v.get("calculationMethod"))
        .and_then(|v| v.as_str())
        .and_then(MasteryCalculation::from_name)
        .unwrap_or(calc::DEFAULT_CALCULATION);
    let cutoff = stored
        .as_ref()
        .and_then(|v| v.get("masteryScore"))
        .and_then(|v| v.as_f64())
        .unwrap_or(calc::DEFAULT_MASTERY_SCORE);
    (method, cutoff)
}
