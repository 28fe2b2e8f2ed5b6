use serde_json::json;
use std::path::PathBuf;

use crate::canvas::CanvasConfig;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{effective_canvas_config, required_str, CANVAS_SETTINGS_KEY};
use crate::ipc::types::{AppState, Request};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            state.workspace = Some(path.clone());
            // Reconnect a previously configured Canvas instance; the
            // environment covers automated runs. A missing or unreadable
            // setting must not prevent the workspace from opening.
            let persisted = db::settings_get_json(&conn, CANVAS_SETTINGS_KEY)
                .ok()
                .flatten()
                .and_then(|v| serde_json::from_value::<CanvasConfig>(v).ok());
            state.canvas = persisted.or_else(CanvasConfig::from_env);
            state.db = Some(conn);
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn handle_canvas_configure(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let base_url = match required_str(&req.params, "baseUrl") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let token = match required_str(&req.params, "token") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let config = CanvasConfig::new(&base_url, &token);
    let value = match serde_json::to_value(&config) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };
    if let Err(e) = db::settings_set_json(conn, CANVAS_SETTINGS_KEY, &value) {
        return err(&req.id, "db_write_failed", e.to_string(), None);
    }

    let base_url = config.base_url.clone();
    state.canvas = Some(config);
    ok(&req.id, json!({ "baseUrl": base_url }))
}

fn handle_canvas_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let config = effective_canvas_config(state);
    ok(
        &req.id,
        json!({
            "configured": config.is_some(),
            "baseUrl": config.map(|c| c.base_url)
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "canvas.configure" => Some(handle_canvas_configure(state, req)),
        "canvas.status" => Some(handle_canvas_status(state, req)),
        _ => None,
    }
}
