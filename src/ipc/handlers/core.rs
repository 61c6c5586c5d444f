use crate::config::Config;
use crate::db;
use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::helpers::{conn, req_str};
use crate::ipc::types::{AppState, Reply, Request};
use crate::model::{now_rfc3339, Actor, Role};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

fn handle_health(state: &mut AppState, _req: &Request) -> ApiResult<Reply> {
    Ok(Reply::ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
        "actor": state.actor,
    })))
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let path = PathBuf::from(req_str(&req.params, "path")?);
    let conn = db::open_db(&path)?;

    // An explicit --config wins; otherwise the workspace may carry its own file.
    if state.config_path.is_none() {
        state.config = Config::resolve(None, Some(path.as_path()))?;
    }
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    state.actor = None;
    info!(workspace = %path.to_string_lossy(), "workspace opened");
    Ok(Reply::ok(json!({ "workspacePath": path.to_string_lossy() })))
}

fn user_count(conn: &Connection) -> ApiResult<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?)
}

/// First-run setup: creates the initial admin, only while no user exists.
fn handle_setup_bootstrap(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let conn = conn(state)?;
    if user_count(conn)? > 0 {
        return Err(ApiError::conflict("workspace already has users"));
    }
    let email = req_str(&req.params, "email")?.to_ascii_lowercase();
    let full_name = req_str(&req.params, "fullName")?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, email, full_name, role, created_at) VALUES(?, ?, ?, 'admin', ?)",
        (&id, &email, &full_name, now_rfc3339()),
    )?;
    info!(user_id = %id, "bootstrap admin created");
    Ok(Reply::created(json!({ "userId": id })))
}

pub fn load_actor(conn: &Connection, user_id: &str) -> ApiResult<Option<Actor>> {
    let row: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT id, email, full_name, role FROM users WHERE id = ?",
            [user_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((id, email, full_name, role)) = row else {
        return Ok(None);
    };
    let role = Role::parse(&role)
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("user {} has unknown role {}", id, role)))?;
    Ok(Some(Actor {
        id,
        email,
        full_name,
        role,
    }))
}

fn handle_session_assume(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let user_id = req_str(&req.params, "userId")?;
    let actor = load_actor(conn(state)?, &user_id)?.ok_or(ApiError::Unauthenticated)?;
    info!(user_id = %actor.id, role = actor.role.as_str(), "session assumed");
    let data = json!({ "actor": actor });
    state.actor = Some(actor);
    Ok(Reply::ok(data))
}

fn handle_session_current(state: &mut AppState, _req: &Request) -> ApiResult<Reply> {
    let actor = state.actor.as_ref().ok_or(ApiError::Unauthenticated)?;
    Ok(Reply::ok(json!({ "actor": actor })))
}

fn handle_session_clear(state: &mut AppState, _req: &Request) -> ApiResult<Reply> {
    state.actor = None;
    Ok(Reply::ok(json!({ "cleared": true })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<ApiResult<Reply>> {
    let result = match req.method.as_str() {
        "health" => handle_health(state, req),
        "workspace.select" => handle_workspace_select(state, req),
        "setup.bootstrap" => handle_setup_bootstrap(state, req),
        "session.assume" => handle_session_assume(state, req),
        "session.current" => handle_session_current(state, req),
        "session.clear" => handle_session_clear(state, req),
        _ => return None,
    };
    Some(result)
}
