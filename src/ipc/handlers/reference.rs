//! Subjects, classrooms and semesters: small reference tables every
//! signed-in user can read and only admins can extend.

use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::helpers::{is_constraint_violation, opt_i64, req_date, req_str, require_admin, session};
use crate::ipc::types::{AppState, Reply, Request};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn insert_unique(
    conn: &rusqlite::Connection,
    sql: &str,
    params: impl rusqlite::Params,
    what: &str,
) -> ApiResult<()> {
    match conn.execute(sql, params) {
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e) => {
            Err(ApiError::conflict(format!("{} already exists", what)))
        }
        Err(e) => Err(e.into()),
    }
}

fn handle_subjects_list(state: &mut AppState, _req: &Request) -> ApiResult<Reply> {
    let (conn, _actor) = session(state)?;
    let mut stmt = conn.prepare("SELECT id, name, code FROM subjects ORDER BY name")?;
    let subjects = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let code: String = row.get(2)?;
            Ok(json!({ "id": id, "name": name, "code": code }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Reply::ok(json!({ "subjects": subjects })))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let name = req_str(&req.params, "name")?;
    let code = req_str(&req.params, "code")?.to_ascii_uppercase();
    let id = Uuid::new_v4().to_string();
    insert_unique(
        conn,
        "INSERT INTO subjects(id, name, code) VALUES(?, ?, ?)",
        (&id, &name, &code),
        &format!("subject code {}", code),
    )?;
    info!(subject_id = %id, code = %code, "subject created");
    Ok(Reply::created(json!({ "subjectId": id })))
}

fn handle_classrooms_list(state: &mut AppState, _req: &Request) -> ApiResult<Reply> {
    let (conn, _actor) = session(state)?;
    let mut stmt = conn.prepare("SELECT id, name, capacity FROM classrooms ORDER BY name")?;
    let rooms = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let capacity: Option<i64> = row.get(2)?;
            Ok(json!({ "id": id, "name": name, "capacity": capacity }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Reply::ok(json!({ "classrooms": rooms })))
}

fn handle_classrooms_create(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let name = req_str(&req.params, "name")?;
    let capacity = opt_i64(&req.params, "capacity")?;
    if matches!(capacity, Some(c) if c <= 0) {
        return Err(ApiError::bad_params("capacity must be > 0"));
    }
    let id = Uuid::new_v4().to_string();
    insert_unique(
        conn,
        "INSERT INTO classrooms(id, name, capacity) VALUES(?, ?, ?)",
        (&id, &name, capacity),
        &format!("classroom {}", name),
    )?;
    Ok(Reply::created(json!({ "classroomId": id })))
}

fn handle_semesters_list(state: &mut AppState, _req: &Request) -> ApiResult<Reply> {
    let (conn, _actor) = session(state)?;
    let mut stmt =
        conn.prepare("SELECT id, name, start_date, end_date FROM semesters ORDER BY start_date")?;
    let semesters = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let start: String = row.get(2)?;
            let end: String = row.get(3)?;
            Ok(json!({ "id": id, "name": name, "startDate": start, "endDate": end }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Reply::ok(json!({ "semesters": semesters })))
}

fn handle_semesters_create(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let name = req_str(&req.params, "name")?;
    let start = req_date(&req.params, "startDate")?;
    let end = req_date(&req.params, "endDate")?;
    if start >= end {
        return Err(ApiError::bad_params("startDate must be before endDate"));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO semesters(id, name, start_date, end_date) VALUES(?, ?, ?, ?)",
        (&id, &name, start.to_string(), end.to_string()),
    )?;
    Ok(Reply::created(json!({ "semesterId": id })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<ApiResult<Reply>> {
    let result = match req.method.as_str() {
        "subjects.list" => handle_subjects_list(state, req),
        "subjects.create" => handle_subjects_create(state, req),
        "classrooms.list" => handle_classrooms_list(state, req),
        "classrooms.create" => handle_classrooms_create(state, req),
        "semesters.list" => handle_semesters_list(state, req),
        "semesters.create" => handle_semesters_create(state, req),
        _ => return None,
    };
    Some(result)
}
