use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::helpers::{
    is_constraint_violation, opt_i64, opt_str, page_params, req_str, require_admin,
    require_exists, require_user_with_role, session, Table,
};
use crate::ipc::types::{AppState, Reply, Request};
use crate::model::{now_rfc3339, Role};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

const GENERATE_TEACHERS_MAX: i64 = 200;

fn normalize_email(raw: &str) -> Option<String> {
    let e = raw.trim().to_ascii_lowercase();
    let (local, domain) = e.split_once('@')?;
    if local.is_empty() || !domain.contains('.') || domain.starts_with('.') || e.contains(' ') {
        return None;
    }
    Some(e)
}

enum InsertOutcome {
    Created(String),
    Duplicate,
}

fn insert_user(
    conn: &Connection,
    email: &str,
    full_name: &str,
    role: Role,
) -> rusqlite::Result<InsertOutcome> {
    let id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO users(id, email, full_name, role, created_at) VALUES(?, ?, ?, ?, ?)",
        (&id, email, full_name, role.as_str(), now_rfc3339()),
    ) {
        Ok(_) => Ok(InsertOutcome::Created(id)),
        Err(e) if is_constraint_violation(&e) => Ok(InsertOutcome::Duplicate),
        Err(e) => Err(e),
    }
}

fn user_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let id: String = row.get(0)?;
    let email: String = row.get(1)?;
    let full_name: String = row.get(2)?;
    let role: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(json!({
        "id": id,
        "email": email,
        "fullName": full_name,
        "role": role,
        "createdAt": created_at,
    }))
}

fn handle_users_list(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let page = page_params(&req.params, &state.config.pagination)?;

    let mut where_sql = String::from(" WHERE 1 = 1");
    let mut binds: Vec<SqlValue> = Vec::new();
    if let Some(role) = opt_str(&req.params, "role") {
        let Some(role) = Role::parse(&role) else {
            return Err(ApiError::bad_params("role must be one of: admin, teacher, student, parent"));
        };
        where_sql.push_str(" AND role = ?");
        binds.push(SqlValue::Text(role.as_str().to_string()));
    }
    if let Some(search) = opt_str(&req.params, "search") {
        where_sql.push_str(" AND (email LIKE ? OR full_name LIKE ?)");
        let pattern = format!("%{}%", search);
        binds.push(SqlValue::Text(pattern.clone()));
        binds.push(SqlValue::Text(pattern));
    }

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM users{}", where_sql),
        params_from_iter(binds.iter()),
        |r| r.get(0),
    )?;

    binds.push(SqlValue::Integer(page.page_size));
    binds.push(SqlValue::Integer(page.offset()));
    let mut stmt = conn.prepare(&format!(
        "SELECT id, email, full_name, role, created_at FROM users{}
         ORDER BY full_name, email LIMIT ? OFFSET ?",
        where_sql
    ))?;
    let users = stmt
        .query_map(params_from_iter(binds.iter()), user_json)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Reply::paged(json!({ "users": users }), page.describe(total)))
}

fn handle_users_create(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;

    let email = normalize_email(&req_str(&req.params, "email")?)
        .ok_or_else(|| ApiError::bad_params("email is not valid"))?;
    let full_name = req_str(&req.params, "fullName")?;
    let role = Role::parse(&req_str(&req.params, "role")?)
        .ok_or_else(|| ApiError::bad_params("role must be one of: admin, teacher, student, parent"))?;

    match insert_user(conn, &email, &full_name, role)? {
        InsertOutcome::Created(id) => {
            info!(user_id = %id, role = role.as_str(), "user created");
            Ok(Reply::created(json!({ "userId": id })))
        }
        InsertOutcome::Duplicate => Err(ApiError::conflict(format!(
            "a user with email {} already exists",
            email
        ))),
    }
}

fn handle_users_update(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let user_id = req_str(&req.params, "userId")?;
    require_exists(conn, Table::Users, &user_id)?;

    let patch = req
        .params
        .get("patch")
        .ok_or_else(|| ApiError::bad_params("missing patch"))?;
    let mut updated = 0usize;
    if let Some(name) = opt_str(patch, "fullName") {
        conn.execute(
            "UPDATE users SET full_name = ? WHERE id = ?",
            (&name, &user_id),
        )?;
        updated += 1;
    }
    if let Some(raw) = opt_str(patch, "email") {
        let email =
            normalize_email(&raw).ok_or_else(|| ApiError::bad_params("email is not valid"))?;
        match conn.execute("UPDATE users SET email = ? WHERE id = ?", (&email, &user_id)) {
            Ok(_) => updated += 1,
            Err(e) if is_constraint_violation(&e) => {
                return Err(ApiError::conflict(format!(
                    "a user with email {} already exists",
                    email
                )))
            }
            Err(e) => return Err(e.into()),
        }
    }
    if updated == 0 {
        return Err(ApiError::bad_params("patch must set fullName or email"));
    }
    Ok(Reply::ok(json!({ "userId": user_id, "updatedFields": updated })))
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let user_id = req_str(&req.params, "userId")?;
    if user_id == actor.id {
        return Err(ApiError::conflict("cannot delete the signed-in user"));
    }
    require_exists(conn, Table::Users, &user_id)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM class_students WHERE student_id = ?", [&user_id])?;
    tx.execute(
        "DELETE FROM parent_students WHERE parent_id = ?1 OR student_id = ?1",
        [&user_id],
    )?;
    tx.execute("DELETE FROM notifications WHERE recipient_id = ?", [&user_id])?;
    match tx.execute("DELETE FROM users WHERE id = ?", [&user_id]) {
        Ok(_) => {}
        Err(e) if is_constraint_violation(&e) => {
            let _ = tx.rollback();
            return Err(ApiError::conflict(
                "user is still referenced by classes, timetable, grades or feedback",
            ));
        }
        Err(e) => return Err(e.into()),
    }
    tx.commit()?;
    info!(user_id = %user_id, "user deleted");
    Ok(Reply::ok(json!({ "userId": user_id, "deleted": true })))
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                buf.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => out.push(std::mem::take(&mut buf)),
            _ => buf.push(ch),
        }
    }
    out.push(buf);
    out
}

struct ImportColumns {
    email: usize,
    full_name: usize,
    role: usize,
}

fn import_columns(header: &str) -> ApiResult<ImportColumns> {
    let fields: Vec<String> = parse_csv_record(header)
        .iter()
        .map(|f| f.trim().trim_start_matches('\u{feff}').to_ascii_lowercase())
        .collect();
    let find = |names: &[&str]| fields.iter().position(|f| names.contains(&f.as_str()));
    match (
        find(&["email"]),
        find(&["full_name", "fullname", "name"]),
        find(&["role"]),
    ) {
        (Some(email), Some(full_name), Some(role)) => Ok(ImportColumns {
            email,
            full_name,
            role,
        }),
        _ => Err(ApiError::bad_params(
            "csv header must contain email, full_name and role",
        )),
    }
}

/// Inserts users row by row. Bad rows are reported and skipped; a store
/// failure stops the import with the rows before it already committed.
fn handle_users_import(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let text = req_str(&req.params, "csvText")?;

    let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
    let Some((_, header)) = lines.next() else {
        return Err(ApiError::bad_params("csv is empty"));
    };
    let cols = import_columns(header)?;

    let mut created: Vec<Value> = Vec::new();
    let mut rejected: Vec<Value> = Vec::new();
    for (idx, line) in lines {
        let line_no = idx + 1;
        let fields = parse_csv_record(line);
        let get = |i: usize| fields.get(i).map(|s| s.trim()).unwrap_or("");

        let Some(email) = normalize_email(get(cols.email)) else {
            rejected.push(json!({ "line": line_no, "error": "invalid email" }));
            continue;
        };
        let full_name = get(cols.full_name).to_string();
        if full_name.is_empty() {
            rejected.push(json!({ "line": line_no, "error": "missing full_name" }));
            continue;
        }
        let Some(role) = Role::parse(get(cols.role)) else {
            rejected.push(json!({ "line": line_no, "error": "invalid role" }));
            continue;
        };

        match insert_user(conn, &email, &full_name, role) {
            Ok(InsertOutcome::Created(id)) => {
                created.push(json!({ "line": line_no, "userId": id, "email": email }))
            }
            Ok(InsertOutcome::Duplicate) => {
                rejected.push(json!({ "line": line_no, "error": "email already exists" }))
            }
            Err(e) => {
                warn!(line = line_no, error = %e, "user import stopped");
                return Err(ApiError::PartialFailure(format!(
                    "import stopped at line {} after {} users were created: {}",
                    line_no,
                    created.len(),
                    e
                )));
            }
        }
    }

    info!(created = created.len(), rejected = rejected.len(), "user import finished");
    Ok(Reply::created(json!({
        "createdCount": created.len(),
        "rejectedCount": rejected.len(),
        "created": created,
        "rejected": rejected,
    })))
}

fn existing_emails(conn: &Connection, domain: &str) -> ApiResult<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT email FROM users WHERE email LIKE ?")?;
    let emails = stmt
        .query_map([format!("%@{}", domain)], |r| r.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(emails)
}

/// Bulk auto-generation of teacher accounts. Inserts run one by one with no
/// compensation when a later insert fails.
fn handle_users_generate_teachers(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;

    let count = opt_i64(&req.params, "count")?.unwrap_or(1);
    if !(1..=GENERATE_TEACHERS_MAX).contains(&count) {
        return Err(ApiError::bad_params(format!(
            "count must be between 1 and {}",
            GENERATE_TEACHERS_MAX
        )));
    }
    let domain = opt_str(&req.params, "emailDomain")
        .unwrap_or_else(|| "school.edu".to_string())
        .to_ascii_lowercase();
    if normalize_email(&format!("x@{}", domain)).is_none() {
        return Err(ApiError::bad_params("emailDomain is not valid"));
    }
    let prefix = opt_str(&req.params, "namePrefix").unwrap_or_else(|| "Teacher".to_string());

    let taken = existing_emails(conn, &domain)?;
    let mut created: Vec<Value> = Vec::new();
    let mut n: i64 = 1;
    while (created.len() as i64) < count {
        let email = format!("teacher{:03}@{}", n, domain);
        let full_name = format!("{} {:03}", prefix, n);
        n += 1;
        if taken.contains(&email) {
            continue;
        }
        match insert_user(conn, &email, &full_name, Role::Teacher) {
            Ok(InsertOutcome::Created(id)) => {
                created.push(json!({ "userId": id, "email": email, "fullName": full_name }))
            }
            Ok(InsertOutcome::Duplicate) => continue,
            Err(e) => {
                return Err(ApiError::PartialFailure(format!(
                    "teacher generation stopped after {} of {} accounts: {}",
                    created.len(),
                    count,
                    e
                )))
            }
        }
    }

    info!(count = created.len(), "teacher accounts generated");
    Ok(Reply::created(json!({ "createdCount": created.len(), "teachers": created })))
}

fn handle_parents_link(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let parent_id = req_str(&req.params, "parentId")?;
    let student_id = req_str(&req.params, "studentId")?;
    require_user_with_role(conn, &parent_id, Role::Parent)?;
    require_user_with_role(conn, &student_id, Role::Student)?;

    conn.execute(
        "INSERT OR IGNORE INTO parent_students(parent_id, student_id) VALUES(?, ?)",
        (&parent_id, &student_id),
    )?;
    Ok(Reply::ok(json!({ "parentId": parent_id, "studentId": student_id })))
}

fn handle_parents_unlink(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let parent_id = req_str(&req.params, "parentId")?;
    let student_id = req_str(&req.params, "studentId")?;
    let removed = conn.execute(
        "DELETE FROM parent_students WHERE parent_id = ? AND student_id = ?",
        (&parent_id, &student_id),
    )?;
    if removed == 0 {
        return Err(ApiError::not_found("link not found"));
    }
    Ok(Reply::ok(json!({ "removed": true })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<ApiResult<Reply>> {
    let result = match req.method.as_str() {
        "users.list" => handle_users_list(state, req),
        "users.create" => handle_users_create(state, req),
        "users.update" => handle_users_update(state, req),
        "users.delete" => handle_users_delete(state, req),
        "users.import" => handle_users_import(state, req),
        "users.generateTeachers" => handle_users_generate_teachers(state, req),
        "parents.link" => handle_parents_link(state, req),
        "parents.unlink" => handle_parents_unlink(state, req),
        _ => return None,
    };
    Some(result)
}
