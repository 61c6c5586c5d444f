use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::helpers::{
    children_of, class_of_student, classes_taught_by, is_homeroom_teacher, is_parent_of,
    opt_str, placeholders, req_date, req_str, session,
};
use crate::ipc::types::{AppState, Reply, Request};
use crate::model::{now_rfc3339, LeaveStatus, Role};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use super::notifications::deliver;

fn handle_leave_submit(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    let p = &req.params;

    let student_id = match actor.role {
        Role::Student => {
            if let Some(other) = opt_str(p, "studentId") {
                if other != actor.id {
                    return Err(ApiError::forbidden(
                        "students may only apply for their own leave",
                    ));
                }
            }
            actor.id.clone()
        }
        Role::Parent => {
            let sid = req_str(p, "studentId")?;
            if !is_parent_of(conn, &actor.id, &sid)? {
                return Err(ApiError::forbidden("student is not linked to this parent"));
            }
            sid
        }
        _ => {
            return Err(ApiError::forbidden(
                "only students and parents submit leave applications",
            ))
        }
    };

    let reason = req_str(p, "reason")?;
    let start = req_date(p, "startDate")?;
    let end = req_date(p, "endDate")?;
    if start > end {
        return Err(ApiError::bad_params("startDate must not be after endDate"));
    }
    let class_id = class_of_student(conn, &student_id)?
        .ok_or_else(|| ApiError::bad_params("student is not enrolled in any class"))?;

    let leave_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO leave_applications(id, student_id, class_id, submitted_by, reason,
           start_date, end_date, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &leave_id,
            &student_id,
            &class_id,
            &actor.id,
            &reason,
            start.to_string(),
            end.to_string(),
            LeaveStatus::Pending.as_str(),
            now_rfc3339(),
        ),
    )?;
    info!(leave_id = %leave_id, student_id = %student_id, "leave application submitted");
    Ok(Reply::created(json!({
        "leaveId": leave_id,
        "status": LeaveStatus::Pending.as_str(),
    })))
}

fn leave_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "studentId": row.get::<_, String>(1)?,
        "studentName": row.get::<_, String>(2)?,
        "classId": row.get::<_, String>(3)?,
        "submittedBy": row.get::<_, String>(4)?,
        "reason": row.get::<_, String>(5)?,
        "startDate": row.get::<_, String>(6)?,
        "endDate": row.get::<_, String>(7)?,
        "status": row.get::<_, String>(8)?,
        "reviewedBy": row.get::<_, Option<String>>(9)?,
        "reviewedAt": row.get::<_, Option<String>>(10)?,
        "reviewNote": row.get::<_, Option<String>>(11)?,
        "createdAt": row.get::<_, String>(12)?,
    }))
}

fn handle_leave_list(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    let p = &req.params;

    let mut where_sql = String::from(" WHERE 1 = 1");
    let mut binds: Vec<SqlValue> = Vec::new();
    let scope: Vec<String> = match actor.role {
        Role::Admin => Vec::new(),
        Role::Teacher => {
            let classes = classes_taught_by(conn, &actor.id)?;
            let mut homeroom = Vec::new();
            for c in classes {
                if is_homeroom_teacher(conn, &actor.id, &c)? {
                    homeroom.push(c);
                }
            }
            if homeroom.is_empty() {
                return Ok(Reply::ok(json!({ "applications": [] })));
            }
            where_sql.push_str(&format!(" AND l.class_id IN ({})", placeholders(homeroom.len())));
            homeroom
        }
        Role::Student => {
            where_sql.push_str(" AND l.student_id = ?");
            vec![actor.id.clone()]
        }
        Role::Parent => {
            let children = children_of(conn, &actor.id)?;
            if children.is_empty() {
                return Ok(Reply::ok(json!({ "applications": [] })));
            }
            where_sql.push_str(&format!(" AND l.student_id IN ({})", placeholders(children.len())));
            children
        }
    };
    binds.extend(scope.into_iter().map(SqlValue::Text));

    if let Some(status) = opt_str(p, "status") {
        let status = LeaveStatus::parse(&status)
            .ok_or_else(|| ApiError::bad_params(format!("unknown status {}", status)))?;
        where_sql.push_str(" AND l.status = ?");
        binds.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(class_id) = opt_str(p, "classId") {
        where_sql.push_str(" AND l.class_id = ?");
        binds.push(SqlValue::Text(class_id));
    }

    let sql = format!(
        "SELECT l.id, l.student_id, u.full_name, l.class_id, l.submitted_by, l.reason,
           l.start_date, l.end_date, l.status, l.reviewed_by, l.reviewed_at, l.review_note,
           l.created_at
         FROM leave_applications l
         JOIN users u ON u.id = l.student_id{}
         ORDER BY l.created_at DESC, l.id",
        where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let applications = stmt
        .query_map(params_from_iter(binds.iter()), leave_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Reply::ok(json!({ "applications": applications })))
}

fn handle_leave_review(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    let leave_id = req_str(&req.params, "leaveId")?;
    let decision_raw = req_str(&req.params, "decision")?;
    let decision = match LeaveStatus::parse(&decision_raw) {
        Some(s @ (LeaveStatus::Approved | LeaveStatus::Rejected)) => s,
        _ => {
            return Err(ApiError::bad_params(
                "decision must be approved or rejected",
            ))
        }
    };
    let note = opt_str(&req.params, "note");

    let row: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT class_id, submitted_by, status, start_date FROM leave_applications WHERE id = ?",
            [&leave_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((class_id, submitted_by, status, start_date)) = row else {
        return Err(ApiError::not_found("leave application not found"));
    };

    match actor.role {
        Role::Admin => {}
        Role::Teacher if is_homeroom_teacher(conn, &actor.id, &class_id)? => {}
        _ => {
            return Err(ApiError::forbidden(
                "only the homeroom teacher can review this application",
            ))
        }
    }
    if LeaveStatus::parse(&status) != Some(LeaveStatus::Pending) {
        return Err(ApiError::conflict(format!(
            "leave application is already {}",
            status
        )));
    }

    let now = now_rfc3339();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE leave_applications
         SET status = ?, reviewed_by = ?, reviewed_at = ?, review_note = ?
         WHERE id = ?",
        (decision.as_str(), &actor.id, &now, &note, &leave_id),
    )?;
    let content = match &note {
        Some(n) => format!(
            "Your leave application starting {} was {}: {}",
            start_date,
            decision.as_str(),
            n
        ),
        None => format!(
            "Your leave application starting {} was {}.",
            start_date,
            decision.as_str()
        ),
    };
    deliver(
        &tx,
        &actor.id,
        &[submitted_by],
        "Leave application reviewed",
        &content,
    )?;
    tx.commit()?;

    info!(leave_id = %leave_id, decision = decision.as_str(), "leave application reviewed");
    Ok(Reply::ok(json!({
        "leaveId": leave_id,
        "status": decision.as_str(),
        "reviewedAt": now,
    })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<ApiResult<Reply>> {
    let result = match req.method.as_str() {
        "leave.submit" => handle_leave_submit(state, req),
        "leave.list" => handle_leave_list(state, req),
        "leave.review" => handle_leave_review(state, req),
        _ => return None,
    };
    Some(result)
}
