use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::helpers::{
    children_of, classes_taught_by, is_homeroom_teacher, opt_str, placeholders, req_str,
    require_exists, require_role, require_user_with_role, session, teaches_class, Table,
};
use crate::ipc::types::{AppState, Reply, Request};
use crate::model::{now_rfc3339, Actor, FeedbackStatus, Role};
use crate::summarizer::{summarize_feedback, HttpSummarizer};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

struct FeedbackRow {
    teacher_id: String,
    class_id: String,
    status: FeedbackStatus,
}

fn load_feedback(conn: &Connection, feedback_id: &str) -> ApiResult<FeedbackRow> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT teacher_id, class_id, status FROM feedback WHERE id = ?",
            [feedback_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((teacher_id, class_id, status)) = row else {
        return Err(ApiError::not_found("feedback not found"));
    };
    let status = FeedbackStatus::parse(&status)
        .ok_or_else(|| anyhow::anyhow!("feedback {} has unknown status {}", feedback_id, status))?;
    Ok(FeedbackRow {
        teacher_id,
        class_id,
        status,
    })
}

fn require_author(actor: &Actor, row: &FeedbackRow) -> ApiResult<()> {
    if actor.id == row.teacher_id {
        Ok(())
    } else {
        Err(ApiError::forbidden("only the author may change this feedback"))
    }
}

fn advance(
    conn: &Connection,
    feedback_id: &str,
    row: &FeedbackRow,
    next: FeedbackStatus,
) -> ApiResult<()> {
    if !row.status.can_advance_to(next) {
        return Err(ApiError::conflict(format!(
            "feedback is {} and cannot become {}",
            row.status.as_str(),
            next.as_str()
        )));
    }
    conn.execute(
        "UPDATE feedback SET status = ?, updated_at = ? WHERE id = ?",
        (next.as_str(), now_rfc3339(), feedback_id),
    )?;
    info!(feedback_id, status = next.as_str(), "feedback status changed");
    Ok(())
}

fn handle_feedback_create(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_role(actor, &[Role::Teacher])?;
    let student_id = req_str(&req.params, "studentId")?;
    let class_id = req_str(&req.params, "classId")?;
    let content = req_str(&req.params, "content")?;
    require_exists(conn, Table::Classes, &class_id)?;
    require_user_with_role(conn, &student_id, Role::Student)?;
    if !teaches_class(conn, &actor.id, &class_id)? {
        return Err(ApiError::forbidden("not a teacher of this class"));
    }

    let feedback_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO feedback(id, student_id, teacher_id, class_id, content, status,
           created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &feedback_id,
            &student_id,
            &actor.id,
            &class_id,
            &content,
            FeedbackStatus::Draft.as_str(),
            &now,
            &now,
        ),
    )?;
    Ok(Reply::created(json!({
        "feedbackId": feedback_id,
        "status": FeedbackStatus::Draft.as_str(),
    })))
}

fn handle_feedback_update(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    let feedback_id = req_str(&req.params, "feedbackId")?;
    let content = req_str(&req.params, "content")?;
    let row = load_feedback(conn, &feedback_id)?;
    require_author(actor, &row)?;
    if row.status != FeedbackStatus::Draft {
        return Err(ApiError::conflict("only draft feedback can be edited"));
    }
    conn.execute(
        "UPDATE feedback SET content = ?, ai_summary = NULL, updated_at = ? WHERE id = ?",
        (&content, now_rfc3339(), &feedback_id),
    )?;
    Ok(Reply::ok(json!({ "feedbackId": feedback_id })))
}

fn handle_feedback_submit(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    let feedback_id = req_str(&req.params, "feedbackId")?;
    let row = load_feedback(conn, &feedback_id)?;
    require_author(actor, &row)?;
    advance(conn, &feedback_id, &row, FeedbackStatus::Submitted)?;
    Ok(Reply::ok(json!({
        "feedbackId": feedback_id,
        "status": FeedbackStatus::Submitted.as_str(),
    })))
}

fn handle_feedback_approve(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    let feedback_id = req_str(&req.params, "feedbackId")?;
    let row = load_feedback(conn, &feedback_id)?;
    match actor.role {
        Role::Admin => {}
        Role::Teacher if is_homeroom_teacher(conn, &actor.id, &row.class_id)? => {}
        _ => {
            return Err(ApiError::forbidden(
                "only the homeroom teacher can approve feedback",
            ))
        }
    }
    advance(conn, &feedback_id, &row, FeedbackStatus::Approved)?;
    Ok(Reply::ok(json!({
        "feedbackId": feedback_id,
        "status": FeedbackStatus::Approved.as_str(),
    })))
}

fn feedback_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "studentId": row.get::<_, String>(1)?,
        "studentName": row.get::<_, String>(2)?,
        "teacherId": row.get::<_, String>(3)?,
        "classId": row.get::<_, String>(4)?,
        "content": row.get::<_, String>(5)?,
        "status": row.get::<_, String>(6)?,
        "aiSummary": row.get::<_, Option<String>>(7)?,
        "createdAt": row.get::<_, String>(8)?,
        "updatedAt": row.get::<_, String>(9)?,
    }))
}

/// Teachers see their classes' feedback; students and parents only
/// approved feedback about themselves or their children.
fn handle_feedback_list(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    let p = &req.params;

    let mut where_sql = String::from(" WHERE 1 = 1");
    let mut binds: Vec<SqlValue> = Vec::new();
    match actor.role {
        Role::Admin => {}
        Role::Teacher => {
            let classes = classes_taught_by(conn, &actor.id)?;
            if classes.is_empty() {
                return Ok(Reply::ok(json!({ "feedback": [] })));
            }
            where_sql.push_str(&format!(" AND f.class_id IN ({})", placeholders(classes.len())));
            binds.extend(classes.into_iter().map(SqlValue::Text));
        }
        Role::Student | Role::Parent => {
            let students = if actor.role == Role::Student {
                vec![actor.id.clone()]
            } else {
                children_of(conn, &actor.id)?
            };
            if students.is_empty() {
                return Ok(Reply::ok(json!({ "feedback": [] })));
            }
            where_sql.push_str(&format!(
                " AND f.status = 'approved' AND f.student_id IN ({})",
                placeholders(students.len())
            ));
            binds.extend(students.into_iter().map(SqlValue::Text));
        }
    }

    if let Some(status) = opt_str(p, "status") {
        let status = FeedbackStatus::parse(&status)
            .ok_or_else(|| ApiError::bad_params(format!("unknown status {}", status)))?;
        where_sql.push_str(" AND f.status = ?");
        binds.push(SqlValue::Text(status.as_str().to_string()));
    }
    for (key, column) in [("classId", "f.class_id"), ("studentId", "f.student_id")] {
        if let Some(v) = opt_str(p, key) {
            where_sql.push_str(&format!(" AND {} = ?", column));
            binds.push(SqlValue::Text(v));
        }
    }

    let sql = format!(
        "SELECT f.id, f.student_id, u.full_name, f.teacher_id, f.class_id, f.content, f.status,
           f.ai_summary, f.created_at, f.updated_at
         FROM feedback f
         JOIN users u ON u.id = f.student_id{}
         ORDER BY f.updated_at DESC, f.id",
        where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params_from_iter(binds.iter()), feedback_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Reply::ok(json!({ "feedback": items })))
}

fn handle_feedback_summarize(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_role(actor, &[Role::Admin, Role::Teacher])?;
    let feedback_id = req_str(&req.params, "feedbackId")?;
    let row = load_feedback(conn, &feedback_id)?;
    if actor.role == Role::Teacher && !teaches_class(conn, &actor.id, &row.class_id)? {
        return Err(ApiError::forbidden("not a teacher of this class"));
    }

    let summarizer = HttpSummarizer::from_config(&state.config.summarizer)?;
    let summary = summarize_feedback(conn, &feedback_id, &summarizer)?;
    Ok(Reply::ok(json!({
        "feedbackId": feedback_id,
        "aiSummary": summary,
    })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<ApiResult<Reply>> {
    let result = match req.method.as_str() {
        "feedback.create" => handle_feedback_create(state, req),
        "feedback.update" => handle_feedback_update(state, req),
        "feedback.submit" => handle_feedback_submit(state, req),
        "feedback.approve" => handle_feedback_approve(state, req),
        "feedback.list" => handle_feedback_list(state, req),
        "feedback.summarize" => handle_feedback_summarize(state, req),
        _ => return None,
    };
    Some(result)
}
