use std::path::PathBuf;

use crate::export::{build_grade_workbook, write_xlsx};
use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::helpers::{
    can_view_student, children_of, class_of_student, classes_taught_by, conn, opt_str,
    page_params, placeholders, req_f64, req_str, require_admin, require_exists, require_role,
    require_user_with_role, session, teaches_class, Table,
};
use crate::ipc::types::{AppState, Reply, Request};
use crate::model::{now_rfc3339, Actor, AuditStatus, ComponentType, Role};
use crate::overrides::{approve_pending, grade_in_range, process_overrides, GradeOverride};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

/// Admins pass; teachers must teach the class.
fn require_class_staff(conn: &Connection, actor: &Actor, class_id: &str) -> ApiResult<()> {
    match actor.role {
        Role::Admin => Ok(()),
        Role::Teacher if teaches_class(conn, &actor.id, class_id)? => Ok(()),
        _ => Err(ApiError::forbidden("not a teacher of this class")),
    }
}

fn handle_grades_record(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_role(actor, &[Role::Admin, Role::Teacher])?;
    let p = &req.params;
    let student_id = req_str(p, "studentId")?;
    let class_id = req_str(p, "classId")?;
    let subject_id = req_str(p, "subjectId")?;
    let semester_id = req_str(p, "semesterId")?;
    let raw_component = req_str(p, "componentType")?;
    let component = ComponentType::parse(&raw_component).ok_or_else(|| {
        ApiError::bad_params(format!("unknown componentType {}", raw_component))
    })?;
    let value = req_f64(p, "value")?;
    if !grade_in_range(value) {
        return Err(ApiError::bad_params(format!(
            "value {} is outside the 0..=10 grade scale",
            value
        )));
    }

    require_exists(conn, Table::Classes, &class_id)?;
    require_exists(conn, Table::Subjects, &subject_id)?;
    require_exists(conn, Table::Semesters, &semester_id)?;
    require_user_with_role(conn, &student_id, Role::Student)?;
    require_class_staff(conn, actor, &class_id)?;
    if class_of_student(conn, &student_id)?.as_deref() != Some(class_id.as_str()) {
        return Err(ApiError::bad_params("student is not enrolled in this class"));
    }

    let grade_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(id, student_id, class_id, subject_id, semester_id, component_type,
           value, recorded_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &grade_id,
            &student_id,
            &class_id,
            &subject_id,
            &semester_id,
            component.as_str(),
            value,
            &actor.id,
            now_rfc3339(),
        ),
    )?;
    info!(grade_id = %grade_id, component = component.as_str(), "grade recorded");
    Ok(Reply::created(json!({ "gradeId": grade_id })))
}

fn grade_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "studentId": row.get::<_, String>(1)?,
        "studentName": row.get::<_, String>(2)?,
        "classId": row.get::<_, String>(3)?,
        "subjectId": row.get::<_, String>(4)?,
        "subjectName": row.get::<_, String>(5)?,
        "semesterId": row.get::<_, String>(6)?,
        "componentType": row.get::<_, String>(7)?,
        "value": row.get::<_, f64>(8)?,
        "updatedAt": row.get::<_, String>(9)?,
    }))
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    let p = &req.params;

    let mut where_sql = String::from(" WHERE 1 = 1");
    let mut binds: Vec<SqlValue> = Vec::new();

    let visible_students: Option<Vec<String>> = match actor.role {
        Role::Admin => None,
        Role::Student => Some(vec![actor.id.clone()]),
        Role::Parent => Some(children_of(conn, &actor.id)?),
        Role::Teacher => {
            let classes = classes_taught_by(conn, &actor.id)?;
            if classes.is_empty() {
                return Ok(Reply::ok(json!({ "grades": [] })));
            }
            where_sql.push_str(&format!(" AND g.class_id IN ({})", placeholders(classes.len())));
            binds.extend(classes.into_iter().map(SqlValue::Text));
            None
        }
    };
    if let Some(students) = visible_students {
        if students.is_empty() {
            return Ok(Reply::ok(json!({ "grades": [] })));
        }
        where_sql.push_str(&format!(" AND g.student_id IN ({})", placeholders(students.len())));
        binds.extend(students.into_iter().map(SqlValue::Text));
    }

    for (key, column) in [
        ("classId", "g.class_id"),
        ("studentId", "g.student_id"),
        ("semesterId", "g.semester_id"),
        ("subjectId", "g.subject_id"),
    ] {
        if let Some(v) = opt_str(p, key) {
            where_sql.push_str(&format!(" AND {} = ?", column));
            binds.push(SqlValue::Text(v));
        }
    }

    let sql = format!(
        "SELECT g.id, g.student_id, u.full_name, g.class_id, g.subject_id, s.name,
           g.semester_id, g.component_type, g.value, g.updated_at
         FROM grades g
         JOIN users u ON u.id = g.student_id
         JOIN subjects s ON s.id = g.subject_id{}
         ORDER BY u.full_name, s.name, g.component_type, g.id",
        where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let grades = stmt
        .query_map(params_from_iter(binds.iter()), grade_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Reply::ok(json!({ "grades": grades })))
}

fn handle_process_overrides(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let conn = conn(state)?;
    let actor = state.actor.as_ref();
    let raw = req
        .params
        .get("overrides")
        .cloned()
        .ok_or_else(|| ApiError::bad_params("missing overrides[]"))?;
    let overrides: Vec<GradeOverride> = serde_json::from_value(raw)
        .map_err(|e| ApiError::bad_params(format!("invalid overrides: {}", e)))?;

    if let Some(actor) = actor {
        require_role(actor, &[Role::Admin, Role::Teacher])?;
        if actor.role == Role::Teacher {
            for ov in &overrides {
                let class_id: Option<String> = conn
                    .query_row(
                        "SELECT class_id FROM grades WHERE id = ?",
                        [&ov.grade_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                // Missing grades are reported by the batch itself.
                if let Some(class_id) = class_id {
                    if !teaches_class(conn, &actor.id, &class_id)? {
                        return Err(ApiError::forbidden(format!(
                            "grade {} belongs to a class you do not teach",
                            ov.grade_id
                        )));
                    }
                }
            }
        }
    }

    let summary = process_overrides(conn, actor.map(|a| a.id.as_str()), &overrides)?;
    Ok(Reply::ok(json!({
        "message": summary.message,
        "overrideCount": summary.override_count,
        "appliedCount": summary.applied_count,
        "pendingCount": summary.pending_count,
        "auditIds": summary.audit_ids,
    })))
}

fn handle_audit_list(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_role(actor, &[Role::Admin, Role::Teacher])?;
    let page = page_params(&req.params, &state.config.pagination)?;

    let mut where_sql = String::from(" WHERE 1 = 1");
    let mut binds: Vec<SqlValue> = Vec::new();
    if actor.role == Role::Teacher {
        where_sql.push_str(" AND a.changed_by = ?");
        binds.push(SqlValue::Text(actor.id.clone()));
    }
    if let Some(status) = opt_str(&req.params, "status") {
        let status = AuditStatus::parse(&status)
            .ok_or_else(|| ApiError::bad_params(format!("unknown status {}", status)))?;
        where_sql.push_str(" AND a.status = ?");
        binds.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(grade_id) = opt_str(&req.params, "gradeId") {
        where_sql.push_str(" AND a.grade_id = ?");
        binds.push(SqlValue::Text(grade_id));
    }

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM grade_audit_logs a{}", where_sql),
        params_from_iter(binds.iter()),
        |r| r.get(0),
    )?;

    let sql = format!(
        "SELECT a.id, a.grade_id, g.student_id, g.component_type, a.old_value, a.new_value,
           a.change_reason, a.changed_by, a.changed_at, a.status, a.processed_at, a.processed_by
         FROM grade_audit_logs a
         JOIN grades g ON g.id = a.grade_id{}
         ORDER BY a.changed_at DESC, a.id
         LIMIT ? OFFSET ?",
        where_sql
    );
    binds.push(SqlValue::Integer(page.page_size));
    binds.push(SqlValue::Integer(page.offset()));
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params_from_iter(binds.iter()), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "gradeId": row.get::<_, String>(1)?,
                "studentId": row.get::<_, String>(2)?,
                "componentType": row.get::<_, String>(3)?,
                "oldValue": row.get::<_, f64>(4)?,
                "newValue": row.get::<_, f64>(5)?,
                "changeReason": row.get::<_, String>(6)?,
                "changedBy": row.get::<_, String>(7)?,
                "changedAt": row.get::<_, String>(8)?,
                "status": row.get::<_, String>(9)?,
                "processedAt": row.get::<_, Option<String>>(10)?,
                "processedBy": row.get::<_, Option<String>>(11)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Reply::paged(json!({ "entries": entries }), page.describe(total)))
}

fn handle_approve_override(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let audit_id = req_str(&req.params, "auditId")?;
    let approved = approve_pending(conn, &audit_id, &actor.id)?;
    Ok(Reply::ok(
        serde_json::to_value(&approved).map_err(anyhow::Error::from)?,
    ))
}

fn handle_grades_export(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    let class_id = req_str(&req.params, "classId")?;
    let semester_id = req_str(&req.params, "semesterId")?;
    let out_path = PathBuf::from(req_str(&req.params, "outPath")?);
    require_exists(conn, Table::Classes, &class_id)?;
    require_exists(conn, Table::Semesters, &semester_id)?;
    require_class_staff(conn, actor, &class_id)?;

    let built = build_grade_workbook(
        conn,
        &class_id,
        &semester_id,
        state.config.export.max_student_sheets,
    )?;
    let summary = write_xlsx(&built.workbook, &out_path)?;
    info!(
        class_id = %class_id,
        path = %out_path.display(),
        sheets = summary.sheet_count,
        "grade workbook exported"
    );
    Ok(Reply::ok(json!({
        "outPath": out_path.to_string_lossy(),
        "sheetCount": summary.sheet_count,
        "studentCount": built.student_count,
        "sha256": summary.sha256,
    })))
}

/// Grades for one student, gated on the caller being allowed to see them.
fn handle_grades_student(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    let student_id = req_str(&req.params, "studentId")?;
    require_user_with_role(conn, &student_id, Role::Student)?;
    if !can_view_student(conn, actor, &student_id)? {
        return Err(ApiError::forbidden("not allowed to view this student"));
    }
    let mut stmt = conn.prepare(
        "SELECT g.id, g.student_id, u.full_name, g.class_id, g.subject_id, s.name,
           g.semester_id, g.component_type, g.value, g.updated_at
         FROM grades g
         JOIN users u ON u.id = g.student_id
         JOIN subjects s ON s.id = g.subject_id
         WHERE g.student_id = ?
         ORDER BY g.semester_id, s.name, g.component_type, g.id",
    )?;
    let grades = stmt
        .query_map([&student_id], grade_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Reply::ok(json!({ "studentId": student_id, "grades": grades })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<ApiResult<Reply>> {
    let result = match req.method.as_str() {
        "grades.record" => handle_grades_record(state, req),
        "grades.list" => handle_grades_list(state, req),
        "grades.student" => handle_grades_student(state, req),
        "grades.processOverrides" => handle_process_overrides(state, req),
        "grades.auditList" => handle_audit_list(state, req),
        "grades.approveOverride" => handle_approve_override(state, req),
        "grades.export" => handle_grades_export(state, req),
        _ => return None,
    };
    Some(result)
}
