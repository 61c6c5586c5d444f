use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::helpers::{
    is_constraint_violation, opt_i64, opt_str, req_str, require_admin, require_exists,
    require_user_with_role, session, str_list, teaches_class, Table,
};
use crate::ipc::types::{AppState, Reply, Request};
use crate::model::Role;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

fn class_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let grade_level: Option<i64> = row.get(2)?;
    let homeroom_teacher_id: Option<String> = row.get(3)?;
    let homeroom_teacher_name: Option<String> = row.get(4)?;
    let student_count: i64 = row.get(5)?;
    Ok(json!({
        "id": id,
        "name": name,
        "gradeLevel": grade_level,
        "homeroomTeacherId": homeroom_teacher_id,
        "homeroomTeacherName": homeroom_teacher_name,
        "studentCount": student_count,
    }))
}

const CLASS_SELECT: &str = "SELECT
       c.id,
       c.name,
       c.grade_level,
       c.homeroom_teacher_id,
       t.full_name,
       (SELECT COUNT(*) FROM class_students cs WHERE cs.class_id = c.id) AS student_count
     FROM classes c
     LEFT JOIN users t ON t.id = c.homeroom_teacher_id";

fn handle_classes_list(state: &mut AppState, _req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;

    // Admins see every class; teachers the ones they teach; students and
    // parents the class(es) of the students they stand for.
    let (sql, bind): (String, Option<&str>) = match actor.role {
        Role::Admin => (format!("{} ORDER BY c.name", CLASS_SELECT), None),
        Role::Teacher => (
            format!(
                "{} WHERE c.homeroom_teacher_id = ?1
                   OR c.id IN (SELECT class_id FROM timetable_slots WHERE teacher_id = ?1)
                 ORDER BY c.name",
                CLASS_SELECT
            ),
            Some(actor.id.as_str()),
        ),
        Role::Student => (
            format!(
                "{} WHERE c.id IN (SELECT class_id FROM class_students WHERE student_id = ?1)
                 ORDER BY c.name",
                CLASS_SELECT
            ),
            Some(actor.id.as_str()),
        ),
        Role::Parent => (
            format!(
                "{} WHERE c.id IN (
                   SELECT cs.class_id FROM class_students cs
                   JOIN parent_students ps ON ps.student_id = cs.student_id
                   WHERE ps.parent_id = ?1)
                 ORDER BY c.name",
                CLASS_SELECT
            ),
            Some(actor.id.as_str()),
        ),
    };

    let mut stmt = conn.prepare(&sql)?;
    let classes = match bind {
        Some(id) => stmt.query_map([id], class_json)?.collect::<Result<Vec<_>, _>>()?,
        None => stmt.query_map([], class_json)?.collect::<Result<Vec<_>, _>>()?,
    };
    Ok(Reply::ok(json!({ "classes": classes })))
}

fn validate_homeroom(conn: &Connection, teacher_id: Option<&str>) -> ApiResult<()> {
    if let Some(t) = teacher_id {
        require_user_with_role(conn, t, Role::Teacher)?;
    }
    Ok(())
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;

    let name = req_str(&req.params, "name")?;
    let grade_level = opt_i64(&req.params, "gradeLevel")?;
    let homeroom = opt_str(&req.params, "homeroomTeacherId");
    validate_homeroom(conn, homeroom.as_deref())?;

    let class_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO classes(id, name, grade_level, homeroom_teacher_id) VALUES(?, ?, ?, ?)",
        (&class_id, &name, grade_level, &homeroom),
    ) {
        Ok(_) => {}
        Err(e) if is_constraint_violation(&e) => {
            return Err(ApiError::conflict(format!("class {} already exists", name)))
        }
        Err(e) => return Err(e.into()),
    }
    info!(class_id = %class_id, "class created");
    Ok(Reply::created(json!({ "classId": class_id, "name": name })))
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let class_id = req_str(&req.params, "classId")?;
    require_exists(conn, Table::Classes, &class_id)?;
    let patch = req
        .params
        .get("patch")
        .ok_or_else(|| ApiError::bad_params("missing patch"))?;

    if let Some(name) = opt_str(patch, "name") {
        match conn.execute("UPDATE classes SET name = ? WHERE id = ?", (&name, &class_id)) {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(ApiError::conflict(format!("class {} already exists", name)))
            }
            Err(e) => return Err(e.into()),
        }
    }
    if patch.get("gradeLevel").is_some() {
        let level = opt_i64(patch, "gradeLevel")?;
        conn.execute(
            "UPDATE classes SET grade_level = ? WHERE id = ?",
            (level, &class_id),
        )?;
    }
    if patch.get("homeroomTeacherId").is_some() {
        // null clears the homeroom assignment
        let homeroom = opt_str(patch, "homeroomTeacherId");
        validate_homeroom(conn, homeroom.as_deref())?;
        conn.execute(
            "UPDATE classes SET homeroom_teacher_id = ? WHERE id = ?",
            (&homeroom, &class_id),
        )?;
    }
    Ok(Reply::ok(json!({ "classId": class_id })))
}

fn count_refs(conn: &Connection, sql: &str, class_id: &str) -> ApiResult<i64> {
    Ok(conn.query_row(sql, [class_id], |r| r.get(0))?)
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let class_id = req_str(&req.params, "classId")?;
    require_exists(conn, Table::Classes, &class_id)?;

    let refs = [
        ("students", "SELECT COUNT(*) FROM class_students WHERE class_id = ?"),
        ("timetable slots", "SELECT COUNT(*) FROM timetable_slots WHERE class_id = ?"),
        ("grades", "SELECT COUNT(*) FROM grades WHERE class_id = ?"),
        ("leave applications", "SELECT COUNT(*) FROM leave_applications WHERE class_id = ?"),
        ("feedback", "SELECT COUNT(*) FROM feedback WHERE class_id = ?"),
    ];
    for (label, sql) in refs {
        let n = count_refs(conn, sql, &class_id)?;
        if n > 0 {
            return Err(ApiError::conflict(format!(
                "class still has {} {}",
                n, label
            )));
        }
    }

    conn.execute("DELETE FROM classes WHERE id = ?", [&class_id])?;
    info!(class_id = %class_id, "class deleted");
    Ok(Reply::ok(json!({ "classId": class_id, "deleted": true })))
}

fn handle_classes_students(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    let class_id = req_str(&req.params, "classId")?;
    require_exists(conn, Table::Classes, &class_id)?;
    match actor.role {
        Role::Admin => {}
        Role::Teacher if teaches_class(conn, &actor.id, &class_id)? => {}
        _ => return Err(ApiError::forbidden("not a teacher of this class")),
    }

    let mut stmt = conn.prepare(
        "SELECT u.id, u.email, u.full_name
         FROM class_students cs
         JOIN users u ON u.id = cs.student_id
         WHERE cs.class_id = ?
         ORDER BY u.full_name, u.id",
    )?;
    let students = stmt
        .query_map([&class_id], |row| {
            let id: String = row.get(0)?;
            let email: String = row.get(1)?;
            let full_name: String = row.get(2)?;
            Ok(json!({ "id": id, "email": email, "fullName": full_name }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Reply::ok(json!({ "classId": class_id, "students": students })))
}

/// Moves each listed student into the class; a student already in another
/// class is transferred.
fn handle_classes_enroll(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let class_id = req_str(&req.params, "classId")?;
    require_exists(conn, Table::Classes, &class_id)?;
    let student_ids = str_list(&req.params, "studentIds")?;
    if student_ids.is_empty() {
        return Err(ApiError::bad_params("studentIds must not be empty"));
    }
    for sid in &student_ids {
        require_user_with_role(conn, sid, Role::Student)?;
    }

    let tx = conn.unchecked_transaction()?;
    let mut transferred = 0usize;
    for sid in &student_ids {
        let previous: Option<String> = tx
            .query_row(
                "SELECT class_id FROM class_students WHERE student_id = ?",
                [sid],
                |r| r.get(0),
            )
            .optional()?;
        if previous.as_deref() == Some(class_id.as_str()) {
            continue;
        }
        if previous.is_some() {
            tx.execute("DELETE FROM class_students WHERE student_id = ?", [sid])?;
            transferred += 1;
        }
        tx.execute(
            "INSERT INTO class_students(class_id, student_id) VALUES(?, ?)",
            (&class_id, sid),
        )?;
    }
    tx.commit()?;

    Ok(Reply::ok(json!({
        "classId": class_id,
        "enrolled": student_ids.len(),
        "transferred": transferred,
    })))
}

fn handle_classes_unenroll(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let class_id = req_str(&req.params, "classId")?;
    let student_id = req_str(&req.params, "studentId")?;
    let removed = conn.execute(
        "DELETE FROM class_students WHERE class_id = ? AND student_id = ?",
        (&class_id, &student_id),
    )?;
    if removed == 0 {
        return Err(ApiError::not_found("student is not enrolled in this class"));
    }
    Ok(Reply::ok(json!({ "removed": true })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<ApiResult<Reply>> {
    let result = match req.method.as_str() {
        "classes.list" => handle_classes_list(state, req),
        "classes.create" => handle_classes_create(state, req),
        "classes.update" => handle_classes_update(state, req),
        "classes.delete" => handle_classes_delete(state, req),
        "classes.students" => handle_classes_students(state, req),
        "classes.enroll" => handle_classes_enroll(state, req),
        "classes.unenroll" => handle_classes_unenroll(state, req),
        _ => return None,
    };
    Some(result)
}
