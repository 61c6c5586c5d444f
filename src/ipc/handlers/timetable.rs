use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::helpers::{
    children_of, class_of_student, opt_i64, opt_str, placeholders, req_i64, req_str,
    require_admin, require_exists, require_role, require_user_with_role, session, Table,
};
use crate::ipc::types::{AppState, Reply, Request};
use crate::model::Role;
use crate::scheduling::{
    check_conflict, normalize_time, valid_day_of_week, valid_week_number, ConflictCheck,
    SlotCandidate,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

/// A fully validated slot, ready to be conflict-checked and written.
struct SlotInput {
    classroom_id: String,
    teacher_id: String,
    class_id: String,
    subject_id: String,
    semester_id: String,
    day_of_week: i64,
    start_time: String,
    end_time: String,
    week_number: i64,
}

impl SlotInput {
    fn candidate(&self) -> SlotCandidate<'_> {
        SlotCandidate {
            classroom_id: &self.classroom_id,
            teacher_id: &self.teacher_id,
            day_of_week: self.day_of_week,
            start_time: &self.start_time,
            week_number: self.week_number,
            semester_id: &self.semester_id,
        }
    }
}

fn parse_day(params: &Value) -> ApiResult<i64> {
    let day = req_i64(params, "dayOfWeek")?;
    if !valid_day_of_week(day) {
        return Err(ApiError::bad_params("dayOfWeek must be between 0 and 6"));
    }
    Ok(day)
}

fn parse_week(params: &Value) -> ApiResult<i64> {
    let week = req_i64(params, "weekNumber")?;
    if !valid_week_number(week) {
        return Err(ApiError::bad_params("weekNumber must be between 1 and 52"));
    }
    Ok(week)
}

fn parse_time(params: &Value, key: &str) -> ApiResult<String> {
    let raw = req_str(params, key)?;
    normalize_time(&raw).ok_or_else(|| ApiError::bad_params(format!("{} must be HH:MM", key)))
}

fn parse_slot(conn: &Connection, params: &Value) -> ApiResult<SlotInput> {
    let slot = SlotInput {
        classroom_id: req_str(params, "classroomId")?,
        teacher_id: req_str(params, "teacherId")?,
        class_id: req_str(params, "classId")?,
        subject_id: req_str(params, "subjectId")?,
        semester_id: req_str(params, "semesterId")?,
        day_of_week: parse_day(params)?,
        start_time: parse_time(params, "startTime")?,
        end_time: parse_time(params, "endTime")?,
        week_number: parse_week(params)?,
    };
    // HH:MM strings order the same way as the times they denote.
    if slot.start_time >= slot.end_time {
        return Err(ApiError::bad_params("startTime must be before endTime"));
    }

    require_exists(conn, Table::Classrooms, &slot.classroom_id)?;
    require_user_with_role(conn, &slot.teacher_id, Role::Teacher)?;
    require_exists(conn, Table::Classes, &slot.class_id)?;
    require_exists(conn, Table::Subjects, &slot.subject_id)?;
    require_exists(conn, Table::Semesters, &slot.semester_id)?;
    Ok(slot)
}

fn refuse_conflict(check: &ConflictCheck) -> ApiResult<()> {
    match check.conflict_type {
        Some(kind) if check.has_conflict => Err(ApiError::conflict(kind.describe())),
        _ => Ok(()),
    }
}

fn handle_check_conflict(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_role(actor, &[Role::Admin, Role::Teacher])?;
    let p = &req.params;
    let classroom_id = req_str(p, "classroomId")?;
    let teacher_id = req_str(p, "teacherId")?;
    let semester_id = req_str(p, "semesterId")?;
    let start_time = parse_time(p, "startTime")?;
    let candidate = SlotCandidate {
        classroom_id: &classroom_id,
        teacher_id: &teacher_id,
        day_of_week: parse_day(p)?,
        start_time: &start_time,
        week_number: parse_week(p)?,
        semester_id: &semester_id,
    };
    let exclude = opt_str(p, "excludeSlotId");
    let check = check_conflict(conn, &candidate, exclude.as_deref())?;
    debug!(has_conflict = check.has_conflict, "conflict check");
    Ok(Reply::ok(serde_json::to_value(&check).map_err(anyhow::Error::from)?))
}

fn handle_timetable_create(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let slot = parse_slot(conn, &req.params)?;
    refuse_conflict(&check_conflict(conn, &slot.candidate(), None)?)?;

    let slot_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO timetable_slots(id, classroom_id, teacher_id, class_id, subject_id,
           semester_id, day_of_week, start_time, end_time, week_number)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &slot_id,
            &slot.classroom_id,
            &slot.teacher_id,
            &slot.class_id,
            &slot.subject_id,
            &slot.semester_id,
            slot.day_of_week,
            &slot.start_time,
            &slot.end_time,
            slot.week_number,
        ),
    )?;
    info!(slot_id = %slot_id, "timetable slot created");
    Ok(Reply::created(json!({ "slotId": slot_id })))
}

fn handle_timetable_update(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let slot_id = req_str(&req.params, "slotId")?;
    require_exists(conn, Table::TimetableSlots, &slot_id)?;
    let slot = parse_slot(conn, &req.params)?;
    refuse_conflict(&check_conflict(conn, &slot.candidate(), Some(slot_id.as_str()))?)?;

    conn.execute(
        "UPDATE timetable_slots SET classroom_id = ?, teacher_id = ?, class_id = ?,
           subject_id = ?, semester_id = ?, day_of_week = ?, start_time = ?, end_time = ?,
           week_number = ?
         WHERE id = ?",
        (
            &slot.classroom_id,
            &slot.teacher_id,
            &slot.class_id,
            &slot.subject_id,
            &slot.semester_id,
            slot.day_of_week,
            &slot.start_time,
            &slot.end_time,
            slot.week_number,
            &slot_id,
        ),
    )?;
    info!(slot_id = %slot_id, "timetable slot updated");
    Ok(Reply::ok(json!({ "slotId": slot_id })))
}

fn handle_timetable_delete(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_admin(actor)?;
    let slot_id = req_str(&req.params, "slotId")?;
    let removed = conn.execute("DELETE FROM timetable_slots WHERE id = ?", [&slot_id])?;
    if removed == 0 {
        return Err(ApiError::not_found("timetable slot not found"));
    }
    info!(slot_id = %slot_id, "timetable slot deleted");
    Ok(Reply::ok(json!({ "slotId": slot_id, "deleted": true })))
}

fn slot_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "classroomId": row.get::<_, String>(1)?,
        "classroomName": row.get::<_, String>(2)?,
        "teacherId": row.get::<_, String>(3)?,
        "teacherName": row.get::<_, String>(4)?,
        "classId": row.get::<_, String>(5)?,
        "className": row.get::<_, String>(6)?,
        "subjectId": row.get::<_, String>(7)?,
        "subjectName": row.get::<_, String>(8)?,
        "semesterId": row.get::<_, String>(9)?,
        "dayOfWeek": row.get::<_, i64>(10)?,
        "startTime": row.get::<_, String>(11)?,
        "endTime": row.get::<_, String>(12)?,
        "weekNumber": row.get::<_, i64>(13)?,
    }))
}

/// Students and parents only see their own class timetables; teachers
/// default to their own slots; admins see everything.
fn handle_timetable_list(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    let p = &req.params;

    let mut where_sql = String::from(" WHERE 1 = 1");
    let mut binds: Vec<SqlValue> = Vec::new();

    match actor.role {
        Role::Admin => {}
        Role::Teacher => {
            if opt_str(p, "classId").is_none() {
                let teacher = opt_str(p, "teacherId").unwrap_or_else(|| actor.id.clone());
                where_sql.push_str(" AND ts.teacher_id = ?");
                binds.push(SqlValue::Text(teacher));
            }
        }
        Role::Student | Role::Parent => {
            let students = if actor.role == Role::Student {
                vec![actor.id.clone()]
            } else {
                children_of(conn, &actor.id)?
            };
            let mut class_ids = Vec::new();
            for sid in &students {
                if let Some(c) = class_of_student(conn, sid)? {
                    class_ids.push(c);
                }
            }
            if class_ids.is_empty() {
                return Ok(Reply::ok(json!({ "slots": [] })));
            }
            where_sql.push_str(&format!(" AND ts.class_id IN ({})", placeholders(class_ids.len())));
            binds.extend(class_ids.into_iter().map(SqlValue::Text));
        }
    }

    if let Some(class_id) = opt_str(p, "classId") {
        where_sql.push_str(" AND ts.class_id = ?");
        binds.push(SqlValue::Text(class_id));
    }
    if actor.role == Role::Admin {
        if let Some(teacher_id) = opt_str(p, "teacherId") {
            where_sql.push_str(" AND ts.teacher_id = ?");
            binds.push(SqlValue::Text(teacher_id));
        }
    }
    if let Some(semester_id) = opt_str(p, "semesterId") {
        where_sql.push_str(" AND ts.semester_id = ?");
        binds.push(SqlValue::Text(semester_id));
    }
    if let Some(week) = opt_i64(p, "weekNumber")? {
        where_sql.push_str(" AND ts.week_number = ?");
        binds.push(SqlValue::Integer(week));
    }

    let sql = format!(
        "SELECT ts.id, ts.classroom_id, r.name, ts.teacher_id, t.full_name, ts.class_id, c.name,
           ts.subject_id, s.name, ts.semester_id, ts.day_of_week, ts.start_time, ts.end_time,
           ts.week_number
         FROM timetable_slots ts
         JOIN classrooms r ON r.id = ts.classroom_id
         JOIN users t ON t.id = ts.teacher_id
         JOIN classes c ON c.id = ts.class_id
         JOIN subjects s ON s.id = ts.subject_id{}
         ORDER BY ts.week_number, ts.day_of_week, ts.start_time, c.name",
        where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let slots = stmt
        .query_map(params_from_iter(binds.iter()), slot_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Reply::ok(json!({ "slots": slots })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<ApiResult<Reply>> {
    let result = match req.method.as_str() {
        "timetable.checkConflict" => handle_check_conflict(state, req),
        "timetable.list" => handle_timetable_list(state, req),
        "timetable.create" => handle_timetable_create(state, req),
        "timetable.update" => handle_timetable_update(state, req),
        "timetable.delete" => handle_timetable_delete(state, req),
        _ => return None,
    };
    Some(result)
}
