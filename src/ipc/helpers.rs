use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

use crate::config::PaginationConfig;
use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::types::AppState;
use crate::model::{Actor, Role};

pub fn conn(state: &AppState) -> ApiResult<&Connection> {
    state.db.as_ref().ok_or(ApiError::NoWorkspace)
}

pub fn actor(state: &AppState) -> ApiResult<&Actor> {
    state.actor.as_ref().ok_or(ApiError::Unauthenticated)
}

/// Workspace plus signed-in user, the precondition of every domain method.
pub fn session(state: &AppState) -> ApiResult<(&Connection, &Actor)> {
    let conn = conn(state)?;
    let actor = actor(state)?;
    Ok((conn, actor))
}

pub fn require_role(actor: &Actor, allowed: &[Role]) -> ApiResult<()> {
    if allowed.contains(&actor.role) {
        Ok(())
    } else {
        Err(ApiError::forbidden(format!(
            "role {} may not perform this action",
            actor.role.as_str()
        )))
    }
}

pub fn require_admin(actor: &Actor) -> ApiResult<()> {
    require_role(actor, &[Role::Admin])
}

pub fn req_str(params: &Value, key: &str) -> ApiResult<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_params(format!("missing {}", key)))
}

pub fn opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn req_i64(params: &Value, key: &str) -> ApiResult<i64> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ApiError::bad_params(format!("missing/invalid {}", key)))
}

pub fn opt_i64(params: &Value, key: &str) -> ApiResult<Option<i64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| ApiError::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn req_f64(params: &Value, key: &str) -> ApiResult<f64> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| ApiError::bad_params(format!("missing/invalid {}", key)))
}

pub fn opt_bool(params: &Value, key: &str) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

pub fn str_list(params: &Value, key: &str) -> ApiResult<Vec<String>> {
    let Some(arr) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(ApiError::bad_params(format!("missing {}[]", key)));
    };
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ApiError::bad_params(format!("{}[] must hold ids", key)))
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: i64,
    pub page_size: i64,
}

impl Page {
    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }

    pub fn describe(&self, total: i64) -> Value {
        let total_pages = if total == 0 {
            0
        } else {
            (total + self.page_size - 1) / self.page_size
        };
        json!({
            "page": self.page,
            "pageSize": self.page_size,
            "total": total,
            "totalPages": total_pages,
        })
    }
}

pub fn page_params(params: &Value, cfg: &PaginationConfig) -> ApiResult<Page> {
    let page = opt_i64(params, "page")?.unwrap_or(1);
    let page_size = opt_i64(params, "pageSize")?.unwrap_or(cfg.default_page_size);
    if page < 1 {
        return Err(ApiError::bad_params("page must be >= 1"));
    }
    if page_size < 1 || page_size > cfg.max_page_size {
        return Err(ApiError::bad_params(format!(
            "pageSize must be between 1 and {}",
            cfg.max_page_size
        )));
    }
    if (page - 1).checked_mul(page_size).is_none() {
        return Err(ApiError::bad_params("page is out of range"));
    }
    Ok(Page { page, page_size })
}

/// Tables whose rows are looked up by primary key from request params.
#[derive(Debug, Clone, Copy)]
pub enum Table {
    Users,
    Classes,
    Subjects,
    Classrooms,
    Semesters,
    TimetableSlots,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Classes => "classes",
            Self::Subjects => "subjects",
            Self::Classrooms => "classrooms",
            Self::Semesters => "semesters",
            Self::TimetableSlots => "timetable_slots",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Users => "user",
            Self::Classes => "class",
            Self::Subjects => "subject",
            Self::Classrooms => "classroom",
            Self::Semesters => "semester",
            Self::TimetableSlots => "timetable slot",
        }
    }
}

pub fn exists(conn: &Connection, table: Table, id: &str) -> ApiResult<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table.name());
    let found: Option<i64> = conn.query_row(&sql, [id], |r| r.get(0)).optional()?;
    Ok(found.is_some())
}

pub fn require_exists(conn: &Connection, table: Table, id: &str) -> ApiResult<()> {
    if exists(conn, table, id)? {
        Ok(())
    } else {
        Err(ApiError::not_found(format!("{} not found", table.label())))
    }
}

pub fn user_role(conn: &Connection, user_id: &str) -> ApiResult<Option<Role>> {
    let role: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [user_id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(role.as_deref().and_then(Role::parse))
}

/// Fails unless `user_id` exists and holds `role`.
pub fn require_user_with_role(conn: &Connection, user_id: &str, role: Role) -> ApiResult<()> {
    match user_role(conn, user_id)? {
        None => Err(ApiError::not_found("user not found")),
        Some(r) if r == role => Ok(()),
        Some(r) => Err(ApiError::bad_params(format!(
            "user {} is a {}, expected a {}",
            user_id,
            r.as_str(),
            role.as_str()
        ))),
    }
}

pub fn class_of_student(conn: &Connection, student_id: &str) -> ApiResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT class_id FROM class_students WHERE student_id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()?)
}

pub fn is_homeroom_teacher(conn: &Connection, teacher_id: &str, class_id: &str) -> ApiResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM classes WHERE id = ? AND homeroom_teacher_id = ?",
            (class_id, teacher_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Homeroom teacher of the class, or scheduled to teach it in any slot.
pub fn teaches_class(conn: &Connection, teacher_id: &str, class_id: &str) -> ApiResult<bool> {
    if is_homeroom_teacher(conn, teacher_id, class_id)? {
        return Ok(true);
    }
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM timetable_slots WHERE class_id = ? AND teacher_id = ? LIMIT 1",
            (class_id, teacher_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn is_parent_of(conn: &Connection, parent_id: &str, student_id: &str) -> ApiResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM parent_students WHERE parent_id = ? AND student_id = ?",
            (parent_id, student_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn children_of(conn: &Connection, parent_id: &str) -> ApiResult<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT student_id FROM parent_students WHERE parent_id = ? ORDER BY student_id")?;
    let ids = stmt
        .query_map([parent_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Classes a teacher may act on: homeroom classes plus every class they
/// have a timetable slot in.
pub fn classes_taught_by(conn: &Connection, teacher_id: &str) -> ApiResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM classes WHERE homeroom_teacher_id = ?1
         UNION
         SELECT DISTINCT class_id FROM timetable_slots WHERE teacher_id = ?1
         ORDER BY 1",
    )?;
    let ids = stmt
        .query_map([teacher_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Whether `actor` may see data about `student_id`.
pub fn can_view_student(conn: &Connection, actor: &Actor, student_id: &str) -> ApiResult<bool> {
    match actor.role {
        Role::Admin => Ok(true),
        Role::Student => Ok(actor.id == student_id),
        Role::Parent => is_parent_of(conn, &actor.id, student_id),
        Role::Teacher => match class_of_student(conn, student_id)? {
            Some(class_id) => teaches_class(conn, &actor.id, &class_id),
            None => Ok(false),
        },
    }
}

/// Valid `YYYY-MM-DD` date, returned normalized.
pub fn req_date(params: &Value, key: &str) -> ApiResult<chrono::NaiveDate> {
    let raw = req_str(params, key)?;
    chrono::NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|_| ApiError::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

/// `?` placeholders for an `IN (...)` list of `n` items.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

pub fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> PaginationConfig {
        PaginationConfig {
            default_page_size: 20,
            max_page_size: 100,
        }
    }

    #[test]
    fn page_params_defaults_and_offset() {
        let page = page_params(&json!({}), &cfg()).expect("defaults");
        assert_eq!((page.page, page.page_size, page.offset()), (1, 20, 0));
        let page = page_params(&json!({ "page": 3, "pageSize": 10 }), &cfg()).expect("page 3");
        assert_eq!(page.offset(), 20);
        assert_eq!(page.describe(21)["totalPages"], 3);
    }

    #[test]
    fn page_params_rejects_out_of_range_pages() {
        for params in [
            json!({ "page": 0 }),
            json!({ "pageSize": 0 }),
            json!({ "pageSize": 101 }),
            json!({ "page": i64::MAX, "pageSize": 100 }),
            json!({ "page": "two" }),
        ] {
            let err = page_params(&params, &cfg()).expect_err("rejected");
            assert_eq!(err.code(), "bad_params", "{}", params);
        }
        // The largest page whose offset still fits is accepted.
        let page = page_params(&json!({ "page": i64::MAX / 100 + 1, "pageSize": 100 }), &cfg())
            .expect("fits");
        assert!(page.offset() > 0);
    }
}
