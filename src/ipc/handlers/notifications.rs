use crate::ipc::error::{ApiError, ApiResult};
use crate::ipc::helpers::{
    opt_bool, opt_str, page_params, req_str, require_exists, require_role, session, str_list,
    teaches_class, Table,
};
use crate::ipc::types::{AppState, Reply, Request};
use crate::model::{now_rfc3339, Actor, Role};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

/// Inserts one notification row per recipient. Callers decide whether this
/// runs inside a transaction.
pub fn deliver(
    conn: &Connection,
    sender_id: &str,
    recipients: &[String],
    title: &str,
    content: &str,
) -> rusqlite::Result<usize> {
    let now = now_rfc3339();
    let mut stmt = conn.prepare(
        "INSERT INTO notifications(id, sender_id, recipient_id, title, content, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
    )?;
    for recipient in recipients {
        stmt.execute((
            Uuid::new_v4().to_string(),
            sender_id,
            recipient,
            title,
            content,
            &now,
        ))?;
    }
    Ok(recipients.len())
}

fn ids_for(conn: &Connection, sql: &str, bind: &str) -> ApiResult<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([bind], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Students of a class plus their linked parents.
fn class_audience(conn: &Connection, class_id: &str) -> ApiResult<Vec<String>> {
    ids_for(
        conn,
        "SELECT student_id FROM class_students WHERE class_id = ?1
         UNION
         SELECT ps.parent_id FROM parent_students ps
         JOIN class_students cs ON cs.student_id = ps.student_id
         WHERE cs.class_id = ?1
         ORDER BY 1",
        class_id,
    )
}

fn resolve_recipients(
    conn: &Connection,
    actor: &Actor,
    params: &serde_json::Value,
) -> ApiResult<Vec<String>> {
    if params.get("recipientIds").is_some() {
        let ids = str_list(params, "recipientIds")?;
        for id in &ids {
            require_exists(conn, Table::Users, id)?;
        }
        if actor.role == Role::Teacher {
            // Teachers reach only the students and parents of their own classes.
            for id in &ids {
                let reachable: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM class_students cs
                         LEFT JOIN parent_students ps ON ps.student_id = cs.student_id
                         WHERE (cs.student_id = ?1 OR ps.parent_id = ?1)
                           AND (cs.class_id IN (SELECT id FROM classes WHERE homeroom_teacher_id = ?2)
                             OR cs.class_id IN (SELECT class_id FROM timetable_slots WHERE teacher_id = ?2))
                         LIMIT 1",
                        (id, &actor.id),
                        |r| r.get(0),
                    )
                    .optional()?;
                if reachable.is_none() {
                    return Err(ApiError::forbidden(format!(
                        "user {} is outside your classes",
                        id
                    )));
                }
            }
        }
        return Ok(ids);
    }
    if let Some(class_id) = opt_str(params, "classId") {
        require_exists(conn, Table::Classes, &class_id)?;
        if actor.role == Role::Teacher && !teaches_class(conn, &actor.id, &class_id)? {
            return Err(ApiError::forbidden("not a teacher of this class"));
        }
        return class_audience(conn, &class_id);
    }
    if let Some(role) = opt_str(params, "role") {
        if actor.role != Role::Admin {
            return Err(ApiError::forbidden("only admins broadcast by role"));
        }
        let role = Role::parse(&role)
            .ok_or_else(|| ApiError::bad_params(format!("unknown role {}", role)))?;
        return ids_for(
            conn,
            "SELECT id FROM users WHERE role = ? ORDER BY id",
            role.as_str(),
        );
    }
    Err(ApiError::bad_params(
        "one of recipientIds, classId or role is required",
    ))
}

fn handle_notifications_send(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    require_role(actor, &[Role::Admin, Role::Teacher])?;
    let title = req_str(&req.params, "title")?;
    let content = req_str(&req.params, "content")?;
    let mut recipients = resolve_recipients(conn, actor, &req.params)?;
    recipients.sort();
    recipients.dedup();
    recipients.retain(|id| id != &actor.id);
    if recipients.is_empty() {
        return Err(ApiError::bad_params("no recipients matched"));
    }

    let tx = conn.unchecked_transaction()?;
    let sent = deliver(&tx, &actor.id, &recipients, &title, &content)?;
    tx.commit()?;
    info!(sender = %actor.id, recipients = sent, "notification sent");
    Ok(Reply::created(json!({ "recipientCount": sent })))
}

fn handle_notifications_list(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    let page = page_params(&req.params, &state.config.pagination)?;
    let unread_only = opt_bool(&req.params, "unreadOnly");
    let filter = if unread_only { " AND n.read_at IS NULL" } else { "" };

    let total: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM notifications n WHERE n.recipient_id = ?{}",
            filter
        ),
        [&actor.id],
        |r| r.get(0),
    )?;
    let unread: i64 = conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE recipient_id = ? AND read_at IS NULL",
        [&actor.id],
        |r| r.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT n.id, n.sender_id, u.full_name, n.title, n.content, n.created_at, n.read_at
         FROM notifications n
         JOIN users u ON u.id = n.sender_id
         WHERE n.recipient_id = ?{}
         ORDER BY n.created_at DESC, n.id
         LIMIT ? OFFSET ?",
        filter
    ))?;
    let items = stmt
        .query_map((&actor.id, page.page_size, page.offset()), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "senderId": row.get::<_, String>(1)?,
                "senderName": row.get::<_, String>(2)?,
                "title": row.get::<_, String>(3)?,
                "content": row.get::<_, String>(4)?,
                "createdAt": row.get::<_, String>(5)?,
                "readAt": row.get::<_, Option<String>>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Reply::paged(
        json!({ "notifications": items, "unreadCount": unread }),
        page.describe(total),
    ))
}

fn handle_notifications_mark_read(state: &mut AppState, req: &Request) -> ApiResult<Reply> {
    let (conn, actor) = session(state)?;
    let notification_id = req_str(&req.params, "notificationId")?;
    let recipient: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT recipient_id, read_at FROM notifications WHERE id = ?",
            [&notification_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((recipient_id, read_at)) = recipient else {
        return Err(ApiError::not_found("notification not found"));
    };
    if recipient_id != actor.id {
        return Err(ApiError::forbidden("notification belongs to another user"));
    }
    // Marking twice keeps the first read time.
    let read_at = match read_at {
        Some(t) => t,
        None => {
            let now = now_rfc3339();
            conn.execute(
                "UPDATE notifications SET read_at = ? WHERE id = ?",
                (&now, &notification_id),
            )?;
            now
        }
    };
    Ok(Reply::ok(json!({
        "notificationId": notification_id,
        "readAt": read_at,
    })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<ApiResult<Reply>> {
    let result = match req.method.as_str() {
        "notifications.send" => handle_notifications_send(state, req),
        "notifications.list" => handle_notifications_list(state, req),
        "notifications.markRead" => handle_notifications_mark_read(state, req),
        _ => return None,
    };
    Some(result)
}
