use crate::model::{now_rfc3339, AuditStatus, ComponentType};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const MIN_GRADE: f64 = 0.0;
pub const MAX_GRADE: f64 = 10.0;

/// One teacher-proposed change to a stored grade.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeOverride {
    pub grade_id: String,
    pub student_id: String,
    pub component_type: String,
    pub old_value: f64,
    pub new_value: f64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideSummary {
    pub message: String,
    pub override_count: usize,
    pub applied_count: usize,
    pub pending_count: usize,
    pub audit_ids: Vec<String>,
}

#[derive(Debug, Error)]
pub enum OverrideError {
    #[error("no overrides to process")]
    Empty,
    #[error("sign in to submit grade overrides")]
    Unauthenticated,
    #[error("override for student {student_id}: value {value} is outside 0..=10")]
    OutOfRange { student_id: String, value: f64 },
    #[error("override for student {student_id}: grade {grade_id} not found")]
    GradeNotFound {
        student_id: String,
        grade_id: String,
    },
    #[error("override for student {student_id}: grade {grade_id} belongs to another student")]
    StudentMismatch {
        student_id: String,
        grade_id: String,
    },
    #[error("override for student {student_id}: grade {grade_id} is a {stored} grade, not {claimed}")]
    ComponentMismatch {
        student_id: String,
        grade_id: String,
        claimed: String,
        stored: &'static str,
    },
    #[error("failed to process override for student {student_id}: {source}")]
    Store {
        student_id: String,
        #[source]
        source: rusqlite::Error,
    },
}

pub fn grade_in_range(v: f64) -> bool {
    v.is_finite() && (MIN_GRADE..=MAX_GRADE).contains(&v)
}

fn insert_audit(
    conn: &Connection,
    ov: &GradeOverride,
    actor_id: &str,
    status: AuditStatus,
    now: &str,
) -> rusqlite::Result<String> {
    let audit_id = Uuid::new_v4().to_string();
    let (processed_at, processed_by) = match status {
        AuditStatus::Approved => (Some(now), Some(actor_id)),
        AuditStatus::Pending => (None, None),
    };
    conn.execute(
        "INSERT INTO grade_audit_logs(id, grade_id, old_value, new_value, change_reason,
           changed_by, changed_at, status, processed_at, processed_by)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &audit_id,
            &ov.grade_id,
            ov.old_value,
            ov.new_value,
            ov.reason.trim(),
            actor_id,
            now,
            status.as_str(),
            processed_at,
            processed_by,
        ),
    )?;
    Ok(audit_id)
}

/// Applies a batch of overrides one at a time.
///
/// Midterm and final changes only leave a `pending` audit row behind; every
/// other component is written to the grade immediately and audited as
/// `approved`. The gate reads the component stored on the grade; an item
/// whose student or component label disagrees with the grade is refused.
/// The loop is not transactional: when an item fails, the items
/// before it stay committed and the error names the failing student.
pub fn process_overrides(
    conn: &Connection,
    actor_id: Option<&str>,
    overrides: &[GradeOverride],
) -> Result<OverrideSummary, OverrideError> {
    let Some(actor_id) = actor_id else {
        return Err(OverrideError::Unauthenticated);
    };
    if overrides.is_empty() {
        return Err(OverrideError::Empty);
    }
    if let Some(bad) = overrides.iter().find(|o| !grade_in_range(o.new_value)) {
        return Err(OverrideError::OutOfRange {
            student_id: bad.student_id.clone(),
            value: bad.new_value,
        });
    }

    let mut applied_count = 0usize;
    let mut pending_count = 0usize;
    let mut audit_ids = Vec::with_capacity(overrides.len());

    for ov in overrides {
        let store_err = |source: rusqlite::Error| OverrideError::Store {
            student_id: ov.student_id.clone(),
            source,
        };

        let stored: Option<(String, String)> = conn
            .query_row(
                "SELECT student_id, component_type FROM grades WHERE id = ?",
                [&ov.grade_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(store_err)?;
        let Some((owner, stored_component)) = stored else {
            return Err(OverrideError::GradeNotFound {
                student_id: ov.student_id.clone(),
                grade_id: ov.grade_id.clone(),
            });
        };
        if owner != ov.student_id {
            return Err(OverrideError::StudentMismatch {
                student_id: ov.student_id.clone(),
                grade_id: ov.grade_id.clone(),
            });
        }
        // The approval gate follows the stored grade, never the request label.
        let component = ComponentType::classify(&stored_component);
        if ComponentType::classify(&ov.component_type) != component {
            return Err(OverrideError::ComponentMismatch {
                student_id: ov.student_id.clone(),
                grade_id: ov.grade_id.clone(),
                claimed: ov.component_type.trim().to_string(),
                stored: component.as_str(),
            });
        }

        let now = now_rfc3339();
        if component.requires_approval() {
            let audit_id = insert_audit(conn, ov, actor_id, AuditStatus::Pending, &now)
                .map_err(store_err)?;
            debug!(grade_id = %ov.grade_id, component = component.as_str(), "override queued for approval");
            audit_ids.push(audit_id);
            pending_count += 1;
        } else {
            conn.execute(
                "UPDATE grades SET value = ?, updated_at = ? WHERE id = ?",
                (ov.new_value, &now, &ov.grade_id),
            )
            .map_err(store_err)?;
            let audit_id = insert_audit(conn, ov, actor_id, AuditStatus::Approved, &now)
                .map_err(store_err)?;
            debug!(grade_id = %ov.grade_id, "override applied");
            audit_ids.push(audit_id);
            applied_count += 1;
        }
    }

    let message = format!(
        "{} regular updated and {} pending approval",
        applied_count, pending_count
    );
    info!(actor = actor_id, applied_count, pending_count, "grade overrides processed");
    Ok(OverrideSummary {
        message,
        override_count: overrides.len(),
        applied_count,
        pending_count,
        audit_ids,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovedOverride {
    pub audit_id: String,
    pub grade_id: String,
    pub new_value: f64,
    pub processed_at: String,
}

#[derive(Debug, Error)]
pub enum ApproveError {
    #[error("audit entry not found")]
    NotFound,
    #[error("audit entry is already {0}")]
    AlreadyProcessed(String),
    #[error(transparent)]
    Store(#[from] rusqlite::Error),
}

/// Admin step that completes a pending midterm/final override: the grade
/// takes the audited `new_value` and the audit row becomes `approved`.
pub fn approve_pending(
    conn: &Connection,
    audit_id: &str,
    actor_id: &str,
) -> Result<ApprovedOverride, ApproveError> {
    let row: Option<(String, f64, String)> = conn
        .query_row(
            "SELECT grade_id, new_value, status FROM grade_audit_logs WHERE id = ?",
            [audit_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((grade_id, new_value, status)) = row else {
        return Err(ApproveError::NotFound);
    };
    if AuditStatus::parse(&status) != Some(AuditStatus::Pending) {
        return Err(ApproveError::AlreadyProcessed(status));
    }

    let now = now_rfc3339();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE grades SET value = ?, updated_at = ? WHERE id = ?",
        (new_value, &now, &grade_id),
    )?;
    tx.execute(
        "UPDATE grade_audit_logs
         SET status = 'approved', processed_at = ?, processed_by = ?
         WHERE id = ?",
        (&now, actor_id, audit_id),
    )?;
    tx.commit()?;

    info!(audit_id, grade_id = %grade_id, "pending override approved");
    Ok(ApprovedOverride {
        audit_id: audit_id.to_string(),
        grade_id,
        new_value,
        processed_at: now,
    })
}
