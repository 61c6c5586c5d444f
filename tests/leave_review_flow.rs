mod test_support;

use serde_json::json;
use test_support::{open_school, str_field, Sidecar};

#[test]
fn homeroom_teacher_reviews_and_submitter_is_notified() {
    let mut sc = Sidecar::spawn();
    let school = open_school(&mut sc, "educonnect-leave");

    sc.assume(&school.student1);
    let submitted = sc.ok(
        "leave.submit",
        json!({ "reason": "Dentist", "startDate": "2026-10-20", "endDate": "2026-10-20" }),
    );
    assert_eq!(submitted.get("status").and_then(|v| v.as_str()), Some("pending"));
    let leave_id = str_field(&submitted, "leaveId");

    sc.assume(&school.teacher2);
    let (status, _) = sc.fail(
        "leave.review",
        json!({ "leaveId": leave_id, "decision": "approved" }),
    );
    assert_eq!(status, 403);

    sc.assume(&school.teacher1);
    let pending = sc.ok("leave.list", json!({ "status": "pending" }));
    assert_eq!(
        pending.get("applications").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );
    let reviewed = sc.ok(
        "leave.review",
        json!({ "leaveId": leave_id, "decision": "approved", "note": "Get well" }),
    );
    assert_eq!(reviewed.get("status").and_then(|v| v.as_str()), Some("approved"));

    let (status, code) = sc.fail(
        "leave.review",
        json!({ "leaveId": leave_id, "decision": "rejected" }),
    );
    assert_eq!((status, code.as_str()), (409, "conflict"));

    sc.assume(&school.student1);
    let inbox = sc.ok("notifications.list", json!({ "unreadOnly": true }));
    assert_eq!(inbox.get("unreadCount").and_then(|v| v.as_i64()), Some(1));
    let content = inbox
        .pointer("/notifications/0/content")
        .and_then(|v| v.as_str())
        .expect("notification content");
    assert!(content.contains("approved"), "content: {}", content);
    assert!(content.contains("Get well"), "content: {}", content);
}

#[test]
fn parents_apply_for_linked_children_only() {
    let mut sc = Sidecar::spawn();
    let school = open_school(&mut sc, "educonnect-leave-parent");
    sc.assume(&school.parent1);

    let (status, _) = sc.fail(
        "leave.submit",
        json!({ "studentId": school.student2, "reason": "Trip",
                "startDate": "2026-11-02", "endDate": "2026-11-03" }),
    );
    assert_eq!(status, 403);

    sc.ok(
        "leave.submit",
        json!({ "studentId": school.student1, "reason": "Trip",
                "startDate": "2026-11-02", "endDate": "2026-11-03" }),
    );
    let mine = sc.ok("leave.list", json!({}));
    assert_eq!(
        mine.pointer("/applications/0/studentId").and_then(|v| v.as_str()),
        Some(school.student1.as_str())
    );

    sc.assume(&school.student2);
    let theirs = sc.ok("leave.list", json!({}));
    assert_eq!(
        theirs.get("applications").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
}

#[test]
fn invalid_dates_and_roles_are_rejected() {
    let mut sc = Sidecar::spawn();
    let school = open_school(&mut sc, "educonnect-leave-invalid");
    sc.assume(&school.student1);
    let (status, _) = sc.fail(
        "leave.submit",
        json!({ "reason": "x", "startDate": "2026-11-05", "endDate": "2026-11-04" }),
    );
    assert_eq!(status, 400);
    let (status, _) = sc.fail(
        "leave.submit",
        json!({ "reason": "x", "startDate": "05/11/2026", "endDate": "2026-11-06" }),
    );
    assert_eq!(status, 400);

    sc.assume(&school.teacher1);
    let (status, _) = sc.fail(
        "leave.submit",
        json!({ "studentId": school.student1, "reason": "x",
                "startDate": "2026-11-05", "endDate": "2026-11-05" }),
    );
    assert_eq!(status, 403);
}
