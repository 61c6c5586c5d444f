mod test_support;

use serde_json::json;
use std::io::{BufRead, Write};
use test_support::{open_school, request, spawn_sidecar, temp_dir, Sidecar};

#[test]
fn health_and_unknown_method() {
    let mut sc = Sidecar::spawn();
    let health = sc.ok("health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health.get("workspacePath").map(|v| v.is_null()).unwrap_or(false));

    let resp = sc.call("no.such.method", json!({}));
    assert_eq!(resp.get("success").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(resp.get("code").and_then(|v| v.as_str()), Some("not_implemented"));
    assert_eq!(resp.get("status").and_then(|v| v.as_u64()), Some(404));
}

#[test]
fn bad_json_line_gets_an_error_reply() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    writeln!(stdin, "{{not json").expect("write");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(value.get("code").and_then(|v| v.as_str()), Some("bad_json"));
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(""));

    // The loop keeps serving after a bad line.
    let health = request(&mut stdin, &mut reader, "2", "health", json!({}));
    assert_eq!(health.get("success").and_then(|v| v.as_bool()), Some(true));
}

#[test]
fn domain_methods_need_workspace_then_session() {
    let mut sc = Sidecar::spawn();
    assert_eq!(
        sc.fail("classes.list", json!({})),
        (400, "no_workspace".to_string())
    );

    let workspace = temp_dir("educonnect-smoke");
    sc.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
    assert_eq!(
        sc.fail("classes.list", json!({})),
        (401, "unauthenticated".to_string())
    );
    assert_eq!(
        sc.fail("session.assume", json!({ "userId": "nobody" })),
        (401, "unauthenticated".to_string())
    );
}

#[test]
fn bootstrap_only_runs_once() {
    let mut sc = Sidecar::spawn();
    let school = open_school(&mut sc, "educonnect-bootstrap");
    let (status, code) = sc.fail(
        "setup.bootstrap",
        json!({ "email": "second@school.test", "fullName": "Second Admin" }),
    );
    assert_eq!((status, code.as_str()), (409, "conflict"));

    let current = sc.ok("session.current", json!({}));
    assert_eq!(
        current.pointer("/actor/id").and_then(|v| v.as_str()),
        Some(school.admin.as_str())
    );
    assert_eq!(
        current.pointer("/actor/role").and_then(|v| v.as_str()),
        Some("admin")
    );
}

#[test]
fn create_methods_report_201_and_role_checks_report_403() {
    let mut sc = Sidecar::spawn();
    let school = open_school(&mut sc, "educonnect-status");
    let resp = sc.call("subjects.create", json!({ "name": "Physics", "code": "phy" }));
    assert_eq!(resp.get("status").and_then(|v| v.as_u64()), Some(201));

    let (status, code) = sc.fail("subjects.create", json!({ "name": "Physics 2", "code": "PHY" }));
    assert_eq!((status, code.as_str()), (409, "conflict"));

    sc.assume(&school.student1);
    let (status, code) = sc.fail("classes.create", json!({ "name": "11B" }));
    assert_eq!((status, code.as_str()), (403, "forbidden"));

    let classes = sc.ok("classes.list", json!({}));
    let list = classes.get("classes").and_then(|v| v.as_array()).expect("classes");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].get("name").and_then(|v| v.as_str()), Some("10A"));
}

#[test]
fn workspace_reopen_keeps_data() {
    let mut sc = Sidecar::spawn();
    let school = open_school(&mut sc, "educonnect-reopen");
    drop(sc);

    let mut sc = Sidecar::spawn();
    sc.ok(
        "workspace.select",
        json!({ "path": school.workspace.to_string_lossy() }),
    );
    sc.assume(&school.admin);
    let users = sc.ok("users.list", json!({ "role": "student" }));
    assert_eq!(users.pointer("/users/0/email").and_then(|v| v.as_str()), Some("s1@school.test"));
}
