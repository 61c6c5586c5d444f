#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_educonnectd");
    let mut child = Command::new(exe)
        .env_remove("EDUCONNECT_AI_API_KEY")
        .env_remove("EDUCONNECT_WORKSPACE")
        .env_remove("EDUCONNECT_CONFIG")
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn educonnectd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("success").and_then(|v| v.as_bool()) == Some(false) {
        assert_ne!(
            value.get("code").and_then(|v| v.as_str()),
            Some("not_implemented"),
            "method {} is not routed",
            method
        );
    }
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("success").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("data").cloned().unwrap_or(Value::Null)
}

/// One sidecar process with an auto-incrementing request id.
pub struct Sidecar {
    _child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    pub fn spawn() -> Self {
        let (child, stdin, reader) = spawn_sidecar();
        Self {
            _child: child,
            stdin,
            reader,
            next_id: 1,
        }
    }

    fn id(&mut self) -> String {
        let id = self.next_id.to_string();
        self.next_id += 1;
        id
    }

    /// Full response envelope.
    pub fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.id();
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    /// `data` of a successful response.
    pub fn ok(&mut self, method: &str, params: Value) -> Value {
        let id = self.id();
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    /// `(status, code)` of a failed response.
    pub fn fail(&mut self, method: &str, params: Value) -> (u64, String) {
        let resp = self.call(method, params);
        assert_eq!(
            resp.get("success").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            resp
        );
        (
            resp.get("status").and_then(|v| v.as_u64()).unwrap_or(0),
            resp.get("code")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        )
    }

    pub fn assume(&mut self, user_id: &str) {
        self.ok("session.assume", json!({ "userId": user_id }));
    }
}

pub fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

/// A small school: one class with two enrolled students, a parent for the
/// first student, two teachers (t1 is homeroom), one subject, one semester
/// and two rooms. The session is left signed in as the admin.
pub struct School {
    pub workspace: PathBuf,
    pub admin: String,
    pub teacher1: String,
    pub teacher2: String,
    pub student1: String,
    pub student2: String,
    pub parent1: String,
    pub class_id: String,
    pub subject_id: String,
    pub semester_id: String,
    pub room1: String,
    pub room2: String,
}

pub fn create_user(sc: &mut Sidecar, email: &str, name: &str, role: &str) -> String {
    str_field(
        &sc.ok(
            "users.create",
            json!({ "email": email, "fullName": name, "role": role }),
        ),
        "userId",
    )
}

pub fn open_school(sc: &mut Sidecar, prefix: &str) -> School {
    let workspace = temp_dir(prefix);
    sc.ok(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = str_field(
        &sc.ok(
            "setup.bootstrap",
            json!({ "email": "admin@school.test", "fullName": "Ada Admin" }),
        ),
        "userId",
    );
    sc.assume(&admin);

    let teacher1 = create_user(sc, "t1@school.test", "Tess Homeroom", "teacher");
    let teacher2 = create_user(sc, "t2@school.test", "Theo Science", "teacher");
    let student1 = create_user(sc, "s1@school.test", "Sam First", "student");
    let student2 = create_user(sc, "s2@school.test", "Sue Second", "student");
    let parent1 = create_user(sc, "p1@school.test", "Pat Parent", "parent");

    let class_id = str_field(
        &sc.ok(
            "classes.create",
            json!({ "name": "10A", "gradeLevel": 10, "homeroomTeacherId": teacher1 }),
        ),
        "classId",
    );
    sc.ok(
        "classes.enroll",
        json!({ "classId": class_id, "studentIds": [student1, student2] }),
    );
    sc.ok(
        "parents.link",
        json!({ "parentId": parent1, "studentId": student1 }),
    );
    let subject_id = str_field(
        &sc.ok("subjects.create", json!({ "name": "Mathematics", "code": "math" })),
        "subjectId",
    );
    let semester_id = str_field(
        &sc.ok(
            "semesters.create",
            json!({ "name": "Fall", "startDate": "2026-09-01", "endDate": "2027-01-31" }),
        ),
        "semesterId",
    );
    let room1 = str_field(
        &sc.ok("classrooms.create", json!({ "name": "R101", "capacity": 30 })),
        "classroomId",
    );
    let room2 = str_field(
        &sc.ok("classrooms.create", json!({ "name": "R102", "capacity": 30 })),
        "classroomId",
    );

    School {
        workspace,
        admin,
        teacher1,
        teacher2,
        student1,
        student2,
        parent1,
        class_id,
        subject_id,
        semester_id,
        room1,
        room2,
    }
}
