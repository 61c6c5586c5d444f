//! Shared fixtures for unit tests.

use crate::db;
use rusqlite::Connection;

pub struct Seed {
    pub admin: String,
    pub teacher1: String,
    pub teacher2: String,
    pub student1: String,
    pub student2: String,
    pub class_id: String,
    pub subject_id: String,
    pub semester_id: String,
    pub semester2_id: String,
    pub room1: String,
    pub room2: String,
}

fn user(conn: &Connection, id: &str, role: &str) -> String {
    conn.execute(
        "INSERT INTO users(id, email, full_name, role, created_at)
         VALUES(?, ?, ?, ?, '2026-01-01T00:00:00Z')",
        (id, format!("{}@school.test", id), format!("User {}", id), role),
    )
    .expect("insert user");
    id.to_string()
}

pub fn seed_reference() -> (Connection, Seed) {
    let conn = db::open_in_memory().expect("open in-memory db");
    let seed = Seed {
        admin: user(&conn, "admin", "admin"),
        teacher1: user(&conn, "t1", "teacher"),
        teacher2: user(&conn, "t2", "teacher"),
        student1: user(&conn, "s1", "student"),
        student2: user(&conn, "s2", "student"),
        class_id: "c1".to_string(),
        subject_id: "math".to_string(),
        semester_id: "sem1".to_string(),
        semester2_id: "sem2".to_string(),
        room1: "r1".to_string(),
        room2: "r2".to_string(),
    };
    conn.execute(
        "INSERT INTO classes(id, name, homeroom_teacher_id) VALUES(?, '10A', ?)",
        (&seed.class_id, &seed.teacher1),
    )
    .expect("insert class");
    for sid in [&seed.student1, &seed.student2] {
        conn.execute(
            "INSERT INTO class_students(class_id, student_id) VALUES(?, ?)",
            (&seed.class_id, sid),
        )
        .expect("enroll");
    }
    conn.execute(
        "INSERT INTO subjects(id, name, code) VALUES(?, 'Mathematics', 'MATH')",
        [&seed.subject_id],
    )
    .expect("insert subject");
    for (id, name) in [(&seed.semester_id, "Fall"), (&seed.semester2_id, "Spring")] {
        conn.execute(
            "INSERT INTO semesters(id, name, start_date, end_date)
             VALUES(?, ?, '2026-09-01', '2027-01-15')",
            (id, name),
        )
        .expect("insert semester");
    }
    for (id, name) in [(&seed.room1, "R1"), (&seed.room2, "R2")] {
        conn.execute(
            "INSERT INTO classrooms(id, name, capacity) VALUES(?, ?, 30)",
            (id, name),
        )
        .expect("insert classroom");
    }
    (conn, seed)
}

pub fn insert_grade(conn: &Connection, seed: &Seed, id: &str, student_id: &str, component: &str, value: f64) {
    conn.execute(
        "INSERT INTO grades(id, student_id, class_id, subject_id, semester_id, component_type,
           value, recorded_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, '2026-10-01T00:00:00Z')",
        (
            id,
            student_id,
            &seed.class_id,
            &seed.subject_id,
            &seed.semester_id,
            component,
            value,
            &seed.teacher1,
        ),
    )
    .expect("insert grade");
}
