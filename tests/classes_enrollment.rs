mod test_support;

use serde_json::{json, Value};
use test_support::{create_user, open_school, str_field, Sidecar};

fn student_ids(sc: &mut Sidecar, class_id: &str) -> Vec<String> {
    sc.ok("classes.students", json!({ "classId": class_id }))
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students")
        .iter()
        .map(|s| str_field(s, "id"))
        .collect()
}

fn find_by_id<'a>(items: &'a Value, key: &str, id: &str) -> &'a Value {
    items
        .get(key)
        .and_then(|v| v.as_array())
        .expect("list")
        .iter()
        .find(|item| item.get("id").and_then(|v| v.as_str()) == Some(id))
        .unwrap_or_else(|| panic!("{} not listed in {}", id, items))
}

#[test]
fn enrolling_into_another_class_transfers_the_student() {
    let mut sc = Sidecar::spawn();
    let school = open_school(&mut sc, "educonnect-transfer");
    let class_b = str_field(
        &sc.ok("classes.create", json!({ "name": "10B", "gradeLevel": 10 })),
        "classId",
    );

    let moved = sc.ok(
        "classes.enroll",
        json!({ "classId": class_b, "studentIds": [school.student1] }),
    );
    assert_eq!(moved.get("enrolled").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(moved.get("transferred").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(student_ids(&mut sc, &school.class_id), vec![school.student2.clone()]);
    assert_eq!(student_ids(&mut sc, &class_b), vec![school.student1.clone()]);

    // Enrolling again into the same class is not a transfer.
    let again = sc.ok(
        "classes.enroll",
        json!({ "classId": class_b, "studentIds": [school.student1] }),
    );
    assert_eq!(again.get("transferred").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(student_ids(&mut sc, &class_b).len(), 1);

    let (status, code) = sc.fail(
        "classes.enroll",
        json!({ "classId": class_b, "studentIds": [school.teacher1] }),
    );
    assert_eq!((status, code.as_str()), (400, "bad_params"));
    let (status, _) = sc.fail("classes.enroll", json!({ "classId": class_b, "studentIds": [] }));
    assert_eq!(status, 400);

    sc.assume(&school.teacher1);
    let (status, _) = sc.fail(
        "classes.enroll",
        json!({ "classId": school.class_id, "studentIds": [school.student1] }),
    );
    assert_eq!(status, 403);
}

#[test]
fn class_with_students_cannot_be_deleted_until_emptied() {
    let mut sc = Sidecar::spawn();
    let school = open_school(&mut sc, "educonnect-class-delete");

    let resp = sc.call("classes.delete", json!({ "classId": school.class_id }));
    assert_eq!(resp.get("status").and_then(|v| v.as_u64()), Some(409));
    assert_eq!(resp.get("code").and_then(|v| v.as_str()), Some("conflict"));
    assert_eq!(
        resp.get("error").and_then(|v| v.as_str()),
        Some("class still has 2 students")
    );

    for student in [&school.student1, &school.student2] {
        let removed = sc.ok(
            "classes.unenroll",
            json!({ "classId": school.class_id, "studentId": student }),
        );
        assert_eq!(removed.get("removed").and_then(|v| v.as_bool()), Some(true));
    }
    let (status, code) = sc.fail(
        "classes.unenroll",
        json!({ "classId": school.class_id, "studentId": school.student1 }),
    );
    assert_eq!((status, code.as_str()), (404, "not_found"));

    let deleted = sc.ok("classes.delete", json!({ "classId": school.class_id }));
    assert_eq!(deleted.get("deleted").and_then(|v| v.as_bool()), Some(true));
    let (status, _) = sc.fail("classes.delete", json!({ "classId": school.class_id }));
    assert_eq!(status, 404);
    let listed = sc.ok("classes.list", json!({}));
    assert_eq!(
        listed.get("classes").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
}

#[test]
fn class_update_renames_and_reassigns_homeroom() {
    let mut sc = Sidecar::spawn();
    let school = open_school(&mut sc, "educonnect-class-update");
    sc.ok("classes.create", json!({ "name": "11A" }));

    sc.ok(
        "classes.update",
        json!({ "classId": school.class_id, "patch": {
            "name": "10A-Science", "gradeLevel": 11, "homeroomTeacherId": school.teacher2,
        }}),
    );
    let listed = sc.ok("classes.list", json!({}));
    let class = find_by_id(&listed, "classes", &school.class_id);
    assert_eq!(class.get("name").and_then(|v| v.as_str()), Some("10A-Science"));
    assert_eq!(class.get("gradeLevel").and_then(|v| v.as_i64()), Some(11));
    assert_eq!(
        class.get("homeroomTeacherId").and_then(|v| v.as_str()),
        Some(school.teacher2.as_str())
    );
    assert_eq!(class.get("studentCount").and_then(|v| v.as_i64()), Some(2));

    let (status, _) = sc.fail(
        "classes.update",
        json!({ "classId": school.class_id, "patch": { "name": "11A" } }),
    );
    assert_eq!(status, 409);
    let (status, _) = sc.fail(
        "classes.update",
        json!({ "classId": school.class_id, "patch": { "homeroomTeacherId": school.student1 } }),
    );
    assert_eq!(status, 400);
    let (status, _) = sc.fail(
        "classes.update",
        json!({ "classId": "no-such-class", "patch": { "name": "X" } }),
    );
    assert_eq!(status, 404);

    // The previous homeroom teacher no longer sees the class.
    sc.assume(&school.teacher1);
    let mine = sc.ok("classes.list", json!({}));
    assert_eq!(
        mine.get("classes").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
    sc.assume(&school.teacher2);
    let mine = sc.ok("classes.list", json!({}));
    assert_eq!(
        mine.pointer("/classes/0/id").and_then(|v| v.as_str()),
        Some(school.class_id.as_str())
    );
}

#[test]
fn user_update_patches_name_and_email() {
    let mut sc = Sidecar::spawn();
    let school = open_school(&mut sc, "educonnect-user-update");

    let updated = sc.ok(
        "users.update",
        json!({ "userId": school.student1, "patch": {
            "fullName": "Samantha First", "email": " Sam.First@School.TEST ",
        }}),
    );
    assert_eq!(updated.get("updatedFields").and_then(|v| v.as_u64()), Some(2));
    let found = sc.ok("users.list", json!({ "search": "samantha" }));
    assert_eq!(
        found.pointer("/users/0/email").and_then(|v| v.as_str()),
        Some("sam.first@school.test")
    );

    let (status, _) = sc.fail(
        "users.update",
        json!({ "userId": school.student2, "patch": { "email": "sam.first@school.test" } }),
    );
    assert_eq!(status, 409);
    let (status, _) = sc.fail(
        "users.update",
        json!({ "userId": school.student2, "patch": { "email": "not-an-email" } }),
    );
    assert_eq!(status, 400);
    let (status, _) = sc.fail("users.update", json!({ "userId": school.student2, "patch": {} }));
    assert_eq!(status, 400);
    let (status, _) = sc.fail(
        "users.update",
        json!({ "userId": "nobody", "patch": { "fullName": "Ghost" } }),
    );
    assert_eq!(status, 404);

    sc.assume(&school.teacher1);
    let (status, _) = sc.fail(
        "users.update",
        json!({ "userId": school.student2, "patch": { "fullName": "Renamed" } }),
    );
    assert_eq!(status, 403);
}

#[test]
fn reference_tables_create_and_list() {
    let mut sc = Sidecar::spawn();
    let school = open_school(&mut sc, "educonnect-reference");

    let physics = str_field(
        &sc.ok("subjects.create", json!({ "name": "Physics", "code": "phy" })),
        "subjectId",
    );
    let (status, code) = sc.fail("subjects.create", json!({ "name": "Maths 2", "code": "MATH" }));
    assert_eq!((status, code.as_str()), (409, "conflict"));
    let (status, _) = sc.fail("subjects.create", json!({ "name": "No code" }));
    assert_eq!(status, 400);
    let subjects = sc.ok("subjects.list", json!({}));
    assert_eq!(subjects.get("subjects").and_then(|v| v.as_array()).map(|a| a.len()), Some(2));
    assert_eq!(
        find_by_id(&subjects, "subjects", &physics).get("code").and_then(|v| v.as_str()),
        Some("PHY")
    );

    let lab = str_field(
        &sc.ok("classrooms.create", json!({ "name": "Lab 1", "capacity": 24 })),
        "classroomId",
    );
    let (status, _) = sc.fail("classrooms.create", json!({ "name": "Closet", "capacity": 0 }));
    assert_eq!(status, 400);
    let (status, _) = sc.fail("classrooms.create", json!({ "name": "R101" }));
    assert_eq!(status, 409);
    let rooms = sc.ok("classrooms.list", json!({}));
    assert_eq!(rooms.get("classrooms").and_then(|v| v.as_array()).map(|a| a.len()), Some(3));
    assert_eq!(
        find_by_id(&rooms, "classrooms", &lab).get("capacity").and_then(|v| v.as_i64()),
        Some(24)
    );

    let spring = str_field(
        &sc.ok(
            "semesters.create",
            json!({ "name": "Spring", "startDate": "2027-02-01", "endDate": "2027-06-30" }),
        ),
        "semesterId",
    );
    let (status, _) = sc.fail(
        "semesters.create",
        json!({ "name": "Backwards", "startDate": "2027-06-30", "endDate": "2027-02-01" }),
    );
    assert_eq!(status, 400);
    let (status, _) = sc.fail(
        "semesters.create",
        json!({ "name": "Garbled", "startDate": "02/01/2027", "endDate": "2027-06-30" }),
    );
    assert_eq!(status, 400);
    let semesters = sc.ok("semesters.list", json!({}));
    let order: Vec<String> = semesters
        .get("semesters")
        .and_then(|v| v.as_array())
        .expect("semesters")
        .iter()
        .map(|s| str_field(s, "id"))
        .collect();
    assert_eq!(order, vec![school.semester_id.clone(), spring]);

    // Everyone signed in reads; only admins write.
    let student = create_user(&mut sc, "s3@school.test", "Sid Third", "student");
    sc.assume(&student);
    let listed = sc.ok("subjects.list", json!({}));
    assert_eq!(listed.get("subjects").and_then(|v| v.as_array()).map(|a| a.len()), Some(2));
    let (status, _) = sc.fail("classrooms.create", json!({ "name": "Attic" }));
    assert_eq!(status, 403);
}
