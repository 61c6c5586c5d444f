use rusqlite::Connection;
use serde::Serialize;

pub const MIN_WEEK: i64 = 1;
pub const MAX_WEEK: i64 = 52;

/// The fields of a proposed slot that take part in conflict detection.
#[derive(Debug, Clone, Copy)]
pub struct SlotCandidate<'a> {
    pub classroom_id: &'a str,
    pub teacher_id: &'a str,
    pub day_of_week: i64,
    pub start_time: &'a str,
    pub week_number: i64,
    pub semester_id: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    Classroom,
    Teacher,
}

impl ConflictType {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Classroom => "classroom is already booked at this time",
            Self::Teacher => "teacher is already scheduled at this time",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCheck {
    pub has_conflict: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_type: Option<ConflictType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicting_slot_id: Option<String>,
}

impl ConflictCheck {
    fn clear() -> Self {
        Self {
            has_conflict: false,
            conflict_type: None,
            conflicting_slot_id: None,
        }
    }

    fn found(kind: ConflictType, slot_id: &str) -> Self {
        Self {
            has_conflict: true,
            conflict_type: Some(kind),
            conflicting_slot_id: Some(slot_id.to_string()),
        }
    }
}

struct Occupant {
    id: String,
    classroom_id: String,
    teacher_id: String,
}

/// Scans the slots that share the candidate's day, start time, week and semester.
/// A shared classroom wins over a shared teacher; only the first hit is
/// reported. `exclude_slot_id` keeps an update from colliding with itself.
pub fn check_conflict(
    conn: &Connection,
    candidate: &SlotCandidate<'_>,
    exclude_slot_id: Option<&str>,
) -> rusqlite::Result<ConflictCheck> {
    let mut stmt = conn.prepare(
        "SELECT id, classroom_id, teacher_id
         FROM timetable_slots
         WHERE day_of_week = ?1
           AND start_time = ?2
           AND week_number = ?3
           AND semester_id = ?4
           AND (?5 IS NULL OR id <> ?5)
         ORDER BY id",
    )?;
    let occupants = stmt
        .query_map(
            (
                candidate.day_of_week,
                candidate.start_time,
                candidate.week_number,
                candidate.semester_id,
                exclude_slot_id,
            ),
            |row| {
                Ok(Occupant {
                    id: row.get(0)?,
                    classroom_id: row.get(1)?,
                    teacher_id: row.get(2)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(c) = occupants
        .iter()
        .find(|c| c.classroom_id == candidate.classroom_id)
    {
        return Ok(ConflictCheck::found(ConflictType::Classroom, &c.id));
    }
    if let Some(c) = occupants.iter().find(|c| c.teacher_id == candidate.teacher_id) {
        return Ok(ConflictCheck::found(ConflictType::Teacher, &c.id));
    }
    Ok(ConflictCheck::clear())
}

/// Normalizes `H:MM`, `HH:MM` or `HH:MM:SS` into `HH:MM` so that equal
/// times compare equal as strings.
pub fn normalize_time(raw: &str) -> Option<String> {
    let mut parts = raw.trim().split(':');
    let h: u32 = parts.next()?.trim().parse().ok()?;
    let m_str = parts.next()?.trim();
    if m_str.len() != 2 {
        return None;
    }
    let m: u32 = m_str.parse().ok()?;
    if let Some(s) = parts.next() {
        let s: u32 = s.trim().parse().ok()?;
        if s > 59 {
            return None;
        }
    }
    if parts.next().is_some() || h > 23 || m > 59 {
        return None;
    }
    Some(format!("{:02}:{:02}", h, m))
}

pub fn valid_day_of_week(day: i64) -> bool {
    (0..=6).contains(&day)
}

pub fn valid_week_number(week: i64) -> bool {
    (MIN_WEEK..=MAX_WEEK).contains(&week)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{seed_reference, Seed};

    fn insert_slot(
        conn: &Connection,
        id: &str,
        seed: &Seed,
        classroom_id: &str,
        teacher_id: &str,
        day: i64,
        start: &str,
        week: i64,
    ) {
        conn.execute(
            "INSERT INTO timetable_slots(id, classroom_id, teacher_id, class_id, subject_id,
               semester_id, day_of_week, start_time, end_time, week_number)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, '09:00', ?)",
            (
                id,
                classroom_id,
                teacher_id,
                &seed.class_id,
                &seed.subject_id,
                &seed.semester_id,
                day,
                start,
                week,
            ),
        )
        .expect("insert slot");
    }

    fn candidate<'a>(seed: &'a Seed, classroom: &'a str, teacher: &'a str) -> SlotCandidate<'a> {
        SlotCandidate {
            classroom_id: classroom,
            teacher_id: teacher,
            day_of_week: 1,
            start_time: "08:00",
            week_number: 3,
            semester_id: &seed.semester_id,
        }
    }

    #[test]
    fn same_room_at_same_time_is_a_classroom_conflict() {
        let (conn, seed) = seed_reference();
        insert_slot(&conn, "slot-a", &seed, &seed.room1, &seed.teacher1, 1, "08:00", 3);

        let check = check_conflict(&conn, &candidate(&seed, &seed.room1, &seed.teacher2), None)
            .expect("check");
        assert!(check.has_conflict);
        assert_eq!(check.conflict_type, Some(ConflictType::Classroom));
        assert_eq!(check.conflicting_slot_id.as_deref(), Some("slot-a"));
    }

    #[test]
    fn same_teacher_in_other_room_is_a_teacher_conflict() {
        let (conn, seed) = seed_reference();
        insert_slot(&conn, "slot-a", &seed, &seed.room1, &seed.teacher1, 1, "08:00", 3);

        let check = check_conflict(&conn, &candidate(&seed, &seed.room2, &seed.teacher1), None)
            .expect("check");
        assert_eq!(check.conflict_type, Some(ConflictType::Teacher));
    }

    #[test]
    fn classroom_wins_when_both_match_on_different_rows() {
        let (conn, seed) = seed_reference();
        // Row sorted first matches only the teacher; the classroom match must still win.
        insert_slot(&conn, "a-teacher", &seed, &seed.room2, &seed.teacher1, 1, "08:00", 3);
        insert_slot(&conn, "b-room", &seed, &seed.room1, &seed.teacher2, 1, "08:00", 3);

        let check = check_conflict(&conn, &candidate(&seed, &seed.room1, &seed.teacher1), None)
            .expect("check");
        assert_eq!(check.conflict_type, Some(ConflictType::Classroom));
        assert_eq!(check.conflicting_slot_id.as_deref(), Some("b-room"));
    }

    #[test]
    fn other_week_day_time_or_semester_never_conflicts() {
        let (conn, seed) = seed_reference();
        insert_slot(&conn, "w4", &seed, &seed.room1, &seed.teacher1, 1, "08:00", 4);
        insert_slot(&conn, "d2", &seed, &seed.room1, &seed.teacher1, 2, "08:00", 3);
        insert_slot(&conn, "t9", &seed, &seed.room1, &seed.teacher1, 1, "09:00", 3);

        let check = check_conflict(&conn, &candidate(&seed, &seed.room1, &seed.teacher1), None)
            .expect("check");
        assert!(!check.has_conflict);

        let other_semester = SlotCandidate {
            semester_id: &seed.semester2_id,
            ..candidate(&seed, &seed.room1, &seed.teacher1)
        };
        insert_slot(&conn, "same", &seed, &seed.room1, &seed.teacher1, 1, "08:00", 3);
        let check = check_conflict(&conn, &other_semester, None).expect("check");
        assert!(!check.has_conflict);
    }

    #[test]
    fn excluding_the_only_conflicting_slot_clears_the_conflict() {
        let (conn, seed) = seed_reference();
        insert_slot(&conn, "slot-a", &seed, &seed.room1, &seed.teacher1, 1, "08:00", 3);

        let p = candidate(&seed, &seed.room1, &seed.teacher1);
        assert!(check_conflict(&conn, &p, None).expect("check").has_conflict);
        let check = check_conflict(&conn, &p, Some("slot-a")).expect("check");
        assert_eq!(
            check,
            ConflictCheck {
                has_conflict: false,
                conflict_type: None,
                conflicting_slot_id: None
            }
        );
    }

    #[test]
    fn repeated_checks_agree() {
        let (conn, seed) = seed_reference();
        insert_slot(&conn, "slot-a", &seed, &seed.room1, &seed.teacher1, 1, "08:00", 3);
        let p = candidate(&seed, &seed.room2, &seed.teacher1);
        let first = check_conflict(&conn, &p, None).expect("first");
        let second = check_conflict(&conn, &p, None).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn time_normalization() {
        assert_eq!(normalize_time("8:00").as_deref(), Some("08:00"));
        assert_eq!(normalize_time("08:05:00").as_deref(), Some("08:05"));
        assert_eq!(normalize_time(" 13:30 ").as_deref(), Some("13:30"));
        assert_eq!(normalize_time("24:00"), None);
        assert_eq!(normalize_time("8:5"), None);
        assert_eq!(normalize_time("morning"), None);
    }
}
