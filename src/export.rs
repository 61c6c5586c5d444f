//! Grade workbook export.
//!
//! Writes a minimal Office Open XML spreadsheet (`.xlsx`) with the zip
//! writer: one summary sheet for the class plus one sheet per student, up to
//! a configured cap. Strings are stored inline so no shared-string table is
//! needed.

use anyhow::{anyhow, Context};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const SHEET_NAME_MAX: usize = 31;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    Empty,
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::Text(s.to_string())
    }
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::Text(s)
    }
}

impl From<Option<f64>> for Cell {
    fn from(v: Option<f64>) -> Self {
        v.map(Cell::Number).unwrap_or(Cell::Empty)
    }
}

#[derive(Debug, Clone)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<Cell>>,
}

#[derive(Debug, Clone, Default)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    /// Adds a sheet, making its name legal and unique within the workbook.
    pub fn push_sheet(&mut self, name: &str, rows: Vec<Vec<Cell>>) {
        let taken: HashSet<&str> = self.sheets.iter().map(|s| s.name.as_str()).collect();
        let base = sanitize_sheet_name(name);
        let mut candidate = base.clone();
        let mut n = 2;
        while taken.contains(candidate.as_str()) {
            let suffix = format!(" ({})", n);
            let keep = SHEET_NAME_MAX.saturating_sub(suffix.chars().count());
            candidate = format!("{}{}", base.chars().take(keep).collect::<String>(), suffix);
            n += 1;
        }
        self.sheets.push(Sheet {
            name: candidate,
            rows,
        });
    }
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub sheet_count: usize,
    pub sha256: String,
}

pub fn sanitize_sheet_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '[' | ']' | ':' | '*' | '?' | '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('\'');
    let out: String = trimmed.chars().take(SHEET_NAME_MAX).collect();
    if out.is_empty() {
        "Sheet".to_string()
    } else {
        out
    }
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if c.is_control() && c != '\t' && c != '\n' && c != '\r' => {}
            c => out.push(c),
        }
    }
    out
}

/// Spreadsheet column letters for a 0-based index: 0 -> A, 25 -> Z, 26 -> AA.
fn column_letters(mut idx: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push((b'A' + (idx % 26) as u8) as char);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    letters.iter().rev().collect()
}

fn sheet_xml(sheet: &Sheet) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
         <worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\"><sheetData>",
    );
    for (r, row) in sheet.rows.iter().enumerate() {
        xml.push_str(&format!("<row r=\"{}\">", r + 1));
        for (c, cell) in row.iter().enumerate() {
            let cell_ref = format!("{}{}", column_letters(c), r + 1);
            match cell {
                Cell::Text(s) => xml.push_str(&format!(
                    "<c r=\"{}\" t=\"inlineStr\"><is><t xml:space=\"preserve\">{}</t></is></c>",
                    cell_ref,
                    xml_escape(s)
                )),
                Cell::Number(v) if v.is_finite() => {
                    xml.push_str(&format!("<c r=\"{}\"><v>{}</v></c>", cell_ref, v))
                }
                Cell::Number(_) | Cell::Empty => {}
            }
        }
        xml.push_str("</row>");
    }
    xml.push_str("</sheetData></worksheet>");
    xml
}

fn content_types_xml(sheet_count: usize) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
         <Types xmlns=\"http://schemas.openxmlformats.org/package/2006/content-types\">\
         <Default Extension=\"rels\" ContentType=\"application/vnd.openxmlformats-package.relationships+xml\"/>\
         <Default Extension=\"xml\" ContentType=\"application/xml\"/>\
         <Override PartName=\"/xl/workbook.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml\"/>",
    );
    for i in 1..=sheet_count {
        xml.push_str(&format!(
            "<Override PartName=\"/xl/worksheets/sheet{}.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml\"/>",
            i
        ));
    }
    xml.push_str("</Types>");
    xml
}

const ROOT_RELS_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
<Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">\
<Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument\" Target=\"xl/workbook.xml\"/>\
</Relationships>";

fn workbook_xml(sheets: &[Sheet]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
         <workbook xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\" \
         xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\"><sheets>",
    );
    for (i, s) in sheets.iter().enumerate() {
        xml.push_str(&format!(
            "<sheet name=\"{}\" sheetId=\"{}\" r:id=\"rId{}\"/>",
            xml_escape(&s.name),
            i + 1,
            i + 1
        ));
    }
    xml.push_str("</sheets></workbook>");
    xml
}

fn workbook_rels_xml(sheet_count: usize) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
         <Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">",
    );
    for i in 1..=sheet_count {
        xml.push_str(&format!(
            "<Relationship Id=\"rId{}\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet\" Target=\"worksheets/sheet{}.xml\"/>",
            i, i
        ));
    }
    xml.push_str("</Relationships>");
    xml
}

pub fn write_xlsx(workbook: &Workbook, out_path: &Path) -> anyhow::Result<ExportSummary> {
    if workbook.sheets.is_empty() {
        return Err(anyhow!("workbook has no sheets"));
    }
    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory {}", parent.to_string_lossy())
            })?;
        }
    }

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let sheet_count = workbook.sheets.len();
    let mut entries: Vec<(String, String)> = vec![
        ("[Content_Types].xml".to_string(), content_types_xml(sheet_count)),
        ("_rels/.rels".to_string(), ROOT_RELS_XML.to_string()),
        ("xl/workbook.xml".to_string(), workbook_xml(&workbook.sheets)),
        (
            "xl/_rels/workbook.xml.rels".to_string(),
            workbook_rels_xml(sheet_count),
        ),
    ];
    for (i, sheet) in workbook.sheets.iter().enumerate() {
        entries.push((format!("xl/worksheets/sheet{}.xml", i + 1), sheet_xml(sheet)));
    }

    for (name, body) in &entries {
        zip.start_file(name.as_str(), opts)
            .with_context(|| format!("failed to start entry {}", name))?;
        zip.write_all(body.as_bytes())
            .with_context(|| format!("failed to write entry {}", name))?;
    }
    zip.finish().context("failed to finalize workbook")?;

    let bytes = std::fs::read(out_path)
        .with_context(|| format!("failed to re-read {}", out_path.to_string_lossy()))?;
    let sha256 = format!("{:x}", Sha256::digest(&bytes));

    Ok(ExportSummary {
        sheet_count,
        sha256,
    })
}

#[derive(Debug, Clone)]
struct StudentRow {
    id: String,
    full_name: String,
    email: String,
}

#[derive(Debug, Clone)]
struct GradeRow {
    student_id: String,
    subject: String,
    component: String,
    value: f64,
    updated_at: String,
}

#[derive(Default)]
struct ComponentTotals {
    regular: (f64, usize),
    midterm: (f64, usize),
    final_exam: (f64, usize),
}

fn mean((sum, n): (f64, usize)) -> Option<f64> {
    if n == 0 {
        None
    } else {
        Some(((sum / n as f64) * 100.0).round() / 100.0)
    }
}

pub struct GradeWorkbook {
    pub workbook: Workbook,
    pub student_count: usize,
}

/// Builds the class grade workbook for one semester: a summary sheet with
/// per-component averages, then a detail sheet per student (alphabetical)
/// until `max_student_sheets` is reached.
pub fn build_grade_workbook(
    conn: &Connection,
    class_id: &str,
    semester_id: &str,
    max_student_sheets: usize,
) -> anyhow::Result<GradeWorkbook> {
    let class_name: String = conn
        .query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .context("class not found")?;
    let semester_name: String = conn
        .query_row("SELECT name FROM semesters WHERE id = ?", [semester_id], |r| {
            r.get(0)
        })
        .context("semester not found")?;

    let mut stmt = conn.prepare(
        "SELECT u.id, u.full_name, u.email
         FROM class_students cs
         JOIN users u ON u.id = cs.student_id
         WHERE cs.class_id = ?
         ORDER BY u.full_name, u.id",
    )?;
    let students = stmt
        .query_map([class_id], |row| {
            Ok(StudentRow {
                id: row.get(0)?,
                full_name: row.get(1)?,
                email: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT g.student_id, s.name, g.component_type, g.value, g.updated_at
         FROM grades g
         JOIN subjects s ON s.id = g.subject_id
         WHERE g.class_id = ? AND g.semester_id = ?
         ORDER BY s.name, g.component_type, g.updated_at",
    )?;
    let grades = stmt
        .query_map((class_id, semester_id), |row| {
            Ok(GradeRow {
                student_id: row.get(0)?,
                subject: row.get(1)?,
                component: row.get(2)?,
                value: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut totals: BTreeMap<&str, ComponentTotals> = BTreeMap::new();
    let mut per_student: BTreeMap<&str, Vec<&GradeRow>> = BTreeMap::new();
    for g in &grades {
        let t = totals.entry(g.student_id.as_str()).or_default();
        let slot = match g.component.as_str() {
            "midterm" => &mut t.midterm,
            "final" => &mut t.final_exam,
            _ => &mut t.regular,
        };
        slot.0 += g.value;
        slot.1 += 1;
        per_student.entry(g.student_id.as_str()).or_default().push(g);
    }

    let mut summary: Vec<Vec<Cell>> = vec![
        vec![
            Cell::from(format!("{} - {}", class_name, semester_name)),
        ],
        vec![
            "Student".into(),
            "Email".into(),
            "Regular avg".into(),
            "Midterm avg".into(),
            "Final avg".into(),
            "Grades".into(),
        ],
    ];
    for s in &students {
        let t = totals.get(s.id.as_str());
        let count = per_student.get(s.id.as_str()).map(|v| v.len()).unwrap_or(0);
        summary.push(vec![
            s.full_name.clone().into(),
            s.email.clone().into(),
            t.and_then(|t| mean(t.regular)).into(),
            t.and_then(|t| mean(t.midterm)).into(),
            t.and_then(|t| mean(t.final_exam)).into(),
            Cell::Number(count as f64),
        ]);
    }

    let mut workbook = Workbook::default();
    workbook.push_sheet("Summary", summary);

    for s in students.iter().take(max_student_sheets) {
        let mut rows: Vec<Vec<Cell>> = vec![
            vec![s.full_name.clone().into(), s.email.clone().into()],
            vec![
                "Subject".into(),
                "Component".into(),
                "Value".into(),
                "Updated".into(),
            ],
        ];
        for g in per_student.get(s.id.as_str()).into_iter().flatten() {
            rows.push(vec![
                g.subject.clone().into(),
                g.component.clone().into(),
                Cell::Number(g.value),
                g.updated_at.clone().into(),
            ]);
        }
        workbook.push_sheet(&s.full_name, rows);
    }

    Ok(GradeWorkbook {
        workbook,
        student_count: students.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{insert_grade, seed_reference};
    use std::io::Read;
    use zip::ZipArchive;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("educonnect-export-{}-{}.xlsx", name, nanos))
    }

    #[test]
    fn column_letters_roll_over() {
        assert_eq!(column_letters(0), "A");
        assert_eq!(column_letters(25), "Z");
        assert_eq!(column_letters(26), "AA");
        assert_eq!(column_letters(27), "AB");
        assert_eq!(column_letters(701), "ZZ");
        assert_eq!(column_letters(702), "AAA");
    }

    #[test]
    fn sheet_names_are_legal_and_unique() {
        let mut wb = Workbook::default();
        wb.push_sheet("Nguyen Van A", vec![]);
        wb.push_sheet("Nguyen Van A", vec![]);
        wb.push_sheet("a/b:c?", vec![]);
        wb.push_sheet(&"x".repeat(40), vec![]);
        wb.push_sheet(&"x".repeat(40), vec![]);
        let names: Vec<&str> = wb.sheets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names[0], "Nguyen Van A");
        assert_eq!(names[1], "Nguyen Van A (2)");
        assert_eq!(names[2], "a_b_c_");
        assert_eq!(names[3].chars().count(), 31);
        assert!(names[4].ends_with(" (2)"));
        assert_eq!(names[4].chars().count(), 31);
    }

    #[test]
    fn text_cells_are_escaped() {
        let sheet = Sheet {
            name: "S".to_string(),
            rows: vec![vec![Cell::from("a<b & \"c\""), Cell::Number(7.5), Cell::Empty]],
        };
        let xml = sheet_xml(&sheet);
        assert!(xml.contains("a&lt;b &amp; &quot;c&quot;"));
        assert!(xml.contains("<c r=\"B1\"><v>7.5</v></c>"));
        assert!(!xml.contains("C1"));
    }

    #[test]
    fn workbook_caps_student_sheets_and_writes_zip_parts() {
        let (conn, seed) = seed_reference();
        insert_grade(&conn, &seed, "g1", &seed.student1, "regular", 8.0);
        insert_grade(&conn, &seed, "g2", &seed.student1, "regular", 6.0);
        insert_grade(&conn, &seed, "g3", &seed.student2, "final", 9.0);

        let built = build_grade_workbook(&conn, &seed.class_id, &seed.semester_id, 1)
            .expect("build workbook");
        assert_eq!(built.student_count, 2);
        assert_eq!(built.workbook.sheets.len(), 2);
        let summary = &built.workbook.sheets[0];
        // Title, header, then one row per student.
        assert_eq!(summary.rows.len(), 4);
        assert_eq!(summary.rows[2][2], Cell::Number(7.0));

        let out = temp_path("cap");
        let written = write_xlsx(&built.workbook, &out).expect("write xlsx");
        assert_eq!(written.sheet_count, 2);
        assert_eq!(written.sha256.len(), 64);

        let mut archive = ZipArchive::new(File::open(&out).expect("open")).expect("zip");
        for name in [
            "[Content_Types].xml",
            "_rels/.rels",
            "xl/workbook.xml",
            "xl/_rels/workbook.xml.rels",
            "xl/worksheets/sheet1.xml",
            "xl/worksheets/sheet2.xml",
        ] {
            assert!(archive.by_name(name).is_ok(), "missing {}", name);
        }
        assert!(archive.by_name("xl/worksheets/sheet3.xml").is_err());

        let mut wb_xml = String::new();
        archive
            .by_name("xl/workbook.xml")
            .expect("workbook entry")
            .read_to_string(&mut wb_xml)
            .expect("read");
        assert!(wb_xml.contains("name=\"Summary\""));
        let _ = std::fs::remove_file(&out);
    }
}
