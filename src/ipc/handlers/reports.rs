use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::{aspects, db_conn, now_iso, required_str};
use crate::ipc::types::{AppState, Request};
use crate::report::{self, GradeRecord, ReportError};
use chrono::{Datelike, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;

fn report_err(req: &Request, e: ReportError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

fn requested_year(req: &Request) -> i64 {
    req.params
        .get("year")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| Utc::now().year() as i64)
}

fn load_student(conn: &Connection, student_id: &str) -> Result<Option<serde_json::Value>, ReportError> {
    conn.query_row(
        "SELECT id, name, email, role, created_at, updated_at FROM users WHERE id = ?",
        [student_id],
        |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let email: String = row.get(2)?;
            let role: String = row.get(3)?;
            let created_at: String = row.get(4)?;
            let updated_at: String = row.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "email": email,
                "role": role,
                "createdAt": created_at,
                "updatedAt": updated_at
            }))
        },
    )
    .optional()
    .map_err(|e| ReportError::new("db_query_failed", e.to_string()))
}

fn load_active_template(conn: &Connection) -> Result<Option<(String, serde_json::Value)>, ReportError> {
    let active = db::active_template_id(conn)
        .map_err(|e| ReportError::new("db_query_failed", e.to_string()))?;
    let Some(template_id) = active else {
        return Ok(None);
    };
    let row = conn
        .query_row(
            "SELECT id, name, description FROM curriculum_templates WHERE id = ?",
            [template_id.as_str()],
            |row| {
                let id: String = row.get(0)?;
                let name: String = row.get(1)?;
                let description: Option<String> = row.get(2)?;
                Ok(json!({ "id": id, "name": name, "description": description }))
            },
        )
        .optional()
        .map_err(|e| ReportError::new("db_query_failed", e.to_string()))?;
    Ok(row.map(|j| (template_id, j)))
}

/// Academic year = calendar year of the grade's recorded timestamp.
fn load_grades_for_year(
    conn: &Connection,
    student_id: &str,
    year: i64,
) -> Result<Vec<GradeRecord>, ReportError> {
    let mut stmt = conn
        .prepare(
            "SELECT g.assessment_aspect_id, g.grade_value, g.notes,
                    g.teacher_id, t.name, g.created_at, g.updated_at
             FROM grades g
             JOIN users t ON t.id = g.teacher_id
             WHERE g.student_id = ?
               AND CAST(strftime('%Y', g.created_at) AS INTEGER) = ?
             ORDER BY g.created_at",
        )
        .map_err(|e| ReportError::new("db_query_failed", e.to_string()))?;
    stmt.query_map((student_id, year), |row| {
        Ok(GradeRecord {
            aspect_id: row.get(0)?,
            grade_value: row.get(1)?,
            notes: row.get(2)?,
            teacher_id: row.get(3)?,
            teacher_name: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| ReportError::new("db_query_failed", e.to_string()))
}

struct StudentReport {
    student: serde_json::Value,
    template: Option<serde_json::Value>,
    structure: Vec<report::ReportNode>,
    stats: report::SummaryStats,
}

impl StudentReport {
    fn into_payload(self, year: i64) -> serde_json::Value {
        json!({
            "student": self.student,
            "academicYear": year,
            "curriculumTemplate": self.template,
            "reportStructure": self.structure,
            "summaryStatistics": self.stats,
            "generatedAt": now_iso(),
        })
    }
}

/// Assemble the report for one student and year.
///
/// No active template degrades to an empty structure with zeroed statistics;
/// a missing student is `not_found`.
fn build_student_report(
    conn: &Connection,
    student_id: &str,
    year: i64,
) -> Result<StudentReport, ReportError> {
    let student = load_student(conn, student_id)?
        .ok_or_else(|| ReportError::new("not_found", "student not found"))?;

    let template = load_active_template(conn)?;
    let aspect_rows = match &template {
        Some((template_id, _)) => aspects::load_aspects_for_template(conn, template_id)
            .map_err(|e| ReportError::new("db_query_failed", e.to_string()))?,
        None => Vec::new(),
    };

    let forest = report::build_aspect_forest(&aspect_rows)?;
    let grades = load_grades_for_year(conn, student_id, year)?;
    let index = report::index_grades_by_aspect(&grades);
    let structure = report::merge_structure(&forest, &index);
    let stats = report::summary_stats(&grades, &forest);

    Ok(StudentReport {
        student,
        template: template.map(|(_, j)| j),
        structure,
        stats,
    })
}

fn handle_reports_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = requested_year(req);

    match build_student_report(conn, &student_id, year) {
        Ok(r) => ok(&req.id, r.into_payload(year)),
        Err(e) => report_err(req, e),
    }
}

fn handle_reports_bulk(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = requested_year(req);

    let requested_ids: Option<Vec<String>> = req
        .params
        .get("studentIds")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        });

    let student_ids: Vec<String> = match requested_ids {
        Some(ids) if !ids.is_empty() => ids,
        _ => {
            let mut stmt = match conn
                .prepare("SELECT id FROM users WHERE role = 'student' ORDER BY name")
            {
                Ok(s) => s,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            match stmt
                .query_map([], |row| row.get::<_, String>(0))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
    };

    let mut reports = Vec::with_capacity(student_ids.len());
    for sid in &student_ids {
        match build_student_report(conn, sid, year) {
            Ok(r) => reports.push(r.into_payload(year)),
            Err(e) => return report_err(req, e),
        }
    }

    let total = reports.len();
    ok(
        &req.id,
        json!({
            "reports": reports,
            "totalStudents": total,
            "academicYear": year,
            "generatedAt": now_iso(),
        }),
    )
}

// An empty list is treated the same as an absent one: no filtering.
fn id_set(req: &Request, key: &str) -> Option<HashSet<String>> {
    req.params
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .filter(|set: &HashSet<String>| !set.is_empty())
}

fn handle_reports_filtered(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = requested_year(req);
    let aspect_ids = id_set(req, "aspectIds");
    let teacher_ids = id_set(req, "teacherIds");

    let mut built = match build_student_report(conn, &student_id, year) {
        Ok(r) => r,
        Err(e) => return report_err(req, e),
    };

    if aspect_ids.is_some() || teacher_ids.is_some() {
        built.structure =
            report::filter_structure(&built.structure, aspect_ids.as_ref(), teacher_ids.as_ref());
    }

    ok(&req.id, built.into_payload(year))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.student" => Some(handle_reports_student(state, req)),
        "reports.bulk" => Some(handle_reports_bulk(state, req)),
        "reports.filtered" => Some(handle_reports_filtered(state, req)),
        _ => None,
    }
}
