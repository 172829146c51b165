use crate::ipc::error::{err, ok};
use crate::ipc::handlers::{db_conn, now_iso, required_str};
use crate::ipc::types::{AppState, Request};
use crate::report::{GradeValue, InputType};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const GRADES_SUBMIT_MAX_ITEMS: usize = 2000;

struct ItemError {
    code: &'static str,
    message: String,
}

fn aspect_input_type(
    conn: &Connection,
    aspect_id: &str,
) -> Result<Option<InputType>, rusqlite::Error> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT input_type FROM assessment_aspects WHERE id = ?",
            [aspect_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(raw.map(|s| InputType::parse(&s).unwrap_or(InputType::FreeText)))
}

fn user_role(conn: &Connection, user_id: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row("SELECT role FROM users WHERE id = ?", [user_id], |r| {
        r.get(0)
    })
    .optional()
}

/// Atomic per (student, aspect) pair: the UNIQUE constraint plus upsert keeps
/// one row per pair even under concurrent submissions.
fn upsert_grade(
    conn: &Connection,
    aspect_id: &str,
    student_id: &str,
    teacher_id: &str,
    grade_value: &str,
    notes: Option<&str>,
) -> Result<(), ItemError> {
    let now = now_iso();
    conn.execute(
        "INSERT INTO grades(
            id, assessment_aspect_id, student_id, teacher_id, grade_value, notes,
            created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(assessment_aspect_id, student_id) DO UPDATE SET
            teacher_id = excluded.teacher_id,
            grade_value = excluded.grade_value,
            notes = excluded.notes,
            updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            aspect_id,
            student_id,
            teacher_id,
            grade_value,
            notes,
            &now,
            &now,
        ),
    )
    .map_err(|e| ItemError {
        code: "db_insert_failed",
        message: e.to_string(),
    })?;
    Ok(())
}

fn submit_one(
    conn: &Connection,
    teacher_id: &str,
    item: &serde_json::Value,
    index: usize,
) -> Result<(), ItemError> {
    let obj = item.as_object().ok_or_else(|| ItemError {
        code: "bad_params",
        message: format!("grade at index {} must be an object", index),
    })?;

    let aspect_id = obj
        .get("aspectId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ItemError {
            code: "bad_params",
            message: format!("grade at index {} missing aspectId", index),
        })?;
    let student_id = obj
        .get("studentId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ItemError {
            code: "bad_params",
            message: format!("grade at index {} missing studentId", index),
        })?;
    let value_raw = obj
        .get("value")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ItemError {
            code: "bad_params",
            message: format!("grade at index {} missing value", index),
        })?;
    let notes = obj.get("notes").and_then(|v| v.as_str());

    let input_type = aspect_input_type(conn, aspect_id)
        .map_err(|e| ItemError {
            code: "db_query_failed",
            message: e.to_string(),
        })?
        .ok_or_else(|| ItemError {
            code: "not_found",
            message: format!("aspect {} not found", aspect_id),
        })?;

    match user_role(conn, student_id).map_err(|e| ItemError {
        code: "db_query_failed",
        message: e.to_string(),
    })? {
        None => {
            return Err(ItemError {
                code: "not_found",
                message: format!("student {} not found", student_id),
            })
        }
        Some(role) if role != "student" => {
            return Err(ItemError {
                code: "bad_params",
                message: format!("user {} is not a student", student_id),
            })
        }
        Some(_) => {}
    }

    let value = GradeValue::parse(input_type, value_raw).map_err(|e| ItemError {
        code: "invalid_grade_value",
        message: e.message,
    })?;

    upsert_grade(
        conn,
        aspect_id,
        student_id,
        teacher_id,
        &value.canonical(),
        notes,
    )
}

fn handle_grades_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(items) = req.params.get("grades").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing grades[]", None);
    };

    match user_role(conn, &teacher_id) {
        Ok(Some(role)) if role == "teacher" => {}
        Ok(Some(_)) => {
            return err(
                &req.id,
                "bad_params",
                "teacherId must reference a teacher",
                None,
            )
        }
        Ok(None) => return err(&req.id, "not_found", "teacher not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    if items.len() > GRADES_SUBMIT_MAX_ITEMS {
        return ok(
            &req.id,
            json!({
                "saved": 0,
                "rejected": items.len(),
                "limitExceeded": true,
                "errors": [{
                    "index": -1,
                    "code": "too_many_items",
                    "message": format!(
                        "submission exceeds max items: {} > {}",
                        items.len(), GRADES_SUBMIT_MAX_ITEMS
                    )
                }]
            }),
        );
    }

    // Partial success: every valid item saves, failures are reported together.
    let mut saved: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();
    for (i, item) in items.iter().enumerate() {
        match submit_one(conn, &teacher_id, item, i) {
            Ok(()) => saved += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    let rejected = errors.len();
    let mut result = serde_json::Map::new();
    result.insert("saved".into(), json!(saved));
    if rejected > 0 {
        result.insert("rejected".into(), json!(rejected));
        result.insert("errors".into(), json!(errors));
    }

    ok(&req.id, serde_json::Value::Object(result))
}

fn handle_grades_list_for_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(year) = req.params.get("year").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing/invalid year", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT g.id, g.assessment_aspect_id, g.grade_value, g.notes,
                g.teacher_id, t.name, g.created_at, g.updated_at
         FROM grades g
         JOIN users t ON t.id = g.teacher_id
         WHERE g.student_id = ?
           AND CAST(strftime('%Y', g.created_at) AS INTEGER) = ?
         ORDER BY g.created_at",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&student_id, year), |row| {
            let id: String = row.get(0)?;
            let aspect_id: String = row.get(1)?;
            let grade_value: String = row.get(2)?;
            let notes: Option<String> = row.get(3)?;
            let teacher_id: String = row.get(4)?;
            let teacher_name: String = row.get(5)?;
            let created_at: String = row.get(6)?;
            let updated_at: String = row.get(7)?;
            Ok(json!({
                "id": id,
                "aspectId": aspect_id,
                "gradeValue": grade_value,
                "notes": notes,
                "teacher": { "id": teacher_id, "name": teacher_name },
                "createdAt": created_at,
                "updatedAt": updated_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(grades) => ok(&req.id, json!({ "grades": grades })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.submit" => Some(handle_grades_submit(state, req)),
        "grades.listForStudent" => Some(handle_grades_list_for_student(state, req)),
        _ => None,
    }
}
