use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::{db_conn, now_iso, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_templates_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "templates": [] }));
    };

    let active_id = match db::active_template_id(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Include aspect counts so the UI can show a useful dashboard.
    let mut stmt = match conn.prepare(
        "SELECT
           t.id,
           t.name,
           t.description,
           (SELECT COUNT(*) FROM assessment_aspects a
            WHERE a.curriculum_template_id = t.id) AS aspect_count
         FROM curriculum_templates t
         ORDER BY t.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let description: Option<String> = row.get(2)?;
            let aspect_count: i64 = row.get(3)?;
            let active = active_id.as_deref() == Some(id.as_str());
            Ok(json!({
                "id": id,
                "name": name,
                "description": description,
                "aspectCount": aspect_count,
                "active": active
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(templates) => ok(&req.id, json!({ "templates": templates })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_templates_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let description = optional_str(req, "description");

    let template_id = Uuid::new_v4().to_string();
    let now = now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO curriculum_templates(id, name, description, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?)",
        (&template_id, &name, &description, &now, &now),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "curriculum_templates" })),
        );
    }

    ok(&req.id, json!({ "templateId": template_id, "name": name }))
}

fn handle_templates_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let template_id = match required_str(req, "templateId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = optional_str(req, "name").map(|v| v.trim().to_string());
    let description = optional_str(req, "description");
    if name.is_none() && description.is_none() {
        return err(&req.id, "bad_params", "nothing to update", None);
    }
    if let Some(n) = &name {
        if n.is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
    }

    let row: Option<(String, Option<String>)> = match conn
        .query_row(
            "SELECT name, description FROM curriculum_templates WHERE id = ?",
            [&template_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((cur_name, cur_desc)) = row else {
        return err(&req.id, "not_found", "template not found", None);
    };

    let new_name = name.unwrap_or(cur_name);
    let new_desc = description.or(cur_desc);
    if let Err(e) = conn.execute(
        "UPDATE curriculum_templates SET name = ?, description = ?, updated_at = ? WHERE id = ?",
        (&new_name, &new_desc, now_iso(), &template_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "templateId": template_id, "name": new_name, "description": new_desc }),
    )
}

fn handle_templates_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let template_id = match required_str(req, "templateId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM curriculum_templates WHERE id = ?",
            [&template_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "template not found", None);
    }

    // The settings row holds exactly one reference, so at most one template
    // can be active at a time.
    if let Err(e) = db::settings_set(conn, db::ACTIVE_TEMPLATE_KEY, &template_id) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "activeTemplateId": template_id }))
}

fn handle_templates_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let template_id = match required_str(req, "templateId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM curriculum_templates WHERE id = ?",
            [&template_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "template not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicit delete in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "DELETE FROM grades
         WHERE assessment_aspect_id IN (
           SELECT id FROM assessment_aspects WHERE curriculum_template_id = ?
         )",
        [&template_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM assessment_aspects WHERE curriculum_template_id = ?",
        [&template_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assessment_aspects" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM curriculum_templates WHERE id = ?",
        [&template_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "curriculum_templates" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM settings WHERE key = ? AND value = ?",
        (db::ACTIVE_TEMPLATE_KEY, &template_id),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "settings" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "templates.list" => Some(handle_templates_list(state, req)),
        "templates.create" => Some(handle_templates_create(state, req)),
        "templates.update" => Some(handle_templates_update(state, req)),
        "templates.activate" => Some(handle_templates_activate(state, req)),
        "templates.delete" => Some(handle_templates_delete(state, req)),
        _ => None,
    }
}
