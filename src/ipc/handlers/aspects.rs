use crate::ipc::error::{err, ok};
use crate::ipc::handlers::{db_conn, now_iso, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::report::{self, AspectRecord, InputType};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub fn load_aspects_for_template(
    conn: &Connection,
    template_id: &str,
) -> Result<Vec<AspectRecord>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, parent_id, name, input_type, sort_order
         FROM assessment_aspects
         WHERE curriculum_template_id = ?
         ORDER BY sort_order",
    )?;
    let rows = stmt.query_map([template_id], |row| {
        let id: String = row.get(0)?;
        let parent_id: Option<String> = row.get(1)?;
        let name: String = row.get(2)?;
        let input_type_raw: String = row.get(3)?;
        let sort_order: i64 = row.get(4)?;
        Ok(AspectRecord {
            id,
            parent_id,
            name,
            // Writes validate the type, so an unknown value here means a
            // hand-edited db; fall back to free text rather than failing reads.
            input_type: InputType::parse(&input_type_raw).unwrap_or(InputType::FreeText),
            sort_order,
        })
    })?;
    rows.collect()
}

fn handle_aspects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let template_id = match required_str(req, "templateId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let aspects = match load_aspects_for_template(conn, &template_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows: Vec<serde_json::Value> = aspects
        .iter()
        .map(|a| {
            json!({
                "id": a.id,
                "parentId": a.parent_id,
                "name": a.name,
                "inputType": a.input_type.as_str(),
                "order": a.sort_order
            })
        })
        .collect();

    ok(&req.id, json!({ "aspects": rows }))
}

fn handle_aspects_tree(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let template_id = match required_str(req, "templateId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let aspects = match load_aspects_for_template(conn, &template_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match report::build_aspect_forest(&aspects) {
        Ok(forest) => ok(&req.id, json!({ "tree": forest })),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_aspects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let template_id = match required_str(req, "templateId") {
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
    let input_type_raw = match required_str(req, "inputType") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(input_type) = InputType::parse(&input_type_raw) else {
        return err(
            &req.id,
            "bad_params",
            "inputType must be one of: numeric, letter, binary, free_text",
            Some(json!({ "inputType": input_type_raw })),
        );
    };
    let parent_id = optional_str(req, "parentId");
    let sort_order = req.params.get("order").and_then(|v| v.as_i64()).unwrap_or(0);

    let template_exists: Option<i64> = match conn
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
    if template_exists.is_none() {
        return err(&req.id, "not_found", "template not found", None);
    }

    // A parent must exist and belong to the same template; this is the write
    // boundary where the forest invariant is enforced.
    if let Some(pid) = &parent_id {
        let parent_template: Option<String> = match conn
            .query_row(
                "SELECT curriculum_template_id FROM assessment_aspects WHERE id = ?",
                [pid],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match parent_template {
            None => return err(&req.id, "not_found", "parent aspect not found", None),
            Some(pt) if pt != template_id => {
                return err(
                    &req.id,
                    "bad_params",
                    "parent aspect belongs to a different template",
                    Some(json!({ "parentId": pid, "parentTemplateId": pt })),
                )
            }
            Some(_) => {}
        }
    }

    let aspect_id = Uuid::new_v4().to_string();
    let now = now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO assessment_aspects(
            id, curriculum_template_id, parent_id, name, input_type, sort_order,
            created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &aspect_id,
            &template_id,
            &parent_id,
            &name,
            input_type.as_str(),
            sort_order,
            &now,
            &now,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assessment_aspects" })),
        );
    }

    ok(
        &req.id,
        json!({ "aspectId": aspect_id, "name": name, "inputType": input_type.as_str() }),
    )
}

fn handle_aspects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let aspect_id = match required_str(req, "aspectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = optional_str(req, "name").map(|v| v.trim().to_string());
    if let Some(n) = &name {
        if n.is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
    }
    let input_type = match optional_str(req, "inputType") {
        Some(raw) => match InputType::parse(&raw) {
            Some(t) => Some(t),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "inputType must be one of: numeric, letter, binary, free_text",
                    Some(json!({ "inputType": raw })),
                )
            }
        },
        None => None,
    };
    let sort_order = req.params.get("order").and_then(|v| v.as_i64());
    if name.is_none() && input_type.is_none() && sort_order.is_none() {
        return err(&req.id, "bad_params", "nothing to update", None);
    }

    let row: Option<(String, String, i64)> = match conn
        .query_row(
            "SELECT name, input_type, sort_order FROM assessment_aspects WHERE id = ?",
            [&aspect_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((cur_name, cur_type, cur_order)) = row else {
        return err(&req.id, "not_found", "aspect not found", None);
    };

    let new_name = name.unwrap_or(cur_name);
    let new_type = input_type
        .map(|t| t.as_str().to_string())
        .unwrap_or(cur_type);
    let new_order = sort_order.unwrap_or(cur_order);
    if let Err(e) = conn.execute(
        "UPDATE assessment_aspects
         SET name = ?, input_type = ?, sort_order = ?, updated_at = ?
         WHERE id = ?",
        (&new_name, &new_type, new_order, now_iso(), &aspect_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "aspectId": aspect_id,
            "name": new_name,
            "inputType": new_type,
            "order": new_order
        }),
    )
}

/// Collect an aspect and all of its descendants. Every node lands after its
/// parent, so reverse iteration deletes leaves first.
fn collect_subtree_ids(
    conn: &Connection,
    root_id: &str,
) -> Result<Vec<String>, rusqlite::Error> {
    let mut all = vec![root_id.to_string()];
    let mut frontier = vec![root_id.to_string()];
    let mut stmt = conn.prepare("SELECT id FROM assessment_aspects WHERE parent_id = ?")?;
    while let Some(current) = frontier.pop() {
        let children = stmt
            .query_map([&current], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for child in children {
            all.push(child.clone());
            frontier.push(child);
        }
    }
    Ok(all)
}

fn handle_aspects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let aspect_id = match required_str(req, "aspectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM assessment_aspects WHERE id = ?",
            [&aspect_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "aspect not found", None);
    }

    let subtree = match collect_subtree_ids(conn, &aspect_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Children before parents so the self-referential FK stays satisfied.
    for id in subtree.iter().rev() {
        if let Err(e) = tx.execute("DELETE FROM grades WHERE assessment_aspect_id = ?", [id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "grades" })),
            );
        }
        if let Err(e) = tx.execute("DELETE FROM assessment_aspects WHERE id = ?", [id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "assessment_aspects" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true, "deletedAspects": subtree.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "aspects.list" => Some(handle_aspects_list(state, req)),
        "aspects.tree" => Some(handle_aspects_tree(state, req)),
        "aspects.create" => Some(handle_aspects_create(state, req)),
        "aspects.update" => Some(handle_aspects_update(state, req)),
        "aspects.delete" => Some(handle_aspects_delete(state, req)),
        _ => None,
    }
}
