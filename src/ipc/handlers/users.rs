use crate::ipc::error::{err, ok};
use crate::ipc::handlers::{db_conn, now_iso, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

/// Closed set of account roles. Authorization branching happens at the UI
/// boundary; the daemon only validates and stores the role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Teacher,
    Principal,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Principal => "principal",
            Role::Student => "student",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            "principal" => Some(Role::Principal),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let email = match required_str(req, "email") {
        Ok(v) => v.trim().to_lowercase(),
        Err(e) => return e,
    };
    let role_raw = match required_str(req, "role") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(role) = Role::parse(&role_raw) else {
        return err(
            &req.id,
            "bad_params",
            "role must be one of: admin, teacher, principal, student",
            Some(json!({ "role": role_raw })),
        );
    };

    // The UNIQUE constraint still catches a racing insert.
    match conn.query_row(
        "SELECT COUNT(*) FROM users WHERE email = ?",
        [&email],
        |row| row.get::<_, i64>(0),
    ) {
        Ok(0) => {}
        Ok(_) => {
            return err(
                &req.id,
                "bad_params",
                "email already in use",
                Some(json!({ "email": email })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let user_id = Uuid::new_v4().to_string();
    let now = now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, name, email, role, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&user_id, &name, &email, role.as_str(), &now, &now),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    ok(
        &req.id,
        json!({ "userId": user_id, "name": name, "email": email, "role": role.as_str() }),
    )
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let role = match optional_str(req, "role") {
        Some(raw) => match Role::parse(&raw) {
            Some(r) => Some(r),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "role must be one of: admin, teacher, principal, student",
                    Some(json!({ "role": raw })),
                )
            }
        },
        None => None,
    };

    let (sql, params): (&str, Vec<String>) = match role {
        Some(r) => (
            "SELECT id, name, email, role FROM users WHERE role = ? ORDER BY name",
            vec![r.as_str().to_string()],
        ),
        None => (
            "SELECT id, name, email, role FROM users ORDER BY name",
            vec![],
        ),
    };

    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let email: String = row.get(2)?;
            let role: String = row.get(3)?;
            Ok(json!({ "id": id, "name": name, "email": email, "role": role }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&user_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "user not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicit delete in dependency order (no ON DELETE CASCADE): grades
    // reference the user as student or as grading teacher.
    if let Err(e) = tx.execute(
        "DELETE FROM grades WHERE student_id = ? OR teacher_id = ?",
        (&user_id, &user_id),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM users WHERE id = ?", [&user_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" => Some(handle_users_create(state, req)),
        "users.list" => Some(handle_users_list(state, req)),
        "users.delete" => Some(handle_users_delete(state, req)),
        _ => None,
    }
}
