use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store::TenantStore;
use serde_json::json;
use uuid::Uuid;

fn handle_links_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tenant_id = match required_str(req, "tenantId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let expires_at = optional_str(req, "expiresAt");

    let store = TenantStore::new(conn, &tenant_id);
    match store.tenant_exists() {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "tenant not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let token = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teacher_links(token, tenant_id, teacher_id, active, expires_at)
         VALUES(?, ?, ?, 1, ?)",
        (&token, &tenant_id, &teacher_id, &expires_at),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "token": token }))
}

fn handle_links_revoke(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tenant_id = match required_str(req, "tenantId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let token = match required_str(req, "token") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let changed = match conn.execute(
        "UPDATE teacher_links SET active = 0 WHERE tenant_id = ? AND token = ?",
        (&tenant_id, &token),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "teacher link not found", None);
    }

    ok(&req.id, json!({ "token": token, "active": false }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "links.create" => Some(handle_links_create(state, req)),
        "links.revoke" => Some(handle_links_revoke(state, req)),
        _ => None,
    }
}
