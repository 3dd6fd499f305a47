use crate::aggregator;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use crate::stats::FirstAttendancePolicy;
use crate::store::TenantStore;
use serde_json::json;

fn handle_stats_sync(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tenant_id = match required_str(req, "tenantId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    // Bulk sync is admin-only; a request with no caller identity at all is
    // distinct from one with the wrong identity.
    let Some(admin_token) = req.params.get("adminToken").and_then(|v| v.as_str()) else {
        return err(&req.id, "unauthenticated", "missing adminToken", None);
    };

    let store = TenantStore::new(conn, &tenant_id);
    let expected = match store.admin_token() {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "tenant not found", None),
        Err(e) => return err(&req.id, "internal", e.to_string(), None),
    };
    if admin_token != expected {
        return err(
            &req.id,
            "permission_denied",
            "adminToken does not match tenant",
            None,
        );
    }

    let student_ids = match store.list_student_ids() {
        Ok(v) => v,
        Err(e) => return err(&req.id, "internal", e.to_string(), None),
    };
    let chunk_size = req
        .params
        .get("chunkSize")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize);
    let policy = db::first_attendance_policy(conn);

    let outcome = aggregator::recompute_batch(&store, &student_ids, chunk_size, policy);
    ok(
        &req.id,
        json!({
            "success": true,
            "total": outcome.total,
            "updated": outcome.updated,
            "errors": outcome.errors,
            "errorDetails": outcome.error_details
        }),
    )
}

fn handle_stats_recompute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tenant_id = match required_str(req, "tenantId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let policy = db::first_attendance_policy(conn);
    let store = TenantStore::new(conn, &tenant_id);
    match aggregator::recompute(&store, &student_id, policy) {
        Ok(snap) => ok(&req.id, json!({ "stats": snap })),
        Err(e) => err(&req.id, e.code, e.message, None),
    }
}

fn handle_stats_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tenant_id = match required_str(req, "tenantId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let store = TenantStore::new(conn, &tenant_id);
    match store.read_stats(&student_id) {
        Ok(Some(snap)) => ok(&req.id, json!({ "stats": snap })),
        Ok(None) => ok(&req.id, json!({ "stats": null })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_stats_configure(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let raw = match required_str(req, "firstAttendancePolicy") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(policy) = FirstAttendancePolicy::parse(&raw) else {
        return err(
            &req.id,
            "invalid_argument",
            "firstAttendancePolicy must be one of: all_statuses, present_late",
            Some(json!({ "firstAttendancePolicy": raw })),
        );
    };

    if let Err(e) = db::set_first_attendance_policy(conn, policy) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "firstAttendancePolicy": policy.as_str() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "stats.sync" => Some(handle_stats_sync(state, req)),
        "stats.recompute" => Some(handle_stats_recompute(state, req)),
        "stats.get" => Some(handle_stats_get(state, req)),
        "stats.configure" => Some(handle_stats_configure(state, req)),
        _ => None,
    }
}
