use crate::events::{ChangeEvent, PendingEvent};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store::TenantStore;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_enrollments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let tenant_id = match required_str(req, "tenantId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let valid_from = optional_str(req, "validFrom");
    let valid_to = optional_str(req, "validTo");

    let event;
    let resp;
    {
        let conn = match db_conn(state, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        let store = TenantStore::new(conn, &tenant_id);
        match store.student_exists(&student_id) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "student not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }

        let enrollment_id = Uuid::new_v4().to_string();
        if let Err(e) = conn.execute(
            "INSERT INTO enrollments(id, tenant_id, student_id, course_id, active, valid_from, valid_to)
             VALUES(?, ?, ?, ?, 1, ?, ?)",
            (
                &enrollment_id,
                &tenant_id,
                &student_id,
                &course_id,
                &valid_from,
                &valid_to,
            ),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }

        resp = ok(&req.id, json!({ "enrollmentId": enrollment_id }));
        event = PendingEvent {
            tenant_id: tenant_id.clone(),
            event: ChangeEvent::Enrollment {
                before: None,
                after: Some(student_id),
            },
        };
    }
    state.pending.push_back(event);
    resp
}

fn handle_enrollments_deactivate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let tenant_id = match required_str(req, "tenantId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let event;
    let resp;
    {
        let conn = match db_conn(state, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        let student_id: Option<String> = match conn
            .query_row(
                "SELECT student_id FROM enrollments WHERE tenant_id = ? AND id = ?",
                (&tenant_id, &enrollment_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let Some(student_id) = student_id else {
            return err(&req.id, "not_found", "enrollment not found", None);
        };

        if let Err(e) = conn.execute(
            "UPDATE enrollments SET active = 0 WHERE tenant_id = ? AND id = ?",
            (&tenant_id, &enrollment_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }

        resp = ok(
            &req.id,
            json!({ "enrollmentId": enrollment_id, "active": false }),
        );
        event = PendingEvent {
            tenant_id: tenant_id.clone(),
            event: ChangeEvent::Enrollment {
                before: Some(student_id.clone()),
                after: Some(student_id),
            },
        };
    }
    state.pending.push_back(event);
    resp
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.create" => Some(handle_enrollments_create(state, req)),
        "enrollments.deactivate" => Some(handle_enrollments_deactivate(state, req)),
        _ => None,
    }
}
