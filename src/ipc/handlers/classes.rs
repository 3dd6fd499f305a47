use crate::events::{ChangeEvent, PendingEvent};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store::TenantStore;
use chrono::NaiveDate;
use serde_json::json;
use std::collections::BTreeSet;
use uuid::Uuid;

fn parse_member_ids(req: &Request) -> Result<BTreeSet<String>, serde_json::Value> {
    let Some(raw) = req.params.get("studentIds").and_then(|v| v.as_array()) else {
        return Err(err(&req.id, "invalid_argument", "missing studentIds", None));
    };
    let mut out = BTreeSet::new();
    for v in raw {
        let Some(id) = v.as_str() else {
            return Err(err(
                &req.id,
                "invalid_argument",
                "studentIds must contain only strings",
                None,
            ));
        };
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(err(
                &req.id,
                "invalid_argument",
                "studentIds must not contain empty ids",
                None,
            ));
        }
        out.insert(trimmed.to_string());
    }
    Ok(out)
}

fn handle_class_instances_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tenant_id = match required_str(req, "tenantId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date = match required_str(req, "date") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if NaiveDate::parse_from_str(&date, "%Y-%m-%d").is_err() {
        return err(
            &req.id,
            "invalid_argument",
            "date must be YYYY-MM-DD",
            Some(json!({ "date": date })),
        );
    }
    let teacher_id = optional_str(req, "teacherId");
    let branch_id = optional_str(req, "branchId");

    let store = TenantStore::new(conn, &tenant_id);
    match store.tenant_exists() {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "tenant not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let instance_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO class_instances(id, tenant_id, date, teacher_id, branch_id)
         VALUES(?, ?, ?, ?, ?)",
        (&instance_id, &tenant_id, &date, &teacher_id, &branch_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "classInstanceId": instance_id }))
}

fn handle_class_instances_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tenant_id = match required_str(req, "tenantId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, date, teacher_id, branch_id
         FROM class_instances
         WHERE tenant_id = ?
         ORDER BY date, id",
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map([&tenant_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "teacherId": r.get::<_, Option<String>>(2)?,
                "branchId": r.get::<_, Option<String>>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "classInstances": rows }))
}

fn handle_class_instances_set_members(state: &mut AppState, req: &Request) -> serde_json::Value {
    let tenant_id = match required_str(req, "tenantId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let instance_id = match required_str(req, "classInstanceId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let after_members = match parse_member_ids(req) {
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
        let store = TenantStore::new(conn, &tenant_id);
        match store.class_instance(&instance_id) {
            Ok(Some(_)) => {}
            Ok(None) => return err(&req.id, "not_found", "class instance not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }

        let mut unknown = Vec::new();
        for sid in &after_members {
            match store.student_exists(sid) {
                Ok(true) => {}
                Ok(false) => unknown.push(sid.clone()),
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
        if !unknown.is_empty() {
            return err(
                &req.id,
                "invalid_argument",
                "studentIds contains unknown students",
                Some(json!({ "unknownStudentIds": unknown })),
            );
        }

        let before_members = match store.members(&instance_id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if let Err(e) = store.replace_members(&instance_id, &after_members) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }

        resp = ok(
            &req.id,
            json!({
                "classInstanceId": instance_id,
                "memberCount": after_members.len()
            }),
        );
        event = PendingEvent {
            tenant_id: tenant_id.clone(),
            event: ChangeEvent::ClassInstance {
                before_members,
                after_members,
            },
        };
    }
    state.pending.push_back(event);
    resp
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classInstances.create" => Some(handle_class_instances_create(state, req)),
        "classInstances.list" => Some(handle_class_instances_list(state, req)),
        "classInstances.setMembers" => Some(handle_class_instances_set_members(state, req)),
        _ => None,
    }
}
