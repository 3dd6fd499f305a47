use crate::events::{ChangeEvent, PendingEvent};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str};
use crate::ipc::types::{AppState, Request};
use crate::stats::AttendanceStatus;
use crate::store::{self, TenantStore};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("invalid_argument", format!("missing {}", key)))
}

fn link_is_expired(expires_at: &str, now: DateTime<Utc>) -> bool {
    match DateTime::parse_from_rfc3339(expires_at) {
        Ok(t) => t.with_timezone(&Utc) <= now,
        // An unreadable expiry never grants access.
        Err(_) => true,
    }
}

fn validate_teacher_link(
    conn: &Connection,
    token: &str,
    tenant_id: &str,
) -> Result<store::TeacherLink, HandlerErr> {
    let link = store::teacher_link_by_token(conn, token)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let Some(link) = link else {
        return Err(HandlerErr::new("not_found", "teacher link not found"));
    };
    if link.tenant_id != tenant_id {
        return Err(HandlerErr::new(
            "permission_denied",
            "teacher link belongs to a different tenant",
        ));
    }
    if !link.active {
        return Err(HandlerErr::new("permission_denied", "teacher link revoked"));
    }
    if let Some(expires_at) = link.expires_at.as_deref() {
        if link_is_expired(expires_at, Utc::now()) {
            return Err(HandlerErr::new("permission_denied", "teacher link expired"));
        }
    }
    Ok(link)
}

fn mark_attendance(
    conn: &Connection,
    req: &Request,
) -> Result<(serde_json::Value, PendingEvent), HandlerErr> {
    let token = get_required_str(&req.params, "token")?;
    let tenant_id = get_required_str(&req.params, "tenantId")?;
    let class_instance_id = get_required_str(&req.params, "classInstanceId")?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let status_raw = get_required_str(&req.params, "status")?;
    let notes = optional_str(req, "notes");

    let Some(status) = AttendanceStatus::parse(&status_raw) else {
        return Err(HandlerErr {
            code: "invalid_argument",
            message: "status must be one of: present, late, absent, excused".to_string(),
            details: Some(json!({ "status": status_raw })),
        });
    };

    validate_teacher_link(conn, &token, &tenant_id)?;

    let tenant = TenantStore::new(conn, &tenant_id);
    let instance = tenant
        .class_instance(&class_instance_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .ok_or_else(|| HandlerErr::new("not_found", "class instance not found"))?;
    let student_known = tenant
        .student_exists(&student_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if !student_known {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    // Record date defaults to the class instance's scheduled date.
    let date = optional_str(req, "date").unwrap_or(instance.date);
    let marked_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let (attendance_id, existed) = tenant
        .upsert_attendance(
            &class_instance_id,
            &student_id,
            status,
            Some(&date),
            &marked_at,
            notes.as_deref(),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let resp = json!({
        "attendanceId": attendance_id,
        "status": status.as_str(),
        "overwritten": existed
    });
    let event = PendingEvent {
        tenant_id,
        event: ChangeEvent::Attendance {
            before: existed.then(|| student_id.clone()),
            after: Some(student_id),
        },
    };
    Ok((resp, event))
}

fn list_attendance(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = get_required_str(&req.params, "tenantId")?;
    let student_id = optional_str(req, "studentId");
    let class_instance_id = optional_str(req, "classInstanceId");

    let mut sql = String::from(
        "SELECT id, class_instance_id, student_id, status, date, marked_at, notes
         FROM attendance_records
         WHERE tenant_id = ?",
    );
    let mut params: Vec<String> = vec![tenant_id];
    if let Some(sid) = student_id {
        sql.push_str(" AND student_id = ?");
        params.push(sid);
    }
    if let Some(cid) = class_instance_id {
        sql.push_str(" AND class_instance_id = ?");
        params.push(cid);
    }
    sql.push_str(" ORDER BY marked_at, id");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classInstanceId": r.get::<_, String>(1)?,
                "studentId": r.get::<_, String>(2)?,
                "status": r.get::<_, String>(3)?,
                "date": r.get::<_, Option<String>>(4)?,
                "markedAt": r.get::<_, String>(5)?,
                "notes": r.get::<_, Option<String>>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "records": rows }))
}

fn handle_attendance_mark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let outcome = {
        let conn = match db_conn(state, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        mark_attendance(conn, req)
    };
    match outcome {
        Ok((result, event)) => {
            state.pending.push_back(event);
            ok(&req.id, result)
        }
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match list_attendance(conn, req) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.mark" => Some(handle_attendance_mark(state, req)),
        "attendance.list" => Some(handle_attendance_list(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_comparison_handles_bad_timestamps() {
        let now = Utc::now();
        assert!(link_is_expired("2020-01-01T00:00:00Z", now));
        assert!(!link_is_expired("2099-01-01T00:00:00Z", now));
        assert!(link_is_expired("not-a-timestamp", now));
    }
}
