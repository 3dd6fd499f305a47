use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::stats::FirstAttendancePolicy;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("studiod.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tenants(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            admin_token TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            active INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(tenant_id) REFERENCES tenants(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_tenant ON students(tenant_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_instances(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            date TEXT NOT NULL,
            teacher_id TEXT,
            branch_id TEXT,
            FOREIGN KEY(tenant_id) REFERENCES tenants(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_instances_tenant ON class_instances(tenant_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_instance_members(
            tenant_id TEXT NOT NULL,
            class_instance_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(class_instance_id, student_id),
            FOREIGN KEY(class_instance_id) REFERENCES class_instances(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_members_student ON class_instance_members(tenant_id, student_id)",
        [],
    )?;

    // One row per (class instance, student): the id is derived from the
    // pair, so marking twice overwrites rather than duplicating.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            class_instance_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            date TEXT,
            marked_at TEXT NOT NULL,
            notes TEXT,
            UNIQUE(class_instance_id, student_id),
            FOREIGN KEY(tenant_id) REFERENCES tenants(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance_records(tenant_id, student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            active INTEGER NOT NULL,
            valid_from TEXT,
            valid_to TEXT,
            FOREIGN KEY(tenant_id) REFERENCES tenants(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(tenant_id, student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_links(
            token TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            active INTEGER NOT NULL,
            expires_at TEXT,
            FOREIGN KEY(tenant_id) REFERENCES tenants(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_links_tenant ON teacher_links(tenant_id)",
        [],
    )?;

    // Derived snapshot, written only by the aggregator. Kept in its own
    // table so an upsert never disturbs profile fields.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_stats(
            tenant_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            total_classes INTEGER NOT NULL,
            active_enrollments INTEGER NOT NULL,
            first_class_id TEXT,
            first_class_date TEXT,
            first_class_branch_id TEXT,
            first_class_teacher_id TEXT,
            first_class_attended INTEGER NOT NULL,
            first_attendance_id TEXT,
            first_attendance_date TEXT,
            first_attendance_class_id TEXT,
            first_attendance_branch_id TEXT,
            first_attendance_teacher_id TEXT,
            last_updated TEXT NOT NULL,
            PRIMARY KEY(tenant_id, student_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

const POLICY_KEY: &str = "stats.first_attendance_policy";

pub fn first_attendance_policy(conn: &Connection) -> FirstAttendancePolicy {
    settings_get_json(conn, POLICY_KEY)
        .ok()
        .flatten()
        .and_then(|v| {
            v.get("policy")
                .and_then(|p| p.as_str())
                .and_then(FirstAttendancePolicy::parse)
        })
        .unwrap_or(FirstAttendancePolicy::AllStatuses)
}

pub fn set_first_attendance_policy(
    conn: &Connection,
    policy: FirstAttendancePolicy,
) -> anyhow::Result<()> {
    settings_set_json(conn, POLICY_KEY, &serde_json::json!({ "policy": policy.as_str() }))
}
