use anyhow::anyhow;
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeSet;

use crate::stats::{
    AttendanceRow, AttendanceStatus, ClassInstanceRow, EnrollmentRow, StatsSnapshot,
};

/// All reads and writes for one tenant. Every query filters by the tenant
/// id held here, so cross-tenant access cannot be expressed through this
/// type at all.
pub struct TenantStore<'a> {
    conn: &'a Connection,
    tenant_id: &'a str,
}

#[derive(Debug, Clone)]
pub struct TeacherLink {
    pub token: String,
    pub tenant_id: String,
    pub teacher_id: String,
    pub active: bool,
    pub expires_at: Option<String>,
}

impl<'a> TenantStore<'a> {
    pub fn new(conn: &'a Connection, tenant_id: &'a str) -> Self {
        Self { conn, tenant_id }
    }

    pub fn tenant_id(&self) -> &str {
        self.tenant_id
    }

    pub fn tenant_exists(&self) -> anyhow::Result<bool> {
        let found = self
            .conn
            .query_row("SELECT 1 FROM tenants WHERE id = ?", [self.tenant_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    pub fn admin_token(&self) -> anyhow::Result<Option<String>> {
        let token = self
            .conn
            .query_row(
                "SELECT admin_token FROM tenants WHERE id = ?",
                [self.tenant_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(token)
    }

    pub fn student_exists(&self, student_id: &str) -> anyhow::Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM students WHERE tenant_id = ? AND id = ?",
                (self.tenant_id, student_id),
                |r| r.get::<_, i64>(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list_student_ids(&self) -> anyhow::Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM students WHERE tenant_id = ? ORDER BY id")?;
        let ids = stmt
            .query_map([self.tenant_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Class instances whose membership set currently contains the student.
    pub fn class_instances_for_student(
        &self,
        student_id: &str,
    ) -> anyhow::Result<Vec<ClassInstanceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT ci.id, ci.date, ci.teacher_id, ci.branch_id
             FROM class_instances ci
             JOIN class_instance_members m ON m.class_instance_id = ci.id
             WHERE ci.tenant_id = ? AND m.student_id = ?
             ORDER BY ci.date, ci.id",
        )?;
        let rows = stmt
            .query_map((self.tenant_id, student_id), |r| {
                Ok(ClassInstanceRow {
                    id: r.get(0)?,
                    date: r.get(1)?,
                    teacher_id: r.get(2)?,
                    branch_id: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn class_instance(&self, id: &str) -> anyhow::Result<Option<ClassInstanceRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, date, teacher_id, branch_id
                 FROM class_instances
                 WHERE tenant_id = ? AND id = ?",
                (self.tenant_id, id),
                |r| {
                    Ok(ClassInstanceRow {
                        id: r.get(0)?,
                        date: r.get(1)?,
                        teacher_id: r.get(2)?,
                        branch_id: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn members(&self, class_instance_id: &str) -> anyhow::Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT student_id FROM class_instance_members
             WHERE tenant_id = ? AND class_instance_id = ?",
        )?;
        let ids = stmt
            .query_map((self.tenant_id, class_instance_id), |r| {
                r.get::<_, String>(0)
            })?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(ids)
    }

    pub fn replace_members(
        &self,
        class_instance_id: &str,
        student_ids: &BTreeSet<String>,
    ) -> anyhow::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM class_instance_members
             WHERE tenant_id = ? AND class_instance_id = ?",
            (self.tenant_id, class_instance_id),
        )?;
        for sid in student_ids {
            tx.execute(
                "INSERT INTO class_instance_members(tenant_id, class_instance_id, student_id)
                 VALUES(?, ?, ?)",
                (self.tenant_id, class_instance_id, sid),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn attendance_for_student(&self, student_id: &str) -> anyhow::Result<Vec<AttendanceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, class_instance_id, status, date, marked_at
             FROM attendance_records
             WHERE tenant_id = ? AND student_id = ?
             ORDER BY id",
        )?;
        let raw = stmt
            .query_map((self.tenant_id, student_id), |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = Vec::with_capacity(raw.len());
        for (id, class_instance_id, status, date, marked_at) in raw {
            let status = AttendanceStatus::parse(&status)
                .ok_or_else(|| anyhow!("unknown attendance status {:?} on record {}", status, id))?;
            rows.push(AttendanceRow {
                id,
                class_instance_id,
                status,
                date,
                marked_at,
            });
        }
        Ok(rows)
    }

    pub fn active_enrollments_for_student(
        &self,
        student_id: &str,
    ) -> anyhow::Result<Vec<EnrollmentRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM enrollments
             WHERE tenant_id = ? AND student_id = ? AND active = 1
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map((self.tenant_id, student_id), |r| {
                Ok(EnrollmentRow {
                    id: r.get(0)?,
                    active: true,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Upsert keyed by `{classInstanceId}_{studentId}`. Returns the record
    /// id and whether a record already existed for the pair.
    pub fn upsert_attendance(
        &self,
        class_instance_id: &str,
        student_id: &str,
        status: AttendanceStatus,
        date: Option<&str>,
        marked_at: &str,
        notes: Option<&str>,
    ) -> anyhow::Result<(String, bool)> {
        let id = format!("{}_{}", class_instance_id, student_id);
        let existed = self
            .conn
            .query_row(
                "SELECT 1 FROM attendance_records WHERE tenant_id = ? AND id = ?",
                (self.tenant_id, &id),
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        self.conn.execute(
            "INSERT INTO attendance_records(id, tenant_id, class_instance_id, student_id, status, date, marked_at, notes)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               status = excluded.status,
               date = excluded.date,
               marked_at = excluded.marked_at,
               notes = excluded.notes",
            (
                &id,
                self.tenant_id,
                class_instance_id,
                student_id,
                status.as_str(),
                date,
                marked_at,
                notes,
            ),
        )?;
        Ok((id, existed))
    }

    pub fn write_stats(&self, student_id: &str, snap: &StatsSnapshot) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO student_stats(
                tenant_id, student_id, total_classes, active_enrollments,
                first_class_id, first_class_date, first_class_branch_id,
                first_class_teacher_id, first_class_attended,
                first_attendance_id, first_attendance_date,
                first_attendance_class_id, first_attendance_branch_id,
                first_attendance_teacher_id, last_updated)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(tenant_id, student_id) DO UPDATE SET
               total_classes = excluded.total_classes,
               active_enrollments = excluded.active_enrollments,
               first_class_id = excluded.first_class_id,
               first_class_date = excluded.first_class_date,
               first_class_branch_id = excluded.first_class_branch_id,
               first_class_teacher_id = excluded.first_class_teacher_id,
               first_class_attended = excluded.first_class_attended,
               first_attendance_id = excluded.first_attendance_id,
               first_attendance_date = excluded.first_attendance_date,
               first_attendance_class_id = excluded.first_attendance_class_id,
               first_attendance_branch_id = excluded.first_attendance_branch_id,
               first_attendance_teacher_id = excluded.first_attendance_teacher_id,
               last_updated = excluded.last_updated",
            rusqlite::params![
                self.tenant_id,
                student_id,
                snap.total_classes,
                snap.active_enrollments,
                snap.first_class_id,
                snap.first_class_date,
                snap.first_class_branch_id,
                snap.first_class_teacher_id,
                snap.first_class_attended as i64,
                snap.first_attendance_id,
                snap.first_attendance_date,
                snap.first_attendance_class_id,
                snap.first_attendance_branch_id,
                snap.first_attendance_teacher_id,
                snap.last_updated,
            ],
        )?;
        Ok(())
    }

    pub fn read_stats(&self, student_id: &str) -> anyhow::Result<Option<StatsSnapshot>> {
        let snap = self
            .conn
            .query_row(
                "SELECT total_classes, active_enrollments, first_class_id,
                        first_class_date, first_class_branch_id,
                        first_class_teacher_id, first_class_attended,
                        first_attendance_id, first_attendance_date,
                        first_attendance_class_id, first_attendance_branch_id,
                        first_attendance_teacher_id, last_updated
                 FROM student_stats
                 WHERE tenant_id = ? AND student_id = ?",
                (self.tenant_id, student_id),
                |r| {
                    Ok(StatsSnapshot {
                        total_classes: r.get(0)?,
                        active_enrollments: r.get(1)?,
                        first_class_id: r.get(2)?,
                        first_class_date: r.get(3)?,
                        first_class_branch_id: r.get(4)?,
                        first_class_teacher_id: r.get(5)?,
                        first_class_attended: r.get::<_, i64>(6)? != 0,
                        first_attendance_id: r.get(7)?,
                        first_attendance_date: r.get(8)?,
                        first_attendance_class_id: r.get(9)?,
                        first_attendance_branch_id: r.get(10)?,
                        first_attendance_teacher_id: r.get(11)?,
                        last_updated: r.get(12)?,
                    })
                },
            )
            .optional()?;
        Ok(snap)
    }
}

/// Token lookup is deliberately global: a link presented against the wrong
/// tenant must be distinguishable (permission denied) from a link that does
/// not exist (not found).
pub fn teacher_link_by_token(conn: &Connection, token: &str) -> anyhow::Result<Option<TeacherLink>> {
    let link = conn
        .query_row(
            "SELECT token, tenant_id, teacher_id, active, expires_at
             FROM teacher_links WHERE token = ?",
            [token],
            |r| {
                Ok(TeacherLink {
                    token: r.get(0)?,
                    tenant_id: r.get(1)?,
                    teacher_id: r.get(2)?,
                    active: r.get::<_, i64>(3)? != 0,
                    expires_at: r.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(link)
}
