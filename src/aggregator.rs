use chrono::{SecondsFormat, Utc};
use log::warn;
use serde::Serialize;

use crate::stats::{self, FirstAttendancePolicy, StatsSnapshot};
use crate::store::TenantStore;

const DEFAULT_CHUNK_SIZE: usize = 25;
const MIN_CHUNK_SIZE: usize = 10;
const MAX_CHUNK_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct AggError {
    pub code: &'static str,
    pub message: String,
}

impl AggError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedStudent {
    pub student_id: String,
    pub error_message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub total: usize,
    pub updated: usize,
    pub errors: usize,
    pub error_details: Vec<FailedStudent>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Recompute one student's stats snapshot from the three source
/// collections and persist it. Idempotent apart from the timestamp.
pub fn recompute(
    store: &TenantStore,
    student_id: &str,
    policy: FirstAttendancePolicy,
) -> Result<StatsSnapshot, AggError> {
    if store.tenant_id().is_empty() {
        return Err(AggError::new("invalid_argument", "tenantId must not be empty"));
    }
    if student_id.is_empty() {
        return Err(AggError::new("invalid_argument", "studentId must not be empty"));
    }

    let exists = store
        .student_exists(student_id)
        .map_err(|e| AggError::new("internal", e.to_string()))?;
    if !exists {
        return Err(AggError::new(
            "not_found",
            format!("student {} not found", student_id),
        ));
    }

    // The three reads are not a transaction; a concurrent source write may
    // land between them. The snapshot is eventually consistent and the next
    // trigger recomputes it.
    let classes = store
        .class_instances_for_student(student_id)
        .map_err(|e| AggError::new("internal", e.to_string()))?;
    let attendance = store
        .attendance_for_student(student_id)
        .map_err(|e| AggError::new("internal", e.to_string()))?;
    let enrollments = store
        .active_enrollments_for_student(student_id)
        .map_err(|e| AggError::new("internal", e.to_string()))?;

    // The first attendance may reference an instance the student was later
    // removed from; resolve it with a point lookup. A failed or empty
    // lookup leaves branch/teacher null, it never aborts the recompute.
    let mut orphan_instance = None;
    if let Some(fa) = stats::first_attendance(&attendance, policy) {
        if !classes.iter().any(|c| c.id == fa.class_instance_id) {
            match store.class_instance(&fa.class_instance_id) {
                Ok(found) => orphan_instance = found,
                Err(e) => {
                    warn!(
                        "lookup of class instance {} for student {} failed: {}",
                        fa.class_instance_id, student_id, e
                    );
                }
            }
        }
    }

    let snap = stats::compute_snapshot(
        &classes,
        &attendance,
        &enrollments,
        orphan_instance.as_ref(),
        policy,
        &now_rfc3339(),
    );

    store
        .write_stats(student_id, &snap)
        .map_err(|e| AggError::new("internal", e.to_string()))?;
    Ok(snap)
}

/// Recompute a set of students in bounded-size chunks. Per-student
/// failures are recorded and never abort the rest of the batch; re-running
/// the whole batch is safe.
pub fn recompute_batch(
    store: &TenantStore,
    student_ids: &[String],
    chunk_size: Option<usize>,
    policy: FirstAttendancePolicy,
) -> BatchOutcome {
    let chunk = chunk_size
        .unwrap_or(DEFAULT_CHUNK_SIZE)
        .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);

    let mut updated = 0usize;
    let mut error_details = Vec::new();
    for batch in student_ids.chunks(chunk) {
        for student_id in batch {
            match recompute(store, student_id, policy) {
                Ok(_) => updated += 1,
                Err(e) => {
                    warn!("stats recompute failed for student {}: {}", student_id, e.message);
                    error_details.push(FailedStudent {
                        student_id: student_id.clone(),
                        error_message: e.message,
                    });
                }
            }
        }
    }

    BatchOutcome {
        total: student_ids.len(),
        updated,
        errors: error_details.len(),
        error_details,
    }
}
