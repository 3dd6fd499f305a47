use log::warn;
use std::collections::BTreeSet;

use crate::aggregator;
use crate::db;
use crate::ipc::AppState;
use crate::store::TenantStore;

/// A source-collection write, carried as before/after images. Either side
/// may be absent (create or delete). Mutating handlers enqueue these; the
/// router drains the queue after every request.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// Attendance record written; images carry the owning student id.
    Attendance {
        before: Option<String>,
        after: Option<String>,
    },
    /// Enrollment written; same shape as attendance.
    Enrollment {
        before: Option<String>,
        after: Option<String>,
    },
    /// Class instance written; only the membership sets matter. A field
    /// edit that leaves membership unchanged fans out to nobody.
    ClassInstance {
        before_members: BTreeSet<String>,
        after_members: BTreeSet<String>,
    },
}

#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub tenant_id: String,
    pub event: ChangeEvent,
}

/// Students whose snapshot the event can affect, deduplicated and sorted.
pub fn affected_students(event: &ChangeEvent) -> Vec<String> {
    match event {
        ChangeEvent::Attendance { before, after } | ChangeEvent::Enrollment { before, after } => {
            after.clone().or_else(|| before.clone()).into_iter().collect()
        }
        ChangeEvent::ClassInstance {
            before_members,
            after_members,
        } => before_members
            .symmetric_difference(after_members)
            .cloned()
            .collect(),
    }
}

/// Drain the queue, recomputing every affected student. Failures are
/// logged per student and never stop the remaining work; the snapshot is
/// derived state, so the next event catches it up.
pub fn dispatch_pending(state: &mut AppState) {
    while let Some(pending) = state.pending.pop_front() {
        let Some(conn) = state.db.as_ref() else {
            state.pending.clear();
            return;
        };
        let policy = db::first_attendance_policy(conn);
        let store = TenantStore::new(conn, &pending.tenant_id);
        for student_id in affected_students(&pending.event) {
            if let Err(e) = aggregator::recompute(&store, &student_id, policy) {
                warn!(
                    "reactive recompute failed for tenant {} student {}: {} ({})",
                    pending.tenant_id, student_id, e.message, e.code
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn attendance_prefers_after_image() {
        let updated = ChangeEvent::Attendance {
            before: Some("s1".to_string()),
            after: Some("s1".to_string()),
        };
        assert_eq!(affected_students(&updated), vec!["s1"]);

        let deleted = ChangeEvent::Attendance {
            before: Some("s2".to_string()),
            after: None,
        };
        assert_eq!(affected_students(&deleted), vec!["s2"]);

        let created = ChangeEvent::Enrollment {
            before: None,
            after: Some("s3".to_string()),
        };
        assert_eq!(affected_students(&created), vec!["s3"]);
    }

    #[test]
    fn membership_diff_fans_out_to_added_and_removed_only() {
        let event = ChangeEvent::ClassInstance {
            before_members: set(&["b", "d"]),
            after_members: set(&["a", "c", "d"]),
        };
        // d is in both sets and must not be recomputed.
        assert_eq!(affected_students(&event), vec!["a", "b", "c"]);
    }

    #[test]
    fn unchanged_membership_fans_out_to_nobody() {
        let event = ChangeEvent::ClassInstance {
            before_members: set(&["a", "b"]),
            after_members: set(&["a", "b"]),
        };
        assert!(affected_students(&event).is_empty());
    }
}
