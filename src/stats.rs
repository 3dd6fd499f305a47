use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
    Excused,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Excused => "excused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(AttendanceStatus::Present),
            "late" => Some(AttendanceStatus::Late),
            "absent" => Some(AttendanceStatus::Absent),
            "excused" => Some(AttendanceStatus::Excused),
            _ => None,
        }
    }
}

/// Which attendance records are eligible when locating the earliest one.
/// The two legacy call sites disagreed; both behaviors are kept behind
/// this flag, configured per workspace via `stats.configure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstAttendancePolicy {
    AllStatuses,
    PresentLateOnly,
}

impl FirstAttendancePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            FirstAttendancePolicy::AllStatuses => "all_statuses",
            FirstAttendancePolicy::PresentLateOnly => "present_late",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all_statuses" => Some(FirstAttendancePolicy::AllStatuses),
            "present_late" => Some(FirstAttendancePolicy::PresentLateOnly),
            _ => None,
        }
    }

    fn includes(self, status: AttendanceStatus) -> bool {
        match self {
            FirstAttendancePolicy::AllStatuses => true,
            FirstAttendancePolicy::PresentLateOnly => matches!(
                status,
                AttendanceStatus::Present | AttendanceStatus::Late
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassInstanceRow {
    pub id: String,
    pub date: String,
    pub teacher_id: Option<String>,
    pub branch_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AttendanceRow {
    pub id: String,
    pub class_instance_id: String,
    pub status: AttendanceStatus,
    pub date: Option<String>,
    pub marked_at: String,
}

impl AttendanceRow {
    /// Records written before the date column was backfilled only carry
    /// their marked-at timestamp.
    fn effective_date(&self) -> &str {
        self.date.as_deref().unwrap_or(&self.marked_at)
    }
}

#[derive(Debug, Clone)]
pub struct EnrollmentRow {
    pub id: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_classes: i64,
    pub active_enrollments: i64,
    pub first_class_id: Option<String>,
    pub first_class_date: Option<String>,
    pub first_class_branch_id: Option<String>,
    pub first_class_teacher_id: Option<String>,
    pub first_class_attended: bool,
    pub first_attendance_id: Option<String>,
    pub first_attendance_date: Option<String>,
    pub first_attendance_class_id: Option<String>,
    pub first_attendance_branch_id: Option<String>,
    pub first_attendance_teacher_id: Option<String>,
    pub last_updated: String,
}

/// Earliest class instance by date, id as the tie-break so the result is
/// stable across recomputes.
pub fn first_class<'a>(classes: &'a [ClassInstanceRow]) -> Option<&'a ClassInstanceRow> {
    classes
        .iter()
        .min_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)))
}

/// Earliest attendance record under the given policy. Falls back to the
/// marked-at timestamp for records without a date.
pub fn first_attendance<'a>(
    attendance: &'a [AttendanceRow],
    policy: FirstAttendancePolicy,
) -> Option<&'a AttendanceRow> {
    attendance
        .iter()
        .filter(|r| policy.includes(r.status))
        .min_by(|a, b| {
            a.effective_date()
                .cmp(b.effective_date())
                .then_with(|| a.id.cmp(&b.id))
        })
}

/// Derive one student's stats snapshot from the current contents of the
/// three source collections. `orphan_instance` is the point-lookup result
/// for a first-attendance record whose class instance no longer lists the
/// student as a member; when it is absent too, the branch/teacher fields
/// stay null rather than failing the recompute.
pub fn compute_snapshot(
    classes: &[ClassInstanceRow],
    attendance: &[AttendanceRow],
    enrollments: &[EnrollmentRow],
    orphan_instance: Option<&ClassInstanceRow>,
    policy: FirstAttendancePolicy,
    now: &str,
) -> StatsSnapshot {
    let first = first_class(classes);
    let first_class_attended = match first {
        Some(fc) => attendance.iter().any(|r| r.class_instance_id == fc.id),
        None => false,
    };

    let first_att = first_attendance(attendance, policy);
    let (fa_branch, fa_teacher) = match first_att {
        Some(fa) => {
            let owner = classes
                .iter()
                .find(|c| c.id == fa.class_instance_id)
                .or_else(|| orphan_instance.filter(|c| c.id == fa.class_instance_id));
            match owner {
                Some(c) => (c.branch_id.clone(), c.teacher_id.clone()),
                None => (None, None),
            }
        }
        None => (None, None),
    };

    StatsSnapshot {
        total_classes: classes.len() as i64,
        active_enrollments: enrollments.iter().filter(|e| e.active).count() as i64,
        first_class_id: first.map(|c| c.id.clone()),
        first_class_date: first.map(|c| c.date.clone()),
        first_class_branch_id: first.and_then(|c| c.branch_id.clone()),
        first_class_teacher_id: first.and_then(|c| c.teacher_id.clone()),
        first_class_attended,
        first_attendance_id: first_att.map(|r| r.id.clone()),
        first_attendance_date: first_att.map(|r| r.effective_date().to_string()),
        first_attendance_class_id: first_att.map(|r| r.class_instance_id.clone()),
        first_attendance_branch_id: fa_branch,
        first_attendance_teacher_id: fa_teacher,
        last_updated: now.to_string(),
    }
}
