use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_studiod");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn studiod");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn result_str(resp: &serde_json::Value, key: &str) -> String {
    resp.get("result")
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing result.{}", key))
        .to_string()
}

fn error_code(resp: &serde_json::Value) -> &str {
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

struct Harness {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
    workspace: PathBuf,
}

impl Harness {
    fn start(prefix: &str) -> Self {
        let workspace = temp_dir(prefix);
        let (child, mut stdin, mut reader) = spawn_sidecar();
        let _ = request(
            &mut stdin,
            &mut reader,
            "ws",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        Harness {
            child,
            stdin,
            reader,
            next_id: 1,
            workspace,
        }
    }

    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = format!("r{}", self.next_id);
        self.next_id += 1;
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn finish(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(self.workspace);
    }
}

#[test]
fn marking_requires_a_valid_link_and_updates_stats_reactively() {
    let mut h = Harness::start("studiod-mark");

    let tenant_a = h.call("tenants.create", json!({ "name": "Studio A" }));
    let tenant_a_id = result_str(&tenant_a, "tenantId");
    let tenant_b = h.call("tenants.create", json!({ "name": "Studio B" }));
    let tenant_b_id = result_str(&tenant_b, "tenantId");

    let student = h.call(
        "students.create",
        json!({ "tenantId": tenant_a_id, "lastName": "Hart", "firstName": "Noor" }),
    );
    let student_id = result_str(&student, "studentId");

    let instance = h.call(
        "classInstances.create",
        json!({
            "tenantId": tenant_a_id,
            "date": "2025-02-03",
            "teacherId": "t-1",
            "branchId": "riverside"
        }),
    );
    let instance_id = result_str(&instance, "classInstanceId");
    let _ = h.call(
        "classInstances.setMembers",
        json!({
            "tenantId": tenant_a_id,
            "classInstanceId": instance_id,
            "studentIds": [student_id]
        }),
    );

    let link_a = h.call(
        "links.create",
        json!({ "tenantId": tenant_a_id, "teacherId": "t-1" }),
    );
    let token_a = result_str(&link_a, "token");
    let link_b = h.call(
        "links.create",
        json!({ "tenantId": tenant_b_id, "teacherId": "t-9" }),
    );
    let token_b = result_str(&link_b, "token");

    // Unknown token, cross-tenant token, bad status, unknown instance.
    let resp = h.call(
        "attendance.mark",
        json!({
            "token": "no-such-token",
            "tenantId": tenant_a_id,
            "classInstanceId": instance_id,
            "studentId": student_id,
            "status": "present"
        }),
    );
    assert_eq!(error_code(&resp), "not_found");

    let resp = h.call(
        "attendance.mark",
        json!({
            "token": token_b,
            "tenantId": tenant_a_id,
            "classInstanceId": instance_id,
            "studentId": student_id,
            "status": "present"
        }),
    );
    assert_eq!(error_code(&resp), "permission_denied");

    let resp = h.call(
        "attendance.mark",
        json!({
            "token": token_a,
            "tenantId": tenant_a_id,
            "classInstanceId": instance_id,
            "studentId": student_id,
            "status": "tardy"
        }),
    );
    assert_eq!(error_code(&resp), "invalid_argument");

    let resp = h.call(
        "attendance.mark",
        json!({
            "token": token_a,
            "tenantId": tenant_a_id,
            "classInstanceId": "missing-instance",
            "studentId": student_id,
            "status": "present"
        }),
    );
    assert_eq!(error_code(&resp), "not_found");

    // First valid mark.
    let resp = h.call(
        "attendance.mark",
        json!({
            "token": token_a,
            "tenantId": tenant_a_id,
            "classInstanceId": instance_id,
            "studentId": student_id,
            "status": "present"
        }),
    );
    let attendance_id = result_str(&resp, "attendanceId");
    assert_eq!(
        attendance_id,
        format!("{}_{}", instance_id, student_id)
    );
    assert_eq!(
        resp.get("result")
            .and_then(|v| v.get("overwritten"))
            .and_then(|v| v.as_bool()),
        Some(false)
    );

    // Stats were recomputed before the mark response was written.
    let resp = h.call(
        "stats.get",
        json!({ "tenantId": tenant_a_id, "studentId": student_id }),
    );
    let stats = resp
        .get("result")
        .and_then(|v| v.get("stats"))
        .expect("stats");
    assert_eq!(
        stats.get("firstClassAttended").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        stats.get("firstAttendanceId").and_then(|v| v.as_str()),
        Some(attendance_id.as_str())
    );
    assert_eq!(
        stats.get("firstAttendanceDate").and_then(|v| v.as_str()),
        Some("2025-02-03")
    );
    assert_eq!(
        stats.get("firstAttendanceBranchId").and_then(|v| v.as_str()),
        Some("riverside")
    );

    // Re-marking the same student in the same instance overwrites in place.
    let resp = h.call(
        "attendance.mark",
        json!({
            "token": token_a,
            "tenantId": tenant_a_id,
            "classInstanceId": instance_id,
            "studentId": student_id,
            "status": "late"
        }),
    );
    assert_eq!(result_str(&resp, "attendanceId"), attendance_id);
    assert_eq!(
        resp.get("result")
            .and_then(|v| v.get("overwritten"))
            .and_then(|v| v.as_bool()),
        Some(true)
    );

    let resp = h.call(
        "attendance.list",
        json!({ "tenantId": tenant_a_id, "studentId": student_id }),
    );
    let records = resp
        .get("result")
        .and_then(|v| v.get("records"))
        .and_then(|v| v.as_array())
        .expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].get("status").and_then(|v| v.as_str()),
        Some("late")
    );

    // Revoked and expired links are both rejected.
    let _ = h.call(
        "links.revoke",
        json!({ "tenantId": tenant_a_id, "token": token_a }),
    );
    let resp = h.call(
        "attendance.mark",
        json!({
            "token": token_a,
            "tenantId": tenant_a_id,
            "classInstanceId": instance_id,
            "studentId": student_id,
            "status": "present"
        }),
    );
    assert_eq!(error_code(&resp), "permission_denied");

    let stale = h.call(
        "links.create",
        json!({
            "tenantId": tenant_a_id,
            "teacherId": "t-1",
            "expiresAt": "2020-01-01T00:00:00Z"
        }),
    );
    let stale_token = result_str(&stale, "token");
    let resp = h.call(
        "attendance.mark",
        json!({
            "token": stale_token,
            "tenantId": tenant_a_id,
            "classInstanceId": instance_id,
            "studentId": student_id,
            "status": "present"
        }),
    );
    assert_eq!(error_code(&resp), "permission_denied");

    h.finish();
}

#[test]
fn first_attendance_policy_controls_which_record_counts() {
    let mut h = Harness::start("studiod-policy");

    let tenant = h.call("tenants.create", json!({ "name": "Policy Studio" }));
    let tenant_id = result_str(&tenant, "tenantId");
    let student = h.call(
        "students.create",
        json!({ "tenantId": tenant_id, "lastName": "Quist", "firstName": "Ari" }),
    );
    let student_id = result_str(&student, "studentId");

    let early = h.call(
        "classInstances.create",
        json!({ "tenantId": tenant_id, "date": "2025-01-05" }),
    );
    let early_id = result_str(&early, "classInstanceId");
    let later = h.call(
        "classInstances.create",
        json!({ "tenantId": tenant_id, "date": "2025-01-12" }),
    );
    let later_id = result_str(&later, "classInstanceId");
    for id in [&early_id, &later_id] {
        let _ = h.call(
            "classInstances.setMembers",
            json!({
                "tenantId": tenant_id,
                "classInstanceId": id,
                "studentIds": [student_id]
            }),
        );
    }

    let link = h.call(
        "links.create",
        json!({ "tenantId": tenant_id, "teacherId": "t-2" }),
    );
    let token = result_str(&link, "token");
    let _ = h.call(
        "attendance.mark",
        json!({
            "token": token,
            "tenantId": tenant_id,
            "classInstanceId": early_id,
            "studentId": student_id,
            "status": "excused"
        }),
    );
    let _ = h.call(
        "attendance.mark",
        json!({
            "token": token,
            "tenantId": tenant_id,
            "classInstanceId": later_id,
            "studentId": student_id,
            "status": "present"
        }),
    );

    // Default policy counts every record, so the excused one wins on date.
    let resp = h.call(
        "stats.get",
        json!({ "tenantId": tenant_id, "studentId": student_id }),
    );
    let stats = resp
        .get("result")
        .and_then(|v| v.get("stats"))
        .expect("stats");
    assert_eq!(
        stats.get("firstAttendanceClassId").and_then(|v| v.as_str()),
        Some(early_id.as_str())
    );
    assert_eq!(
        stats.get("firstClassAttended").and_then(|v| v.as_bool()),
        Some(true)
    );

    let resp = h.call(
        "stats.configure",
        json!({ "firstAttendancePolicy": "present_late" }),
    );
    assert_eq!(
        result_str(&resp, "firstAttendancePolicy"),
        "present_late"
    );
    let resp = h.call(
        "stats.configure",
        json!({ "firstAttendancePolicy": "sometimes" }),
    );
    assert_eq!(error_code(&resp), "invalid_argument");

    let resp = h.call(
        "stats.recompute",
        json!({ "tenantId": tenant_id, "studentId": student_id }),
    );
    let stats = resp
        .get("result")
        .and_then(|v| v.get("stats"))
        .expect("stats");
    assert_eq!(
        stats.get("firstAttendanceClassId").and_then(|v| v.as_str()),
        Some(later_id.as_str())
    );
    assert_eq!(
        stats.get("firstAttendanceDate").and_then(|v| v.as_str()),
        Some("2025-01-12")
    );
    // The attended flag still considers every status.
    assert_eq!(
        stats.get("firstClassAttended").and_then(|v| v.as_bool()),
        Some(true)
    );

    h.finish();
}
