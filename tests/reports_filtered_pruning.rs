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
    let exe = env!("CARGO_BIN_EXE_rapord");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rapord");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Seeded {
    student_id: String,
    teacher_a: String,
    root_ids: Vec<String>,
    second_root_child_id: String,
}

/// Three root aspects; the second root has one child. Grades: the second
/// root's child by teacher A, the third root by teacher B.
fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seeded {
    let student = request_ok(
        stdin,
        reader,
        "u1",
        "users.create",
        json!({ "name": "Budi", "email": "budi@school.test", "role": "student" }),
    );
    let teacher_a = request_ok(
        stdin,
        reader,
        "u2",
        "users.create",
        json!({ "name": "Teacher A", "email": "a@school.test", "role": "teacher" }),
    );
    let teacher_b = request_ok(
        stdin,
        reader,
        "u3",
        "users.create",
        json!({ "name": "Teacher B", "email": "b@school.test", "role": "teacher" }),
    );
    let student_id = student["userId"].as_str().expect("id").to_string();
    let teacher_a = teacher_a["userId"].as_str().expect("id").to_string();
    let teacher_b = teacher_b["userId"].as_str().expect("id").to_string();

    let template = request_ok(
        stdin,
        reader,
        "t1",
        "templates.create",
        json!({ "name": "Kurikulum 2025" }),
    );
    let template_id = template["templateId"].as_str().expect("id").to_string();
    request_ok(
        stdin,
        reader,
        "t2",
        "templates.activate",
        json!({ "templateId": template_id }),
    );

    let mut root_ids = Vec::new();
    for (i, name) in ["First", "Second", "Third"].iter().enumerate() {
        let aspect = request_ok(
            stdin,
            reader,
            &format!("a{}", i),
            "aspects.create",
            json!({ "templateId": template_id, "name": name, "inputType": "numeric", "order": i }),
        );
        root_ids.push(aspect["aspectId"].as_str().expect("id").to_string());
    }
    let child = request_ok(
        stdin,
        reader,
        "a9",
        "aspects.create",
        json!({ "templateId": template_id, "name": "Second Child", "inputType": "numeric",
                "parentId": root_ids[1], "order": 0 }),
    );
    let second_root_child_id = child["aspectId"].as_str().expect("id").to_string();

    request_ok(
        stdin,
        reader,
        "g1",
        "grades.submit",
        json!({
            "teacherId": teacher_a,
            "grades": [
                { "aspectId": second_root_child_id, "studentId": student_id, "value": "90" }
            ]
        }),
    );
    request_ok(
        stdin,
        reader,
        "g2",
        "grades.submit",
        json!({
            "teacherId": teacher_b,
            "grades": [
                { "aspectId": root_ids[2], "studentId": student_id, "value": "80" }
            ]
        }),
    );

    Seeded {
        student_id,
        teacher_a,
        root_ids,
        second_root_child_id,
    }
}

#[test]
fn aspect_filter_keeps_only_the_allowed_root_with_its_subtree() {
    let workspace = temp_dir("rapord-filter-aspect");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed(&mut stdin, &mut reader);

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.filtered",
        json!({
            "studentId": seeded.student_id,
            "aspectIds": [seeded.root_ids[1], seeded.second_root_child_id]
        }),
    );
    let structure = report["reportStructure"].as_array().expect("structure");
    assert_eq!(structure.len(), 1);
    assert_eq!(structure[0]["name"].as_str(), Some("Second"));
    let children = structure[0]["children"].as_array().expect("children");
    assert_eq!(children.len(), 1);
    assert_eq!(children[0]["name"].as_str(), Some("Second Child"));
    // Statistics describe the unfiltered report; only the structure is pruned.
    assert_eq!(
        report["summaryStatistics"]["totalAspects"].as_u64(),
        Some(4)
    );
}

// Regression pin: the filter recurses only into kept nodes, so an allowed
// descendant under a disallowed root stays pruned.
#[test]
fn descendant_of_a_disallowed_root_is_hard_pruned() {
    let workspace = temp_dir("rapord-filter-hard");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed(&mut stdin, &mut reader);

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.filtered",
        json!({
            "studentId": seeded.student_id,
            "aspectIds": [seeded.second_root_child_id]
        }),
    );
    assert_eq!(
        report["reportStructure"].as_array().map(|a| a.len()),
        Some(0)
    );
}

#[test]
fn teacher_filter_drops_only_nodes_graded_by_other_teachers() {
    let workspace = temp_dir("rapord-filter-teacher");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed(&mut stdin, &mut reader);

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.filtered",
        json!({
            "studentId": seeded.student_id,
            "teacherIds": [seeded.teacher_a]
        }),
    );
    let structure = report["reportStructure"].as_array().expect("structure");
    // Ungraded roots survive; the root graded by teacher B is dropped.
    let names: Vec<&str> = structure
        .iter()
        .filter_map(|n| n["name"].as_str())
        .collect();
    assert_eq!(names, vec!["First", "Second"]);
    let children = structure[1]["children"].as_array().expect("children");
    assert_eq!(children[0]["name"].as_str(), Some("Second Child"));
}

#[test]
fn absent_filters_leave_the_structure_untouched() {
    let workspace = temp_dir("rapord-filter-none");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed(&mut stdin, &mut reader);

    let plain = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.student",
        json!({ "studentId": seeded.student_id }),
    );
    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "reports.filtered",
        json!({ "studentId": seeded.student_id }),
    );
    assert_eq!(plain["reportStructure"], filtered["reportStructure"]);
}

// An explicit empty list is no filter, not "prune everything".
#[test]
fn empty_filter_lists_leave_the_structure_untouched() {
    let workspace = temp_dir("rapord-filter-empty");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed(&mut stdin, &mut reader);

    let plain = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.student",
        json!({ "studentId": seeded.student_id }),
    );
    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "reports.filtered",
        json!({ "studentId": seeded.student_id, "aspectIds": [], "teacherIds": [] }),
    );
    let structure = filtered["reportStructure"].as_array().expect("structure");
    assert_eq!(structure.len(), 3);
    assert_eq!(plain["reportStructure"], filtered["reportStructure"]);
}
