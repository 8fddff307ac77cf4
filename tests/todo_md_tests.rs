//! Source-of-truth file protocol: backlog append and section moves.

use fleetgate::fleetgate::todo_md::{format_formula_task, TodoState};
use fleetgate::TodoFile;

#[test]
fn test_backlog_append_and_done_move_exact_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("todo.md");
    std::fs::write(
        &path,
        "## Backlog\n- [ ] T500: foo @agent\n## Active\n\n## Delayed\n\n## Done\n",
    )
    .unwrap();
    let todo = TodoFile::new(&path);

    todo.append_to_backlog(&["- [ ] T501: bar @agent".to_string()])
        .unwrap();
    todo.move_to_active("T501").unwrap();
    todo.mark_done("T501", "ok").unwrap();

    let all = todo.read_all();
    // Backlog contains only T500.
    assert_eq!(all["Backlog"].len(), 1);
    assert_eq!(all["Backlog"][0].task_id, "T500");
    // Active is empty — T501 moved through.
    assert!(all["Active"].is_empty());
    // Done contains exactly the expected line.
    assert_eq!(all["Done"].len(), 1);
    assert_eq!(
        all["Done"][0].raw_line.trim(),
        "- [x] T501: bar (ok) **DONE** @agent"
    );
    assert_eq!(all["Done"][0].state, TodoState::Done);
}

#[test]
fn test_parse_write_parse_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("todo.md");
    std::fs::write(
        &path,
        "# Tasks\n\n## Backlog\n- [ ] T1: alpha @agent\n- [~] T2: beta **BLOCKED** @human\nnot a task line\n\n## Active\n\n## Delayed\n- [ ] T3: gamma @agent\n\n## Done\n- [x] T4: delta **DONE** @agent\n",
    )
    .unwrap();
    let todo = TodoFile::new(&path);

    let before = todo.read_all();
    // A write that touches one line must leave every other parsed line
    // intact: parse(write(parse(f))) == parse(f) for the untouched set.
    todo.mark_in_progress("T1").unwrap();
    let after = todo.read_all();

    assert_eq!(after["Backlog"][1].raw_line, before["Backlog"][1].raw_line);
    assert_eq!(after["Delayed"][0].raw_line, before["Delayed"][0].raw_line);
    assert_eq!(after["Done"][0].raw_line, before["Done"][0].raw_line);
    assert_eq!(after["Backlog"][0].state, TodoState::InProgress);

    // The unparseable line is left untouched in the file.
    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains("not a task line"));
}

#[test]
fn test_formula_lines_allocate_monotonic_ids() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("todo.md");
    std::fs::write(
        &path,
        "# Tasks\n\n## Backlog\n- [ ] T7: existing @agent\n\n## Active\n\n## Delayed\n\n## Done\n",
    )
    .unwrap();
    let todo = TodoFile::new(&path);

    let ids = todo.next_task_ids(3);
    assert_eq!(ids, vec!["T8", "T9", "T10"]);

    let lines: Vec<String> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            format_formula_task(id, "demo", &format!("step {}", i), None, "do it", "@agent")
        })
        .collect();
    let appended = todo.append_to_backlog(&lines).unwrap();
    assert_eq!(appended, ids);

    // Allocation stays monotonic after the append.
    assert_eq!(todo.next_task_ids(1), vec!["T11"]);
    assert_eq!(todo.read_all()["Backlog"].len(), 4);
}
