//! Lifecycle scenarios driving the gate, self-healer, fix queue, and task
//! tracker against real temp workspaces with scripted check runners.

use chrono::{Duration, Utc};

use toolgate::core::types::{FixStatus, IncidentSource, IncidentStatus, TaskStatus};
use toolgate::exit_codes;
use toolgate::fixes::{ProcessOutcome, process_one_task};
use toolgate::gate::{capture_pre_tool, run_gate};
use toolgate::heal::{HealOutcome, heal};
use toolgate::io::config::ToolgateConfig;
use toolgate::io::snapshot::{BaselineUnavailable, RollbackError, RollbackMethod};
use toolgate::io::state::{load_fix_queue, load_incidents, load_metrics, load_patterns};
use toolgate::session::Session;
use toolgate::tasks::{close_task, show_task, start_task};
use toolgate::test_support::{
    FailingStore, Scripted, ScriptedRunner, TestRepo, bash_event, check, edit_event,
};

fn lint_config() -> ToolgateConfig {
    let mut lint = check("lint");
    lint.signature_pattern = Some(r"\b(unused-import)\b".to_string());
    lint.guidance = Some("Remove unused imports.".to_string());
    ToolgateConfig {
        checks: vec![lint, check("test")],
        ..ToolgateConfig::default()
    }
}

fn checks(pairs: &[(&str, bool)]) -> Vec<(String, bool)> {
    pairs
        .iter()
        .map(|(name, ok)| (name.to_string(), *ok))
        .collect()
}

/// Diff limit passes, lint fails with `lint:unused-import`: the change is
/// rolled back, one incident and one pending fix task are recorded, and
/// `test` never runs.
#[test]
fn failing_lint_rolls_back_and_opens_incident() {
    let repo = TestRepo::new().expect("repo");
    let session = repo.session(lint_config());
    repo.write("app.py", "import os\nimport sys\n").expect("edit");
    let runner = ScriptedRunner::new(vec![Scripted::fail(
        1,
        "app.py:2:8: unused-import `sys` imported but unused",
    )]);

    let report = run_gate(&session, &runner, &edit_event(repo.path(), "app.py"), Utc::now())
        .expect("gate");

    assert!(!report.passed);
    assert_eq!(report.checks, checks(&[("diff_limit", true), ("lint", false)]));
    assert_eq!(report.failed_signature.as_deref(), Some("lint:unused-import"));
    assert!(report.rolled_back);
    assert_eq!(report.rollback_method, Some(RollbackMethod::GitCheckout));
    assert_eq!(report.exit_code(), exit_codes::REJECTED);
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(runner.calls(), vec![vec!["lint".to_string()]]);
    assert_eq!(repo.read("app.py").expect("read"), "import os\n");

    let store = session.store();
    let incidents = load_incidents(store);
    assert_eq!(incidents.len(), 1);
    let incident = &incidents[0];
    assert!(incident.classification.contains("lint"));
    assert_eq!(incident.source, IncidentSource::QualityGate);
    assert_eq!(incident.status, IncidentStatus::Linked);
    assert_eq!(incident.fix_task_id, report.fix_task_id);

    let queue = load_fix_queue(store);
    assert_eq!(queue.tasks().len(), 1);
    let task = &queue.tasks()[0];
    assert_eq!(task.status, FixStatus::Pending);
    assert_eq!(task.incident_id, incident.id);
    assert_eq!(task.verify_command, vec!["lint".to_string()]);
    assert_eq!(task.suggested_fix, "Remove unused imports.");

    let metrics = load_metrics(store);
    assert_eq!(metrics.runs, 1);
    assert_eq!(metrics.gate_failures, 1);
    assert_eq!(metrics.rollback_count, 1);
    assert_eq!(metrics.incidents_total, 1);
    assert_eq!(metrics.incidents_open, 1);
    assert_eq!(metrics.last_failed_check.as_deref(), Some("lint"));
    assert_eq!(
        load_patterns(store)
            .get("lint:unused-import")
            .map(|c| c.failure_count),
        Some(1)
    );
}

/// Over a mixed sequence, `runs == passes + fails` and every failure is
/// rolled back.
#[test]
fn run_counters_stay_consistent() {
    let repo = TestRepo::new().expect("repo");
    let session = repo.session(lint_config());
    let runner = ScriptedRunner::new(vec![
        Scripted::pass(),
        Scripted::pass(),
        Scripted::fail(1, "unused-import"),
        Scripted::pass(),
        Scripted::fail(1, "FAILED test_app.py"),
    ]);
    let event = edit_event(repo.path(), "app.py");
    let now = Utc::now();

    let outcomes: Vec<bool> = ["import os\n# a\n", "import os\n# b\n", "import os\n# c\n"]
        .iter()
        .map(|contents| {
            repo.write("app.py", contents).expect("edit");
            run_gate(&session, &runner, &event, now).expect("gate").passed
        })
        .collect();
    assert_eq!(outcomes, vec![true, false, false]);

    let metrics = load_metrics(session.store());
    assert_eq!(metrics.runs, 3);
    assert_eq!(metrics.runs, metrics.gate_passes + metrics.gate_failures);
    assert_eq!(metrics.rollback_count, metrics.gate_failures);
    let patterns = load_patterns(session.store());
    assert_eq!(patterns.get("quality_gate_pass").map(|c| c.success_count), Some(1));
    assert_eq!(patterns.get("test:fail").map(|c| c.failure_count), Some(1));
}

#[test]
fn diff_limit_fails_before_any_check_runs() {
    let repo = TestRepo::new().expect("repo");
    let session = repo.session(ToolgateConfig {
        diff_limit_lines: 2,
        ..lint_config()
    });
    repo.write("app.py", "a = 1\nb = 2\nc = 3\n").expect("edit");
    let runner = ScriptedRunner::default();

    let report = run_gate(&session, &runner, &edit_event(repo.path(), "app.py"), Utc::now())
        .expect("gate");

    assert_eq!(report.checks, checks(&[("diff_limit", false)]));
    assert_eq!(report.failed_signature.as_deref(), Some("diff:limit_exceeded:4"));
    assert!(runner.calls().is_empty());
    assert_eq!(repo.read("app.py").expect("read"), "import os\n");
}

#[test]
fn missing_optional_tool_degrades_but_missing_required_tool_fails() {
    let repo = TestRepo::new().expect("repo");
    let event = edit_event(repo.path(), "app.py");

    let session = repo.session(lint_config());
    let runner = ScriptedRunner::new(vec![Scripted::Missing, Scripted::pass()]);
    let report = run_gate(&session, &runner, &event, Utc::now()).expect("gate");
    assert!(report.passed);
    assert!(report.degraded);
    assert_eq!(report.skipped, vec!["lint".to_string()]);
    assert_eq!(report.checks, checks(&[("diff_limit", true), ("test", true)]));
    assert_eq!(report.exit_code(), exit_codes::DEGRADED);
    assert_eq!(load_metrics(session.store()).degraded_runs, 1);

    let mut config = lint_config();
    config.checks[0].required = true;
    let session = repo.session(config);
    let runner = ScriptedRunner::new(vec![Scripted::Missing]);
    let report = run_gate(&session, &runner, &event, Utc::now()).expect("gate");
    assert!(!report.passed);
    assert_eq!(report.failed_signature.as_deref(), Some("check:error"));
}

#[test]
fn timed_out_check_is_a_failure() {
    let repo = TestRepo::new().expect("repo");
    let session = repo.session(lint_config());
    repo.write("app.py", "import os\nwhile True: pass\n").expect("edit");
    let runner = ScriptedRunner::new(vec![Scripted::Timeout]);

    let report = run_gate(&session, &runner, &edit_event(repo.path(), "app.py"), Utc::now())
        .expect("gate");

    assert!(!report.passed);
    assert_eq!(report.failed_signature.as_deref(), Some("check:error"));
    assert!(report.rolled_back);
    assert_eq!(repo.read("app.py").expect("read"), "import os\n");
}

/// Outside git, the pre-tool snapshot restores edited files and removes
/// files the tool created.
#[test]
fn pre_tool_snapshot_restores_plain_workspace() {
    let repo = TestRepo::plain().expect("dir");
    let session = repo.session(lint_config());
    repo.write("notes.txt", "v1\n").expect("seed");
    let now = Utc::now();

    let edit = edit_event(repo.path(), "notes.txt");
    let created = edit_event(repo.path(), "new.txt");
    capture_pre_tool(&session, &edit, now).expect("snapshot edit");
    let snapshot = capture_pre_tool(&session, &created, now + Duration::seconds(1))
        .expect("snapshot create");
    assert_eq!(snapshot.files, vec!["new.txt".to_string()]);
    repo.write("new.txt", "fresh\n").expect("create");

    let runner = ScriptedRunner::new(vec![Scripted::fail(1, "")]);
    let report = run_gate(&session, &runner, &created, now + Duration::seconds(2)).expect("gate");
    assert_eq!(report.rollback_method, Some(RollbackMethod::SnapshotRestore));
    assert_eq!(report.checks, checks(&[("lint", false)]));
    assert_eq!(report.failed_signature.as_deref(), Some("lint:fail"));
    assert!(!repo.path().join("new.txt").exists());

    // The older pending snapshot is consumed by the next run.
    repo.write("notes.txt", "v2\n").expect("edit");
    let runner = ScriptedRunner::new(vec![Scripted::fail(1, "")]);
    run_gate(&session, &runner, &edit, now + Duration::seconds(3)).expect("gate");
    assert_eq!(repo.read("notes.txt").expect("read"), "v1\n");
}

/// Outside git and without a pre-tool snapshot, the only baseline is the
/// post-change content: the change is rejected but not reported as rolled back.
#[test]
fn rejection_without_pre_change_baseline_is_not_a_rollback() {
    let repo = TestRepo::plain().expect("dir");
    let session = repo.session(lint_config());
    repo.write("notes.txt", "edited\n").expect("edit");
    let runner = ScriptedRunner::new(vec![Scripted::fail(1, "unused-import")]);

    let report = run_gate(&session, &runner, &edit_event(repo.path(), "notes.txt"), Utc::now())
        .expect("gate");

    assert!(!report.passed);
    assert!(!report.baseline_pre_change);
    assert!(!report.rolled_back);
    assert_eq!(report.rollback_method, None);
    assert_eq!(report.exit_code(), exit_codes::REJECTED);
    assert_eq!(repo.read("notes.txt").expect("read"), "edited\n");
    assert_eq!(load_incidents(session.store()).len(), 1);

    let metrics = load_metrics(session.store());
    assert_eq!(metrics.gate_failures, 1);
    assert_eq!(metrics.rollback_count, 0);
}

/// A restore that cannot write the file back is fatal and typed.
#[test]
fn failed_restore_surfaces_rollback_error() {
    let repo = TestRepo::plain().expect("dir");
    let session = repo.session(lint_config());
    repo.write("notes.txt", "v1\n").expect("seed");
    let edit = edit_event(repo.path(), "notes.txt");
    let now = Utc::now();
    capture_pre_tool(&session, &edit, now).expect("snapshot");

    // The tool replaced the file with a directory; copying the file back fails.
    std::fs::remove_file(repo.path().join("notes.txt")).expect("remove");
    repo.write("notes.txt/inner.txt", "x").expect("replace with dir");

    let runner = ScriptedRunner::new(vec![Scripted::fail(1, "")]);
    let err = run_gate(&session, &runner, &edit, now + Duration::seconds(1))
        .expect_err("rollback must fail");
    assert!(
        matches!(
            err.downcast_ref::<RollbackError>(),
            Some(RollbackError::Restore { path, .. }) if path == "notes.txt"
        ),
        "{err:#}"
    );

    // Bookkeeping happened before the rollback was attempted.
    let metrics = load_metrics(session.store());
    assert_eq!(metrics.gate_failures, 1);
    assert_eq!(metrics.rollback_count, 0);
    assert_eq!(load_incidents(session.store()).len(), 1);
}

/// Every state write fails: the failure is still rolled back and the write
/// errors are listed on the report.
#[test]
fn rollback_runs_even_when_every_state_write_fails() {
    let repo = TestRepo::new().expect("repo");
    let session = Session::with_store(repo.paths(), lint_config(), FailingStore::all());
    repo.write("app.py", "import os\nimport sys\n").expect("edit");
    let runner = ScriptedRunner::new(vec![Scripted::fail(1, "unused-import")]);

    let report = run_gate(&session, &runner, &edit_event(repo.path(), "app.py"), Utc::now())
        .expect("gate");

    assert!(!report.passed);
    assert!(report.rolled_back);
    assert_eq!(report.rollback_method, Some(RollbackMethod::GitCheckout));
    assert_eq!(report.incident_id, None);
    assert_eq!(repo.read("app.py").expect("read"), "import os\n");
    for what in ["record failure pattern", "record incident", "update metrics"] {
        assert!(
            report.errors.iter().any(|err| err.starts_with(what)),
            "{what} missing from {:?}",
            report.errors
        );
    }
}

/// No baseline, no checks: the gate fails closed with a typed error.
#[test]
fn unusable_snapshot_dir_fails_before_any_check() {
    let repo = TestRepo::plain().expect("dir");
    let session = repo.session(lint_config());
    std::fs::create_dir_all(&session.paths.state_dir).expect("state dir");
    std::fs::write(&session.paths.snapshots_dir, "not a directory").expect("block snapshots");
    repo.write("notes.txt", "edited\n").expect("edit");
    let runner = ScriptedRunner::new(Vec::new());

    let err = run_gate(&session, &runner, &edit_event(repo.path(), "notes.txt"), Utc::now())
        .expect_err("no baseline");
    assert!(err.downcast_ref::<BaselineUnavailable>().is_some(), "{err:#}");
    assert!(runner.calls().is_empty());
    assert_eq!(load_metrics(session.store()).runs, 0);
}

/// Tool fails with a missing-module message: import incident, pending fix
/// task, class pattern failure +1. Processing the task verifies it.
#[test]
fn missing_module_incident_is_verified_by_fix_queue() {
    let repo = TestRepo::new().expect("repo");
    let session = repo.session(ToolgateConfig::default());
    let now = Utc::now();

    let outcome = heal(
        &session,
        &bash_event(
            "python app.py",
            1,
            "Traceback (most recent call last):\nModuleNotFoundError: No module named 'yaml'",
        ),
        now,
    )
    .expect("heal");
    let HealOutcome::Incident {
        classification,
        fix_task_id,
        verify_command,
        ..
    } = outcome
    else {
        panic!("expected incident");
    };
    assert_eq!(classification.as_str(), "import_error");
    assert_eq!(verify_command, vec!["python3", "-B", "-c", "import yaml"]);

    let store = session.store();
    assert_eq!(load_incidents(store).len(), 1);
    assert_eq!(load_fix_queue(store).stats().pending, 1);
    assert_eq!(
        load_patterns(store)
            .get("incident:import_error")
            .map(|c| c.failure_count),
        Some(1)
    );

    let runner = ScriptedRunner::new(vec![Scripted::pass()]);
    let processed = process_one_task(&session, &runner, now).expect("process");
    let ProcessOutcome::Processed { task_id, status, .. } = processed else {
        panic!("expected processed task");
    };
    assert_eq!(Some(task_id), fix_task_id);
    assert_eq!(status, FixStatus::Completed);
    assert_eq!(runner.calls(), vec![verify_command]);

    let metrics = load_metrics(store);
    assert_eq!(metrics.fixes_completed, 1);
    assert_eq!(metrics.incidents_open, 0);
    assert_eq!(
        process_one_task(&session, &runner, now).expect("process"),
        ProcessOutcome::NoPendingTask
    );
}

/// Start task, pass a gate, close with success.
#[test]
fn task_progress_accrues_from_passing_gates() {
    let repo = TestRepo::new().expect("repo");
    let session = repo.session(lint_config());
    let now = Utc::now();

    let started = start_task(&session, "add logging", now).expect("start");
    assert_eq!(started.progress, 0.0);

    repo.write("app.py", "import os\nprint(os.getcwd())\n").expect("edit");
    let runner = ScriptedRunner::new(vec![Scripted::pass(), Scripted::pass()]);
    let report = run_gate(&session, &runner, &edit_event(repo.path(), "app.py"), now)
        .expect("gate");
    assert!(report.passed);
    let effect = report.task.expect("task advanced");
    assert_eq!(effect.task_id, started.id);

    let active = show_task(&session).expect("active");
    assert!(active.progress > started.progress);
    assert_eq!(active.progress_events, 1);
    assert_eq!(repo.read("app.py").expect("read"), "import os\nprint(os.getcwd())\n");

    let closed = close_task(&session, true, "done", now + Duration::seconds(90)).expect("close");
    assert_eq!(closed.task.status, TaskStatus::ClosedSuccess);
    assert_eq!(show_task(&session), None);

    let metrics = load_metrics(session.store());
    assert_eq!(metrics.tasks_completed, 1);
    assert_eq!(metrics.tasks_successful, 1);
    assert_eq!(metrics.success_rate, 1.0);
    assert_eq!(metrics.mean_time_to_close_task, Some(90.0));
    assert_eq!(metrics.task_progress_events, 1);
}

#[test]
fn gate_failure_notes_active_task() {
    let repo = TestRepo::new().expect("repo");
    let session = repo.session(lint_config());
    let now = Utc::now();
    start_task(&session, "refactor", now).expect("start");

    repo.write("app.py", "import os, sys\n").expect("edit");
    let runner = ScriptedRunner::new(vec![Scripted::fail(1, "unused-import")]);
    run_gate(&session, &runner, &edit_event(repo.path(), "app.py"), now).expect("gate");

    let active = show_task(&session).expect("active");
    assert_eq!(active.progress, 0.0);
    assert_eq!(active.notes, vec!["quality_gate_fail:lint:unused-import".to_string()]);
    assert_eq!(active.last_gate_fail_at, Some(now));
}
