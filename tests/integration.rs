//! End-to-end scenarios driven through `Engine` with
//! `IsolationMode::Bypass`, so the full job lifecycle — submit, run,
//! stop, delete — and workflow dependency resolution exercise real code
//! paths without requiring root or a real cgroup v2 hierarchy.

use std::time::Duration;

use joblet::config::{IsolationModeConfig, JobletConfig};
use joblet::engine::Engine;
use joblet::errors::ErrorKind;
use joblet::model::{JobSpec, JobStatus};
use joblet::rpc::JobletApi;
use joblet::workflow::WorkflowYaml;

fn bypass_engine() -> Engine {
    let mut config = JobletConfig::default();
    config.isolation_mode = IsolationModeConfig::Bypass;
    Engine::new(&config, std::path::PathBuf::from("/proc/self/exe"))
}

#[test]
fn job_lifecycle_run_then_stop_then_delete() {
    let engine = bypass_engine();

    let id = engine
        .submit_job(JobSpec { command: "/bin/sleep".into(), args: vec!["5".into()], ..Default::default() })
        .unwrap();

    let job = engine.get_job(&id.to_string()).unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.pid.is_some());

    engine.stop_job(id).unwrap();
    let stopped = engine.get_job(&id.to_string()).unwrap();
    assert_eq!(stopped.status, JobStatus::Stopped);

    engine.delete_job(id).unwrap();
    let err = engine.get_job(&id.to_string()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[test]
fn job_with_empty_command_is_rejected_before_launch() {
    let engine = bypass_engine();
    let err = engine.submit_job(JobSpec::default()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
}

#[test]
fn stopping_an_already_terminal_job_is_idempotent() {
    let engine = bypass_engine();
    let id = engine
        .submit_job(JobSpec { command: "/bin/true".into(), ..Default::default() })
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    engine.stop_job(id).unwrap();
    // Second stop on an already-stopped job must not error.
    engine.stop_job(id).unwrap();
}

#[test]
fn list_jobs_reflects_every_submission() {
    let engine = bypass_engine();
    for _ in 0..3 {
        engine
            .submit_job(JobSpec { command: "/bin/true".into(), ..Default::default() })
            .unwrap();
    }
    assert_eq!(engine.list_jobs().unwrap().len(), 3);
}

#[test]
fn workflow_with_linear_dependency_starts_only_the_root() {
    let engine = bypass_engine();
    let yaml = r#"
name: two-step
jobs:
  first:
    command: /bin/true
  second:
    command: /bin/true
dependencies:
  - from: first
    to: second
    condition: success
"#;
    let definition = WorkflowYaml::parse(yaml).unwrap();
    let workflow_id = engine.submit_workflow(definition).unwrap();

    let record = engine.get_workflow(workflow_id).unwrap();
    assert_eq!(record.jobs, vec!["first", "second"]);

    // Only "first" (the root) has been launched; "second" awaits the
    // resolver's `advance` call once "first" reaches a terminal status.
    let first_id = record.job_ids["first"];
    let first_job = engine.get_job(&first_id.to_string()).unwrap();
    assert_eq!(first_job.status, JobStatus::Running);
}

#[test]
fn workflow_rejects_a_dependency_cycle() {
    let engine = bypass_engine();
    let yaml = r#"
jobs:
  a:
    command: /bin/true
  b:
    command: /bin/true
dependencies:
  - from: a
    to: b
  - from: b
    to: a
"#;
    let definition = WorkflowYaml::parse(yaml).unwrap();
    let err = engine.submit_workflow(definition).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
}

#[test]
fn volume_lifecycle_create_list_delete() {
    let engine = bypass_engine();
    let volume = joblet::model::Volume::new(
        "scratch".into(),
        joblet::model::VolumeKind::Tmpfs,
        "/tmp/joblet-scratch".into(),
        64,
    );
    engine.create_volume(volume).unwrap();
    assert_eq!(engine.list_volumes().unwrap().len(), 1);
    engine.delete_volume("scratch").unwrap();
    assert_eq!(engine.list_volumes().unwrap().len(), 0);
}

#[test]
fn tailing_logs_for_a_job_with_no_chunks_yet_is_not_found() {
    let engine = bypass_engine();
    let id = engine
        .submit_job(JobSpec { command: "/bin/true".into(), ..Default::default() })
        .unwrap();
    let err = engine.tail_logs(id).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[test]
fn workflow_job_specs_round_trip_through_submit() {
    let engine = bypass_engine();
    let yaml = "jobs:\n  solo:\n    command: /bin/true\n";
    let definition = WorkflowYaml::parse(yaml).unwrap();
    let workflow_id = engine.submit_workflow(definition).unwrap();
    let record = engine.get_workflow(workflow_id).unwrap();
    assert_eq!(record.jobs.len(), 1);
}
