//! The workflow execution loop: submits root jobs
//! immediately, and as each job reaches a terminal state evaluates every
//! downstream edge's condition to decide whether to submit, skip, or
//! cascade a cancellation to the rest of a branch whose blocking edge
//! condition can never be satisfied.
//!
//! Progression is event-driven: every job started on behalf of a
//! workflow gets a background watcher subscribed to its State Store
//! change feed, which calls `advance` itself once that job reaches a
//! terminal status. Nothing outside this module ever needs to call
//! `advance` directly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::errors::Result;
use crate::model::{JobSpec, JobStatus, WorkflowRecord, WorkflowStatus};
use crate::state_store::StateStore;

use super::graph::Graph;
use super::yaml::WorkflowYaml;

/// What the resolver needs from the executor, kept as a trait so
/// workflow tests can run against a fake launcher instead of real
/// namespaces/cgroups (mirrors `executor::JobLauncher`'s own split).
pub trait JobStarter: Send + Sync {
    fn start(&self, job_id: Uuid, spec: JobSpec) -> Result<()>;
    fn stop(&self, job_id: Uuid) -> Result<()>;
}

struct ResolverInner {
    store: Arc<StateStore>,
    starter: Arc<dyn JobStarter>,
    /// Job specs for each in-flight workflow, keyed by workflow id; looked
    /// up by `advance` when it decides what to start next. Entries are
    /// dropped once a workflow reaches a terminal status.
    job_specs: Mutex<HashMap<Uuid, BTreeMap<String, JobSpec>>>,
}

/// Cheap to clone (backed by a single `Arc`), so the background watchers
/// it spawns can each hold their own handle back into the resolver.
#[derive(Clone)]
pub struct WorkflowResolver(Arc<ResolverInner>);

impl WorkflowResolver {
    pub fn new(store: Arc<StateStore>, starter: Arc<dyn JobStarter>) -> Self {
        WorkflowResolver(Arc::new(ResolverInner {
            store,
            starter,
            job_specs: Mutex::new(HashMap::new()),
        }))
    }

    /// Submit a workflow definition: allocate job IDs for every named job,
    /// build the dependency graph, persist the `WorkflowRecord`, and start
    /// every root job. Returns the workflow's id.
    pub fn submit(&self, definition: &WorkflowYaml, job_specs: BTreeMap<String, JobSpec>) -> Result<Uuid> {
        let names = definition.job_names();
        let edges = definition.dependency_edges();
        let graph = Graph::build(&names, &edges)?;

        let mut job_ids = BTreeMap::new();
        for name in &names {
            job_ids.insert(name.clone(), crate::idgen::new_job_id());
        }

        let workflow_id = crate::idgen::new_job_id();
        let record = WorkflowRecord {
            id: workflow_id,
            source_yaml: definition.to_yaml()?,
            jobs: names.clone(),
            edges,
            status: WorkflowStatus::Running,
            job_ids: job_ids.clone(),
        };
        self.0.store.create_workflow(record);
        self.0.job_specs.lock().insert(workflow_id, job_specs.clone());

        for root in graph.roots() {
            if let Some(spec) = job_specs.get(root) {
                let id = job_ids[root];
                self.0.starter.start(id, spec.clone())?;
                self.watch_job(workflow_id, root.to_string(), id);
            }
        }

        Ok(workflow_id)
    }

    /// Call when a job inside a workflow reaches a terminal status:
    /// evaluate every downstream edge, starting jobs whose condition is
    /// satisfied and cascading cancellation down branches whose condition
    /// fails.
    pub fn advance(&self, workflow_id: Uuid, finished_job_name: &str) -> Result<()> {
        let Some(mut record) = self.0.store.get_workflow(workflow_id) else {
            return Ok(());
        };
        let graph = Graph::build(&record.jobs, &record.edges)?;

        let statuses = self.collect_statuses(&record);
        let Some(&finished_status) = statuses.get(finished_job_name) else {
            return Ok(());
        };

        let job_specs = self.0.job_specs.lock().get(&workflow_id).cloned().unwrap_or_default();

        for downstream_name in graph.downstream_of(finished_job_name) {
            let edge = graph
                .upstream_edges_of(downstream_name)
                .find(|e| e.from == finished_job_name);
            let Some(edge) = edge else { continue };

            if edge.condition.evaluate(finished_status, &statuses) {
                if let Some(spec) = job_specs.get(downstream_name) {
                    if let Some(&id) = record.job_ids.get(downstream_name) {
                        self.0.starter.start(id, spec.clone())?;
                        self.watch_job(workflow_id, downstream_name.to_string(), id);
                    }
                }
            } else {
                self.cancel_branch(&graph, downstream_name, &mut record)?;
            }
        }

        if self.is_workflow_done(&record) {
            record.status = if statuses.values().any(|s| *s == JobStatus::Failed) {
                WorkflowStatus::Failed
            } else {
                WorkflowStatus::Completed
            };
            self.0.job_specs.lock().remove(&workflow_id);
        }
        self.0.store.update_workflow(workflow_id, record)?;
        Ok(())
    }

    /// Spawn a background watcher for one workflow job: subscribes to its
    /// State Store change feed and calls `advance` itself the moment the
    /// job reaches a terminal status, so progression needs no external
    /// poller. Subscribing before reading the job's current status closes
    /// the race against a job that finishes before the watcher attaches:
    /// any transition published after `subscribe_job` arrives on `rx`,
    /// and anything that happened before is caught by the direct read.
    fn watch_job(&self, workflow_id: Uuid, job_name: String, job_id: Uuid) {
        let resolver = self.clone();
        let store = self.0.store.clone();
        std::thread::spawn(move || {
            let (history, rx) = store.subscribe_job(job_id);
            let mut latest = history.into_iter().last().or_else(|| store.get_job(job_id));
            loop {
                if let Some(job) = &latest {
                    if job.status.is_terminal() {
                        let _ = resolver.advance(workflow_id, &job_name);
                        return;
                    }
                }
                match rx.recv() {
                    Ok(job) => latest = Some(job),
                    Err(_) => return,
                }
            }
        });
    }

    fn cancel_branch(&self, graph: &Graph, start: &str, record: &mut WorkflowRecord) -> Result<()> {
        let mut stack = vec![start.to_string()];
        while let Some(name) = stack.pop() {
            if let Some(&id) = record.job_ids.get(&name) {
                self.0.starter.stop(id).ok();
            }
            stack.extend(graph.downstream_of(&name).map(|s| s.to_string()));
        }
        record.status = WorkflowStatus::Cancelled;
        Ok(())
    }

    fn collect_statuses(&self, record: &WorkflowRecord) -> BTreeMap<String, JobStatus> {
        record
            .job_ids
            .iter()
            .filter_map(|(name, id)| self.0.store.get_job(*id).map(|j| (name.clone(), j.status)))
            .collect()
    }

    fn is_workflow_done(&self, record: &WorkflowRecord) -> bool {
        record
            .job_ids
            .values()
            .all(|id| self.0.store.get_job(*id).map(|j| j.status.is_terminal()).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobSpec;
    use std::sync::Mutex as StdMutex;

    struct RecordingStarter {
        started: StdMutex<Vec<Uuid>>,
        stopped: StdMutex<Vec<Uuid>>,
    }

    impl JobStarter for RecordingStarter {
        fn start(&self, job_id: Uuid, _spec: JobSpec) -> Result<()> {
            self.started.lock().unwrap().push(job_id);
            Ok(())
        }
        fn stop(&self, job_id: Uuid) -> Result<()> {
            self.stopped.lock().unwrap().push(job_id);
            Ok(())
        }
    }

    #[test]
    fn submit_starts_only_root_jobs() {
        let store = Arc::new(StateStore::new());
        let starter = Arc::new(RecordingStarter { started: Default::default(), stopped: Default::default() });
        let resolver = WorkflowResolver::new(store, starter.clone());

        let yaml = r#"
jobs:
  build:
    command: make
  test:
    command: make
dependencies:
  - from: build
    to: test
"#;
        let def = WorkflowYaml::parse(yaml).unwrap();
        let mut specs = BTreeMap::new();
        specs.insert("build".to_string(), JobSpec { command: "make".into(), ..Default::default() });
        specs.insert("test".to_string(), JobSpec { command: "make".into(), ..Default::default() });

        resolver.submit(&def, specs).unwrap();
        assert_eq!(starter.started.lock().unwrap().len(), 1);
    }
}
