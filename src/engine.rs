//! Wires the State Store, Job Executor, Log Pipeline, and Workflow
//! Resolver into one handle implementing `JobletApi` — the daemon's
//! single entry point, behind a trait so `rnx` and tests share one seam.

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::JobletConfig;
use crate::errors::{JobletError, Result};
use crate::executor::{BypassLauncher, Executor, FullLauncher, IsolationMode, JobLauncher};
use crate::logpipeline::LogPipeline;
use crate::model::{Job, JobSpec, Network, Volume, WorkflowRecord};
use crate::rpc::JobletApi;
use crate::state_store::StateStore;
use crate::workflow::{JobStarter, WorkflowResolver, WorkflowYaml};

pub struct Engine {
    store: Arc<StateStore>,
    executor: Arc<Executor>,
    log_pipeline: Arc<LogPipeline>,
    resolver: Arc<WorkflowResolver>,
    // Kept alive for as long as the engine runs: the log pipeline's
    // batcher tasks are spawned onto this runtime's worker threads.
    _runtime: tokio::runtime::Runtime,
}

/// Adapts `Executor` to the workflow resolver's narrower `JobStarter`
/// seam, so the resolver never needs the rest of the executor's surface.
struct ExecutorStarter(Arc<Executor>);

impl JobStarter for ExecutorStarter {
    fn start(&self, job_id: Uuid, spec: JobSpec) -> Result<()> {
        self.0.start_with_id(job_id, spec)
    }

    fn stop(&self, job_id: Uuid) -> Result<()> {
        self.0.stop(job_id)
    }
}

impl Engine {
    pub fn new(config: &JobletConfig, self_exe: std::path::PathBuf) -> Self {
        let store = Arc::new(StateStore::new());
        let launcher: Arc<dyn JobLauncher> = match IsolationMode::from(config.isolation_mode) {
            IsolationMode::Full => Arc::new(FullLauncher {
                cgroup_root: config.cgroup_root.clone(),
                self_exe,
            }),
            IsolationMode::Bypass => Arc::new(BypassLauncher),
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("build log pipeline runtime");
        let log_pipeline = Arc::new(LogPipeline::new(config.log_pipeline.clone(), runtime.handle().clone()));
        let executor = Arc::new(Executor::new(store.clone(), launcher, log_pipeline.clone()));
        let resolver = Arc::new(WorkflowResolver::new(store.clone(), Arc::new(ExecutorStarter(executor.clone()))));

        Engine { store, executor, log_pipeline, resolver, _runtime: runtime }
    }

    pub fn log_pipeline(&self) -> &Arc<LogPipeline> {
        &self.log_pipeline
    }
}

impl JobletApi for Engine {
    fn submit_job(&self, spec: JobSpec) -> Result<Uuid> {
        self.executor.start(spec)
    }

    fn stop_job(&self, id: Uuid) -> Result<()> {
        self.executor.stop(id)
    }

    fn delete_job(&self, id: Uuid) -> Result<()> {
        self.executor.delete(id)
    }

    fn get_job(&self, id_or_prefix: &str) -> Result<Job> {
        if let Ok(id) = Uuid::parse_str(id_or_prefix) {
            if let Some(job) = self.store.get_job(id) {
                return Ok(job);
            }
        }
        self.store
            .get_job_by_prefix(id_or_prefix)?
            .ok_or_else(|| JobletError::not_found(format!("job '{id_or_prefix}' not found")))
    }

    fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.executor.list())
    }

    fn create_volume(&self, volume: Volume) -> Result<Volume> {
        Ok(self.store.create_volume(volume))
    }

    fn list_volumes(&self) -> Result<Vec<Volume>> {
        Ok(self.store.list_volumes())
    }

    fn delete_volume(&self, name: &str) -> Result<()> {
        match self.store.get_volume(name) {
            Some(v) if v.in_use() => Err(JobletError::conflict(format!("volume '{name}' is in use"))),
            Some(_) => {
                self.store.delete_volume(name);
                Ok(())
            }
            None => Err(JobletError::not_found(format!("volume '{name}' not found"))),
        }
    }

    fn create_network(&self, network: Network) -> Result<Network> {
        crate::netns::ensure_bridge(&network)?;
        Ok(self.store.create_network(network))
    }

    fn list_networks(&self) -> Result<Vec<Network>> {
        Ok(self.store.list_networks())
    }

    fn submit_workflow(&self, definition: WorkflowYaml) -> Result<Uuid> {
        let specs: BTreeMap<String, JobSpec> = definition.jobs.clone();
        self.resolver.submit(&definition, specs)
    }

    fn get_workflow(&self, id: Uuid) -> Result<WorkflowRecord> {
        self.store
            .get_workflow(id)
            .ok_or_else(|| JobletError::not_found(format!("workflow {id} not found")))
    }

    fn list_workflows(&self) -> Result<Vec<WorkflowRecord>> {
        Ok(self.store.list_workflows())
    }

    fn tail_logs(&self, id: Uuid) -> Result<(Vec<crate::model::LogChunk>, crossbeam_channel::Receiver<crate::model::LogChunk>)> {
        self.log_pipeline
            .subscribe(id)
            .ok_or_else(|| JobletError::not_found(format!("job {id} has no log stream")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IsolationModeConfig, JobletConfig};

    #[test]
    fn submit_and_get_job_round_trips() {
        let mut config = JobletConfig::default();
        config.isolation_mode = IsolationModeConfig::Bypass;
        let engine = Engine::new(&config, std::path::PathBuf::from("/proc/self/exe"));

        let id = engine.submit_job(JobSpec { command: "/bin/true".into(), ..Default::default() }).unwrap();
        let job = engine.get_job(&id.to_string()).unwrap();
        assert_eq!(job.id, id);
    }

    #[test]
    fn get_job_by_prefix_works_through_the_api() {
        let mut config = JobletConfig::default();
        config.isolation_mode = IsolationModeConfig::Bypass;
        let engine = Engine::new(&config, std::path::PathBuf::from("/proc/self/exe"));

        let id = engine.submit_job(JobSpec { command: "/bin/true".into(), ..Default::default() }).unwrap();
        let prefix = &id.simple().to_string()[..8];
        let job = engine.get_job(prefix).unwrap();
        assert_eq!(job.id, id);
    }
}
