//! The pinned interface between a client (the `rnx` CLI, or any future
//! RPC transport) and the engine.
//! Kept as a plain trait rather than a generated service stub since
//! Joblet has exactly one transport today (local, in-process from
//! `rnx`'s perspective) and no generated-code dependency to justify.

use uuid::Uuid;

use crate::errors::Result;
use crate::model::{Job, JobSpec, Network, Volume, WorkflowRecord};
use crate::workflow::WorkflowYaml;

pub trait JobletApi: Send + Sync {
    fn submit_job(&self, spec: JobSpec) -> Result<Uuid>;
    fn stop_job(&self, id: Uuid) -> Result<()>;
    fn delete_job(&self, id: Uuid) -> Result<()>;
    fn get_job(&self, id_or_prefix: &str) -> Result<Job>;
    fn list_jobs(&self) -> Result<Vec<Job>>;

    fn create_volume(&self, volume: Volume) -> Result<Volume>;
    fn list_volumes(&self) -> Result<Vec<Volume>>;
    fn delete_volume(&self, name: &str) -> Result<()>;

    fn create_network(&self, network: Network) -> Result<Network>;
    fn list_networks(&self) -> Result<Vec<Network>>;

    fn submit_workflow(&self, definition: WorkflowYaml) -> Result<Uuid>;
    fn get_workflow(&self, id: Uuid) -> Result<WorkflowRecord>;
    fn list_workflows(&self) -> Result<Vec<WorkflowRecord>>;

    /// Historical-plus-live log chunks for a job.
    fn tail_logs(&self, id: Uuid) -> Result<(Vec<crate::model::LogChunk>, crossbeam_channel::Receiver<crate::model::LogChunk>)>;
}
