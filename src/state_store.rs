//! In-memory indexed record store for jobs, volumes, networks, and
//! workflows. Each collection is guarded by its own
//! `parking_lot::RwLock` so that, e.g., listing volumes never blocks a
//! job status update.
//!
//! Create is idempotent on UUID collision: the first writer wins and a
//! duplicate `create` silently returns the existing record. Every successful
//! mutation publishes the new value on that record's change topic so
//! that `rnx wait`/log-follow style callers can subscribe instead of
//! polling.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::errors::{JobletError, Result};
use crate::model::{Job, Network, Volume, WorkflowRecord};
use crate::pubsub::Topic;

const CHANGE_HISTORY_DEPTH: usize = 16;

struct Indexed<T: Clone + Send + 'static> {
    records: RwLock<HashMap<Uuid, T>>,
    changes: RwLock<HashMap<Uuid, Arc<Topic<T>>>>,
}

impl<T: Clone + Send + 'static> Indexed<T> {
    fn new() -> Self {
        Indexed {
            records: RwLock::new(HashMap::new()),
            changes: RwLock::new(HashMap::new()),
        }
    }

    /// Insert `value` under `id` unless `id` already exists, in which case
    /// the existing record is returned untouched.
    fn create(&self, id: Uuid, value: T) -> T {
        let mut records = self.records.write();
        if let Some(existing) = records.get(&id) {
            return existing.clone();
        }
        records.insert(id, value.clone());
        value
    }

    fn update(&self, id: Uuid, value: T) -> Result<()> {
        {
            let mut records = self.records.write();
            if !records.contains_key(&id) {
                return Err(JobletError::not_found(format!("record {id} not found")));
            }
            records.insert(id, value.clone());
        }
        if let Some(topic) = self.changes.read().get(&id) {
            topic.publish(value);
        }
        Ok(())
    }

    fn get(&self, id: Uuid) -> Option<T> {
        self.records.read().get(&id).cloned()
    }

    fn delete(&self, id: Uuid) -> Option<T> {
        let removed = self.records.write().remove(&id);
        self.changes.write().remove(&id);
        removed
    }

    fn list(&self) -> Vec<T> {
        self.records.read().values().cloned().collect()
    }

    /// Look up every record whose UUID's hyphen-stripped hex form starts
    /// with `prefix`. Returns an error when the
    /// prefix is ambiguous (matches more than one record).
    fn get_by_prefix(&self, prefix: &str) -> Result<Option<(Uuid, T)>> {
        let prefix = prefix.to_ascii_lowercase();
        let records = self.records.read();
        let mut matches: Vec<(Uuid, T)> = records
            .iter()
            .filter(|(id, _)| id.simple().to_string().starts_with(&prefix))
            .map(|(id, v)| (*id, v.clone()))
            .collect();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches.remove(0))),
            _ => Err(JobletError::validation(format!(
                "ambiguous id prefix '{prefix}' matches {} records",
                matches.len()
            ))),
        }
    }

    fn subscribe(&self, id: Uuid) -> (Vec<T>, crossbeam_channel::Receiver<T>) {
        let topic = self
            .changes
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(Topic::new(CHANGE_HISTORY_DEPTH)))
            .clone();
        topic.subscribe(crate::pubsub::DEFAULT_SUBSCRIBER_BUFFER)
    }
}

/// The daemon's single source of truth for in-flight records. Cheap to
/// clone (everything behind `Arc`), so callers can hold their own handle.
#[derive(Clone)]
pub struct StateStore {
    jobs: Arc<Indexed<Job>>,
    volumes: Arc<Indexed<Volume>>,
    networks: Arc<Indexed<Network>>,
    workflows: Arc<Indexed<WorkflowRecord>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        StateStore {
            jobs: Arc::new(Indexed::new()),
            volumes: Arc::new(Indexed::new()),
            networks: Arc::new(Indexed::new()),
            workflows: Arc::new(Indexed::new()),
        }
    }

    pub fn create_job(&self, job: Job) -> Job {
        self.jobs.create(job.id, job)
    }

    pub fn update_job(&self, id: Uuid, job: Job) -> Result<()> {
        self.jobs.update(id, job)
    }

    pub fn get_job(&self, id: Uuid) -> Option<Job> {
        self.jobs.get(id)
    }

    pub fn get_job_by_prefix(&self, prefix: &str) -> Result<Option<Job>> {
        Ok(self.jobs.get_by_prefix(prefix)?.map(|(_, job)| job))
    }

    pub fn delete_job(&self, id: Uuid) -> Option<Job> {
        self.jobs.delete(id)
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        self.jobs.list()
    }

    pub fn subscribe_job(&self, id: Uuid) -> (Vec<Job>, crossbeam_channel::Receiver<Job>) {
        self.jobs.subscribe(id)
    }

    pub fn create_volume(&self, volume: Volume) -> Volume {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, volume.name.as_bytes());
        self.volumes.create(id, volume)
    }

    pub fn get_volume(&self, name: &str) -> Option<Volume> {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes());
        self.volumes.get(id)
    }

    pub fn delete_volume(&self, name: &str) -> Option<Volume> {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes());
        self.volumes.delete(id)
    }

    pub fn list_volumes(&self) -> Vec<Volume> {
        self.volumes.list()
    }

    pub fn create_network(&self, network: Network) -> Network {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, network.name.as_bytes());
        self.networks.create(id, network)
    }

    pub fn get_network(&self, name: &str) -> Option<Network> {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes());
        self.networks.get(id)
    }

    pub fn list_networks(&self) -> Vec<Network> {
        self.networks.list()
    }

    pub fn create_workflow(&self, workflow: WorkflowRecord) -> WorkflowRecord {
        self.workflows.create(workflow.id, workflow)
    }

    pub fn update_workflow(&self, id: Uuid, workflow: WorkflowRecord) -> Result<()> {
        self.workflows.update(id, workflow)
    }

    pub fn get_workflow(&self, id: Uuid) -> Option<WorkflowRecord> {
        self.workflows.get(id)
    }

    pub fn list_workflows(&self) -> Vec<WorkflowRecord> {
        self.workflows.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobSpec, JobStatus};

    fn sample_job(id: Uuid) -> Job {
        Job::new(id, JobSpec::default(), "2026-01-01T00:00:00Z".to_string())
    }

    #[test]
    fn create_is_idempotent_on_uuid_collision() {
        let store = StateStore::new();
        let id = Uuid::new_v4();
        let first = store.create_job(sample_job(id));

        let mut duplicate = sample_job(id);
        duplicate.command = "different-command".to_string();
        let second = store.create_job(duplicate);

        assert_eq!(first.command, second.command);
        assert_eq!(store.list_jobs().len(), 1);
    }

    #[test]
    fn update_publishes_change_and_rejects_unknown_id() {
        let store = StateStore::new();
        let id = Uuid::new_v4();
        store.create_job(sample_job(id));

        let (history, rx) = store.subscribe_job(id);
        assert!(history.is_empty());

        let mut running = sample_job(id);
        running.status = JobStatus::Running;
        store.update_job(id, running).unwrap();

        let seen = rx.try_recv().unwrap();
        assert_eq!(seen.status, JobStatus::Running);

        let missing = Uuid::new_v4();
        assert!(store.update_job(missing, sample_job(missing)).is_err());
    }

    #[test]
    fn prefix_lookup_resolves_unique_and_flags_ambiguous() {
        let store = StateStore::new();
        let id = Uuid::new_v4();
        store.create_job(sample_job(id));

        let prefix = &id.simple().to_string()[..8];
        let found = store.get_job_by_prefix(prefix).unwrap();
        assert_eq!(found.unwrap().id, id);

        assert!(store.get_job_by_prefix("00000000").unwrap().is_none());
    }
}
