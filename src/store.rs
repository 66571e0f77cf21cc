//! Durable storage adapter for checkpoints and topology
//!
//! The executor and topology registry consume [`StorageAdapter`] and require
//! durable-write-before-acknowledge semantics: a `save_*` that returns `Ok`
//! must survive a process crash. The in-memory backend is for tests and
//! dry-runs; the sled backend (feature `sled-backend`) is the durable one.

use crate::executor::job::{Checkpoint, JobId};
use crate::topology::{Group, Server};
use crate::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Storage backend consumed by the executor and the topology registry
pub trait StorageAdapter: Send + Sync {
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    /// Checkpoints of jobs that were not terminal at last write
    fn load_pending_jobs(&self) -> Result<Vec<Checkpoint>>;
    /// All checkpoints, terminal included (retention pruning, listings)
    fn list_checkpoints(&self) -> Result<Vec<Checkpoint>>;
    fn delete_checkpoint(&self, job: JobId) -> Result<()>;

    fn save_server(&self, server: &Server) -> Result<()>;
    fn delete_server(&self, uuid: &Uuid) -> Result<()>;
    fn save_group(&self, group: &Group) -> Result<()>;
    fn delete_group(&self, id: &str) -> Result<()>;
    fn load_topology(&self) -> Result<(Vec<Group>, Vec<Server>)>;
}

// === In-memory backend ===

#[derive(Default)]
struct MemoryInner {
    checkpoints: HashMap<JobId, Checkpoint>,
    servers: HashMap<Uuid, Server>,
    groups: HashMap<String, Group>,
}

/// In-memory store (tests, dry-runs)
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageAdapter for MemoryStore {
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .checkpoints
            .insert(checkpoint.job_id, checkpoint.clone());
        Ok(())
    }

    fn load_pending_jobs(&self) -> Result<Vec<Checkpoint>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .checkpoints
            .values()
            .filter(|cp| !cp.status.is_terminal())
            .cloned()
            .collect())
    }

    fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.inner.lock().unwrap().checkpoints.values().cloned().collect())
    }

    fn delete_checkpoint(&self, job: JobId) -> Result<()> {
        self.inner.lock().unwrap().checkpoints.remove(&job);
        Ok(())
    }

    fn save_server(&self, server: &Server) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .servers
            .insert(server.uuid, server.clone());
        Ok(())
    }

    fn delete_server(&self, uuid: &Uuid) -> Result<()> {
        self.inner.lock().unwrap().servers.remove(uuid);
        Ok(())
    }

    fn save_group(&self, group: &Group) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .groups
            .insert(group.id.clone(), group.clone());
        Ok(())
    }

    fn delete_group(&self, id: &str) -> Result<()> {
        self.inner.lock().unwrap().groups.remove(id);
        Ok(())
    }

    fn load_topology(&self) -> Result<(Vec<Group>, Vec<Server>)> {
        let inner = self.inner.lock().unwrap();
        Ok((
            inner.groups.values().cloned().collect(),
            inner.servers.values().cloned().collect(),
        ))
    }
}

// === Sled backend ===

/// Sled-backed store with one tree per record kind, flushed on every write
#[cfg(feature = "sled-backend")]
pub struct SledStore {
    db: sled::Db,
    checkpoints: sled::Tree,
    servers: sled::Tree,
    groups: sled::Tree,
}

#[cfg(feature = "sled-backend")]
impl SledStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| crate::Error::Checkpoint(e.to_string()))?;
        let checkpoints = db
            .open_tree("checkpoints")
            .map_err(|e| crate::Error::Checkpoint(e.to_string()))?;
        let servers = db
            .open_tree("servers")
            .map_err(|e| crate::Error::Checkpoint(e.to_string()))?;
        let groups = db
            .open_tree("groups")
            .map_err(|e| crate::Error::Checkpoint(e.to_string()))?;
        Ok(Self {
            db,
            checkpoints,
            servers,
            groups,
        })
    }

    fn put<T: serde::Serialize>(&self, tree: &sled::Tree, key: &[u8], value: &T) -> Result<()> {
        let bytes =
            bincode::serialize(value).map_err(|e| crate::Error::Serialize(e.to_string()))?;
        tree.insert(key, bytes)
            .map_err(|e| crate::Error::Checkpoint(e.to_string()))?;
        // Acknowledge only after the write is on disk
        self.db
            .flush()
            .map_err(|e| crate::Error::Checkpoint(e.to_string()))?;
        Ok(())
    }
}

#[cfg(feature = "sled-backend")]
impl StorageAdapter for SledStore {
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.put(
            &self.checkpoints,
            checkpoint.job_id.as_uuid().as_bytes(),
            checkpoint,
        )
    }

    fn load_pending_jobs(&self) -> Result<Vec<Checkpoint>> {
        Ok(self
            .list_checkpoints()?
            .into_iter()
            .filter(|cp| !cp.status.is_terminal())
            .collect())
    }

    fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let mut out = Vec::new();
        for item in self.checkpoints.iter() {
            let (_, bytes) = item.map_err(|e| crate::Error::Checkpoint(e.to_string()))?;
            let cp: Checkpoint = bincode::deserialize(&bytes)
                .map_err(|e| crate::Error::Serialize(e.to_string()))?;
            out.push(cp);
        }
        Ok(out)
    }

    fn delete_checkpoint(&self, job: JobId) -> Result<()> {
        self.checkpoints
            .remove(job.as_uuid().as_bytes())
            .map_err(|e| crate::Error::Checkpoint(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| crate::Error::Checkpoint(e.to_string()))?;
        Ok(())
    }

    fn save_server(&self, server: &Server) -> Result<()> {
        self.put(&self.servers, server.uuid.as_bytes(), server)
    }

    fn delete_server(&self, uuid: &Uuid) -> Result<()> {
        self.servers
            .remove(uuid.as_bytes())
            .map_err(|e| crate::Error::Checkpoint(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| crate::Error::Checkpoint(e.to_string()))?;
        Ok(())
    }

    fn save_group(&self, group: &Group) -> Result<()> {
        self.put(&self.groups, group.id.as_bytes(), group)
    }

    fn delete_group(&self, id: &str) -> Result<()> {
        self.groups
            .remove(id.as_bytes())
            .map_err(|e| crate::Error::Checkpoint(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| crate::Error::Checkpoint(e.to_string()))?;
        Ok(())
    }

    fn load_topology(&self) -> Result<(Vec<Group>, Vec<Server>)> {
        let mut groups = Vec::new();
        for item in self.groups.iter() {
            let (_, bytes) = item.map_err(|e| crate::Error::Checkpoint(e.to_string()))?;
            groups.push(
                bincode::deserialize(&bytes).map_err(|e| crate::Error::Serialize(e.to_string()))?,
            );
        }
        let mut servers = Vec::new();
        for item in self.servers.iter() {
            let (_, bytes) = item.map_err(|e| crate::Error::Checkpoint(e.to_string()))?;
            servers.push(
                bincode::deserialize(&bytes).map_err(|e| crate::Error::Serialize(e.to_string()))?,
            );
        }
        Ok((groups, servers))
    }
}
