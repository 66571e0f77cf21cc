//! Farm topology: servers, groups, and the registry that owns them
//!
//! The topology is an explicit store object handed to the executor and
//! failover controller at construction. Committed state lives here and in the
//! storage adapter; mutation happens through executed job steps, never from
//! the failure detector.

use crate::executor::lock::{LockManager, ResourceKey};
use crate::store::StorageAdapter;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

pub type ServerId = Uuid;
pub type GroupId = String;

/// Server health/participation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    Faulty,
    Spare,
    Offline,
}

impl ServerStatus {
    /// Is this server a live group member (polled, promotable)?
    pub fn is_running(&self) -> bool {
        matches!(self, ServerStatus::Running)
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Running => write!(f, "running"),
            ServerStatus::Faulty => write!(f, "faulty"),
            ServerStatus::Spare => write!(f, "spare"),
            ServerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Server read/write mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    ReadWrite,
    ReadOnly,
    Offline,
}

/// A managed database server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub uuid: ServerId,
    pub address: String,
    /// At most one group membership
    pub group: Option<GroupId>,
    pub status: ServerStatus,
    pub mode: ServerMode,
    /// Promotion preference, lower wins ties
    pub rank: u32,
}

/// A replication group of servers with at most one primary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub description: Option<String>,
    pub members: BTreeSet<ServerId>,
    pub primary: Option<ServerId>,
}

impl Group {
    pub fn contains_server(&self, uuid: &ServerId) -> bool {
        self.members.contains(uuid)
    }
}

/// Registry of groups and servers, backed by the storage adapter
pub struct TopologyStore {
    servers: RwLock<HashMap<ServerId, Server>>,
    groups: RwLock<HashMap<GroupId, Group>>,
    store: Arc<dyn StorageAdapter>,
}

impl TopologyStore {
    /// Hydrate the registry from the storage adapter
    pub fn load(store: Arc<dyn StorageAdapter>) -> Result<Self> {
        let (groups, servers) = store.load_topology()?;
        Ok(Self {
            servers: RwLock::new(servers.into_iter().map(|s| (s.uuid, s)).collect()),
            groups: RwLock::new(groups.into_iter().map(|g| (g.id.clone(), g)).collect()),
            store,
        })
    }

    // === Group operations ===

    /// Create a group
    pub fn create_group(&self, id: &str, description: Option<String>) -> Result<Group> {
        let mut groups = self.groups.write().unwrap();
        if groups.contains_key(id) {
            return Err(crate::Error::Group(format!("Group ({}) already exists", id)));
        }
        let group = Group {
            id: id.to_string(),
            description,
            members: BTreeSet::new(),
            primary: None,
        };
        self.store.save_group(&group)?;
        groups.insert(id.to_string(), group.clone());
        tracing::debug!("Added group ({})", id);
        Ok(group)
    }

    /// Remove a group
    ///
    /// A non-empty group is only removed with `force`, which drops its member
    /// servers as well; each dropped server must be free of job locks.
    pub fn remove_group(&self, id: &str, force: bool, locks: &LockManager) -> Result<()> {
        let group = self.group(id)?;
        if !group.members.is_empty() && !force {
            return Err(crate::Error::Group(format!("Group ({}) is not empty", id)));
        }
        for uuid in &group.members {
            self.check_server_unlocked(uuid, locks)?;
        }
        for uuid in &group.members {
            self.store.delete_server(uuid)?;
            self.servers.write().unwrap().remove(uuid);
        }
        self.store.delete_group(id)?;
        self.groups.write().unwrap().remove(id);
        tracing::debug!("Removed group ({})", id);
        Ok(())
    }

    /// Update a group's description
    pub fn set_group_description(&self, id: &str, description: Option<String>) -> Result<()> {
        let mut groups = self.groups.write().unwrap();
        let group = groups
            .get_mut(id)
            .ok_or_else(|| crate::Error::GroupNotFound(id.to_string()))?;
        group.description = description;
        self.store.save_group(group)
    }

    /// Fetch a group snapshot
    pub fn group(&self, id: &str) -> Result<Group> {
        self.groups
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| crate::Error::GroupNotFound(id.to_string()))
    }

    /// List all groups
    pub fn groups(&self) -> Vec<Group> {
        self.groups.read().unwrap().values().cloned().collect()
    }

    // === Server operations ===

    /// Register a server into a group
    pub fn register_server(&self, group_id: &str, address: &str, rank: u32) -> Result<Server> {
        let mut groups = self.groups.write().unwrap();
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| crate::Error::GroupNotFound(group_id.to_string()))?;

        let server = Server {
            uuid: Uuid::new_v4(),
            address: address.to_string(),
            group: Some(group_id.to_string()),
            status: ServerStatus::Running,
            mode: ServerMode::ReadOnly,
            rank,
        };
        self.store.save_server(&server)?;
        group.members.insert(server.uuid);
        self.store.save_group(group)?;
        self.servers
            .write()
            .unwrap()
            .insert(server.uuid, server.clone());
        tracing::debug!("Added server ({}) to group ({})", server.uuid, group_id);
        Ok(server)
    }

    /// Remove a server from its group and destroy it
    ///
    /// The group primary cannot be removed (demote it first), and a server a
    /// job currently holds a lock on cannot be removed.
    pub fn remove_server(&self, uuid: &ServerId, locks: &LockManager) -> Result<()> {
        let server = self.server(uuid)?;
        if let Some(group_id) = &server.group {
            let mut groups = self.groups.write().unwrap();
            let group = groups
                .get_mut(group_id)
                .ok_or_else(|| crate::Error::GroupNotFound(group_id.clone()))?;
            if group.primary == Some(*uuid) {
                return Err(crate::Error::Server(format!(
                    "Cannot remove server ({}), which is primary in group ({}). Demote it first",
                    uuid, group_id
                )));
            }
            self.check_server_unlocked(uuid, locks)?;
            group.members.remove(uuid);
            self.store.save_group(group)?;
        } else {
            self.check_server_unlocked(uuid, locks)?;
        }
        self.store.delete_server(uuid)?;
        self.servers.write().unwrap().remove(uuid);
        tracing::debug!("Removed server ({})", uuid);
        Ok(())
    }

    /// Fetch a server snapshot
    pub fn server(&self, uuid: &ServerId) -> Result<Server> {
        self.servers
            .read()
            .unwrap()
            .get(uuid)
            .cloned()
            .ok_or_else(|| crate::Error::ServerNotFound(uuid.to_string()))
    }

    /// List member servers of a group
    pub fn servers_in(&self, group_id: &str) -> Result<Vec<Server>> {
        let group = self.group(group_id)?;
        let servers = self.servers.read().unwrap();
        Ok(group
            .members
            .iter()
            .filter_map(|uuid| servers.get(uuid).cloned())
            .collect())
    }

    /// List every registered server
    pub fn servers(&self) -> Vec<Server> {
        self.servers.read().unwrap().values().cloned().collect()
    }

    // === Mutations driven by job steps ===

    /// Set a server's status, returning the previous value
    pub fn set_server_status(&self, uuid: &ServerId, status: ServerStatus) -> Result<ServerStatus> {
        let mut servers = self.servers.write().unwrap();
        let server = servers
            .get_mut(uuid)
            .ok_or_else(|| crate::Error::ServerNotFound(uuid.to_string()))?;
        let previous = server.status;
        server.status = status;
        self.store.save_server(server)?;
        Ok(previous)
    }

    /// Set a server's read/write mode
    pub fn set_server_mode(&self, uuid: &ServerId, mode: ServerMode) -> Result<()> {
        let mut servers = self.servers.write().unwrap();
        let server = servers
            .get_mut(uuid)
            .ok_or_else(|| crate::Error::ServerNotFound(uuid.to_string()))?;
        server.mode = mode;
        self.store.save_server(server)
    }

    /// Point a group at a new primary (or none)
    ///
    /// The new primary goes read-write; a previous, still-registered primary
    /// is dropped to read-only so a committed state never shows two writers.
    pub fn set_primary(&self, group_id: &str, primary: Option<ServerId>) -> Result<()> {
        let mut groups = self.groups.write().unwrap();
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| crate::Error::GroupNotFound(group_id.to_string()))?;
        if let Some(uuid) = primary {
            if !group.contains_server(&uuid) {
                return Err(crate::Error::Group(format!(
                    "Group ({}) does not contain server ({})",
                    group_id, uuid
                )));
            }
        }
        let old = group.primary;
        group.primary = primary;
        self.store.save_group(group)?;

        let mut servers = self.servers.write().unwrap();
        if let Some(old_uuid) = old {
            if Some(old_uuid) != primary {
                if let Some(server) = servers.get_mut(&old_uuid) {
                    server.mode = ServerMode::ReadOnly;
                    self.store.save_server(server)?;
                }
            }
        }
        if let Some(new_uuid) = primary {
            let server = servers
                .get_mut(&new_uuid)
                .ok_or_else(|| crate::Error::ServerNotFound(new_uuid.to_string()))?;
            server.mode = ServerMode::ReadWrite;
            self.store.save_server(server)?;
        }
        Ok(())
    }

    fn check_server_unlocked(&self, uuid: &ServerId, locks: &LockManager) -> Result<()> {
        let key = ResourceKey::server(uuid);
        if let Some(job) = locks.holder(&key) {
            return Err(crate::Error::Server(format!(
                "Server ({}) is locked by job ({})",
                uuid, job
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn topology() -> TopologyStore {
        TopologyStore::load(Arc::new(MemoryStore::new())).unwrap()
    }

    #[test]
    fn test_group_lifecycle() {
        let topo = topology();
        let locks = LockManager::new();

        topo.create_group("g1", Some("primary shard".into())).unwrap();
        assert!(topo.create_group("g1", None).is_err());

        let s = topo.register_server("g1", "db1:3306", 0).unwrap();
        assert_eq!(topo.servers_in("g1").unwrap().len(), 1);

        // Non-empty group needs force
        assert!(topo.remove_group("g1", false, &locks).is_err());
        topo.remove_group("g1", true, &locks).unwrap();
        assert!(topo.server(&s.uuid).is_err());
    }

    #[test]
    fn test_primary_cannot_be_removed() {
        let topo = topology();
        let locks = LockManager::new();

        topo.create_group("g1", None).unwrap();
        let s = topo.register_server("g1", "db1:3306", 0).unwrap();
        topo.set_primary("g1", Some(s.uuid)).unwrap();

        let err = topo.remove_server(&s.uuid, &locks).unwrap_err();
        assert!(err.to_string().contains("primary"));
    }

    #[test]
    fn test_set_primary_flips_modes() {
        let topo = topology();

        topo.create_group("g1", None).unwrap();
        let a = topo.register_server("g1", "db1:3306", 0).unwrap();
        let b = topo.register_server("g1", "db2:3306", 1).unwrap();

        topo.set_primary("g1", Some(a.uuid)).unwrap();
        assert_eq!(topo.server(&a.uuid).unwrap().mode, ServerMode::ReadWrite);

        topo.set_primary("g1", Some(b.uuid)).unwrap();
        assert_eq!(topo.server(&a.uuid).unwrap().mode, ServerMode::ReadOnly);
        assert_eq!(topo.server(&b.uuid).unwrap().mode, ServerMode::ReadWrite);
        assert_eq!(topo.group("g1").unwrap().primary, Some(b.uuid));
    }

    #[test]
    fn test_set_primary_rejects_foreign_server() {
        let topo = topology();
        topo.create_group("g1", None).unwrap();
        topo.create_group("g2", None).unwrap();
        let s = topo.register_server("g2", "db1:3306", 0).unwrap();

        assert!(topo.set_primary("g1", Some(s.uuid)).is_err());
    }

    #[test]
    fn test_reload_from_store() {
        let store = Arc::new(MemoryStore::new());
        let a;
        {
            let topo = TopologyStore::load(store.clone()).unwrap();
            topo.create_group("g1", None).unwrap();
            a = topo.register_server("g1", "db1:3306", 0).unwrap();
            topo.set_primary("g1", Some(a.uuid)).unwrap();
        }
        let topo = TopologyStore::load(store).unwrap();
        assert_eq!(topo.group("g1").unwrap().primary, Some(a.uuid));
        assert_eq!(topo.server(&a.uuid).unwrap().address, "db1:3306");
    }
}
