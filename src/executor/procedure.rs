//! Procedure steps
//!
//! The closed set of operations a job can be composed of. Each variant pairs
//! an `execute` action against the driver/topology with an optional
//! compensating step that undoes it after a later step fails. New operations
//! are added as new variants, keeping dispatch static.

use crate::driver::DatabaseDriver;
use crate::topology::{GroupId, ServerId, ServerMode, ServerStatus, TopologyStore};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Everything a step may touch while executing
pub struct StepContext<'a> {
    pub driver: &'a dyn DatabaseDriver,
    pub topology: &'a TopologyStore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// Flip a server's read-only flag
    SetReadOnly {
        server: ServerId,
        read_only: bool,
    },
    /// Stop replication on a server; `source` is kept so the step can be
    /// compensated by re-pointing the server at its old source
    StopReplication {
        server: ServerId,
        source: ServerId,
    },
    /// Point a server's replication at `source`
    StartReplication {
        server: ServerId,
        source: ServerId,
    },
    /// Clear binary logs ahead of a role change. Irreversible: no compensation.
    ResetMaster {
        server: ServerId,
    },
    /// Make `server` the group primary. `previous` is the primary being
    /// replaced, carried for compensation.
    PromotePrimary {
        group: GroupId,
        server: ServerId,
        previous: Option<ServerId>,
    },
    /// Strip `server` of the primary role, restoring `restore` as the
    /// committed primary pointer (or leaving the group leaderless)
    DemotePrimary {
        group: GroupId,
        server: ServerId,
        restore: Option<ServerId>,
    },
    /// Record a server status transition in the topology
    SetServerStatus {
        server: ServerId,
        status: ServerStatus,
        previous: ServerStatus,
    },
}

impl Step {
    /// Step name for logs and reports
    pub fn name(&self) -> &'static str {
        match self {
            Step::SetReadOnly { .. } => "set_read_only",
            Step::StopReplication { .. } => "stop_replication",
            Step::StartReplication { .. } => "start_replication",
            Step::ResetMaster { .. } => "reset_master",
            Step::PromotePrimary { .. } => "promote_primary",
            Step::DemotePrimary { .. } => "demote_primary",
            Step::SetServerStatus { .. } => "set_server_status",
        }
    }

    /// Execute the step, producing the state handed to the next step
    pub async fn execute(&self, cx: &StepContext<'_>) -> Result<serde_json::Value> {
        match self {
            Step::SetReadOnly { server, read_only } => {
                let srv = cx.topology.server(server)?;
                cx.driver.set_read_only(&srv, *read_only).await?;
                let mode = if *read_only {
                    ServerMode::ReadOnly
                } else {
                    ServerMode::ReadWrite
                };
                cx.topology.set_server_mode(server, mode)?;
                Ok(json!({ "step": self.name(), "server": server, "read_only": read_only }))
            }
            Step::StopReplication { server, .. } => {
                let srv = cx.topology.server(server)?;
                cx.driver.stop_replication(&srv).await?;
                Ok(json!({ "step": self.name(), "server": server }))
            }
            Step::StartReplication { server, source } => {
                let srv = cx.topology.server(server)?;
                let src = cx.topology.server(source)?;
                cx.driver.start_replication(&srv, &src).await?;
                Ok(json!({ "step": self.name(), "server": server, "source": source }))
            }
            Step::ResetMaster { server } => {
                let srv = cx.topology.server(server)?;
                cx.driver.reset_master(&srv).await?;
                Ok(json!({ "step": self.name(), "server": server }))
            }
            Step::PromotePrimary { group, server, .. } => {
                let srv = cx.topology.server(server)?;
                // Promoting an already-promoted server is success, so a
                // retried or repeated failover converges instead of failing
                match cx.driver.promote(&srv).await {
                    Ok(()) | Err(crate::Error::AlreadyPrimary(_)) => {}
                    Err(e) => return Err(e),
                }
                cx.topology.set_primary(group, Some(*server))?;
                Ok(json!({ "step": self.name(), "group": group, "primary": server }))
            }
            Step::DemotePrimary { group, server, restore } => {
                let srv = cx.topology.server(server)?;
                cx.driver.demote(&srv).await?;
                cx.driver.set_read_only(&srv, true).await?;
                cx.topology.set_primary(group, *restore)?;
                Ok(json!({ "step": self.name(), "group": group, "demoted": server }))
            }
            Step::SetServerStatus { server, status, .. } => {
                let previous = cx.topology.set_server_status(server, *status)?;
                Ok(json!({
                    "step": self.name(),
                    "server": server,
                    "status": status,
                    "previous": previous,
                }))
            }
        }
    }

    /// The step undoing this one, if it is undoable at all
    pub fn compensation(&self) -> Option<Step> {
        match self {
            Step::SetReadOnly { server, read_only } => Some(Step::SetReadOnly {
                server: *server,
                read_only: !read_only,
            }),
            Step::StopReplication { server, source } => Some(Step::StartReplication {
                server: *server,
                source: *source,
            }),
            Step::StartReplication { server, source } => Some(Step::StopReplication {
                server: *server,
                source: *source,
            }),
            // Binary logs cannot be un-cleared
            Step::ResetMaster { .. } => None,
            Step::PromotePrimary { group, server, previous } => Some(Step::DemotePrimary {
                group: group.clone(),
                server: *server,
                restore: *previous,
            }),
            Step::DemotePrimary { group, server, restore } => Some(Step::PromotePrimary {
                group: group.clone(),
                server: *server,
                previous: *restore,
            }),
            Step::SetServerStatus { server, status, previous } => Some(Step::SetServerStatus {
                server: *server,
                status: *previous,
                previous: *status,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ScriptedDriver;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn fixture() -> (TopologyStore, ScriptedDriver, ServerId, ServerId) {
        let topo = TopologyStore::load(Arc::new(MemoryStore::new())).unwrap();
        topo.create_group("g1", None).unwrap();
        let a = topo.register_server("g1", "db1:3306", 0).unwrap();
        let b = topo.register_server("g1", "db2:3306", 1).unwrap();
        (topo, ScriptedDriver::new(), a.uuid, b.uuid)
    }

    #[tokio::test]
    async fn test_promote_updates_topology() {
        let (topo, driver, a, _) = fixture();
        let cx = StepContext {
            driver: &driver,
            topology: &topo,
        };

        let step = Step::PromotePrimary {
            group: "g1".into(),
            server: a,
            previous: None,
        };
        step.execute(&cx).await.unwrap();
        assert_eq!(topo.group("g1").unwrap().primary, Some(a));
        assert_eq!(topo.server(&a).unwrap().mode, ServerMode::ReadWrite);
    }

    #[tokio::test]
    async fn test_promote_already_primary_is_success() {
        let (topo, driver, a, _) = fixture();
        let cx = StepContext {
            driver: &driver,
            topology: &topo,
        };

        driver.fail("promote", a, crate::driver::Fault::AlreadyPrimary, 1);
        let step = Step::PromotePrimary {
            group: "g1".into(),
            server: a,
            previous: None,
        };
        step.execute(&cx).await.unwrap();
        assert_eq!(topo.group("g1").unwrap().primary, Some(a));
    }

    #[tokio::test]
    async fn test_compensations_invert() {
        let (_, _, a, b) = fixture();

        let promote = Step::PromotePrimary {
            group: "g1".into(),
            server: a,
            previous: Some(b),
        };
        match promote.compensation().unwrap() {
            Step::DemotePrimary { server, restore, .. } => {
                assert_eq!(server, a);
                assert_eq!(restore, Some(b));
            }
            other => panic!("unexpected compensation: {:?}", other),
        }

        let reset = Step::ResetMaster { server: a };
        assert!(reset.compensation().is_none());

        let ro = Step::SetReadOnly {
            server: a,
            read_only: true,
        };
        match ro.compensation().unwrap() {
            Step::SetReadOnly { read_only, .. } => assert!(!read_only),
            other => panic!("unexpected compensation: {:?}", other),
        }
    }
}
