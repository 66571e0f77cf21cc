//! Database driver capability
//!
//! farmd does not speak any replication protocol itself. Everything it does
//! to a server goes through [`DatabaseDriver`], a small capability an
//! embedding binary supplies. Transport failures (server unreachable) and
//! semantic rejections (server reached, operation refused) surface as
//! distinct error variants so the procedure engine can retry the former and
//! fail fast on the latter.

use crate::topology::Server;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Replication primitives consumed by job steps and the failure detector
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Liveness probe
    async fn ping(&self, server: &Server) -> Result<()>;

    /// Make the server a replication source accepting writes
    async fn promote(&self, server: &Server) -> Result<()>;

    /// Strip the server of its source role
    async fn demote(&self, server: &Server) -> Result<()>;

    async fn set_read_only(&self, server: &Server, read_only: bool) -> Result<()>;

    /// Point the server's replication at `source`
    async fn start_replication(&self, server: &Server, source: &Server) -> Result<()>;

    async fn stop_replication(&self, server: &Server) -> Result<()>;

    /// Clear the server's binary logs before a role change
    async fn reset_master(&self, server: &Server) -> Result<()>;
}

// === Scripted driver (test double) ===

/// Failure kind a scripted call should produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transport,
    Semantic,
    AlreadyPrimary,
}

impl Fault {
    fn to_error(self, server: &Server) -> crate::Error {
        match self {
            Fault::Transport => crate::Error::Transport {
                server: server.address.clone(),
                reason: "injected transport fault".into(),
            },
            Fault::Semantic => crate::Error::Semantic {
                server: server.address.clone(),
                reason: "injected semantic fault".into(),
            },
            Fault::AlreadyPrimary => crate::Error::AlreadyPrimary(server.address.clone()),
        }
    }
}

#[derive(Default)]
struct Script {
    down: HashMap<Uuid, bool>,
    faults: HashMap<(String, Uuid), (Fault, usize)>,
    calls: Vec<String>,
}

/// In-memory driver with programmable faults and a call log.
///
/// Used by the test suite and by `farmd serve --dry-run`-style harnesses; all
/// operations succeed unless a fault was scripted for (operation, server).
#[derive(Default)]
pub struct ScriptedDriver {
    script: Mutex<Script>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a server unreachable (pings fail with a transport error)
    pub fn set_down(&self, server: Uuid, down: bool) {
        self.script.lock().unwrap().down.insert(server, down);
    }

    /// Script the next `times` calls of `op` against `server` to fail
    pub fn fail(&self, op: &str, server: Uuid, fault: Fault, times: usize) {
        self.script
            .lock()
            .unwrap()
            .faults
            .insert((op.to_string(), server), (fault, times));
    }

    /// Every call recorded so far, as `"op address"` lines
    pub fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    /// Number of recorded calls matching an operation name
    pub fn count(&self, op: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(op))
            .count()
    }

    fn call(&self, op: &str, server: &Server) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(format!("{} {}", op, server.address));

        if op == "ping" && script.down.get(&server.uuid).copied().unwrap_or(false) {
            return Err(crate::Error::Transport {
                server: server.address.clone(),
                reason: "server down".into(),
            });
        }

        if let Some((fault, remaining)) = script.faults.get_mut(&(op.to_string(), server.uuid)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(fault.to_error(server));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseDriver for ScriptedDriver {
    async fn ping(&self, server: &Server) -> Result<()> {
        self.call("ping", server)
    }

    async fn promote(&self, server: &Server) -> Result<()> {
        self.call("promote", server)
    }

    async fn demote(&self, server: &Server) -> Result<()> {
        self.call("demote", server)
    }

    async fn set_read_only(&self, server: &Server, read_only: bool) -> Result<()> {
        self.call(if read_only { "set_read_only" } else { "set_read_write" }, server)
    }

    async fn start_replication(&self, server: &Server, source: &Server) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        script
            .calls
            .push(format!("start_replication {} <- {}", server.address, source.address));
        if let Some((fault, remaining)) = script
            .faults
            .get_mut(&("start_replication".to_string(), server.uuid))
        {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(fault.to_error(server));
            }
        }
        Ok(())
    }

    async fn stop_replication(&self, server: &Server) -> Result<()> {
        self.call("stop_replication", server)
    }

    async fn reset_master(&self, server: &Server) -> Result<()> {
        self.call("reset_master", server)
    }
}

// === Dry-run driver ===

/// Driver for monitoring-only deployments: pings are real TCP connects, every
/// administrative operation is logged and skipped.
pub struct DryRunDriver {
    connect_timeout: Duration,
}

impl DryRunDriver {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn skipped(&self, op: &str, server: &Server) -> Result<()> {
        tracing::info!("dry-run: skipping {} on {}", op, server.address);
        Ok(())
    }
}

#[async_trait]
impl DatabaseDriver for DryRunDriver {
    async fn ping(&self, server: &Server) -> Result<()> {
        let connect = tokio::net::TcpStream::connect(&server.address);
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(crate::Error::Transport {
                server: server.address.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(crate::Error::Timeout(format!(
                "connect to {}",
                server.address
            ))),
        }
    }

    async fn promote(&self, server: &Server) -> Result<()> {
        self.skipped("promote", server)
    }

    async fn demote(&self, server: &Server) -> Result<()> {
        self.skipped("demote", server)
    }

    async fn set_read_only(&self, server: &Server, read_only: bool) -> Result<()> {
        self.skipped(if read_only { "set_read_only" } else { "set_read_write" }, server)
    }

    async fn start_replication(&self, server: &Server, _source: &Server) -> Result<()> {
        self.skipped("start_replication", server)
    }

    async fn stop_replication(&self, server: &Server) -> Result<()> {
        self.skipped("stop_replication", server)
    }

    async fn reset_master(&self, server: &Server) -> Result<()> {
        self.skipped("reset_master", server)
    }
}
