//! Failover controller
//!
//! Reacts to FAULTY declarations from the detector and to manual switchover
//! requests. Both paths build a procedure and push it through the same
//! executor, so at most one topology-changing job per group is ever in
//! flight: the group lock serializes them.

use crate::common::config::FailoverConfig;
use crate::events::{EventBus, FarmEventKind};
use crate::executor::job::{Job, JobId};
use crate::executor::lock::ResourceKey;
use crate::executor::procedure::Step;
use crate::executor::scheduler::Executor;
use crate::topology::{Group, Server, ServerId, ServerStatus, TopologyStore};
use crate::Result;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub struct FailoverController {
    topology: Arc<TopologyStore>,
    executor: Executor,
    cfg: FailoverConfig,
    /// Last failover submission per group, for cool-down
    cooldown: Mutex<HashMap<String, Instant>>,
    /// Groups known to have no promotable member
    leaderless: Mutex<HashSet<String>>,
    events: EventBus,
}

impl FailoverController {
    pub fn new(
        topology: Arc<TopologyStore>,
        executor: Executor,
        cfg: FailoverConfig,
        events: EventBus,
    ) -> Self {
        Self {
            topology,
            executor,
            cfg,
            cooldown: Mutex::new(HashMap::new()),
            leaderless: Mutex::new(HashSet::new()),
            events,
        }
    }

    /// React to a FAULTY edge reported by the detector.
    ///
    /// For a group primary this submits a failover job unless the group is in
    /// cool-down or has no candidate; for any other server it submits a job
    /// that records the server faulty. Returns the submitted job id, if any.
    pub fn on_server_faulty(&self, server: ServerId) -> Result<Option<JobId>> {
        let srv = self.topology.server(&server)?;
        let Some(group_id) = srv.group.clone() else {
            // Unattached server, nothing to fail over
            return self.submit_deactivate(&srv).map(Some);
        };
        let group = self.topology.group(&group_id)?;

        if group.primary != Some(server) {
            return self.submit_deactivate(&srv).map(Some);
        }

        if let Some(remaining) = self.in_cooldown(&group_id) {
            self.events.publish(FarmEventKind::FailoverSuppressed {
                group: group_id,
                remaining_ms: remaining.as_millis() as u64,
            });
            return Ok(None);
        }

        let members = self.topology.servers_in(&group_id)?;
        let Some(candidate) = select_candidate(&members, Some(server)) else {
            self.leaderless.lock().unwrap().insert(group_id.clone());
            self.events
                .publish(FarmEventKind::GroupLeaderless { group: group_id });
            return Ok(None);
        };

        let job = build_failover(&group, &srv, &candidate, &members);
        let candidate_id = candidate.uuid;
        let id = self.executor.submit(job)?;
        self.touch_cooldown(&group_id);
        self.leaderless.lock().unwrap().remove(&group_id);
        self.events.publish(FarmEventKind::FailoverStarted {
            group: group_id,
            job: id,
            candidate: candidate_id,
        });
        Ok(Some(id))
    }

    /// Planned, administrator-initiated primary replacement.
    ///
    /// Picks `target` (or the best-ranked running member) and submits a
    /// switchover job through the same path automatic failover uses.
    pub fn switchover(&self, group_id: &str, target: Option<ServerId>) -> Result<JobId> {
        let group = self.topology.group(group_id)?;
        let old = group
            .primary
            .ok_or_else(|| crate::Error::Group(format!("Group ({}) has no primary", group_id)))?;
        let members = self.topology.servers_in(group_id)?;

        let new = match target {
            Some(uuid) => members
                .iter()
                .find(|s| s.uuid == uuid && s.status.is_running())
                .cloned()
                .ok_or_else(|| {
                    crate::Error::Server(format!(
                        "Server ({}) is not a running member of group ({})",
                        uuid, group_id
                    ))
                })?,
            None => select_candidate(&members, Some(old))
                .ok_or_else(|| crate::Error::NoCandidate(group_id.to_string()))?,
        };
        if new.uuid == old {
            return Err(crate::Error::Server(format!(
                "Server ({}) is already primary in group ({})",
                new.uuid, group_id
            )));
        }

        let old_server = self.topology.server(&old)?;
        let job = build_switchover(&group, &old_server, &new, &members);
        let id = self.executor.submit(job)?;
        self.touch_cooldown(group_id);
        Ok(id)
    }

    /// Has this group been recorded leaderless?
    pub fn is_leaderless(&self, group_id: &str) -> bool {
        self.leaderless.lock().unwrap().contains(group_id)
    }

    fn submit_deactivate(&self, server: &Server) -> Result<JobId> {
        let mut keys = BTreeSet::new();
        keys.insert(ResourceKey::server(&server.uuid));
        if let Some(group) = &server.group {
            keys.insert(ResourceKey::group(group));
        }
        let job = Job::new(
            format!("deactivate {}", server.address),
            vec![Step::SetServerStatus {
                server: server.uuid,
                status: ServerStatus::Faulty,
                previous: server.status,
            }],
            keys,
        );
        self.executor.submit(job)
    }

    fn in_cooldown(&self, group_id: &str) -> Option<Duration> {
        let interval = Duration::from_millis(self.cfg.interval_ms);
        let cooldown = self.cooldown.lock().unwrap();
        let last = cooldown.get(group_id)?;
        let elapsed = last.elapsed();
        if elapsed < interval {
            Some(interval - elapsed)
        } else {
            None
        }
    }

    fn touch_cooldown(&self, group_id: &str) {
        self.cooldown
            .lock()
            .unwrap()
            .insert(group_id.to_string(), Instant::now());
    }
}

/// Pick the replacement primary: running members only, best (lowest) rank,
/// ties broken by lowest uuid so the choice is deterministic
pub fn select_candidate(members: &[Server], exclude: Option<ServerId>) -> Option<Server> {
    members
        .iter()
        .filter(|s| s.status.is_running() && Some(s.uuid) != exclude)
        .min_by_key(|s| (s.rank, s.uuid))
        .cloned()
}

/// Failover procedure: record the old primary faulty, cut the candidate loose
/// from it, promote, and re-point the surviving replicas
fn build_failover(group: &Group, failed: &Server, candidate: &Server, members: &[Server]) -> Job {
    let mut steps = vec![
        Step::SetServerStatus {
            server: failed.uuid,
            status: ServerStatus::Faulty,
            previous: failed.status,
        },
        Step::StopReplication {
            server: candidate.uuid,
            source: failed.uuid,
        },
        Step::PromotePrimary {
            group: group.id.clone(),
            server: candidate.uuid,
            previous: Some(failed.uuid),
        },
    ];
    for replica in members {
        if replica.uuid == failed.uuid || replica.uuid == candidate.uuid {
            continue;
        }
        if !replica.status.is_running() {
            continue;
        }
        steps.push(Step::StopReplication {
            server: replica.uuid,
            source: failed.uuid,
        });
        steps.push(Step::StartReplication {
            server: replica.uuid,
            source: candidate.uuid,
        });
    }
    Job::new(
        format!("failover {} -> {}", group.id, candidate.address),
        steps,
        lock_keys(group, members),
    )
}

/// Switchover procedure: fence the old primary, clear the candidate, promote,
/// then re-join the old primary and remaining replicas under the new one
fn build_switchover(group: &Group, old: &Server, new: &Server, members: &[Server]) -> Job {
    let mut steps = vec![
        Step::SetReadOnly {
            server: old.uuid,
            read_only: true,
        },
        Step::StopReplication {
            server: new.uuid,
            source: old.uuid,
        },
        Step::ResetMaster { server: new.uuid },
        Step::PromotePrimary {
            group: group.id.clone(),
            server: new.uuid,
            previous: Some(old.uuid),
        },
        Step::StartReplication {
            server: old.uuid,
            source: new.uuid,
        },
    ];
    for replica in members {
        if replica.uuid == old.uuid || replica.uuid == new.uuid {
            continue;
        }
        if !replica.status.is_running() {
            continue;
        }
        steps.push(Step::StopReplication {
            server: replica.uuid,
            source: old.uuid,
        });
        steps.push(Step::StartReplication {
            server: replica.uuid,
            source: new.uuid,
        });
    }
    Job::new(
        format!("switchover {} -> {}", group.id, new.address),
        steps,
        lock_keys(group, members),
    )
}

/// A topology-changing job locks the group and every member it may touch
fn lock_keys(group: &Group, members: &[Server]) -> BTreeSet<ResourceKey> {
    let mut keys = BTreeSet::new();
    keys.insert(ResourceKey::group(&group.id));
    for member in members {
        keys.insert(ResourceKey::server(&member.uuid));
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ServerMode;
    use uuid::Uuid;

    fn server(rank: u32, status: ServerStatus) -> Server {
        Server {
            uuid: Uuid::new_v4(),
            address: format!("db-{}:3306", rank),
            group: Some("g1".into()),
            status,
            mode: ServerMode::ReadOnly,
            rank,
        }
    }

    #[test]
    fn test_candidate_prefers_lowest_rank() {
        let a = server(2, ServerStatus::Running);
        let b = server(1, ServerStatus::Running);
        let c = server(3, ServerStatus::Running);
        let picked = select_candidate(&[a, b.clone(), c], None).unwrap();
        assert_eq!(picked.uuid, b.uuid);
    }

    #[test]
    fn test_candidate_tie_breaks_by_uuid() {
        let mut a = server(1, ServerStatus::Running);
        let mut b = server(1, ServerStatus::Running);
        // Force a known uuid order
        a.uuid = Uuid::from_u128(1);
        b.uuid = Uuid::from_u128(2);
        let picked = select_candidate(&[b.clone(), a.clone()], None).unwrap();
        assert_eq!(picked.uuid, a.uuid);
    }

    #[test]
    fn test_candidate_skips_faulty_and_excluded() {
        let a = server(1, ServerStatus::Faulty);
        let b = server(2, ServerStatus::Running);
        let c = server(3, ServerStatus::Spare);
        let picked = select_candidate(&[a.clone(), b.clone(), c], Some(b.uuid));
        assert!(picked.is_none());

        let picked = select_candidate(&[a, b.clone()], None).unwrap();
        assert_eq!(picked.uuid, b.uuid);
    }

    #[test]
    fn test_failover_steps_shape() {
        let failed = server(0, ServerStatus::Running);
        let cand = server(1, ServerStatus::Running);
        let replica = server(2, ServerStatus::Running);
        let group = Group {
            id: "g1".into(),
            description: None,
            members: [failed.uuid, cand.uuid, replica.uuid].into_iter().collect(),
            primary: Some(failed.uuid),
        };

        let members = vec![failed.clone(), cand.clone(), replica.clone()];
        let job = build_failover(&group, &failed, &cand, &members);

        assert_eq!(job.steps.len(), 5);
        assert!(matches!(job.steps[0], Step::SetServerStatus { .. }));
        assert!(matches!(job.steps[2], Step::PromotePrimary { .. }));
        // Group plus all three member locks
        assert_eq!(job.lock_keys.len(), 4);
        assert!(job.lock_keys.contains(&ResourceKey::group("g1")));
    }
}
