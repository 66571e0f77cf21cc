//! Per-resource mutual exclusion for jobs
//!
//! Multi-key acquisition is all-or-nothing: keys are claimed in their fixed
//! lexicographic order, so two jobs with overlapping key sets can never wait
//! on each other in a cycle. Each key keeps a FIFO waiter queue and a release
//! hands the key directly to the longest-waiting job, so later arrivals
//! cannot barge past a parked waiter.

use crate::executor::job::JobId;
use crate::Result;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// A lockable resource name, e.g. `group:g1` or `server:<uuid>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn group(id: &str) -> Self {
        Self(format!("group:{}", id))
    }

    pub fn server(uuid: &uuid::Uuid) -> Self {
        Self(format!("server:{}", uuid))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Waiter {
    job: JobId,
    grant: oneshot::Sender<()>,
}

struct KeyQueue {
    holder: JobId,
    waiters: VecDeque<Waiter>,
}

/// Lock manager: resource key → holding job, FIFO waiters per key
pub struct LockManager {
    table: Mutex<HashMap<ResourceKey, KeyQueue>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire every key in the set, blocking until all are held.
    ///
    /// Keys are taken in sorted order. On a wait timeout every key already
    /// held for this call is released and [`crate::Error::LockTimeout`] is
    /// returned, leaving the job holding nothing.
    pub async fn acquire(
        &self,
        keys: &BTreeSet<ResourceKey>,
        job: JobId,
        wait: Option<Duration>,
    ) -> Result<()> {
        let mut held: Vec<&ResourceKey> = Vec::with_capacity(keys.len());
        // BTreeSet iteration is the fixed global order
        for key in keys {
            match self.acquire_one(key, job, wait).await {
                Ok(()) => held.push(key),
                Err(e) => {
                    for h in held {
                        self.release_one(h, job);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn acquire_one(&self, key: &ResourceKey, job: JobId, wait: Option<Duration>) -> Result<()> {
        let rx = {
            let mut table = self.table.lock().unwrap();
            match table.get_mut(key) {
                None => {
                    table.insert(
                        key.clone(),
                        KeyQueue {
                            holder: job,
                            waiters: VecDeque::new(),
                        },
                    );
                    return Ok(());
                }
                // Re-acquiring a held key is a no-op
                Some(q) if q.holder == job => return Ok(()),
                Some(q) => {
                    let (tx, rx) = oneshot::channel();
                    q.waiters.push_back(Waiter { job, grant: tx });
                    rx
                }
            }
        };

        match wait {
            None => {
                // Sender only drops on grant or manager teardown
                rx.await
                    .map_err(|_| crate::Error::Internal(format!("lock queue dropped for {}", key)))
            }
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => {
                    Err(crate::Error::Internal(format!("lock queue dropped for {}", key)))
                }
                Err(_) => {
                    self.cancel_wait(key, job);
                    Err(crate::Error::LockTimeout(key.to_string()))
                }
            },
        }
    }

    /// Drop out of a key's waiter queue after a timeout.
    ///
    /// The grant may have raced the timeout; if this job became the holder in
    /// the meantime the key is released again so nothing leaks.
    fn cancel_wait(&self, key: &ResourceKey, job: JobId) {
        let granted = {
            let mut table = self.table.lock().unwrap();
            match table.get_mut(key) {
                Some(q) if q.holder == job => true,
                Some(q) => {
                    q.waiters.retain(|w| w.job != job);
                    false
                }
                None => false,
            }
        };
        if granted {
            self.release_one(key, job);
        }
    }

    /// Release a set of keys held by a job. Idempotent for keys not held.
    pub fn release(&self, keys: &BTreeSet<ResourceKey>, job: JobId) {
        for key in keys {
            self.release_one(key, job);
        }
    }

    /// Forcibly release every key a job still holds
    pub fn release_all(&self, job: JobId) {
        let held: Vec<ResourceKey> = {
            let table = self.table.lock().unwrap();
            table
                .iter()
                .filter(|(_, q)| q.holder == job)
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in &held {
            self.release_one(key, job);
        }
    }

    fn release_one(&self, key: &ResourceKey, job: JobId) {
        let mut table = self.table.lock().unwrap();
        let Some(q) = table.get_mut(key) else {
            return;
        };
        if q.holder != job {
            return;
        }
        // Hand the key to the longest-waiting job; skip waiters that gave up
        loop {
            match q.waiters.pop_front() {
                Some(next) => {
                    let next_job = next.job;
                    if next.grant.send(()).is_ok() {
                        q.holder = next_job;
                        return;
                    }
                }
                None => {
                    table.remove(key);
                    return;
                }
            }
        }
    }

    /// Current holder of a key, if any
    pub fn holder(&self, key: &ResourceKey) -> Option<JobId> {
        self.table.lock().unwrap().get(key).map(|q| q.holder)
    }

    /// Number of jobs parked behind a key
    pub fn waiting(&self, key: &ResourceKey) -> usize {
        self.table
            .lock()
            .unwrap()
            .get(key)
            .map_or(0, |q| q.waiters.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn keys(names: &[&str]) -> BTreeSet<ResourceKey> {
        names
            .iter()
            .map(|n| ResourceKey::group(n))
            .collect()
    }

    fn job() -> JobId {
        JobId::new()
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let locks = LockManager::new();
        let j1 = job();

        locks.acquire(&keys(&["g1"]), j1, None).await.unwrap();
        assert_eq!(locks.holder(&ResourceKey::group("g1")), Some(j1));

        locks.release(&keys(&["g1"]), j1);
        assert_eq!(locks.holder(&ResourceKey::group("g1")), None);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let locks = LockManager::new();
        let j1 = job();
        let j2 = job();

        locks.acquire(&keys(&["g1"]), j1, None).await.unwrap();
        // j2 never held g1; releasing must not disturb j1's hold
        locks.release(&keys(&["g1"]), j2);
        assert_eq!(locks.holder(&ResourceKey::group("g1")), Some(j1));
        locks.release(&keys(&["g1"]), j1);
        locks.release(&keys(&["g1"]), j1);
    }

    #[tokio::test]
    async fn test_fifo_handoff() {
        let locks = Arc::new(LockManager::new());
        let j1 = job();
        let j2 = job();
        let j3 = job();

        locks.acquire(&keys(&["g1"]), j1, None).await.unwrap();

        let l2 = locks.clone();
        let w2 = tokio::spawn(async move { l2.acquire(&keys(&["g1"]), j2, None).await });
        // Make sure j2 is parked before j3 arrives
        tokio::time::sleep(Duration::from_millis(20)).await;
        let l3 = locks.clone();
        let w3 = tokio::spawn(async move { l3.acquire(&keys(&["g1"]), j3, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(locks.waiting(&ResourceKey::group("g1")), 2);

        locks.release(&keys(&["g1"]), j1);
        w2.await.unwrap().unwrap();
        assert_eq!(locks.holder(&ResourceKey::group("g1")), Some(j2));

        locks.release(&keys(&["g1"]), j2);
        w3.await.unwrap().unwrap();
        assert_eq!(locks.holder(&ResourceKey::group("g1")), Some(j3));
        locks.release_all(j3);
    }

    #[tokio::test]
    async fn test_timeout_releases_partial_set() {
        let locks = Arc::new(LockManager::new());
        let j1 = job();
        let j2 = job();

        // j1 holds g2; j2 wants g1+g2 and must give back g1 on timeout
        locks.acquire(&keys(&["g2"]), j1, None).await.unwrap();
        let err = locks
            .acquire(&keys(&["g1", "g2"]), j2, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::LockTimeout(_)));
        assert_eq!(locks.holder(&ResourceKey::group("g1")), None);
        assert_eq!(locks.waiting(&ResourceKey::group("g2")), 0);
    }

    #[tokio::test]
    async fn test_release_all() {
        let locks = LockManager::new();
        let j1 = job();

        locks.acquire(&keys(&["g1", "g2", "g3"]), j1, None).await.unwrap();
        locks.release_all(j1);
        assert_eq!(locks.holder(&ResourceKey::group("g1")), None);
        assert_eq!(locks.holder(&ResourceKey::group("g2")), None);
        assert_eq!(locks.holder(&ResourceKey::group("g3")), None);
    }
}
