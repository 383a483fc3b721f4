//! In-process implementation of the [`Kv`] trait with the same observable
//! semantics as etcd: monotonic revisions, leases that expire keys, and
//! prefix watches. Used by the test suites across the workspace.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use hypervisor_types::{Error, Result};

use super::{KeepAlive, Kv, KvEvent, KvEventType, KvPair, KvWatch};

const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    create_revision: i64,
    mod_revision: i64,
    lease: i64,
}

#[derive(Debug)]
struct Lease {
    ttl: i64,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, Entry>,
    leases: HashMap<i64, Lease>,
    revision: i64,
    next_lease: i64,
}

/// An in-memory KV store. Clones share state.
#[derive(Clone)]
pub struct MemKv {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<KvEvent>,
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemKv {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        MemKv {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }

    fn pair(key: &str, entry: &Entry) -> KvPair {
        KvPair {
            key: key.to_string(),
            value: entry.value.clone(),
            create_revision: entry.create_revision,
            mod_revision: entry.mod_revision,
        }
    }

    /// Drop keys whose lease has expired, emitting delete events exactly as
    /// the real store would.
    fn sweep(&self, inner: &mut Inner) {
        let now = Instant::now();
        let expired: Vec<i64> = inner
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease_id in expired {
            inner.leases.remove(&lease_id);
            let doomed: Vec<String> = inner
                .data
                .iter()
                .filter(|(_, e)| e.lease == lease_id)
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                if let Some(entry) = inner.data.remove(&key) {
                    inner.revision += 1;
                    let mut pair = Self::pair(&key, &entry);
                    pair.mod_revision = inner.revision;
                    let _ = self.events.send(KvEvent {
                        event_type: KvEventType::Delete,
                        pair,
                    });
                }
            }
        }
    }

    fn write(&self, key: &str, value: Vec<u8>, lease: i64) {
        let mut inner = self.inner.lock().unwrap();
        self.sweep(&mut inner);
        inner.revision += 1;
        let revision = inner.revision;
        let pair = match inner.data.get_mut(key) {
            Some(entry) => {
                entry.value = value;
                entry.mod_revision = revision;
                entry.lease = lease;
                Self::pair(key, entry)
            }
            None => {
                let entry = Entry {
                    value,
                    create_revision: revision,
                    mod_revision: revision,
                    lease,
                };
                let pair = Self::pair(key, &entry);
                inner.data.insert(key.to_string(), entry);
                pair
            }
        };
        let _ = self.events.send(KvEvent {
            event_type: KvEventType::Put,
            pair,
        });
    }

    /// Force-expire a lease without waiting for its TTL. Test helper.
    pub fn expire_lease(&self, lease_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(lease) = inner.leases.get_mut(&lease_id) {
            lease.expires_at = Instant::now() - Duration::from_millis(1);
        }
        self.sweep(&mut inner);
    }
}

#[async_trait]
impl Kv for MemKv {
    async fn get(&self, key: &str) -> Result<KvPair> {
        let mut inner = self.inner.lock().unwrap();
        self.sweep(&mut inner);
        inner
            .data
            .get(key)
            .map(|e| Self::pair(key, e))
            .ok_or_else(|| Error::not_found(format!("key {}", key)))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let mut inner = self.inner.lock().unwrap();
        self.sweep(&mut inner);
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| Self::pair(k, e))
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.write(key, value, 0);
        Ok(())
    }

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease_id: i64) -> Result<()> {
        {
            let inner = self.inner.lock().unwrap();
            if !inner.leases.contains_key(&lease_id) {
                return Err(Error::not_found(format!("lease {:x}", lease_id)));
            }
        }
        self.write(key, value, lease_id);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        self.sweep(&mut inner);
        match inner.data.remove(key) {
            Some(entry) => {
                inner.revision += 1;
                let mut pair = Self::pair(key, &entry);
                pair.mod_revision = inner.revision;
                let _ = self.events.send(KvEvent {
                    event_type: KvEventType::Delete,
                    pair,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<i64> {
        let keys: Vec<String> = {
            let mut inner = self.inner.lock().unwrap();
            self.sweep(&mut inner);
            inner
                .data
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect()
        };
        let mut deleted = 0;
        for key in keys {
            if self.delete(&key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn create_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        let absent = {
            let mut inner = self.inner.lock().unwrap();
            self.sweep(&mut inner);
            !inner.data.contains_key(key)
        };
        if absent {
            self.write(key, value, 0);
        }
        Ok(absent)
    }

    async fn grant_lease(&self, ttl_seconds: i64) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(
            id,
            Lease {
                ttl: ttl_seconds,
                expires_at: Instant::now() + Duration::from_secs(ttl_seconds.max(0) as u64),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease_id: i64) -> Result<KeepAlive> {
        {
            let inner = self.inner.lock().unwrap();
            if !inner.leases.contains_key(&lease_id) {
                return Err(Error::not_found(format!("lease {:x}", lease_id)));
            }
        }
        let (tx, rx) = mpsc::channel(8);
        let store = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let ttl = {
                    let mut inner = store.inner.lock().unwrap();
                    store.sweep(&mut inner);
                    match inner.leases.get_mut(&lease_id) {
                        Some(lease) => {
                            lease.expires_at =
                                Instant::now() + Duration::from_secs(lease.ttl.max(0) as u64);
                            lease.ttl
                        }
                        None => break,
                    }
                };
                if tx.send(ttl).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(
                    ((ttl.max(1) as u64) * 1000 / 3).max(50),
                ))
                .await;
            }
        });
        Ok(KeepAlive::new(rx, task))
    }

    async fn keep_alive_once(&self, lease_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.sweep(&mut inner);
        match inner.leases.get_mut(&lease_id) {
            Some(lease) => {
                lease.expires_at = Instant::now() + Duration::from_secs(lease.ttl.max(0) as u64);
                Ok(())
            }
            None => Err(Error::not_found(format!("lease {:x}", lease_id))),
        }
    }

    async fn revoke_lease(&self, lease_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.leases.remove(&lease_id).is_none() {
            return Err(Error::not_found(format!("lease {:x}", lease_id)));
        }
        let doomed: Vec<String> = inner
            .data
            .iter()
            .filter(|(_, e)| e.lease == lease_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            if let Some(entry) = inner.data.remove(&key) {
                inner.revision += 1;
                let mut pair = Self::pair(&key, &entry);
                pair.mod_revision = inner.revision;
                let _ = self.events.send(KvEvent {
                    event_type: KvEventType::Delete,
                    pair,
                });
            }
        }
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<KvWatch> {
        let mut rx = self.events.subscribe();
        let (tx, out) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let prefix = prefix.to_string();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.pair.key.starts_with(&prefix)
                            && tx.send(event).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(KvWatch::new(out, task))
    }
}
