//! A narrow, typed surface over the external consensus store.
//!
//! Two implementations: [`EtcdKv`] for production and [`MemKv`], a faithful
//! in-process model of the same semantics (revisions, leases, prefix
//! watches) used by tests throughout the workspace.

mod etcd;
mod mem;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use hypervisor_types::Result;

pub use etcd::{EtcdConfig, EtcdKv, KvCredentials, KvSettings};
pub use mem::MemKv;

/// A key-value pair with the store revisions the registries need to
/// distinguish freshly created keys from modified ones.
#[derive(Debug, Clone)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
}

impl KvPair {
    /// True when this revision of the key is the one that created it.
    pub fn is_create(&self) -> bool {
        self.create_revision == self.mod_revision
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventType {
    Put,
    Delete,
}

/// One change under a watched prefix. Delete events carry the last known
/// value of the key when the store can provide it.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub event_type: KvEventType,
    pub pair: KvPair,
}

/// A lazy, cancellable stream of changes under a prefix. Dropping the watch
/// cancels it; events observed before the cancellation revision are never
/// dropped.
pub struct KvWatch {
    events: mpsc::Receiver<KvEvent>,
    task: JoinHandle<()>,
}

impl KvWatch {
    pub(crate) fn new(events: mpsc::Receiver<KvEvent>, task: JoinHandle<()>) -> Self {
        KvWatch { events, task }
    }

    /// The next event, or `None` once the watch is cancelled or the stream
    /// ends.
    pub async fn next(&mut self) -> Option<KvEvent> {
        self.events.recv().await
    }

    /// Stop watching. Buffered events remain readable via [`next`](Self::next).
    pub fn cancel(&mut self) {
        self.task.abort();
        self.events.close();
    }
}

impl Drop for KvWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A keep-alive session for one lease. The owning task renews the lease on
/// its own cadence (a third of the granted TTL); consumers read the
/// acknowledgement stream and treat its end as loss of the lease.
pub struct KeepAlive {
    acks: mpsc::Receiver<i64>,
    task: JoinHandle<()>,
}

impl KeepAlive {
    pub(crate) fn new(acks: mpsc::Receiver<i64>, task: JoinHandle<()>) -> Self {
        KeepAlive { acks, task }
    }

    /// The next renewal acknowledgement (the remaining TTL in seconds), or
    /// `None` when the keep-alive stream has closed.
    pub async fn ack(&mut self) -> Option<i64> {
        self.acks.recv().await
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The store operations the registries are built on. Key-missing is the
/// distinguished `not-found` error; every other failure surfaces as
/// `unavailable` (transport) or `internal`.
#[async_trait]
pub trait Kv: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<KvPair>;

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KvPair>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease_id: i64) -> Result<()>;

    /// Returns whether a key was actually removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Returns the number of keys removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<i64>;

    /// Atomic create: a single compare-create-revision==0 transaction.
    /// Returns false when the key already exists.
    async fn create_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool>;

    async fn grant_lease(&self, ttl_seconds: i64) -> Result<i64>;

    /// Open a renewal session for the lease. See [`KeepAlive`].
    async fn keep_alive(&self, lease_id: i64) -> Result<KeepAlive>;

    /// Renew the lease exactly once.
    async fn keep_alive_once(&self, lease_id: i64) -> Result<()>;

    async fn revoke_lease(&self, lease_id: i64) -> Result<()>;

    async fn watch_prefix(&self, prefix: &str) -> Result<KvWatch>;
}
