//! etcd-backed implementation of the [`Kv`] trait.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions, PutOptions,
    TlsOptions, Txn, TxnOp, WatchOptions,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use hypervisor_types::{Error, Result};

use super::{KeepAlive, Kv, KvEvent, KvEventType, KvPair, KvWatch};

const WATCH_CHANNEL_SIZE: usize = 64;
const KEEP_ALIVE_CHANNEL_SIZE: usize = 8;

/// Connection settings for the etcd cluster backing the registries.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub dial_timeout: Duration,
    /// Per-request deadline applied by the client to every KV operation.
    pub op_timeout: Duration,
    pub credentials: Option<(String, String)>,
    pub tls: bool,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        EtcdConfig {
            endpoints: vec!["localhost:2379".to_string()],
            dial_timeout: Duration::from_secs(5),
            op_timeout: Duration::from_secs(5),
            credentials: None,
            tls: false,
        }
    }
}

/// The `kv` section of the daemon config files.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct KvSettings {
    pub endpoints: Vec<String>,
    /// Seconds.
    pub dial_timeout: u64,
    /// Seconds.
    pub op_timeout: u64,
    pub credentials: Option<KvCredentials>,
    pub tls: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KvCredentials {
    pub username: String,
    pub password: String,
}

impl Default for KvSettings {
    fn default() -> Self {
        KvSettings {
            endpoints: vec!["localhost:2379".to_string()],
            dial_timeout: 5,
            op_timeout: 5,
            credentials: None,
            tls: false,
        }
    }
}

impl KvSettings {
    pub fn to_config(&self) -> EtcdConfig {
        EtcdConfig {
            endpoints: self.endpoints.clone(),
            dial_timeout: Duration::from_secs(self.dial_timeout),
            op_timeout: Duration::from_secs(self.op_timeout),
            credentials: self
                .credentials
                .as_ref()
                .map(|c| (c.username.clone(), c.password.clone())),
            tls: self.tls,
        }
    }
}

/// Typed wrapper over an etcd cluster. Cheap to clone; all sub-clients share
/// the underlying channel.
#[derive(Clone)]
pub struct EtcdKv {
    client: Client,
}

impl EtcdKv {
    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(config.dial_timeout)
            .with_timeout(config.op_timeout)
            .with_keep_alive(Duration::from_secs(10), Duration::from_secs(5));
        if let Some((user, password)) = &config.credentials {
            options = options.with_user(user, password);
        }
        if config.tls {
            options = options.with_tls(TlsOptions::new());
        }
        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(transport)?;
        debug!(endpoints = ?config.endpoints, "connected to etcd");
        Ok(EtcdKv { client })
    }
}

fn transport(err: etcd_client::Error) -> Error {
    Error::unavailable(format!("kv store: {}", err))
}

fn pair_from(kv: &etcd_client::KeyValue) -> KvPair {
    KvPair {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
    }
}

#[async_trait]
impl Kv for EtcdKv {
    async fn get(&self, key: &str) -> Result<KvPair> {
        let mut kv = self.client.kv_client();
        let resp = kv.get(key, None).await.map_err(transport)?;
        resp.kvs()
            .first()
            .map(pair_from)
            .ok_or_else(|| Error::not_found(format!("key {}", key)))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(transport)?;
        Ok(resp.kvs().iter().map(pair_from).collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut kv = self.client.kv_client();
        kv.put(key, value, None).await.map_err(transport)?;
        Ok(())
    }

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease_id: i64) -> Result<()> {
        let mut kv = self.client.kv_client();
        kv.put(key, value, Some(PutOptions::new().with_lease(lease_id)))
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut kv = self.client.kv_client();
        let resp = kv.delete(key, None).await.map_err(transport)?;
        Ok(resp.deleted() > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<i64> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await
            .map_err(transport)?;
        Ok(resp.deleted())
    }

    async fn create_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        let mut kv = self.client.kv_client();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, None)]);
        let resp = kv.txn(txn).await.map_err(transport)?;
        Ok(resp.succeeded())
    }

    async fn grant_lease(&self, ttl_seconds: i64) -> Result<i64> {
        let mut lease = self.client.lease_client();
        let resp = lease.grant(ttl_seconds, None).await.map_err(transport)?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease_id: i64) -> Result<KeepAlive> {
        let mut lease = self.client.lease_client();
        let (mut keeper, mut stream) = lease.keep_alive(lease_id).await.map_err(transport)?;
        let (tx, rx) = mpsc::channel(KEEP_ALIVE_CHANNEL_SIZE);
        let task = tokio::spawn(async move {
            loop {
                if let Err(err) = keeper.keep_alive().await {
                    warn!(lease_id, error = %err, "lease renewal request failed");
                    break;
                }
                match stream.message().await {
                    Ok(Some(ack)) => {
                        let ttl = ack.ttl();
                        if ttl <= 0 {
                            warn!(lease_id, "lease expired or was revoked");
                            break;
                        }
                        if tx.send(ttl).await.is_err() {
                            break;
                        }
                        // Renew at a third of the remaining TTL.
                        tokio::time::sleep(Duration::from_secs((ttl as u64 / 3).max(1))).await;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(lease_id, error = %err, "keep-alive stream failed");
                        break;
                    }
                }
            }
        });
        Ok(KeepAlive::new(rx, task))
    }

    async fn keep_alive_once(&self, lease_id: i64) -> Result<()> {
        let mut lease = self.client.lease_client();
        let (mut keeper, mut stream) = lease.keep_alive(lease_id).await.map_err(transport)?;
        keeper.keep_alive().await.map_err(transport)?;
        match stream.message().await.map_err(transport)? {
            Some(ack) if ack.ttl() > 0 => Ok(()),
            _ => Err(Error::not_found(format!("lease {:x}", lease_id))),
        }
    }

    async fn revoke_lease(&self, lease_id: i64) -> Result<()> {
        let mut lease = self.client.lease_client();
        lease.revoke(lease_id).await.map_err(transport)?;
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<KvWatch> {
        let mut watch = self.client.watch_client();
        let (_watcher, mut stream) = watch
            .watch(
                prefix,
                Some(WatchOptions::new().with_prefix().with_prev_key()),
            )
            .await
            .map_err(transport)?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        let prefix = prefix.to_string();
        let task = tokio::spawn(async move {
            // Keep the watcher alive for the lifetime of the stream; dropping
            // it cancels the server-side watch.
            let _watcher = _watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            let mapped = match event.event_type() {
                                EventType::Put => event.kv().map(|kv| KvEvent {
                                    event_type: KvEventType::Put,
                                    pair: pair_from(kv),
                                }),
                                EventType::Delete => {
                                    // The current kv carries the key; the
                                    // previous kv carries the last value.
                                    event.kv().map(|kv| {
                                        let mut pair = pair_from(kv);
                                        if let Some(prev) = event.prev_kv() {
                                            pair.value = prev.value().to_vec();
                                        }
                                        KvEvent {
                                            event_type: KvEventType::Delete,
                                            pair,
                                        }
                                    })
                                }
                            };
                            if let Some(kv_event) = mapped {
                                if tx.send(kv_event).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(prefix = %prefix, error = %err, "watch stream failed; closing");
                        break;
                    }
                }
            }
        });
        Ok(KvWatch::new(rx, task))
    }
}
