//! OCI container driver backed by the Docker Engine API via `bollard`.
//!
//! The engine owns the runtime state; this driver keeps a persisted record
//! per instance (for recovery and for `list` when the engine is away) and
//! maps every lifecycle call onto the corresponding engine operation.
//! Container names are derived from the instance ID so replays are cheap to
//! detect.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use bollard::Docker;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use hypervisor_types::{
    Error, Instance, InstanceSpec, InstanceState, InstanceStats, InstanceType, Result,
};

use crate::store::InstanceStore;
use crate::Driver;

/// Label stamped on every container this driver owns.
const MANAGED_LABEL: &str = "io.hypervisor.instance-id";

#[derive(Debug, Clone)]
pub struct ContainerDriverConfig {
    pub state_dir: PathBuf,
    /// Default graceful-stop window handed to the engine.
    pub stop_timeout: Duration,
}

impl Default for ContainerDriverConfig {
    fn default() -> Self {
        ContainerDriverConfig {
            state_dir: PathBuf::from("/var/lib/hypervisor/container"),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

struct ContainerHandle {
    instance: Instance,
}

type Handle = Arc<Mutex<ContainerHandle>>;

pub struct ContainerDriver {
    docker: Docker,
    config: ContainerDriverConfig,
    store: InstanceStore,
    instances: RwLock<HashMap<String, Handle>>,
}

fn docker_err(err: bollard::errors::Error) -> Error {
    use bollard::errors::Error::*;
    match err {
        DockerResponseServerError {
            status_code: 404,
            message,
        } => Error::NotFound(message),
        DockerResponseServerError {
            status_code: 409,
            message,
        } => Error::AlreadyExists(message),
        DockerResponseServerError {
            status_code,
            message,
        } => Error::Internal(format!("docker ({}): {}", status_code, message)),
        other => Error::Unavailable(format!("docker: {}", other)),
    }
}

fn container_name(id: &str) -> String {
    format!("hv-{}", id)
}

fn map_engine_state(status: Option<ContainerStateStatusEnum>) -> InstanceState {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => InstanceState::Stopped,
        Some(ContainerStateStatusEnum::RUNNING) => InstanceState::Running,
        Some(ContainerStateStatusEnum::RESTARTING) => InstanceState::Running,
        Some(ContainerStateStatusEnum::PAUSED) => InstanceState::Paused,
        Some(ContainerStateStatusEnum::EXITED) => InstanceState::Stopped,
        Some(ContainerStateStatusEnum::REMOVING) => InstanceState::Stopped,
        Some(ContainerStateStatusEnum::DEAD) => InstanceState::Failed,
        _ => InstanceState::Unknown,
    }
}

impl ContainerDriver {
    /// Connect to the local engine and recover persisted records.
    pub async fn new(config: ContainerDriverConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::unavailable(format!("docker: {}", e)))?;
        Self::with_docker(docker, config).await
    }

    pub async fn with_docker(docker: Docker, config: ContainerDriverConfig) -> Result<Self> {
        let store = InstanceStore::new(&config.state_dir);
        store.ensure().await?;

        let mut instances = HashMap::new();
        for instance in store.load_all().await? {
            info!(instance_id = %instance.id, "recovered container record");
            instances.insert(
                instance.id.clone(),
                Arc::new(Mutex::new(ContainerHandle { instance })),
            );
        }

        Ok(ContainerDriver {
            docker,
            config,
            store,
            instances: RwLock::new(instances),
        })
    }

    async fn handle(&self, id: &str) -> Result<Handle> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("instance {}", id)))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        debug!(image, "pulling image");
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map(|_| ())
            .map_err(docker_err)
    }

    /// Refresh a record's state and address from the engine. Missing
    /// containers surface as `failed` with a reason rather than an error so
    /// the record stays inspectable.
    async fn refresh_locked(&self, handle: &mut ContainerHandle) -> Result<()> {
        let name = container_name(&handle.instance.id);
        match self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                let status = inspect.state.as_ref().and_then(|s| s.status);
                let state = map_engine_state(status);
                if state != handle.instance.state {
                    handle.instance.state = state;
                    handle.instance.updated_at = Utc::now();
                }
                if let Some(ip) = inspect
                    .network_settings
                    .as_ref()
                    .and_then(|n| n.ip_address.clone())
                    .filter(|ip| !ip.is_empty())
                {
                    handle.instance.ip_address = Some(ip);
                }
                Ok(())
            }
            Err(err) => {
                let mapped = docker_err(err);
                if mapped.is_not_found() {
                    handle.instance.state = InstanceState::Failed;
                    handle.instance.state_reason = "container missing from engine".to_string();
                    Ok(())
                } else {
                    Err(mapped)
                }
            }
        }
    }
}

/// Translate an instance spec into the engine's container configuration.
fn engine_config(id: &str, spec: &InstanceSpec) -> Config<String> {
    let mut cmd = Vec::new();
    if let Some(command) = &spec.command {
        cmd.push(command.clone());
        cmd.extend(spec.args.iter().cloned());
    }
    let env: Vec<String> = spec
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), id.to_string());

    let mut host_config = HostConfig {
        memory: Some((spec.memory_mb * 1024 * 1024) as i64),
        nano_cpus: Some(spec.cpu_cores as i64 * 1_000_000_000),
        ..Default::default()
    };
    if let Some(limits) = &spec.resource_limits {
        if limits.memory_limit > 0 {
            host_config.memory = Some(limits.memory_limit);
        }
        if limits.cpu_quota > 0 {
            host_config.cpu_quota = Some(limits.cpu_quota);
            host_config.nano_cpus = None;
        }
        if limits.cpu_period > 0 {
            host_config.cpu_period = Some(limits.cpu_period);
        }
    }

    Config {
        image: Some(spec.image.clone()),
        cmd: (!cmd.is_empty()).then_some(cmd),
        env: (!env.is_empty()).then_some(env),
        labels: Some(labels),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl Driver for ContainerDriver {
    fn name(&self) -> &str {
        "docker"
    }

    fn instance_type(&self) -> InstanceType {
        InstanceType::Container
    }

    #[instrument(level = "info", skip(self, spec))]
    async fn create(&self, id: &str, name: &str, spec: &InstanceSpec) -> Result<Instance> {
        spec.validate()?;
        if spec.image.is_empty() {
            return Err(Error::invalid_spec("container requires an image reference"));
        }

        // Take the map lock only to claim the slot; the handle is locked
        // after the map lock is gone.
        let (handle, replayed) = {
            let mut instances = self.instances.write().await;
            match instances.get(id) {
                Some(existing) => (existing.clone(), true),
                None => {
                    let mut instance =
                        Instance::new(id, name, InstanceType::Container, spec.clone());
                    instance.state = InstanceState::Creating;
                    let handle = Arc::new(Mutex::new(ContainerHandle { instance }));
                    instances.insert(id.to_string(), handle.clone());
                    (handle, false)
                }
            }
        };
        if replayed {
            return Ok(handle.lock().await.instance.clone());
        }
        let mut locked = handle.lock().await;

        self.pull_image(&spec.image).await?;

        let options = CreateContainerOptions {
            name: container_name(id),
            platform: None,
        };
        match self
            .docker
            .create_container(Some(options), engine_config(id, spec))
            .await
        {
            Ok(_) => {}
            // A replayed create finds the container already present.
            Err(err) => {
                let mapped = docker_err(err);
                if !matches!(mapped, Error::AlreadyExists(_)) {
                    locked.instance.state = InstanceState::Failed;
                    locked.instance.state_reason = mapped.to_string();
                    let _ = self.store.save(&locked.instance).await;
                    return Err(mapped);
                }
            }
        }

        locked.instance.state = InstanceState::Stopped;
        locked.instance.updated_at = Utc::now();
        self.store.save(&locked.instance).await?;
        info!(instance_id = %id, image = %spec.image, "created container");
        Ok(locked.instance.clone())
    }

    #[instrument(level = "info", skip(self))]
    async fn start(&self, id: &str) -> Result<()> {
        let handle = self.handle(id).await?;
        let mut locked = handle.lock().await;
        if locked.instance.state == InstanceState::Running {
            return Ok(());
        }
        match self
            .docker
            .start_container(&container_name(id), None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                // Already started.
            }
            Err(err) => return Err(docker_err(err)),
        }
        self.refresh_locked(&mut locked).await?;
        self.store.save(&locked.instance).await
    }

    #[instrument(level = "info", skip(self))]
    async fn stop(&self, id: &str, force: bool) -> Result<()> {
        let handle = self.handle(id).await?;
        let mut locked = handle.lock().await;
        if matches!(
            locked.instance.state,
            InstanceState::Stopped | InstanceState::Failed
        ) {
            return Ok(());
        }
        let name = container_name(id);
        let result = if force {
            self.docker
                .kill_container(&name, None::<KillContainerOptions<String>>)
                .await
        } else {
            self.docker
                .stop_container(
                    &name,
                    Some(StopContainerOptions {
                        t: self.config.stop_timeout.as_secs() as i64,
                    }),
                )
                .await
        };
        match result {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(err) => return Err(docker_err(err)),
        }
        self.refresh_locked(&mut locked).await?;
        self.store.save(&locked.instance).await
    }

    #[instrument(level = "info", skip(self))]
    async fn delete(&self, id: &str) -> Result<()> {
        let handle = match self.handle(id).await {
            Ok(handle) => handle,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        {
            let _locked = handle.lock().await;
            match self
                .docker
                .remove_container(
                    &container_name(id),
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => {}
                Err(err) => {
                    let mapped = docker_err(err);
                    if !mapped.is_not_found() {
                        return Err(mapped);
                    }
                }
            }
        }
        self.store.remove(id).await?;
        self.instances.write().await.remove(id);
        info!(instance_id = %id, "deleted container");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Instance> {
        let handle = self.handle(id).await?;
        let mut locked = handle.lock().await;
        if let Err(err) = self.refresh_locked(&mut locked).await {
            debug!(instance_id = %id, error = %err, "engine unreachable; serving last known state");
        }
        Ok(locked.instance.clone())
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        let handles: Vec<Handle> = self.instances.read().await.values().cloned().collect();
        let mut instances = Vec::with_capacity(handles.len());
        for handle in handles {
            let mut locked = handle.lock().await;
            if let Err(err) = self.refresh_locked(&mut locked).await {
                debug!(error = %err, "engine unreachable; serving last known state");
            }
            instances.push(locked.instance.clone());
        }
        Ok(instances)
    }

    async fn stats(&self, id: &str) -> Result<InstanceStats> {
        // Make sure the id is ours before asking the engine.
        self.handle(id).await?;
        let mut stream = self.docker.stats(
            &container_name(id),
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        let sample = stream
            .next()
            .await
            .ok_or_else(|| Error::unavailable("engine returned no stats sample"))?
            .map_err(docker_err)?;

        let mut stats = InstanceStats {
            collected_at: Some(Utc::now()),
            ..Default::default()
        };

        stats.cpu_time_ns = sample.cpu_stats.cpu_usage.total_usage;
        let cpu_delta = sample
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(sample.precpu_stats.cpu_usage.total_usage);
        let system_delta = sample
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(sample.precpu_stats.system_cpu_usage.unwrap_or(0));
        if system_delta > 0 {
            let online = sample.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
            stats.cpu_usage_percent =
                (cpu_delta as f64 / system_delta as f64) * online * 100.0;
        }

        stats.memory_used_bytes = sample.memory_stats.usage.unwrap_or(0);
        if let Some(mem) = sample.memory_stats.stats {
            use bollard::container::MemoryStatsStats;
            stats.memory_cache_bytes = match mem {
                MemoryStatsStats::V1(v1) => v1.cache,
                MemoryStatsStats::V2(v2) => v2.file,
            };
        }

        if let Some(entries) = sample.blkio_stats.io_service_bytes_recursive {
            for entry in entries {
                match entry.op.to_ascii_lowercase().as_str() {
                    "read" => stats.disk_read_bytes += entry.value,
                    "write" => stats.disk_write_bytes += entry.value,
                    _ => {}
                }
            }
        }

        if let Some(networks) = sample.networks {
            for net in networks.values() {
                stats.network_rx_bytes += net.rx_bytes;
                stats.network_tx_bytes += net.tx_bytes;
            }
        }

        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        // Containers are supervised by the engine; nothing to release.
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn engine_state_mapping_follows_lifecycle() {
        assert_eq!(
            map_engine_state(Some(ContainerStateStatusEnum::RUNNING)),
            InstanceState::Running
        );
        assert_eq!(
            map_engine_state(Some(ContainerStateStatusEnum::EXITED)),
            InstanceState::Stopped
        );
        assert_eq!(
            map_engine_state(Some(ContainerStateStatusEnum::PAUSED)),
            InstanceState::Paused
        );
        assert_eq!(
            map_engine_state(Some(ContainerStateStatusEnum::DEAD)),
            InstanceState::Failed
        );
        assert_eq!(map_engine_state(None), InstanceState::Unknown);
    }

    #[test]
    fn container_names_are_stable_per_instance() {
        assert_eq!(container_name("i-1"), "hv-i-1");
    }

    #[test]
    fn engine_config_carries_sizing_and_limits() {
        let mut spec = InstanceSpec {
            image: "nginx:alpine".into(),
            cpu_cores: 2,
            memory_mb: 512,
            command: Some("nginx".into()),
            args: vec!["-g".into(), "daemon off;".into()],
            ..Default::default()
        };
        spec.env.insert("MODE".into(), "prod".into());

        let config = engine_config("i-1", &spec);
        assert_eq!(config.image.as_deref(), Some("nginx:alpine"));
        assert_eq!(
            config.cmd,
            Some(vec![
                "nginx".to_string(),
                "-g".to_string(),
                "daemon off;".to_string()
            ])
        );
        assert_eq!(config.env, Some(vec!["MODE=prod".to_string()]));
        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(2_000_000_000));
        assert_eq!(
            config.labels.unwrap().get(MANAGED_LABEL).map(String::as_str),
            Some("i-1")
        );

        // Explicit cgroup limits override the derived sizing.
        spec.resource_limits = Some(hypervisor_types::ResourceLimits {
            cpu_quota: 50_000,
            cpu_period: 100_000,
            memory_limit: 256 * 1024 * 1024,
            ..Default::default()
        });
        let host = engine_config("i-1", &spec).host_config.unwrap();
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.cpu_quota, Some(50_000));
        assert_eq!(host.cpu_period, Some(100_000));
        assert_eq!(host.nano_cpus, None);
    }

    #[test]
    fn error_mapping_distinguishes_missing_from_transport() {
        let missing = docker_err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        });
        assert!(missing.is_not_found());

        let conflict = docker_err(bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "name in use".into(),
        });
        assert!(matches!(conflict, Error::AlreadyExists(_)));
    }
}
