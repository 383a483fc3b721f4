//! The uniform driver contract and the per-agent driver manager.
//!
//! A driver owns every interaction with one runtime backend. The agent is
//! the only caller; it routes each request through the [`DriverManager`] and
//! never touches a backend directly. All three shipped drivers follow the
//! same shape: an `RwLock`'d map of instance handles guarding in-memory
//! state, and a per-instance state file that makes `create` safe to replay
//! and lets `list` survive an agent restart.

pub mod container;
pub mod microvm;
mod procstat;
mod qmp;
mod store;
pub mod testing;
pub mod vm;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use hypervisor_types::{Error, Instance, InstanceSpec, InstanceStats, InstanceType, Result};

pub use container::{ContainerDriver, ContainerDriverConfig};
pub use microvm::{MicroVmDriver, MicroVmDriverConfig};
pub use store::InstanceStore;
pub use vm::{VmDriver, VmDriverConfig};

/// Options for console attachment.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachOptions {
    /// Attach for output only; writes from the client are discarded.
    pub read_only: bool,
}

/// A bidirectional console byte stream.
pub trait ConsoleStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ConsoleStream for T {}

pub type Console = Box<dyn ConsoleStream>;

/// The instance-lifecycle contract every runtime backend implements.
///
/// Cancellation is cooperative: callers impose deadlines with
/// `tokio::time::timeout` and dropping the returned future abandons the
/// operation. Write operations are safe to replay after an interruption.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Human-readable backend name, e.g. `qemu`.
    fn name(&self) -> &str;

    /// The instance type this driver serves.
    fn instance_type(&self) -> InstanceType;

    /// Materialise the persistent artefacts for an instance without
    /// starting execution. Returns the record in state `stopped` (or
    /// `pending` for backends that defer materialisation). Replaying a
    /// create for an ID this driver already knows returns the existing
    /// record.
    async fn create(&self, id: &str, name: &str, spec: &InstanceSpec) -> Result<Instance>;

    /// Start execution. Idempotent when already running.
    async fn start(&self, id: &str) -> Result<()>;

    /// Stop execution. Non-force requests a graceful shutdown with a
    /// driver-defined timeout before escalating; force terminates
    /// immediately. Idempotent when already stopped.
    async fn stop(&self, id: &str, force: bool) -> Result<()>;

    /// Semantically stop-then-start; backends may substitute a
    /// runtime-native reboot for `force = false`.
    async fn restart(&self, id: &str, force: bool) -> Result<()> {
        self.stop(id, force).await?;
        self.start(id).await
    }

    /// Destroy the instance and clean its persistent artefacts. A running
    /// instance is force-stopped first.
    async fn delete(&self, id: &str) -> Result<()>;

    /// The driver's current view of one instance.
    async fn get(&self, id: &str) -> Result<Instance>;

    /// The driver's current view of everything it owns. Source of truth
    /// for recovery.
    async fn list(&self) -> Result<Vec<Instance>>;

    /// Best-effort usage sample; fields the backend cannot compute are
    /// zero.
    async fn stats(&self, id: &str) -> Result<InstanceStats>;

    /// Attach a bidirectional console stream. Optional; backends without a
    /// console surface return `not-supported`.
    async fn attach(&self, id: &str, _opts: AttachOptions) -> Result<Console> {
        Err(Error::NotSupported(format!(
            "console attach is not supported by the {} driver",
            self.name()
        )))
    }

    /// Release backend resources. Instances keep running where the backend
    /// permits it.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Maps instance types to the driver serving them. Built once at agent
/// startup and read-only afterwards.
#[derive(Default)]
pub struct DriverManager {
    drivers: Vec<(InstanceType, Arc<dyn Driver>)>,
}

impl DriverManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver. Last registration wins for a duplicated type.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        let instance_type = driver.instance_type();
        self.drivers.retain(|(t, _)| *t != instance_type);
        self.drivers.push((instance_type, driver));
    }

    /// The driver serving `instance_type`.
    pub fn get(&self, instance_type: InstanceType) -> Result<Arc<dyn Driver>> {
        self.drivers
            .iter()
            .find(|(t, _)| *t == instance_type)
            .map(|(_, d)| d.clone())
            .ok_or_else(|| {
                Error::not_found(format!("driver for instance type {}", instance_type))
            })
    }

    /// Locate the driver that owns an instance ID. Lifecycle RPCs carry
    /// only the ID, so routing probes each registered driver.
    pub async fn driver_for(&self, id: &str) -> Result<Arc<dyn Driver>> {
        for (_, driver) in &self.drivers {
            if driver.get(id).await.is_ok() {
                return Ok(driver.clone());
            }
        }
        Err(Error::not_found(format!("instance {}", id)))
    }

    /// The instance types this agent can host, in registration order.
    pub fn capabilities(&self) -> Vec<InstanceType> {
        self.drivers.iter().map(|(t, _)| *t).collect()
    }

    /// Union of every driver's local view.
    pub async fn list_all(&self) -> Result<Vec<Instance>> {
        let mut all = Vec::new();
        for (_, driver) in &self.drivers {
            all.extend(driver.list().await?);
        }
        Ok(all)
    }

    pub async fn close_all(&self) {
        for (_, driver) in &self.drivers {
            if let Err(err) = driver.close().await {
                tracing::warn!(driver = driver.name(), error = %err, "driver close failed");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::testing::FakeDriver;
    use super::*;

    #[tokio::test]
    async fn manager_routes_by_type_and_reports_missing_drivers() {
        let mut manager = DriverManager::new();
        manager.register(Arc::new(FakeDriver::new(InstanceType::Container)));

        assert!(manager.get(InstanceType::Container).is_ok());
        let err = match manager.get(InstanceType::MicroVm) {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert!(err.is_not_found());
        assert_eq!(manager.capabilities(), vec![InstanceType::Container]);
    }

    #[tokio::test]
    async fn driver_for_probes_each_driver() {
        let mut manager = DriverManager::new();
        let containers = Arc::new(FakeDriver::new(InstanceType::Container));
        let vms = Arc::new(FakeDriver::new(InstanceType::Vm));
        manager.register(containers.clone());
        manager.register(vms.clone());

        let spec = hypervisor_types::InstanceSpec {
            image: "img".into(),
            cpu_cores: 1,
            memory_mb: 64,
            ..Default::default()
        };
        vms.create("i-vm", "a-vm", &spec).await.unwrap();

        let owner = manager.driver_for("i-vm").await.unwrap();
        assert_eq!(owner.instance_type(), InstanceType::Vm);
        let missing = match manager.driver_for("i-missing").await {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn default_attach_is_not_supported() {
        let driver = FakeDriver::new(InstanceType::MicroVm);
        let err = match driver.attach("i-1", AttachOptions::default()).await {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert!(matches!(err, Error::NotSupported(_)));
    }
}
