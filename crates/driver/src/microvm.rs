//! MicroVM driver backed by Firecracker. The whole machine definition is
//! rendered to a JSON config file at create time and handed to the binary
//! with `--config-file`, so a start boots the guest immediately. Graceful
//! stop is a SIGTERM to the VMM; console attach is not supported.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use hypervisor_types::{
    Error, Instance, InstanceSpec, InstanceState, InstanceStats, InstanceType, Result,
};

use crate::procstat::{self, ProcSample};
use crate::store::InstanceStore;
use crate::Driver;

#[derive(Debug, Clone)]
pub struct MicroVmDriverConfig {
    pub firecracker_binary: PathBuf,
    pub state_dir: PathBuf,
    /// Kernel used when the spec does not name one.
    pub default_kernel: Option<PathBuf>,
    pub default_kernel_args: String,
    /// How long a SIGTERM may take before the VMM is killed.
    pub graceful_timeout: Duration,
}

impl Default for MicroVmDriverConfig {
    fn default() -> Self {
        MicroVmDriverConfig {
            firecracker_binary: PathBuf::from("firecracker"),
            state_dir: PathBuf::from("/var/lib/hypervisor/microvm"),
            default_kernel: None,
            default_kernel_args: "console=ttyS0 reboot=k panic=1 pci=off".to_string(),
            graceful_timeout: Duration::from_secs(10),
        }
    }
}

struct MicroVmHandle {
    instance: Instance,
    child: Option<Child>,
    last_sample: Option<ProcSample>,
}

type Handle = Arc<Mutex<MicroVmHandle>>;

pub struct MicroVmDriver {
    config: MicroVmDriverConfig,
    store: InstanceStore,
    instances: RwLock<HashMap<String, Handle>>,
}

impl MicroVmDriver {
    pub async fn new(config: MicroVmDriverConfig) -> Result<Self> {
        let store = InstanceStore::new(&config.state_dir);
        store.ensure().await?;

        let mut instances = HashMap::new();
        for mut instance in store.load_all().await? {
            if !matches!(instance.state, InstanceState::Stopped | InstanceState::Failed) {
                instance.state = InstanceState::Stopped;
                instance.state_reason = "agent restarted".to_string();
                store.save(&instance).await?;
            }
            info!(instance_id = %instance.id, "recovered microvm record");
            instances.insert(
                instance.id.clone(),
                Arc::new(Mutex::new(MicroVmHandle {
                    instance,
                    child: None,
                    last_sample: None,
                })),
            );
        }

        Ok(MicroVmDriver {
            config,
            store,
            instances: RwLock::new(instances),
        })
    }

    fn config_path(&self, id: &str) -> PathBuf {
        self.store.instance_dir(id).join("firecracker.json")
    }

    fn api_socket(&self, id: &str) -> PathBuf {
        self.store.instance_dir(id).join("firecracker.sock")
    }

    fn drive_path(&self, id: &str, name: &str) -> PathBuf {
        self.store.instance_dir(id).join(format!("{}.img", name))
    }

    async fn handle(&self, id: &str) -> Result<Handle> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("instance {}", id)))
    }

    /// The machine definition Firecracker boots from.
    pub(crate) fn machine_config(&self, id: &str, spec: &InstanceSpec) -> Result<serde_json::Value> {
        let kernel = spec
            .kernel
            .clone()
            .or_else(|| {
                self.config
                    .default_kernel
                    .as_ref()
                    .map(|p| p.display().to_string())
            })
            .ok_or_else(|| Error::invalid_spec("microvm requires a kernel image"))?;
        let boot_args = spec
            .kernel_args
            .clone()
            .unwrap_or_else(|| self.config.default_kernel_args.clone());

        let mut drives = Vec::new();
        if !spec.image.is_empty() {
            drives.push(json!({
                "drive_id": "rootfs",
                "path_on_host": spec.image,
                "is_root_device": true,
                "is_read_only": false,
            }));
        }
        for disk in &spec.disks {
            drives.push(json!({
                "drive_id": disk.name,
                "path_on_host": self.drive_path(id, &disk.name),
                "is_root_device": drives.is_empty() && disk.boot,
                "is_read_only": false,
            }));
        }
        if drives.is_empty() {
            return Err(Error::invalid_spec("microvm requires a root drive"));
        }

        let mut machine = json!({
            "boot-source": {
                "kernel_image_path": kernel,
                "boot_args": boot_args,
            },
            "drives": drives,
            "machine-config": {
                "vcpu_count": spec.cpu_cores,
                "mem_size_mib": spec.memory_mb,
                "smt": false,
            },
        });
        if let Some(initrd) = &spec.initrd {
            machine["boot-source"]["initrd_path"] = json!(initrd);
        }
        Ok(machine)
    }

    async fn materialise_drive(&self, path: &PathBuf, size_gb: u32) -> Result<()> {
        if tokio::fs::metadata(path).await.is_ok() {
            return Ok(());
        }
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| Error::internal(format!("creating drive image: {}", e)))?;
        file.set_len(size_gb as u64 * 1024 * 1024 * 1024)
            .await
            .map_err(|e| Error::internal(format!("sizing drive image: {}", e)))
    }

    async fn stop_locked(&self, handle: &mut MicroVmHandle, force: bool) -> Result<()> {
        if !matches!(
            handle.instance.state,
            InstanceState::Running | InstanceState::Paused
        ) {
            return Ok(());
        }
        let id = handle.instance.id.clone();

        if let Some(mut child) = handle.child.take() {
            let mut killed = false;
            #[cfg(unix)]
            if !force {
                if let Some(pid) = child.id() {
                    // Firecracker exits cleanly on SIGTERM.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                    killed = tokio::time::timeout(self.config.graceful_timeout, child.wait())
                        .await
                        .is_ok();
                    if !killed {
                        warn!(instance_id = %id, "graceful stop timed out; killing");
                    }
                }
            }
            #[cfg(not(unix))]
            let _ = force;
            if !killed {
                if let Err(err) = child.start_kill() {
                    debug!(instance_id = %id, error = %err, "vmm process already gone");
                }
                let _ = child.wait().await;
            }
        }

        let _ = tokio::fs::remove_file(self.api_socket(&id)).await;
        handle.instance.state = InstanceState::Stopped;
        handle.instance.state_reason.clear();
        handle.instance.updated_at = Utc::now();
        handle.last_sample = None;
        self.store.save(&handle.instance).await
    }
}

#[async_trait]
impl Driver for MicroVmDriver {
    fn name(&self) -> &str {
        "firecracker"
    }

    fn instance_type(&self) -> InstanceType {
        InstanceType::MicroVm
    }

    #[instrument(level = "info", skip(self, spec))]
    async fn create(&self, id: &str, name: &str, spec: &InstanceSpec) -> Result<Instance> {
        spec.validate()?;
        let machine = self.machine_config(id, spec)?;

        // Take the map lock only to claim the slot; the handle is locked
        // after the map lock is gone.
        let (handle, replayed) = {
            let mut instances = self.instances.write().await;
            match instances.get(id) {
                Some(existing) => (existing.clone(), true),
                None => {
                    let mut instance =
                        Instance::new(id, name, InstanceType::MicroVm, spec.clone());
                    instance.state = InstanceState::Creating;
                    if let Some(net) = &spec.network {
                        instance.ip_address = net.ip_address.clone();
                    }
                    let handle = Arc::new(Mutex::new(MicroVmHandle {
                        instance,
                        child: None,
                        last_sample: None,
                    }));
                    instances.insert(id.to_string(), handle.clone());
                    (handle, false)
                }
            }
        };
        if replayed {
            return Ok(handle.lock().await.instance.clone());
        }
        let mut locked = handle.lock().await;

        for disk in &spec.disks {
            let path = self.drive_path(id, &disk.name);
            if let Err(err) = self.materialise_drive(&path, disk.size_gb).await {
                locked.instance.state = InstanceState::Failed;
                locked.instance.state_reason = err.to_string();
                let _ = self.store.save(&locked.instance).await;
                return Err(err);
            }
        }

        // The store directory must exist before the config file lands in it.
        self.store.save(&locked.instance).await?;
        let config_json = serde_json::to_vec_pretty(&machine)?;
        tokio::fs::write(self.config_path(id), config_json)
            .await
            .map_err(|e| Error::internal(format!("writing machine config: {}", e)))?;

        locked.instance.state = InstanceState::Stopped;
        locked.instance.updated_at = Utc::now();
        self.store.save(&locked.instance).await?;
        info!(instance_id = %id, "created microvm");
        Ok(locked.instance.clone())
    }

    #[instrument(level = "info", skip(self))]
    async fn start(&self, id: &str) -> Result<()> {
        let handle = self.handle(id).await?;
        let mut locked = handle.lock().await;
        if locked.instance.state == InstanceState::Running {
            return Ok(());
        }
        if locked.instance.state == InstanceState::Failed {
            return Err(Error::FailedPrecondition(format!(
                "instance {} is failed; delete and recreate it",
                id
            )));
        }

        let _ = tokio::fs::remove_file(self.api_socket(id)).await;
        let child = Command::new(&self.config.firecracker_binary)
            .arg("--api-sock")
            .arg(self.api_socket(id))
            .arg("--config-file")
            .arg(self.config_path(id))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::unavailable(format!("spawning firecracker: {}", e)))?;
        debug!(instance_id = %id, pid = ?child.id(), "firecracker started");

        locked.child = Some(child);
        locked.instance.state = InstanceState::Running;
        locked.instance.state_reason.clear();
        locked.instance.updated_at = Utc::now();
        self.store.save(&locked.instance).await
    }

    #[instrument(level = "info", skip(self))]
    async fn stop(&self, id: &str, force: bool) -> Result<()> {
        let handle = self.handle(id).await?;
        let mut locked = handle.lock().await;
        self.stop_locked(&mut locked, force).await
    }

    #[instrument(level = "info", skip(self))]
    async fn delete(&self, id: &str) -> Result<()> {
        let handle = match self.handle(id).await {
            Ok(handle) => handle,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        {
            let mut locked = handle.lock().await;
            self.stop_locked(&mut locked, true).await?;
        }
        self.store.remove(id).await?;
        self.instances.write().await.remove(id);
        info!(instance_id = %id, "deleted microvm");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Instance> {
        let handle = self.handle(id).await?;
        let locked = handle.lock().await;
        Ok(locked.instance.clone())
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        let handles: Vec<Handle> = self.instances.read().await.values().cloned().collect();
        let mut instances = Vec::with_capacity(handles.len());
        for handle in handles {
            instances.push(handle.lock().await.instance.clone());
        }
        Ok(instances)
    }

    async fn stats(&self, id: &str) -> Result<InstanceStats> {
        let handle = self.handle(id).await?;
        let mut locked = handle.lock().await;
        let mut stats = InstanceStats {
            collected_at: Some(Utc::now()),
            ..Default::default()
        };
        let pid = locked.child.as_ref().and_then(|c| c.id());
        if let Some(pid) = pid {
            if let Some(sample) = procstat::sample(pid).await {
                stats.cpu_time_ns = sample.cpu_time_ns;
                stats.memory_used_bytes = sample.rss_bytes;
                stats.disk_read_bytes = sample.read_bytes;
                stats.disk_write_bytes = sample.write_bytes;
                if let Some(prev) = locked.last_sample {
                    stats.cpu_usage_percent = procstat::cpu_percent(&prev, &sample);
                }
                locked.last_sample = Some(sample);
            }
        }
        Ok(stats)
    }

    // attach: the trait default answers not-supported; Firecracker has no
    // console socket to hand out.

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{AttachOptions, Driver};
    use hypervisor_types::DiskSpec;

    async fn make_driver(default_kernel: Option<&str>) -> (MicroVmDriver, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = MicroVmDriverConfig {
            state_dir: dir.path().to_path_buf(),
            default_kernel: default_kernel.map(PathBuf::from),
            ..Default::default()
        };
        (MicroVmDriver::new(config).await.unwrap(), dir)
    }

    fn spec() -> InstanceSpec {
        InstanceSpec {
            image: "/images/rootfs.ext4".into(),
            cpu_cores: 1,
            memory_mb: 128,
            kernel: Some("/boot/vmlinux".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn machine_config_renders_boot_source_and_drives() {
        let (driver, _dir) = make_driver(None).await;
        let mut s = spec();
        s.disks.push(DiskSpec {
            name: "data".into(),
            size_gb: 1,
            disk_type: String::new(),
            boot: false,
        });
        let machine = driver.machine_config("i-1", &s).unwrap();
        assert_eq!(machine["boot-source"]["kernel_image_path"], "/boot/vmlinux");
        assert_eq!(machine["machine-config"]["vcpu_count"], 1);
        assert_eq!(machine["machine-config"]["mem_size_mib"], 128);
        let drives = machine["drives"].as_array().unwrap();
        assert_eq!(drives.len(), 2);
        assert_eq!(drives[0]["drive_id"], "rootfs");
        assert_eq!(drives[0]["is_root_device"], true);
        assert_eq!(drives[1]["drive_id"], "data");
    }

    #[tokio::test]
    async fn kernel_is_required_unless_defaulted() {
        let (driver, _dir) = make_driver(None).await;
        let mut s = spec();
        s.kernel = None;
        let err = driver.machine_config("i-1", &s).unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));

        let (driver, _dir) = make_driver(Some("/boot/default-vmlinux")).await;
        let machine = driver.machine_config("i-1", &s).unwrap();
        assert_eq!(
            machine["boot-source"]["kernel_image_path"],
            "/boot/default-vmlinux"
        );
    }

    #[tokio::test]
    async fn create_is_replay_safe_and_attach_is_unsupported() {
        let (driver, _dir) = make_driver(None).await;
        let created = driver.create("i-1", "db", &spec()).await.unwrap();
        assert_eq!(created.state, InstanceState::Stopped);

        // Replaying the create returns the same record instead of failing.
        let replayed = driver.create("i-1", "db", &spec()).await.unwrap();
        assert_eq!(replayed.id, created.id);

        let err = match driver.attach("i-1", AttachOptions::default()).await {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[tokio::test]
    async fn create_materialises_additional_drives() {
        let (driver, dir) = make_driver(None).await;
        let mut s = spec();
        s.disks.push(DiskSpec {
            name: "data".into(),
            size_gb: 1,
            disk_type: String::new(),
            boot: false,
        });
        driver.create("i-1", "db", &s).await.unwrap();
        let drive = dir.path().join("i-1").join("data.img");
        let meta = std::fs::metadata(drive).unwrap();
        assert_eq!(meta.len(), 1024 * 1024 * 1024);
        assert!(dir.path().join("i-1").join("firecracker.json").exists());

        driver.delete("i-1").await.unwrap();
        assert!(!dir.path().join("i-1").exists());
    }
}
