//! Full-VM driver backed by QEMU/KVM. Disk images are materialised with
//! `qemu-img`, the guest runs as a child `qemu-system` process, graceful
//! shutdown goes through the QMP control socket and the serial console is
//! exposed as a unix socket for attachment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use hypervisor_types::{
    Error, Instance, InstanceSpec, InstanceState, InstanceStats, InstanceType, Result,
};

use crate::procstat::{self, ProcSample};
use crate::qmp;
use crate::store::InstanceStore;
use crate::{AttachOptions, Console, Driver};

#[derive(Debug, Clone)]
pub struct VmDriverConfig {
    pub qemu_binary: PathBuf,
    pub qemu_img_binary: PathBuf,
    pub state_dir: PathBuf,
    /// How long a graceful powerdown may take before the VM is killed.
    pub graceful_timeout: Duration,
}

impl Default for VmDriverConfig {
    fn default() -> Self {
        VmDriverConfig {
            qemu_binary: PathBuf::from("qemu-system-x86_64"),
            qemu_img_binary: PathBuf::from("qemu-img"),
            state_dir: PathBuf::from("/var/lib/hypervisor/vm"),
            graceful_timeout: Duration::from_secs(30),
        }
    }
}

struct VmHandle {
    instance: Instance,
    child: Option<Child>,
    last_sample: Option<ProcSample>,
}

type Handle = Arc<Mutex<VmHandle>>;

pub struct VmDriver {
    config: VmDriverConfig,
    store: InstanceStore,
    instances: RwLock<HashMap<String, Handle>>,
}

impl VmDriver {
    /// Open the state directory and recover records left by a previous
    /// agent. VMs that were running are recorded as stopped: their QEMU
    /// processes died with the old agent.
    pub async fn new(config: VmDriverConfig) -> Result<Self> {
        let store = InstanceStore::new(&config.state_dir);
        store.ensure().await?;

        let mut instances = HashMap::new();
        for mut instance in store.load_all().await? {
            if !matches!(instance.state, InstanceState::Stopped | InstanceState::Failed) {
                instance.state = InstanceState::Stopped;
                instance.state_reason = "agent restarted".to_string();
                store.save(&instance).await?;
            }
            info!(instance_id = %instance.id, state = %instance.state, "recovered vm record");
            instances.insert(
                instance.id.clone(),
                Arc::new(Mutex::new(VmHandle {
                    instance,
                    child: None,
                    last_sample: None,
                })),
            );
        }

        Ok(VmDriver {
            config,
            store,
            instances: RwLock::new(instances),
        })
    }

    fn qmp_socket(&self, id: &str) -> PathBuf {
        self.store.instance_dir(id).join("qmp.sock")
    }

    fn console_socket(&self, id: &str) -> PathBuf {
        self.store.instance_dir(id).join("console.sock")
    }

    fn disk_path(&self, id: &str, disk_name: &str) -> PathBuf {
        self.store.instance_dir(id).join(format!("{}.qcow2", disk_name))
    }

    async fn handle(&self, id: &str) -> Result<Handle> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("instance {}", id)))
    }

    async fn create_disk(
        &self,
        path: &PathBuf,
        size_gb: u32,
        backing: Option<&str>,
    ) -> Result<()> {
        if tokio::fs::metadata(path).await.is_ok() {
            // Replayed create; the image is already there.
            return Ok(());
        }
        let mut cmd = Command::new(&self.config.qemu_img_binary);
        cmd.arg("create").arg("-f").arg("qcow2");
        if let Some(image) = backing {
            cmd.arg("-b").arg(image).arg("-F").arg("qcow2");
        }
        cmd.arg(path).arg(format!("{}G", size_gb));
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::unavailable(format!("qemu-img: {}", e)))?;
        if !output.status.success() {
            return Err(Error::internal(format!(
                "qemu-img create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// The full qemu-system argument vector for an instance.
    pub(crate) fn qemu_args(&self, instance: &Instance) -> Vec<String> {
        let spec = &instance.spec;
        let mut args = vec![
            "-name".to_string(),
            format!("guest={}", instance.id),
            "-machine".to_string(),
            "accel=kvm:tcg".to_string(),
            "-smp".to_string(),
            spec.cpu_cores.to_string(),
            "-m".to_string(),
            format!("{}M", spec.memory_mb),
            "-display".to_string(),
            "none".to_string(),
            "-qmp".to_string(),
            format!("unix:{},server,nowait", self.qmp_socket(&instance.id).display()),
            "-serial".to_string(),
            format!(
                "unix:{},server,nowait",
                self.console_socket(&instance.id).display()
            ),
        ];

        if spec.disks.is_empty() {
            args.push("-drive".to_string());
            args.push(format!("file={},format=qcow2,if=virtio", spec.image));
        } else {
            for disk in &spec.disks {
                args.push("-drive".to_string());
                args.push(format!(
                    "file={},format=qcow2,if=virtio",
                    self.disk_path(&instance.id, &disk.name).display()
                ));
            }
        }

        if let Some(kernel) = &spec.kernel {
            args.push("-kernel".to_string());
            args.push(kernel.clone());
            if let Some(initrd) = &spec.initrd {
                args.push("-initrd".to_string());
                args.push(initrd.clone());
            }
            if let Some(kernel_args) = &spec.kernel_args {
                args.push("-append".to_string());
                args.push(kernel_args.clone());
            }
        }

        match spec.network.as_ref() {
            Some(net) if net.mode == "none" => {
                args.push("-nic".to_string());
                args.push("none".to_string());
            }
            Some(net) if net.mode == "bridge" && !net.bridge.is_empty() => {
                args.push("-netdev".to_string());
                args.push(format!("bridge,id=net0,br={}", net.bridge));
                args.push("-device".to_string());
                let mut device = "virtio-net-pci,netdev=net0".to_string();
                if let Some(mac) = &net.mac_address {
                    device.push_str(&format!(",mac={}", mac));
                }
                args.push(device);
            }
            _ => {
                args.push("-netdev".to_string());
                args.push("user,id=net0".to_string());
                args.push("-device".to_string());
                args.push("virtio-net-pci,netdev=net0".to_string());
            }
        }

        args
    }

    async fn stop_locked(&self, handle: &mut VmHandle, force: bool) -> Result<()> {
        if !matches!(
            handle.instance.state,
            InstanceState::Running | InstanceState::Paused
        ) {
            return Ok(());
        }

        let id = handle.instance.id.clone();
        let mut graceful = false;
        if !force {
            match qmp::execute(&self.qmp_socket(&id), "system_powerdown").await {
                Ok(()) => {
                    if let Some(child) = handle.child.as_mut() {
                        graceful = tokio::time::timeout(self.config.graceful_timeout, child.wait())
                            .await
                            .is_ok();
                    }
                }
                Err(err) => {
                    warn!(instance_id = %id, error = %err, "graceful powerdown failed; killing");
                }
            }
        }

        if let Some(mut child) = handle.child.take() {
            if !graceful {
                if let Err(err) = child.start_kill() {
                    debug!(instance_id = %id, error = %err, "vm process already gone");
                }
                let _ = child.wait().await;
            }
        }

        handle.instance.state = InstanceState::Stopped;
        handle.instance.state_reason.clear();
        handle.instance.updated_at = Utc::now();
        handle.last_sample = None;
        self.store.save(&handle.instance).await
    }
}

#[async_trait]
impl Driver for VmDriver {
    fn name(&self) -> &str {
        "qemu"
    }

    fn instance_type(&self) -> InstanceType {
        InstanceType::Vm
    }

    #[instrument(level = "info", skip(self, spec))]
    async fn create(&self, id: &str, name: &str, spec: &InstanceSpec) -> Result<Instance> {
        spec.validate()?;
        if spec.image.is_empty() && spec.disks.is_empty() && spec.kernel.is_none() {
            return Err(Error::invalid_spec("vm needs an image, a disk or a kernel"));
        }

        // Take the map lock only to claim the slot; the handle is locked
        // after the map lock is gone.
        let (handle, replayed) = {
            let mut instances = self.instances.write().await;
            match instances.get(id) {
                Some(existing) => (existing.clone(), true),
                None => {
                    let mut instance = Instance::new(id, name, InstanceType::Vm, spec.clone());
                    instance.state = InstanceState::Creating;
                    if let Some(net) = &spec.network {
                        instance.ip_address = net.ip_address.clone();
                    }
                    let handle = Arc::new(Mutex::new(VmHandle {
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
            // Replayed create: the record is authoritative.
            return Ok(handle.lock().await.instance.clone());
        }

        let mut locked = handle.lock().await;
        for disk in &spec.disks {
            let backing = (disk.boot && !spec.image.is_empty()).then_some(spec.image.as_str());
            let path = self.disk_path(id, &disk.name);
            if let Err(err) = self.create_disk(&path, disk.size_gb, backing).await {
                locked.instance.state = InstanceState::Failed;
                locked.instance.state_reason = err.to_string();
                let _ = self.store.save(&locked.instance).await;
                return Err(err);
            }
        }

        locked.instance.state = InstanceState::Stopped;
        locked.instance.updated_at = Utc::now();
        self.store.save(&locked.instance).await?;
        info!(instance_id = %id, "created vm");
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

        let args = self.qemu_args(&locked.instance);
        let child = Command::new(&self.config.qemu_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::unavailable(format!("spawning qemu: {}", e)))?;
        debug!(instance_id = %id, pid = ?child.id(), "qemu started");

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
        info!(instance_id = %id, "deleted vm");
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

    #[cfg(unix)]
    async fn attach(&self, id: &str, _opts: AttachOptions) -> Result<Console> {
        let handle = self.handle(id).await?;
        let locked = handle.lock().await;
        if locked.instance.state != InstanceState::Running {
            return Err(Error::FailedPrecondition(format!(
                "instance {} is not running",
                id
            )));
        }
        let socket = self.console_socket(id);
        drop(locked);
        let stream = tokio::net::UnixStream::connect(&socket)
            .await
            .map_err(|e| Error::unavailable(format!("console socket: {}", e)))?;
        Ok(Box::new(stream))
    }

    #[cfg(not(unix))]
    async fn attach(&self, _id: &str, _opts: AttachOptions) -> Result<Console> {
        Err(Error::NotSupported(
            "console attach requires unix sockets".into(),
        ))
    }

    async fn close(&self) -> Result<()> {
        // VMs keep running; their state files already reflect reality.
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hypervisor_types::{DiskSpec, NetworkSpec};

    async fn driver() -> (VmDriver, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = VmDriverConfig {
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        (VmDriver::new(config).await.unwrap(), dir)
    }

    fn vm_instance(id: &str, spec: InstanceSpec) -> Instance {
        Instance::new(id, "test", InstanceType::Vm, spec)
    }

    #[tokio::test]
    async fn qemu_args_cover_cpu_memory_and_sockets() {
        let (driver, _dir) = driver().await;
        let instance = vm_instance(
            "i-1",
            InstanceSpec {
                image: "/images/base.qcow2".into(),
                cpu_cores: 2,
                memory_mb: 2048,
                ..Default::default()
            },
        );
        let args = driver.qemu_args(&instance);
        let joined = args.join(" ");
        assert!(joined.contains("-smp 2"));
        assert!(joined.contains("-m 2048M"));
        assert!(joined.contains("qmp.sock"));
        assert!(joined.contains("console.sock"));
        assert!(joined.contains("file=/images/base.qcow2,format=qcow2,if=virtio"));
        assert!(joined.contains("-netdev user,id=net0"));
    }

    #[tokio::test]
    async fn qemu_args_use_materialised_disks_and_bridge() {
        let (driver, _dir) = driver().await;
        let instance = vm_instance(
            "i-2",
            InstanceSpec {
                image: "/images/base.qcow2".into(),
                cpu_cores: 1,
                memory_mb: 512,
                disks: vec![DiskSpec {
                    name: "root".into(),
                    size_gb: 10,
                    disk_type: "qcow2".into(),
                    boot: true,
                }],
                network: Some(NetworkSpec {
                    mode: "bridge".into(),
                    bridge: "br0".into(),
                    mac_address: Some("52:54:00:12:34:56".into()),
                    ip_address: None,
                }),
                kernel: Some("/boot/vmlinuz".into()),
                kernel_args: Some("console=ttyS0".into()),
                ..Default::default()
            },
        );
        let args = driver.qemu_args(&instance);
        let joined = args.join(" ");
        assert!(joined.contains("root.qcow2"));
        assert!(joined.contains("bridge,id=net0,br=br0"));
        assert!(joined.contains("mac=52:54:00:12:34:56"));
        assert!(joined.contains("-kernel /boot/vmlinuz"));
        assert!(joined.contains("-append console=ttyS0"));
    }

    #[tokio::test]
    async fn create_rejects_impossible_specs() {
        let (driver, _dir) = driver().await;
        let err = driver
            .create("i-bad", "bad", &InstanceSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));

        let err = driver
            .create(
                "i-bad2",
                "bad",
                &InstanceSpec {
                    image: "img".into(),
                    cpu_cores: 0,
                    memory_mb: 512,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn lifecycle_ops_on_unknown_ids_are_not_found() {
        let (driver, _dir) = driver().await;
        assert!(driver.start("i-missing").await.unwrap_err().is_not_found());
        assert!(driver
            .stop("i-missing", true)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(driver.get("i-missing").await.unwrap_err().is_not_found());
        // Delete of an unknown instance is idempotent success.
        driver.delete("i-missing").await.unwrap();
    }

    #[tokio::test]
    async fn recovery_marks_previously_running_vms_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path());
        store.ensure().await.unwrap();
        let mut inst = vm_instance(
            "i-1",
            InstanceSpec {
                image: "img.qcow2".into(),
                cpu_cores: 1,
                memory_mb: 256,
                ..Default::default()
            },
        );
        inst.state = InstanceState::Running;
        store.save(&inst).await.unwrap();

        let config = VmDriverConfig {
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let driver = VmDriver::new(config).await.unwrap();
        let recovered = driver.get("i-1").await.unwrap();
        assert_eq!(recovered.state, InstanceState::Stopped);
        assert_eq!(recovered.state_reason, "agent restarted");
        assert_eq!(driver.list().await.unwrap().len(), 1);
    }
}
