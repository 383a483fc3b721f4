//! Node fact collection at agent startup: hostname and measured hardware
//! capacity. Config values always win over measurement.

use tracing::debug;

use hypervisor_types::Resources;

pub fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Measure this machine's capacity. Dimensions that cannot be measured on
/// the platform come back zero; operators override them in the node config.
pub fn capacity(state_dir: &std::path::Path) -> Resources {
    let cpu_cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    let memory_bytes = total_memory_bytes().unwrap_or(0);
    let disk_bytes = filesystem_bytes(state_dir).unwrap_or(0);
    let capacity = Resources::new(cpu_cores, memory_bytes, disk_bytes, 0);
    debug!(?capacity, "measured node capacity");
    capacity
}

#[cfg(target_os = "linux")]
fn total_memory_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(not(target_os = "linux"))]
fn total_memory_bytes() -> Option<u64> {
    None
}

#[cfg(unix)]
fn filesystem_bytes(path: &std::path::Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_blocks as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn filesystem_bytes(_path: &std::path::Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capacity_always_reports_at_least_one_core() {
        let capacity = capacity(std::path::Path::new("/"));
        assert!(capacity.cpu_cores >= 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_measures_memory_and_disk() {
        assert!(total_memory_bytes().unwrap() > 0);
        assert!(filesystem_bytes(std::path::Path::new("/")).unwrap() > 0);
    }
}
