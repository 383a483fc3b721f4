//! Process-level usage sampling for backends that run their workloads as
//! host processes (QEMU and Firecracker). Linux-only; on other platforms
//! every sample is `None` and the corresponding stats fields stay zero.

use std::time::Instant;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ProcSample {
    pub cpu_time_ns: u64,
    pub rss_bytes: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub sampled_at: Instant,
}

/// CPU usage between two samples of the same pid, as a percentage of one
/// core.
pub(crate) fn cpu_percent(prev: &ProcSample, cur: &ProcSample) -> f64 {
    let wall_ns = cur.sampled_at.duration_since(prev.sampled_at).as_nanos() as f64;
    if wall_ns <= 0.0 {
        return 0.0;
    }
    let cpu_ns = cur.cpu_time_ns.saturating_sub(prev.cpu_time_ns) as f64;
    (cpu_ns / wall_ns) * 100.0
}

#[cfg(target_os = "linux")]
pub(crate) async fn sample(pid: u32) -> Option<ProcSample> {
    let stat = tokio::fs::read_to_string(format!("/proc/{}/stat", pid))
        .await
        .ok()?;
    let cpu_time_ns = parse_cpu_time_ns(&stat)?;

    let status = tokio::fs::read_to_string(format!("/proc/{}/status", pid))
        .await
        .unwrap_or_default();
    let rss_bytes = parse_vm_rss_bytes(&status).unwrap_or(0);

    // /proc/<pid>/io needs privileges we may not have; zeros are fine.
    let io = tokio::fs::read_to_string(format!("/proc/{}/io", pid))
        .await
        .unwrap_or_default();
    let read_bytes = parse_io_field(&io, "read_bytes:").unwrap_or(0);
    let write_bytes = parse_io_field(&io, "write_bytes:").unwrap_or(0);

    Some(ProcSample {
        cpu_time_ns,
        rss_bytes,
        read_bytes,
        write_bytes,
        sampled_at: Instant::now(),
    })
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn sample(_pid: u32) -> Option<ProcSample> {
    None
}

/// utime + stime (fields 14 and 15) converted from clock ticks. The comm
/// field can contain spaces, so parse from the closing paren.
#[cfg(target_os = "linux")]
fn parse_cpu_time_ns(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // After the comm field, utime is the 12th and stime the 13th field.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks_per_sec <= 0 {
        return None;
    }
    Some((utime + stime) * (1_000_000_000 / ticks_per_sec as u64))
}

#[cfg(target_os = "linux")]
fn parse_vm_rss_bytes(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(target_os = "linux")]
fn parse_io_field(io: &str, field: &str) -> Option<u64> {
    let line = io.lines().find(|l| l.starts_with(field))?;
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(all(test, target_os = "linux"))]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stat_parsing_handles_spaces_in_comm() {
        let stat = "1234 (qemu-system x86) S 1 1234 1234 0 -1 4194560 \
                    2000 0 0 0 150 50 0 0 20 0 4 0 100000 1000000 5000";
        let ns = parse_cpu_time_ns(stat).unwrap();
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) } as u64;
        assert_eq!(ns, 200 * (1_000_000_000 / ticks));
    }

    #[test]
    fn vm_rss_is_reported_in_bytes() {
        let status = "Name:\tqemu\nVmRSS:\t  2048 kB\n";
        assert_eq!(parse_vm_rss_bytes(status), Some(2048 * 1024));
    }

    #[test]
    fn cpu_percent_is_delta_based() {
        let t0 = Instant::now();
        let prev = ProcSample {
            cpu_time_ns: 0,
            rss_bytes: 0,
            read_bytes: 0,
            write_bytes: 0,
            sampled_at: t0,
        };
        let cur = ProcSample {
            cpu_time_ns: 500_000_000,
            sampled_at: t0 + Duration::from_secs(1),
            ..prev
        };
        let pct = cpu_percent(&prev, &cur);
        assert!((pct - 50.0).abs() < 0.1);
    }
}
