//! Process helpers used around a supervised stressor child

use anyhow::{Context, Result};
use log::debug;
use nix::errno::Errno;
use nix::libc;
use regex::Regex;
use std::fs;
use std::io::ErrorKind;

use crate::context::StressContext;

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// Capability needed to map `/dev/mem`
pub const CAP_SYS_ADMIN: u32 = 21;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Deliver SIGALRM to the calling process once its parent dies, so orphaned
/// stressors run into their alarm handling instead of running forever.
pub fn parent_died_alarm() -> nix::Result<()> {
    let res = unsafe {
        libc::prctl(
            libc::PR_SET_PDEATHSIG,
            libc::SIGALRM as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    Errno::result(res).map(drop)
}

/// Whether `cap` (e.g. `CAP_SYS_ADMIN`) is in the effective set of the calling process
pub fn has_capability(cap: u32) -> bool {
    let mut header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapUserData::default(); 2];
    let res = unsafe {
        libc::syscall(
            libc::SYS_capget,
            &mut header as *mut CapUserHeader,
            data.as_mut_ptr(),
        )
    };
    if res < 0 {
        return false;
    }
    match data.get((cap / 32) as usize) {
        Some(d) => d.effective & (1 << (cap % 32)) != 0,
        None => false,
    }
}

/// Clear all capability sets of the calling process and forbid regaining
/// privileges through execve.
pub fn drop_capabilities() -> nix::Result<()> {
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    // version 3 uses two data structs for 64 capability bits
    let data = [CapUserData::default(); 2];
    let res = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if res < 0 {
        return Err(Errno::last());
    }
    let res = unsafe {
        libc::prctl(
            libc::PR_SET_NO_NEW_PRIVS,
            1 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    Errno::result(res).map(drop)
}

/// System memory figures in kB, as reported by `/proc/meminfo`
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MemInfo {
    /// MemTotal
    pub total: u64,
    /// MemFree
    pub free: u64,
    /// MemAvailable
    pub available: u64,
    /// Shmem
    pub shared: u64,
    /// Buffers
    pub buffers: u64,
    /// SwapTotal
    pub swap_total: u64,
    /// SwapFree
    pub swap_free: u64,
}

fn parse_meminfo(content: &str) -> Result<MemInfo> {
    let mut info = MemInfo::default();
    for cap in Regex::new(r"(?m)^(?P<key>\w+):\s+(?P<value>\d+)")?.captures_iter(content) {
        let field = match &cap["key"] {
            "MemTotal" => &mut info.total,
            "MemFree" => &mut info.free,
            "MemAvailable" => &mut info.available,
            "Shmem" => &mut info.shared,
            "Buffers" => &mut info.buffers,
            "SwapTotal" => &mut info.swap_total,
            "SwapFree" => &mut info.swap_free,
            _ => continue,
        };
        *field = cap["value"]
            .parse()
            .with_context(|| format!("invalid value for {}", &cap["key"]))?;
    }
    Ok(info)
}

/// Read `/proc/meminfo`
pub fn read_meminfo() -> Result<MemInfo> {
    let content = fs::read_to_string("/proc/meminfo").context("cannot read /proc/meminfo")?;
    parse_meminfo(&content)
}

fn mb(kb: u64) -> f64 {
    kb as f64 / 1024.0
}

/// Log how much memory is left, called after a stressor got oom killed
pub fn log_system_mem_info() {
    match read_meminfo() {
        Ok(m) => debug!(
            "memory (MB): total {:.2}, free {:.2}, available {:.2}, shared {:.2}, buffer {:.2}, swap {:.2}, free swap {:.2}",
            mb(m.total),
            mb(m.free),
            mb(m.available),
            mb(m.shared),
            mb(m.buffers),
            mb(m.swap_total),
            mb(m.swap_free)
        ),
        Err(e) => debug!("cannot log memory info: {:#}", e),
    }
}

/// Remove the temporary directory of a stressor instance, a missing directory is fine
pub fn clean_dir(ctx: &StressContext) -> Result<()> {
    let dir = ctx.temp_dir();
    if let Err(e) = fs::remove_dir_all(&dir) {
        if e.kind() != ErrorKind::NotFound {
            Err(e).with_context(|| format!("cannot remove {}", dir.display()))?;
        }
    }
    Ok(())
}

#[test]
fn test_parse_meminfo() {
    let meminfo = "MemTotal:       16303412 kB
MemFree:         1002876 kB
MemAvailable:    9112452 kB
Buffers:          524288 kB
Cached:          7400120 kB
SwapCached:            0 kB
Shmem:            204800 kB
SwapTotal:       2097148 kB
SwapFree:        2097148 kB
HugePages_Total:       0
";
    assert_eq!(
        parse_meminfo(meminfo).unwrap(),
        MemInfo {
            total: 16303412,
            free: 1002876,
            available: 9112452,
            shared: 204800,
            buffers: 524288,
            swap_total: 2097148,
            swap_free: 2097148,
        }
    );
}

#[test]
fn test_has_capability() {
    // root normally holds every capability, nobody else holds CAP_SYS_ADMIN
    if nix::unistd::geteuid().is_root() {
        return;
    }
    assert!(!has_capability(CAP_SYS_ADMIN));
    assert!(!has_capability(64));
}

#[test]
fn test_clean_dir() {
    use std::time::Duration;

    let tmp = tempfile::tempdir().unwrap();
    let ctx = StressContext::new("clean", 2, Duration::from_secs(1)).with_temp_path(tmp.path());

    // nothing to clean up yet
    clean_dir(&ctx).unwrap();

    fs::create_dir_all(ctx.temp_dir().join("nested")).unwrap();
    fs::write(ctx.temp_dir().join("nested/file"), "data").unwrap();
    clean_dir(&ctx).unwrap();
    assert!(!ctx.temp_dir().exists());
    assert!(tmp.path().exists());
}
