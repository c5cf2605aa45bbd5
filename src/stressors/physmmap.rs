//! Stress physical page mappings through `/dev/mem`

use anyhow::{Context, Result};
use log::{debug, info};
use nix::libc;
use rand::Rng;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::time::Instant;

use super::StressorOptions;
use crate::context::{StressContext, EXIT_NO_RESOURCE, EXIT_SUCCESS};
use crate::proc::{has_capability, CAP_SYS_ADMIN};
use crate::run_state::{set_proc_state, ProcState};

/// A "System RAM" range from `/proc/iomem`
#[derive(Debug, PartialEq, Eq)]
pub struct PhysRange {
    /// Physical start address
    pub addr: u64,
    /// Pages in the range
    pub pages: usize,
    /// Per page: still worth trying to map
    mappable_pages: Vec<bool>,
    /// Any page in the range could be mapped in the last pass
    mappable: bool,
}

impl PhysRange {
    fn new(addr: u64, pages: usize) -> Self {
        PhysRange {
            addr,
            pages,
            mappable_pages: vec![true; pages],
            // assume so until proven otherwise
            mappable: true,
        }
    }

    /// Pages that have been mapped successfully so far
    pub fn mappable_pages(&self) -> usize {
        self.mappable_pages.iter().filter(|m| **m).count()
    }
}

/// Mapping `/dev/mem` requires `CAP_SYS_ADMIN`
pub fn supported() -> bool {
    if has_capability(CAP_SYS_ADMIN) {
        return true;
    }
    info!("physmmap stressor needs to be running with CAP_SYS_ADMIN rights");
    false
}

fn parse_range(line: &str) -> Option<(u64, u64)> {
    let (begin, rest) = line.trim_start().split_once('-')?;
    let end = rest.split(|c: char| !c.is_ascii_hexdigit()).next()?;
    Some((
        u64::from_str_radix(begin, 16).ok()?,
        u64::from_str_radix(end, 16).ok()?,
    ))
}

/// "System RAM" ranges of at least one page
pub fn parse_iomem(content: &str, page_size: usize) -> Vec<PhysRange> {
    content
        .lines()
        .filter(|line| line.contains("System RAM"))
        .filter_map(parse_range)
        // unprivileged readers see all zero addresses
        .filter(|(begin, end)| begin < end && end - begin >= page_size as u64)
        .map(|(begin, end)| PhysRange::new(begin, ((end - begin) / page_size as u64) as usize))
        .collect()
}

fn read_iomem(page_size: usize) -> Result<Vec<PhysRange>> {
    let content = fs::read_to_string("/proc/iomem").context("cannot open /proc/iomem")?;
    Ok(parse_iomem(&content, page_size))
}

fn map_page(mem: &File, page_size: usize, flags: libc::c_int, offset: u64) -> bool {
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            page_size,
            libc::PROT_READ,
            flags,
            mem.as_raw_fd(),
            offset as libc::off_t,
        )
    };
    if addr == libc::MAP_FAILED {
        return false;
    }
    unsafe { libc::munmap(addr, page_size) };
    true
}

/// Map and unmap every page of System RAM read-only, one page at a time,
/// with randomly chosen mapping flags. Pages that fail to map are skipped in
/// later passes; the stressor ends when nothing is mappable anymore.
pub fn stress_physmmap(ctx: &mut StressContext, _options: &mut StressorOptions) -> i32 {
    let page_size = ctx.page_size;
    let mem = match OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_SYNC)
        .open("/dev/mem")
    {
        Ok(f) => f,
        Err(e) => {
            info!("{}: could not open /dev/mem: {}, skipping", ctx.name, e);
            return EXIT_NO_RESOURCE;
        }
    };
    let mut ranges = match read_iomem(page_size) {
        Ok(ranges) => ranges,
        Err(e) => {
            info!("{}: {:#}, skipping", ctx.name, e);
            return EXIT_NO_RESOURCE;
        }
    };
    if ranges.is_empty() {
        info!(
            "{}: could not find any System RAM entries in /proc/iomem, skipping",
            ctx.name
        );
        return EXIT_NO_RESOURCE;
    }

    set_proc_state(&ctx.name, ProcState::Run);
    let total_pages: usize = ranges.iter().map(|r| r.pages).sum();
    if ctx.instance == 0 {
        info!("{}: attempting mmap/munmap {} pages", ctx.name, total_pages);
    }

    let mut rng = rand::thread_rng();
    let (mut map_success, mut map_failed) = (0u64, 0u64);
    let start = Instant::now();
    let mut scan_time = None;
    'run: loop {
        let mut mappable = false;
        for range in ranges.iter_mut().filter(|r| r.mappable) {
            let mut range_mappable = false;
            for page in 0..range.pages {
                if !ctx.keep_going() || ctx.expired() {
                    break 'run;
                }
                if !range.mappable_pages[page] {
                    continue;
                }
                let mut flags = if rng.gen() {
                    libc::MAP_SHARED
                } else {
                    libc::MAP_PRIVATE
                };
                if rng.gen() {
                    flags |= libc::MAP_POPULATE;
                }
                let offset = range.addr + (page * page_size) as u64;
                if map_page(&mem, page_size, flags, offset) {
                    map_success += 1;
                    mappable = true;
                    range_mappable = true;
                } else {
                    map_failed += 1;
                    range.mappable_pages[page] = false;
                }
                ctx.bogo_inc();
            }
            range.mappable = range_mappable;
        }
        scan_time.get_or_insert_with(|| start.elapsed());
        if !mappable || !ctx.keep_going() {
            break;
        }
    }

    if map_success == 0 {
        info!("{}: unable to mmap any pages from /dev/mem", ctx.name);
    }
    if let (0, Some(scan_time)) = (ctx.instance, scan_time) {
        let mappable_pages: usize = ranges
            .iter()
            .filter(|r| r.mappable)
            .map(|r| r.mappable_pages())
            .sum();
        debug!(
            "{}: {:.2} seconds to perform initial {} page /dev/mem mmap scan, {} pages were mappable",
            ctx.name,
            scan_time.as_secs_f64(),
            total_pages,
            mappable_pages
        );
    }
    info!(
        "{}: {} /dev/mem pages mmapped, {} pages not mmappable",
        ctx.name, map_success, map_failed
    );

    set_proc_state(&ctx.name, ProcState::Deinit);
    EXIT_SUCCESS
}

#[test]
fn test_parse_iomem() {
    let iomem = "00000000-00000fff : Reserved
00001000-0009efff : System RAM
000a0000-000bffff : PCI Bus 0000:00
00100000-bffdffff : System RAM
  01000000-01e0252f : Kernel code
fee00000-fee00fff : Local APIC
100000000-13fffffff : System RAM
";
    let ranges = parse_iomem(iomem, 4096);
    assert_eq!(ranges.len(), 3);
    assert_eq!(ranges[0].addr, 0x1000);
    assert_eq!(ranges[0].pages, (0x9efff - 0x1000) / 4096);
    assert_eq!(ranges[1].addr, 0x100000);
    assert_eq!(ranges[2].addr, 0x1_0000_0000);
    assert_eq!(ranges[2].pages, (0x13fffffff - 0x100000000) / 4096);
    assert_eq!(ranges[2].mappable_pages(), ranges[2].pages);
}

#[test]
fn test_parse_iomem_unprivileged() {
    // without root the kernel hides the addresses
    let iomem = "00000000-00000000 : Reserved
00000000-00000000 : System RAM
00000000-00000000 : System RAM
";
    assert!(parse_iomem(iomem, 4096).is_empty());
}

#[test]
fn test_parse_iomem_tiny_and_garbage() {
    let iomem = "00001000-00001fff : System RAM
zzzz-yyyy : System RAM
System RAM
";
    // 0xfff bytes are less than a page
    assert!(parse_iomem(iomem, 4096).is_empty());
}
