//! Check the kernel log for oom kills

use nix::libc;
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;

const KMSG: &str = "/dev/kmsg";
/// Upper bound for a single read from the kernel log
const CHUNK_SIZE: usize = 4095;
/// sscanf style field width of the pid after "process"
const PID_WIDTH: usize = 10;

/// Messages read from a kernel log one `read` at a time.
///
/// `/dev/kmsg` returns one record per read. The iterator ends on the first
/// error or empty read, a would-block error from a non-blocking descriptor
/// just means there are no more messages.
pub struct KmsgRecords<R> {
    reader: R,
    buf: Vec<u8>,
    done: bool,
}

impl<R: Read> KmsgRecords<R> {
    /// Read records from `reader`
    pub fn new(reader: R) -> Self {
        KmsgRecords {
            reader,
            buf: vec![0; CHUNK_SIZE],
            done: false,
        }
    }
}

impl<R: Read> Iterator for KmsgRecords<R> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.done {
            return None;
        }
        match self.reader.read(&mut self.buf) {
            Ok(n) if n > 0 => Some(String::from_utf8_lossy(&self.buf[..n]).into_owned()),
            _ => {
                self.done = true;
                None
            }
        }
    }
}

/// Pid of the process an oom kill record talks about, e.g.
/// `Out of memory: Killed process 22566 (stress-ng)` or
/// `oom_reaper: reaped process 22566 (stress-ng)`.
pub fn oom_killed_pid(record: &str) -> Option<i64> {
    let at = record.find("process")?;
    if !(record.contains("Out of memory") || record.contains("oom_reaper")) {
        return None;
    }
    parse_pid(&record[at + "process".len()..])
}

fn parse_pid(s: &str) -> Option<i64> {
    let s = s.trim_start_matches(|c: char| c.is_ascii_whitespace());
    let bytes = s.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    let digits = end;
    while end < bytes.len() && end < PID_WIDTH && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits {
        return None;
    }
    s[..end].parse().ok()
}

/// Whether any record from `reader` reports an oom kill of `pid`
pub fn oomed_in<R: Read>(reader: R, pid: Pid) -> bool {
    let pid = i64::from(pid.as_raw());
    KmsgRecords::new(reader)
        .filter_map(|record| oom_killed_pid(&record))
        .any(|oom_pid| oom_pid == pid)
}

/// Whether the kernel logged an oom kill of `pid`.
///
/// This is a snapshot of the kernel ring buffer, older messages may already be
/// overwritten. An unreadable log counts as "not killed".
pub fn process_oomed(pid: Pid) -> bool {
    match OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(KMSG)
    {
        Ok(kmsg) => oomed_in(kmsg, pid),
        Err(_) => false,
    }
}

#[cfg(test)]
struct FakeKmsg(std::collections::VecDeque<&'static str>);

#[cfg(test)]
impl Read for FakeKmsg {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.0.pop_front() {
            Some(record) => {
                let n = record.len().min(buf.len());
                buf[..n].copy_from_slice(&record.as_bytes()[..n]);
                Ok(n)
            }
            None => Err(std::io::ErrorKind::WouldBlock.into()),
        }
    }
}

#[cfg(test)]
fn fake_kmsg(records: &[&'static str]) -> FakeKmsg {
    FakeKmsg(records.iter().copied().collect())
}

#[test]
fn test_oom_killed_pid() {
    assert_eq!(
        oom_killed_pid("3,1432,93814,-;Out of memory: Killed process 22566 (stress-ng) total-vm:1024kB"),
        Some(22566)
    );
    assert_eq!(
        oom_killed_pid("6,1433,93815,-;oom_reaper: reaped process 22566 (stress-ng), now anon-rss:0kB"),
        Some(22566)
    );
    assert_eq!(
        oom_killed_pid("Out of memory: Kill process  +42 (a.out)"),
        Some(42)
    );
    // no oom phrase
    assert_eq!(oom_killed_pid("audit: process 22566 exited"), None);
    // no pid after "process"
    assert_eq!(oom_killed_pid("Out of memory: Killed process (stress-ng)"), None);
    // pid field is at most 10 characters wide
    assert_eq!(
        oom_killed_pid("Out of memory: Killed process 123456789012"),
        Some(1234567890)
    );
}

#[test]
fn test_oomed_in_matches_exact_pid() {
    let records = [
        "6,1,10,-;Linux version 6.1.0",
        "3,2,20,-;Out of memory: Killed process 4242 (stress-ng)",
        "6,3,30,-;oom_reaper: reaped process 4243 (stress-ng)",
    ];
    assert!(oomed_in(fake_kmsg(&records), Pid::from_raw(4242)));
    assert!(oomed_in(fake_kmsg(&records), Pid::from_raw(4243)));
    assert!(!oomed_in(fake_kmsg(&records), Pid::from_raw(424)));
    assert!(!oomed_in(fake_kmsg(&records), Pid::from_raw(42420)));
}

#[test]
fn test_oomed_in_stops_at_end_of_data() {
    assert!(!oomed_in(fake_kmsg(&[]), Pid::from_raw(1)));
    // an empty read ends the scan even if more records would follow
    let records = ["", "Out of memory: Killed process 7 (x)"];
    assert!(!oomed_in(fake_kmsg(&records), Pid::from_raw(7)));
}

#[test]
fn test_records_are_lazy() {
    let mut records = KmsgRecords::new(fake_kmsg(&["a", "b"]));
    assert_eq!(records.next().as_deref(), Some("a"));
    assert_eq!(records.next().as_deref(), Some("b"));
    assert_eq!(records.next(), None);
    assert_eq!(records.next(), None);
}

#[test]
fn test_process_oomed_for_live_process() {
    // we are obviously still alive, unreadable /dev/kmsg also yields false
    assert!(!process_oomed(nix::unistd::getpid()));
}
