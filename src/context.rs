//! Per-instance state shared between the supervisor and a stressor workload

use log::error;
use nix::unistd::{self, Pid};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::run_state;

/// Stressor completed successfully
pub const EXIT_SUCCESS: i32 = 0;
/// Stressor failed, e.g. a verification error
pub const EXIT_FAILURE: i32 = 1;
/// Stressor skipped because of a missing resource or privilege
pub const EXIT_NO_RESOURCE: i32 = 3;

/// One logical stressor instance.
///
/// The context outlives a single supervised run: it is owned by the caller and
/// handed by reference to the runner, which forwards it to each forked child.
#[derive(Debug, Clone)]
pub struct StressContext {
    /// Stressor name, used as a log prefix
    pub name: String,
    /// Zero based instance index
    pub instance: u32,
    /// Pid of the process that owns this instance
    pub pid: Pid,
    /// No new work is started after this point in time
    pub deadline: Instant,
    /// Stop after this many bogo operations, 0 means no bound
    pub max_ops: u64,
    /// Page size of the machine
    pub page_size: usize,
    /// Root for per-instance temporary directories
    pub temp_path: PathBuf,
    counter: u64,
    failed: bool,
}

impl StressContext {
    /// A context for `instance` of stressor `name` that runs for `timeout`.
    pub fn new(name: &str, instance: u32, timeout: Duration) -> StressContext {
        StressContext {
            name: name.to_string(),
            instance,
            pid: unistd::getpid(),
            deadline: Instant::now() + timeout,
            max_ops: 0,
            page_size: page_size(),
            temp_path: std::env::temp_dir(),
            counter: 0,
            failed: false,
        }
    }

    /// Bound the number of bogo operations
    pub fn with_max_ops(mut self, max_ops: u64) -> Self {
        self.max_ops = max_ops;
        self
    }

    /// Use `path` as root for temporary directories
    pub fn with_temp_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.temp_path = path.as_ref().to_path_buf();
        self
    }

    /// Whether the instance should keep doing work: the global run flag is
    /// still set and the bogo operation bound has not been reached.
    pub fn keep_going(&self) -> bool {
        run_state::keep_stressing() && (self.max_ops == 0 || self.counter < self.max_ops)
    }

    /// Whether the deadline has passed
    pub fn expired(&self) -> bool {
        Instant::now() > self.deadline
    }

    /// Count one bogo operation
    pub fn bogo_inc(&mut self) {
        self.counter += 1;
    }

    /// Bogo operations performed so far
    pub fn bogo_ops(&self) -> u64 {
        self.counter
    }

    /// Log a failure and remember it, the child then exits with [`EXIT_FAILURE`]
    /// whatever the workload returns.
    pub fn fail(&mut self, msg: fmt::Arguments) {
        error!("{}: {}", self.name, msg);
        self.failed = true;
    }

    /// The fail-check override: `Some(EXIT_FAILURE)` once [`fail`](Self::fail) was called
    pub fn fail_check(&self) -> Option<i32> {
        self.failed.then_some(EXIT_FAILURE)
    }

    /// Per-instance scratch directory, `tmp-<name>-<pid>-<instance>`
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_path.join(format!(
            "tmp-{}-{}-{}",
            self.name,
            self.pid.as_raw(),
            self.instance
        ))
    }
}

fn page_size() -> usize {
    let size = unsafe { nix::libc::sysconf(nix::libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[test]
fn test_max_ops_bound() {
    let mut ctx = StressContext::new("fork", 0, Duration::from_secs(10)).with_max_ops(2);
    assert!(ctx.keep_going());
    ctx.bogo_inc();
    assert!(ctx.keep_going());
    ctx.bogo_inc();
    assert!(!ctx.keep_going());
    assert_eq!(ctx.bogo_ops(), 2);
}

#[test]
fn test_fail_check() {
    let mut ctx = StressContext::new("fork", 1, Duration::from_secs(10));
    assert_eq!(ctx.fail_check(), None);
    ctx.fail(format_args!("fork failed"));
    assert_eq!(ctx.fail_check(), Some(EXIT_FAILURE));
}

#[test]
fn test_temp_dir_name() {
    let ctx = StressContext::new("physmmap", 3, Duration::ZERO).with_temp_path("/tmp/kstress");
    assert_eq!(
        ctx.temp_dir(),
        PathBuf::from(format!(
            "/tmp/kstress/tmp-physmmap-{}-3",
            unistd::getpid().as_raw()
        ))
    );
}
