//! Module to modify oom scores on Linux

use log::debug;
use nix::unistd::{geteuid, getuid};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::context::StressContext;

const OOM_SCORE_ADJ_MIN: &str = "-1000";
const OOM_SCORE_ADJ_MAX: &str = "1000";

const OOM_ADJ_NO_OOM: &str = "-17";
const OOM_ADJ_MIN: &str = "-16";
const OOM_ADJ_MAX: &str = "15";

/// How often a write is retried when interrupted or told to try again
const MAX_WRITE_ATTEMPTS: usize = 32;

/// Process wide oom policy, decided once at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OomPolicy {
    /// Never touch oom adjustments
    pub no_oom_adjust: bool,
    /// Stressor workers are expected to be killed by the oom killer. Workers are
    /// always made killable and an oom kill ends a supervised run successfully.
    pub oomable: bool,
}

/// What we want the oom killer to think of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomAdjustment {
    /// First in line to be killed
    Maximize,
    /// Last in line to be killed, needs root
    Minimize,
    /// Leave the kernel heuristics alone
    Neutral,
}

impl OomAdjustment {
    /// Unprivileged processes may only raise their score, so they fall back to neutral.
    pub fn new(make_killable: bool, privileged: bool) -> Self {
        if make_killable {
            OomAdjustment::Maximize
        } else if privileged {
            OomAdjustment::Minimize
        } else {
            OomAdjustment::Neutral
        }
    }

    /// Value for `/proc/<pid>/oom_score_adj`
    pub fn score_adj(self) -> &'static str {
        match self {
            OomAdjustment::Maximize => OOM_SCORE_ADJ_MAX,
            OomAdjustment::Minimize => OOM_SCORE_ADJ_MIN,
            OomAdjustment::Neutral => "0",
        }
    }

    /// Value for the legacy `/proc/<pid>/oom_adj`
    pub fn legacy_adj(self) -> &'static str {
        match self {
            OomAdjustment::Maximize => OOM_ADJ_MAX,
            OomAdjustment::Minimize => OOM_ADJ_NO_OOM,
            OomAdjustment::Neutral => OOM_ADJ_MIN,
        }
    }
}

/// Both real and effective uid are root
pub fn is_privileged() -> bool {
    getuid().is_root() && geteuid().is_root()
}

/// Writes oom adjustments for the calling process
#[derive(Debug, Clone)]
pub struct OomScoreAdjuster {
    score_adj_path: PathBuf,
    legacy_adj_path: PathBuf,
}

impl Default for OomScoreAdjuster {
    fn default() -> Self {
        OomScoreAdjuster::with_paths("/proc/self/oom_score_adj", "/proc/self/oom_adj")
    }
}

impl OomScoreAdjuster {
    /// Adjuster writing to the given modern and legacy interface files
    pub fn with_paths<P: AsRef<Path>, Q: AsRef<Path>>(score_adj: P, legacy_adj: Q) -> Self {
        OomScoreAdjuster {
            score_adj_path: score_adj.as_ref().to_path_buf(),
            legacy_adj_path: legacy_adj.as_ref().to_path_buf(),
        }
    }

    /// Steer the oom killer for the calling process.
    ///
    /// `ctx` is `None` for the main process and `Some` for stressor workers.
    /// With root privileges a non-killable process is protected as far as the
    /// kernel allows. If `oom_score_adj` does not exist, `oom_adj` is tried once
    /// and its failure is only logged.
    pub fn adjust(
        &self,
        policy: &OomPolicy,
        ctx: Option<&StressContext>,
        killable: bool,
    ) -> io::Result<()> {
        if policy.no_oom_adjust {
            return Ok(());
        }
        let privileged = is_privileged();
        // the main process is never forced to be killable
        let make_killable = killable || (ctx.is_some() && policy.oomable);
        let adjustment = OomAdjustment::new(make_killable, privileged);

        match write_adjustment(&self.score_adj_path, adjustment.score_adj()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if let Err(e) = write_adjustment(&self.legacy_adj_path, adjustment.legacy_adj()) {
                    log_failure(ctx, "oom_adj", &e);
                }
                Ok(())
            }
            Err(e) => {
                log_failure(ctx, "oom_score_adj", &e);
                Err(e)
            }
        }
    }
}

/// Adjust the calling process through `/proc/self`. See [`OomScoreAdjuster::adjust`].
pub fn set_oom_adjustment(
    policy: &OomPolicy,
    ctx: Option<&StressContext>,
    killable: bool,
) -> io::Result<()> {
    OomScoreAdjuster::default().adjust(policy, ctx, killable)
}

// only instance 0 complains, all other instances would fail the same way
fn log_failure(ctx: Option<&StressContext>, file: &str, e: &io::Error) {
    if let Some(ctx) = ctx {
        if ctx.instance == 0 {
            debug!("{}: can't set {}: {}", ctx.name, file, e);
        }
    }
}

fn write_adjustment(path: &Path, value: &str) -> io::Result<()> {
    write_retrying(|| OpenOptions::new().write(true).open(path), value)
}

// every attempt gets a freshly opened file
fn write_retrying<W, F>(mut open: F, value: &str) -> io::Result<()>
where
    W: Write,
    F: FnMut() -> io::Result<W>,
{
    let mut last_err = io::Error::from(ErrorKind::WriteZero);
    for _ in 0..MAX_WRITE_ATTEMPTS {
        let mut f = open()?;
        match f.write(value.as_bytes()) {
            Ok(n) if n > 0 => return Ok(()),
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                last_err = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

#[cfg(test)]
fn adjustment_files() -> (tempfile::TempDir, PathBuf, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let score_adj = dir.path().join("oom_score_adj");
    let legacy_adj = dir.path().join("oom_adj");
    (dir, score_adj, legacy_adj)
}

#[test]
fn test_adjustment_values() {
    assert_eq!(OomAdjustment::new(true, false).score_adj(), "1000");
    assert_eq!(OomAdjustment::new(true, true).score_adj(), "1000");
    assert_eq!(OomAdjustment::new(false, true).score_adj(), "-1000");
    assert_eq!(OomAdjustment::new(false, false).score_adj(), "0");

    assert_eq!(OomAdjustment::new(true, true).legacy_adj(), "15");
    assert_eq!(OomAdjustment::new(false, true).legacy_adj(), "-17");
    assert_eq!(OomAdjustment::new(false, false).legacy_adj(), "-16");
}

#[test]
fn test_no_oom_adjust_writes_nothing() {
    let (_dir, score_adj, legacy_adj) = adjustment_files();
    std::fs::write(&score_adj, "").unwrap();
    let adjuster = OomScoreAdjuster::with_paths(&score_adj, &legacy_adj);
    let policy = OomPolicy {
        no_oom_adjust: true,
        oomable: true,
    };

    adjuster.adjust(&policy, None, true).unwrap();
    adjuster.adjust(&policy, None, false).unwrap();

    assert_eq!(std::fs::read_to_string(&score_adj).unwrap(), "");
    assert!(!legacy_adj.exists());
}

#[test]
fn test_modern_interface_values() {
    let (_dir, score_adj, legacy_adj) = adjustment_files();
    let adjuster = OomScoreAdjuster::with_paths(&score_adj, &legacy_adj);
    let policy = OomPolicy::default();

    std::fs::write(&score_adj, "").unwrap();
    adjuster.adjust(&policy, None, true).unwrap();
    assert_eq!(std::fs::read_to_string(&score_adj).unwrap(), "1000");

    std::fs::write(&score_adj, "").unwrap();
    adjuster.adjust(&policy, None, false).unwrap();
    let expected = if is_privileged() { "-1000" } else { "0" };
    assert_eq!(std::fs::read_to_string(&score_adj).unwrap(), expected);
}

#[test]
fn test_oomable_forces_workers_killable() {
    use std::time::Duration;

    let (_dir, score_adj, legacy_adj) = adjustment_files();
    let adjuster = OomScoreAdjuster::with_paths(&score_adj, &legacy_adj);
    let policy = OomPolicy {
        no_oom_adjust: false,
        oomable: true,
    };
    let ctx = StressContext::new("oom-test", 0, Duration::from_secs(1));

    std::fs::write(&score_adj, "").unwrap();
    adjuster.adjust(&policy, Some(&ctx), false).unwrap();
    assert_eq!(std::fs::read_to_string(&score_adj).unwrap(), "1000");

    // the main process keeps its requested priority
    std::fs::write(&score_adj, "").unwrap();
    adjuster.adjust(&policy, None, false).unwrap();
    let expected = if is_privileged() { "-1000" } else { "0" };
    assert_eq!(std::fs::read_to_string(&score_adj).unwrap(), expected);
}

#[test]
fn test_legacy_fallback() {
    let (_dir, score_adj, legacy_adj) = adjustment_files();
    std::fs::write(&legacy_adj, "").unwrap();
    let adjuster = OomScoreAdjuster::with_paths(&score_adj, &legacy_adj);

    adjuster
        .adjust(&OomPolicy::default(), None, false)
        .unwrap();
    let expected = if is_privileged() { "-17" } else { "-16" };
    assert_eq!(std::fs::read_to_string(&legacy_adj).unwrap(), expected);
    assert!(!score_adj.exists());

    std::fs::write(&legacy_adj, "").unwrap();
    adjuster.adjust(&OomPolicy::default(), None, true).unwrap();
    assert_eq!(std::fs::read_to_string(&legacy_adj).unwrap(), "15");
}

#[test]
fn test_legacy_failure_is_not_propagated() {
    let (_dir, score_adj, legacy_adj) = adjustment_files();
    let adjuster = OomScoreAdjuster::with_paths(&score_adj, &legacy_adj);

    // neither interface exists
    assert!(adjuster
        .adjust(&OomPolicy::default(), None, true)
        .is_ok());
    assert!(!legacy_adj.exists());
}

#[test]
fn test_other_errors_are_returned() {
    let (dir, _, legacy_adj) = adjustment_files();
    // opening a directory for writing fails with something other than NotFound
    let adjuster = OomScoreAdjuster::with_paths(dir.path(), &legacy_adj);

    assert!(adjuster
        .adjust(&OomPolicy::default(), None, true)
        .is_err());
    assert!(!legacy_adj.exists());
}

/// Writer failing with the given errors before it accepts data
#[cfg(test)]
struct FlakyFile<'a> {
    failures: &'a std::cell::RefCell<Vec<ErrorKind>>,
    written: &'a std::cell::RefCell<String>,
}

#[cfg(test)]
impl Write for FlakyFile<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(kind) = self.failures.borrow_mut().pop() {
            return Err(kind.into());
        }
        self.written
            .borrow_mut()
            .push_str(std::str::from_utf8(buf).unwrap());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_write_retries_transient_errors() {
    use std::cell::{Cell, RefCell};

    let opened = Cell::new(0);
    let failures = RefCell::new(vec![
        ErrorKind::Interrupted,
        ErrorKind::WouldBlock,
        ErrorKind::Interrupted,
    ]);
    let written = RefCell::new(String::new());
    let open = || {
        opened.set(opened.get() + 1);
        Ok::<_, io::Error>(FlakyFile {
            failures: &failures,
            written: &written,
        })
    };
    write_retrying(open, "1000").unwrap();
    assert_eq!(opened.get(), 4);
    assert_eq!(written.borrow().as_str(), "1000");

    // gives up after a bounded number of attempts
    opened.set(0);
    *failures.borrow_mut() = vec![ErrorKind::WouldBlock; MAX_WRITE_ATTEMPTS + 1];
    written.borrow_mut().clear();
    let err = write_retrying(open, "1000").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock);
    assert_eq!(opened.get(), MAX_WRITE_ATTEMPTS);
    assert_eq!(failures.borrow().len(), 1);
    assert!(written.borrow().is_empty());

    // anything else is not retried
    opened.set(0);
    *failures.borrow_mut() = vec![ErrorKind::PermissionDenied];
    let err = write_retrying(open, "1000").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(opened.get(), 1);
}
