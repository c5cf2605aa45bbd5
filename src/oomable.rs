//! Runs a stressor workload in a child process that is allowed to die.
//!
//! Stressors deliberately provoke the oom killer, SIGBUS from speculative
//! mappings and SIGSEGV from fault injection. Such deaths restart the
//! workload instead of failing the stressor.

use lazy_static::lazy_static;
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use prometheus::{register_int_counter_vec, IntCounterVec};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use crate::context::{StressContext, EXIT_FAILURE, EXIT_SUCCESS};
use crate::oom_score::{set_oom_adjustment, OomPolicy};
use crate::proc::{clean_dir, drop_capabilities, log_system_mem_info, parent_died_alarm};
use crate::run_state::{install_child_stop_handler, set_proc_state, ProcState};

lazy_static! {
    static ref RESTARTS: IntCounterVec = register_int_counter_vec!(
        "kstress_restarts_total",
        "How often a stressor child has been restarted",
        &["stressor", "cause"],
    )
    .unwrap();
}

/// How long to back off when fork runs out of resources
const FORK_RETRY_DELAY: Duration = Duration::from_millis(100);
/// How long to back off between escalation steps after the first one
const REWAIT_DELAY: Duration = Duration::from_millis(500);

/// Sent to a child we cannot wait for, gentle first
const ESCALATION_SIGNALS: [Signal; 6] = [
    Signal::SIGALRM,
    Signal::SIGALRM,
    Signal::SIGALRM,
    Signal::SIGALRM,
    Signal::SIGTERM,
    Signal::SIGKILL,
];

/// Options for [`run_oomable_child`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildOptions {
    /// Do not log failures and restarts
    pub quiet: bool,
    /// Drop all capabilities in the child before running the workload
    pub drop_capabilities: bool,
}

/// Restarts within one supervised run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestartCounts {
    /// Child was killed by SIGKILL, presumably by the oom killer
    pub ooms: u32,
    /// Child died of SIGSEGV
    pub segvs: u32,
    /// Child died of SIGBUS
    pub buserrs: u32,
}

impl RestartCounts {
    /// Sum of all restarts
    pub fn total(&self) -> u32 {
        self.ooms + self.segvs + self.buserrs
    }
}

/// Result of a supervised run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Exit status of the stressor
    pub status: i32,
    /// Restarts that happened on the way
    pub restarts: RestartCounts,
}

/// Outcome of a single escalation step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationStep {
    /// `signal` was sent, wait for the child again
    Rewait {
        /// The signal that was sent
        signal: Signal,
        /// Only the first step re-waits without delay, the child may already be dead
        immediate: bool,
    },
    /// Every signal has been sent, stop waiting for the child
    Exhausted,
}

/// Walks through [`ESCALATION_SIGNALS`], never going back
#[derive(Debug, Clone)]
pub struct Escalation {
    next: usize,
    last_sent: Option<Signal>,
}

impl Default for Escalation {
    fn default() -> Self {
        Escalation::new()
    }
}

impl Escalation {
    /// Start with the gentlest signal
    pub fn new() -> Self {
        Escalation {
            next: 0,
            last_sent: None,
        }
    }

    /// Number of signals sent so far
    pub fn index(&self) -> usize {
        self.next
    }

    /// The most recent signal handed to `send`
    pub fn last_sent(&self) -> Option<Signal> {
        self.last_sent
    }

    /// The signal the next step would send, `None` once exhausted
    pub fn next_signal(&self) -> Option<Signal> {
        ESCALATION_SIGNALS.get(self.next).copied()
    }

    /// Hand the next signal to `send`. Once the last signal went out the
    /// sequence is exhausted and nothing is sent anymore.
    pub fn escalate<F: FnOnce(Signal)>(&mut self, send: F) -> EscalationStep {
        let signal = match ESCALATION_SIGNALS.get(self.next) {
            Some(signal) => *signal,
            None => return EscalationStep::Exhausted,
        };
        send(signal);
        self.last_sent = Some(signal);
        self.next += 1;
        if self.next >= ESCALATION_SIGNALS.len() {
            EscalationStep::Exhausted
        } else {
            EscalationStep::Rewait {
                signal,
                immediate: self.next == 1,
            }
        }
    }
}

/// How a supervised child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Exited with a status code
    Exited(i32),
    /// Terminated by a signal
    Signaled(Signal),
    /// Already reaped, or we gave up waiting for it
    Gone,
}

/// A forked stressor child
#[derive(Debug)]
pub struct Child {
    pid: Pid,
}

impl Child {
    /// Pid of the child
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Block until the child is gone. When waiting itself fails, the child is
    /// prodded with the next signal of `escalation` before waiting again.
    pub fn supervise(
        &self,
        ctx: &StressContext,
        escalation: &mut Escalation,
        quiet: bool,
    ) -> WaitOutcome {
        loop {
            set_proc_state(&ctx.name, ProcState::Wait);
            let res = waitpid(self.pid, None);
            set_proc_state(&ctx.name, ProcState::Run);
            match res {
                Ok(WaitStatus::Exited(_, code)) => return WaitOutcome::Exited(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => return WaitOutcome::Signaled(signal),
                Ok(status) => {
                    debug!("{}: unexpected wait status {:?}", ctx.name, status);
                }
                Err(Errno::ECHILD) => return WaitOutcome::Gone,
                Err(e) => {
                    // an interrupted wait usually means our own alarm went off
                    if e != Errno::EINTR && !quiet {
                        debug!("{}: waitpid(): {}", ctx.name, e);
                    }
                    let pid = self.pid;
                    match escalation.escalate(|signal| {
                        let _ = kill(pid, signal);
                    }) {
                        EscalationStep::Exhausted => return WaitOutcome::Gone,
                        EscalationStep::Rewait {
                            immediate: false, ..
                        } => thread::sleep(REWAIT_DELAY),
                        EscalationStep::Rewait { .. } => {}
                    }
                }
            }
        }
    }
}

/// Fork a child running `child_main`. The child never returns from here, it
/// exits with the status `child_main` returns.
///
/// # Safety
///
/// Same contract as [`fork`]: if the calling process has other threads,
/// `child_main` must not touch anything those threads may have held locked at
/// the time of the fork (allocator aside).
pub unsafe fn spawn_child<F: FnOnce() -> i32>(child_main: F) -> nix::Result<Child> {
    match fork()? {
        ForkResult::Parent { child } => Ok(Child { pid: child }),
        ForkResult::Child => {
            // a panic must not unwind into the parent's code path
            let status =
                panic::catch_unwind(AssertUnwindSafe(child_main)).unwrap_or(EXIT_FAILURE);
            exit_child(status)
        }
    }
}

fn exit_child(status: i32) -> ! {
    // skip atexit handlers and buffered output inherited from the parent
    unsafe { libc::_exit(status) }
}

fn should_stop(ctx: &StressContext) -> bool {
    !ctx.keep_going() || ctx.expired()
}

fn run_workload<T, F>(
    ctx: &mut StressContext,
    context: &mut T,
    func: &mut F,
    policy: &OomPolicy,
    options: ChildOptions,
) -> i32
where
    F: FnMut(&mut StressContext, &mut T) -> i32,
{
    set_proc_state(&ctx.name, ProcState::Start);
    if should_stop(ctx) {
        set_proc_state(&ctx.name, ProcState::Exit);
        return EXIT_SUCCESS;
    }
    set_proc_state(&ctx.name, ProcState::Init);
    if let Err(e) = install_child_stop_handler() {
        debug!("{}: cannot install stop handler: {}", ctx.name, e);
    }
    if let Err(e) = parent_died_alarm() {
        debug!("{}: cannot arm parent death signal: {}", ctx.name, e);
    }
    // children are always fair game for the oom killer
    let _ = set_oom_adjustment(policy, Some(ctx), true);
    if options.drop_capabilities {
        let _ = drop_capabilities();
    }
    // we may have run out of time while getting here
    if should_stop(ctx) {
        set_proc_state(&ctx.name, ProcState::Exit);
        return EXIT_SUCCESS;
    }

    let mut status = func(ctx, context);
    if let Some(rc) = ctx.fail_check() {
        status = rc;
    }
    set_proc_state(&ctx.name, ProcState::Exit);
    status
}

/// A SIGKILL is put down to the oom killer unless killing is what the
/// escalation is about to do anyway.
fn killed_by_oom(signal: Signal, escalation: &Escalation) -> bool {
    signal == Signal::SIGKILL && escalation.next_signal() != Some(Signal::SIGKILL)
}

fn count_restart(ctx: &StressContext, cause: &str) {
    RESTARTS.with_label_values(&[&ctx.name, cause]).inc();
}

/// Run `func` in a child process until it finishes.
///
/// The child is made an easy oom killer target. A child killed by SIGKILL
/// (assumed to be the oom killer), SIGSEGV or SIGBUS is restarted until the
/// run flag is cleared or the deadline of `ctx` passes. With
/// [`OomPolicy::oomable`] an oom kill ends the run successfully instead.
/// `context` is handed to `func` untouched.
pub fn run_oomable_child<T, F>(
    ctx: &mut StressContext,
    context: &mut T,
    mut func: F,
    policy: &OomPolicy,
    options: ChildOptions,
) -> RunReport
where
    F: FnMut(&mut StressContext, &mut T) -> i32,
{
    let mut restarts = RestartCounts::default();
    let mut escalation = Escalation::new();

    let status = loop {
        if should_stop(ctx) {
            break EXIT_SUCCESS;
        }
        // the only other thread of kstress is the ctrlc handler blocked on its pipe
        let child = match unsafe {
            spawn_child(|| run_workload(ctx, context, &mut func, policy, options))
        } {
            Ok(child) => child,
            Err(Errno::EAGAIN | Errno::ENOMEM) => {
                thread::sleep(FORK_RETRY_DELAY);
                continue;
            }
            Err(e) => {
                if !options.quiet {
                    error!("{}: fork failed: {}", ctx.name, e);
                }
                return RunReport {
                    status: EXIT_FAILURE,
                    restarts,
                };
            }
        };

        let signal = match child.supervise(ctx, &mut escalation, options.quiet) {
            WaitOutcome::Exited(code) => break code,
            WaitOutcome::Gone => break EXIT_SUCCESS,
            WaitOutcome::Signaled(signal) => signal,
        };
        if !options.quiet {
            debug!("{}: child died: {} (instance {})", ctx.name, signal, ctx.instance);
        }
        match signal {
            Signal::SIGBUS => {
                restarts.buserrs += 1;
                count_restart(ctx, "sigbus");
            }
            Signal::SIGKILL if killed_by_oom(signal, &escalation) => {
                log_system_mem_info();
                if policy.oomable {
                    if !options.quiet {
                        debug!(
                            "{}: assuming killed by OOM killer, bailing out (instance {})",
                            ctx.name, ctx.instance
                        );
                    }
                    if let Err(e) = clean_dir(ctx) {
                        warn!("{}: {:#}", ctx.name, e);
                    }
                    return RunReport {
                        status: EXIT_SUCCESS,
                        restarts,
                    };
                }
                if !options.quiet {
                    debug!(
                        "{}: assuming killed by OOM killer, restarting again (instance {})",
                        ctx.name, ctx.instance
                    );
                }
                restarts.ooms += 1;
                count_restart(ctx, "oom");
            }
            Signal::SIGSEGV => {
                if !options.quiet {
                    debug!(
                        "{}: killed by SIGSEGV, restarting again (instance {})",
                        ctx.name, ctx.instance
                    );
                }
                restarts.segvs += 1;
                count_restart(ctx, "sigsegv");
            }
            // a signaled child carries no exit code
            _ => break EXIT_SUCCESS,
        }
    };

    if restarts.total() > 0 && !options.quiet {
        debug!(
            "{}: OOM restarts: {}, SIGSEGV restarts: {}, SIGBUS restarts: {}",
            ctx.name, restarts.ooms, restarts.segvs, restarts.buserrs
        );
    }
    RunReport { status, restarts }
}

#[cfg(test)]
fn die_by(signal: Signal) -> i32 {
    // keep the test run free of core dumps
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
    let _ = kill(nix::unistd::getpid(), signal);
    // SIGKILL and friends do not return, anything else is a test bug
    EXIT_FAILURE
}

#[cfg(test)]
fn run_test_child<T, F>(
    ctx: &mut StressContext,
    context: &mut T,
    func: F,
    policy: &OomPolicy,
) -> RunReport
where
    F: FnMut(&mut StressContext, &mut T) -> i32,
{
    let _guard = crate::run_state::FORK_TESTS
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    run_oomable_child(ctx, context, func, policy, ChildOptions::default())
}

#[cfg(test)]
extern "C" fn interrupt_only(_: libc::c_int) {}

#[cfg(test)]
static TERM_RECEIVED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

#[cfg(test)]
extern "C" fn note_term(_: libc::c_int) {
    TERM_RECEIVED.store(true, std::sync::atomic::Ordering::Relaxed);
}

#[cfg(test)]
fn set_handler(
    signal: Signal,
    handler: nix::sys::signal::SigHandler,
    flags: nix::sys::signal::SaFlags,
) -> nix::sys::signal::SigAction {
    use nix::sys::signal::{sigaction, SigAction, SigSet};

    let action = SigAction::new(handler, flags, SigSet::empty());
    unsafe { sigaction(signal, &action) }.unwrap()
}

/// Child that survives ALRM and TERM, marks `ready` and then hangs
#[cfg(test)]
fn wedged_child(ready: &std::path::Path) -> i32 {
    use nix::sys::signal::{SaFlags, SigHandler};

    set_handler(Signal::SIGALRM, SigHandler::SigIgn, SaFlags::empty());
    set_handler(Signal::SIGTERM, SigHandler::SigIgn, SaFlags::empty());
    std::fs::write(ready, "").unwrap();
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

/// Run `f` while every blocking wait of the calling thread is interrupted
/// with SIGUSR2, starting once `ready` exists.
#[cfg(test)]
fn with_interrupted_waits<R>(ready: &std::path::Path, f: impl FnOnce() -> R) -> R {
    use nix::sys::signal::{sigaction, SaFlags, SigHandler};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    // no SA_RESTART, a blocked waitpid fails with EINTR
    let previous = set_handler(
        Signal::SIGUSR2,
        SigHandler::Handler(interrupt_only),
        SaFlags::empty(),
    );
    let target = unsafe { libc::pthread_self() };
    let done = Arc::new(AtomicBool::new(false));
    let interrupter = {
        let done = Arc::clone(&done);
        let ready = ready.to_path_buf();
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                if ready.exists() {
                    unsafe { libc::pthread_kill(target, libc::SIGUSR2) };
                }
                thread::sleep(Duration::from_millis(50));
            }
        })
    };
    let res = f();
    done.store(true, Ordering::Relaxed);
    interrupter.join().unwrap();
    unsafe { sigaction(Signal::SIGUSR2, &previous) }.unwrap();
    res
}

#[test]
fn test_escalation_sequence() {
    let mut escalation = Escalation::new();
    let mut sent = vec![];
    let mut steps = vec![];
    for i in 0..ESCALATION_SIGNALS.len() {
        steps.push(escalation.escalate(|signal| sent.push(signal)));
        assert_eq!(escalation.index(), i + 1);
    }
    assert_eq!(sent, ESCALATION_SIGNALS.to_vec());
    assert_eq!(
        steps[0],
        EscalationStep::Rewait {
            signal: Signal::SIGALRM,
            immediate: true
        }
    );
    assert_eq!(
        steps[4],
        EscalationStep::Rewait {
            signal: Signal::SIGTERM,
            immediate: false
        }
    );
    // the final SIGKILL exhausts the sequence, after that nothing is sent
    assert_eq!(steps[5], EscalationStep::Exhausted);
    assert_eq!(
        escalation.escalate(|signal| sent.push(signal)),
        EscalationStep::Exhausted
    );
    assert_eq!(sent.len(), ESCALATION_SIGNALS.len());
    assert_eq!(escalation.index(), ESCALATION_SIGNALS.len());
    assert_eq!(escalation.last_sent(), Some(Signal::SIGKILL));
    assert_eq!(escalation.next_signal(), None);
}

#[test]
fn test_killed_by_oom() {
    let mut escalation = Escalation::new();
    assert_eq!(escalation.next_signal(), Some(Signal::SIGALRM));
    assert!(killed_by_oom(Signal::SIGKILL, &escalation));
    assert!(!killed_by_oom(Signal::SIGSEGV, &escalation));

    for _ in 0..4 {
        escalation.escalate(|_| {});
    }
    assert_eq!(escalation.next_signal(), Some(Signal::SIGTERM));
    assert!(killed_by_oom(Signal::SIGKILL, &escalation));

    // a KILL right before we would send one ourselves is not the oom killer
    escalation.escalate(|_| {});
    assert_eq!(escalation.next_signal(), Some(Signal::SIGKILL));
    assert!(!killed_by_oom(Signal::SIGKILL, &escalation));
}

#[test]
fn test_sigkill_after_term_ends_the_run() {
    use nix::sys::signal::{SaFlags, SigHandler};
    use std::sync::atomic::Ordering;

    let dir = tempfile::tempdir().unwrap();
    let ready = dir.path().join("ready");
    let mut marker = ready.clone();
    let mut ctx = StressContext::new("term-kill-test", 0, Duration::from_secs(20));
    let report = with_interrupted_waits(&ready, || {
        run_test_child(
            &mut ctx,
            &mut marker,
            |_, marker| {
                set_handler(Signal::SIGALRM, SigHandler::SigIgn, SaFlags::empty());
                set_handler(
                    Signal::SIGTERM,
                    SigHandler::Handler(note_term),
                    SaFlags::SA_RESTART,
                );
                std::fs::write(marker.as_path(), "").unwrap();
                // ALRM four times, then TERM, the next step would be KILL
                while !TERM_RECEIVED.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                die_by(Signal::SIGKILL)
            },
            &OomPolicy::default(),
        )
    });
    assert_eq!(
        report,
        RunReport {
            status: EXIT_SUCCESS,
            restarts: RestartCounts::default()
        }
    );
}

#[test]
fn test_supervise_gives_up_after_kill() {
    let _guard = crate::run_state::FORK_TESTS
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let ready = dir.path().join("ready");
    let ctx = StressContext::new("wedged-test", 0, Duration::from_secs(30));
    let child = unsafe { spawn_child(|| wedged_child(&ready)) }.unwrap();

    let mut escalation = Escalation::new();
    let outcome = with_interrupted_waits(&ready, || {
        child.supervise(&ctx, &mut escalation, true)
    });
    assert_eq!(outcome, WaitOutcome::Gone);
    assert_eq!(escalation.index(), ESCALATION_SIGNALS.len());
    assert_eq!(escalation.last_sent(), Some(Signal::SIGKILL));
    // the final KILL got through
    assert!(matches!(
        waitpid(child.pid(), None),
        Ok(WaitStatus::Signaled(_, Signal::SIGKILL, _))
    ));
}

#[test]
fn test_wedged_child_ends_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let ready = dir.path().join("ready");
    let mut marker = ready.clone();
    let mut ctx = StressContext::new("wedged-run-test", 0, Duration::from_secs(30));
    let report = with_interrupted_waits(&ready, || {
        run_test_child(
            &mut ctx,
            &mut marker,
            |_, marker| wedged_child(marker.as_path()),
            &OomPolicy::default(),
        )
    });
    assert_eq!(
        report,
        RunReport {
            status: EXIT_SUCCESS,
            restarts: RestartCounts::default()
        }
    );
}

#[test]
fn test_exit_status_is_returned() {
    let mut ctx = StressContext::new("exit-test", 0, Duration::from_secs(30));
    let report = run_test_child(&mut ctx, &mut (), |_, _| 7, &OomPolicy::default());
    assert_eq!(
        report,
        RunReport {
            status: 7,
            restarts: RestartCounts::default()
        }
    );
}

#[test]
fn test_opaque_context_and_fail_check() {
    let dir = tempfile::tempdir().unwrap();
    let mut marker = dir.path().join("ran");
    let mut ctx = StressContext::new("fail-test", 0, Duration::from_secs(30));
    let report = run_test_child(
        &mut ctx,
        &mut marker,
        |ctx, marker| {
            std::fs::write(marker.as_path(), "").unwrap();
            ctx.fail(format_args!("verification failed"));
            EXIT_SUCCESS
        },
        &OomPolicy::default(),
    );
    assert_eq!(report.status, EXIT_FAILURE);
    assert!(marker.exists());
}

#[test]
fn test_no_fork_when_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let mut marker = dir.path().join("ran");
    let workload = |_: &mut StressContext, marker: &mut std::path::PathBuf| {
        std::fs::write(marker.as_path(), "").unwrap();
        3
    };

    // bogo op bound already reached
    let mut ctx = StressContext::new("stop-test", 0, Duration::from_secs(30)).with_max_ops(1);
    ctx.bogo_inc();
    let report = run_test_child(&mut ctx, &mut marker, workload, &OomPolicy::default());
    assert_eq!(report.status, EXIT_SUCCESS);

    // deadline already passed
    let mut ctx = StressContext::new("stop-test", 0, Duration::ZERO);
    thread::sleep(Duration::from_millis(1));
    let report = run_test_child(&mut ctx, &mut marker, workload, &OomPolicy::default());
    assert_eq!(report.status, EXIT_SUCCESS);

    assert!(!marker.exists());
}

#[test]
fn test_sigbus_restarts_until_deadline() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let mut deaths = dir.path().join("deaths");
    let mut ctx = StressContext::new("sigbus-test", 0, Duration::from_millis(300));
    let report = run_test_child(
        &mut ctx,
        &mut deaths,
        |_, deaths| {
            let mut f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(deaths.as_path())
                .unwrap();
            f.write_all(b"x").unwrap();
            drop(f);
            die_by(Signal::SIGBUS)
        },
        &OomPolicy::default(),
    );
    assert_eq!(report.status, EXIT_SUCCESS);
    assert!(report.restarts.buserrs > 0);
    assert_eq!(report.restarts.ooms, 0);
    assert_eq!(report.restarts.segvs, 0);
    let died = std::fs::read(&deaths).unwrap().len();
    assert_eq!(report.restarts.buserrs as usize, died);
}

#[test]
fn test_sigsegv_restarts() {
    let mut ctx = StressContext::new("sigsegv-test", 0, Duration::from_millis(200));
    let report = run_test_child(
        &mut ctx,
        &mut (),
        |_, _| die_by(Signal::SIGSEGV),
        &OomPolicy::default(),
    );
    assert_eq!(report.status, EXIT_SUCCESS);
    assert!(report.restarts.segvs > 0);
    assert_eq!(report.restarts.ooms + report.restarts.buserrs, 0);
}

#[test]
fn test_sigkill_is_an_oom_restart() {
    let mut ctx = StressContext::new("oom-restart-test", 0, Duration::from_millis(200));
    let report = run_test_child(
        &mut ctx,
        &mut (),
        |_, _| die_by(Signal::SIGKILL),
        &OomPolicy::default(),
    );
    assert_eq!(report.status, EXIT_SUCCESS);
    assert!(report.restarts.ooms > 0);
    assert_eq!(report.restarts.segvs + report.restarts.buserrs, 0);
}

#[test]
fn test_oomable_sigkill_stops_immediately() {
    let tmp = tempfile::tempdir().unwrap();
    let mut ctx =
        StressContext::new("oomable-test", 0, Duration::from_secs(30)).with_temp_path(tmp.path());
    std::fs::create_dir_all(ctx.temp_dir()).unwrap();
    let policy = OomPolicy {
        no_oom_adjust: false,
        oomable: true,
    };
    let report = run_test_child(
        &mut ctx,
        &mut (),
        |_, _| die_by(Signal::SIGKILL),
        &policy,
    );
    assert_eq!(
        report,
        RunReport {
            status: EXIT_SUCCESS,
            restarts: RestartCounts::default()
        }
    );
    assert!(!ctx.temp_dir().exists());
}

#[test]
fn test_other_signals_end_the_run() {
    let mut ctx = StressContext::new("sigusr1-test", 0, Duration::from_secs(30));
    let report = run_test_child(
        &mut ctx,
        &mut (),
        |_, _| die_by(Signal::SIGUSR1),
        &OomPolicy::default(),
    );
    assert_eq!(
        report,
        RunReport {
            status: EXIT_SUCCESS,
            restarts: RestartCounts::default()
        }
    );
}

#[test]
fn test_gone_child() {
    let _guard = crate::run_state::FORK_TESTS
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    let ctx = StressContext::new("gone-test", 0, Duration::from_secs(30));
    let child = unsafe { spawn_child(|| 0) }.unwrap();
    assert_eq!(
        child.supervise(&ctx, &mut Escalation::new(), true),
        WaitOutcome::Exited(0)
    );
    // reaped already, a second wait fails with ECHILD
    let mut escalation = Escalation::new();
    assert_eq!(
        child.supervise(&ctx, &mut escalation, true),
        WaitOutcome::Gone
    );
    assert_eq!(escalation.index(), 0);
}
