//! Global run flag and stressor lifecycle states

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use log::{info, trace};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use prometheus::{register_int_gauge_vec, IntGaugeVec};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

lazy_static! {
    static ref PROC_STATE: IntGaugeVec = register_int_gauge_vec!(
        "kstress_proc_state",
        "In what lifecycle state a stressor process is",
        &["stressor", "state"],
    )
    .unwrap();
}

static KEEP_STRESSING: AtomicBool = AtomicBool::new(true);

// Tests that fork must not race with other threads holding the metric locks
#[cfg(test)]
pub(crate) static FORK_TESTS: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Whether stressors should keep running. Cleared once by a termination
/// signal or by [`stop_stressing`], never set again.
pub fn keep_stressing() -> bool {
    KEEP_STRESSING.load(Ordering::Relaxed)
}

/// Ask every stressor of this process to wind down
pub fn stop_stressing() {
    KEEP_STRESSING.store(false, Ordering::Relaxed);
}

/// Clear the run flag on SIGINT, SIGTERM or SIGHUP.
pub fn install_stop_handler() -> Result<()> {
    ctrlc::set_handler(|| {
        info!("termination signal received, stopping stressors");
        stop_stressing();
    })
    .context("Cannot register termination handler")
}

extern "C" fn stop_on_signal(_: nix::libc::c_int) {
    stop_stressing();
}

/// Stop handler for forked stressor children.
///
/// The handler thread installed by [`install_stop_handler`] does not survive a
/// fork, so children clear the run flag straight from the signal handler.
/// SIGALRM is included: it is what a dying parent and a parent that cannot
/// reap its child send first.
pub fn install_child_stop_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(stop_on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [
        Signal::SIGALRM,
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
    ] {
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

/// Lifecycle of a stressor process. Purely observational.
// When adding states also update `ProcState::ALL`
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ProcState {
    /// Forked, nothing done yet
    Start,
    /// Setting up resources
    Init,
    /// Running the workload
    Run,
    /// Blocked waiting for a child
    Wait,
    /// Releasing resources
    Deinit,
    /// About to exit
    Exit,
}

impl ProcState {
    const ALL: [ProcState; 6] = [
        ProcState::Start,
        ProcState::Init,
        ProcState::Run,
        ProcState::Wait,
        ProcState::Deinit,
        ProcState::Exit,
    ];
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Record that stressor `name` entered `state`
pub fn set_proc_state(name: &str, state: ProcState) {
    for s in ProcState::ALL {
        PROC_STATE
            .with_label_values(&[name, &s.to_string()])
            .set(i64::from(s == state));
    }
    trace!("{}: state {}", name, state);
}

#[test]
fn test_set_proc_state() {
    let _guard = FORK_TESTS.lock().unwrap_or_else(|e| e.into_inner());
    set_proc_state("state-test", ProcState::Wait);
    assert_eq!(
        PROC_STATE
            .with_label_values(&["state-test", "Wait"])
            .get(),
        1
    );
    set_proc_state("state-test", ProcState::Run);
    assert_eq!(
        PROC_STATE
            .with_label_values(&["state-test", "Wait"])
            .get(),
        0
    );
    assert_eq!(
        PROC_STATE.with_label_values(&["state-test", "Run"]).get(),
        1
    );

    // exactly one state is set at a time
    for state in ProcState::ALL {
        set_proc_state("state-test", state);
        let set: i64 = ProcState::ALL
            .iter()
            .map(|s| {
                PROC_STATE
                    .with_label_values(&["state-test", &s.to_string()])
                    .get()
            })
            .sum();
        assert_eq!(set, 1);
    }
}
