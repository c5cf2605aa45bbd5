//! Stress process creation by forking and reaping children

use nix::sys::wait::waitpid;

use super::StressorOptions;
use crate::context::{StressContext, EXIT_SUCCESS};
use crate::oomable::spawn_child;
use crate::run_state::{set_proc_state, ProcState};

/// Fork a child that exits right away and reap it, one bogo op per fork.
pub fn stress_fork(ctx: &mut StressContext, options: &mut StressorOptions) -> i32 {
    set_proc_state(&ctx.name, ProcState::Run);
    loop {
        // the child only exits
        match unsafe { spawn_child(|| EXIT_SUCCESS) } {
            Ok(child) => {
                let _ = waitpid(child.pid(), None);
            }
            Err(e) => {
                if options.verify {
                    ctx.fail(format_args!("fork failed: {}", e));
                }
            }
        }
        ctx.bogo_inc();
        if !ctx.keep_going() || ctx.expired() {
            break;
        }
    }
    set_proc_state(&ctx.name, ProcState::Deinit);
    EXIT_SUCCESS
}

#[test]
fn test_stress_fork_bogo_ops() {
    use std::time::Duration;

    let _guard = crate::run_state::FORK_TESTS
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    let mut ctx = StressContext::new("fork", 0, Duration::from_secs(30)).with_max_ops(5);
    let status = stress_fork(&mut ctx, &mut StressorOptions { verify: true });
    assert_eq!(status, EXIT_SUCCESS);
    assert_eq!(ctx.bogo_ops(), 5);
    assert_eq!(ctx.fail_check(), None);
}

#[test]
fn test_stress_fork_runs_at_least_once() {
    use std::time::Duration;

    let _guard = crate::run_state::FORK_TESTS
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    let mut ctx = StressContext::new("fork", 0, Duration::ZERO);
    stress_fork(&mut ctx, &mut StressorOptions::default());
    assert_eq!(ctx.bogo_ops(), 1);
}
