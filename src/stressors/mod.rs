//! Stressor workloads, each run in a supervised child

pub mod fork;
pub mod physmmap;

use clap::ValueEnum;
use log::info;
use serde::Serialize;

use crate::context::{StressContext, EXIT_NO_RESOURCE};
use crate::oom_score::OomPolicy;
use crate::oomable::{run_oomable_child, ChildOptions, RestartCounts, RunReport};

/// Options shared by all stressors
#[derive(Debug, Clone, Copy, Default)]
pub struct StressorOptions {
    /// Verify results and treat anomalies as failures
    pub verify: bool,
}

/// Available stressors
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StressorKind {
    /// Fork a child that exits immediately, over and over
    Fork,
    /// mmap and munmap physical pages through /dev/mem
    Physmmap,
}

impl StressorKind {
    /// Name used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            StressorKind::Fork => "fork",
            StressorKind::Physmmap => "physmmap",
        }
    }

    fn supported(&self) -> bool {
        match self {
            StressorKind::Fork => true,
            StressorKind::Physmmap => physmmap::supported(),
        }
    }

    /// Run the stressor under [`run_oomable_child`] until it is done.
    /// Unsupported stressors are skipped with [`EXIT_NO_RESOURCE`].
    pub fn run(
        &self,
        ctx: &mut StressContext,
        policy: &OomPolicy,
        mut options: StressorOptions,
        quiet: bool,
    ) -> RunReport {
        if !self.supported() {
            info!("{}: stressor will be skipped", ctx.name);
            return RunReport {
                status: EXIT_NO_RESOURCE,
                restarts: RestartCounts::default(),
            };
        }
        match self {
            StressorKind::Fork => run_oomable_child(
                ctx,
                &mut options,
                fork::stress_fork,
                policy,
                ChildOptions {
                    quiet,
                    drop_capabilities: true,
                },
            ),
            // /dev/mem needs CAP_SYS_ADMIN, keep it
            StressorKind::Physmmap => run_oomable_child(
                ctx,
                &mut options,
                physmmap::stress_physmmap,
                policy,
                ChildOptions {
                    quiet,
                    drop_capabilities: false,
                },
            ),
        }
    }
}
