#![deny(missing_docs)]

//! a supervisor library for stressors that are expected to be oom killed

pub mod context;
pub mod kmsg;
pub mod log_fmt;
pub mod metrics;
pub mod oom_score;
pub mod oomable;
pub mod proc;
pub mod run_state;
pub mod settings;
pub mod stressors;
