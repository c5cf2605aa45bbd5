//! Read settings for kstress

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::context::StressContext;
use crate::oom_score::OomPolicy;
use crate::stressors::{StressorKind, StressorOptions};

/// Setting options for kstress
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Settings {
    /// Stressor to run
    #[clap(long, value_enum, default_value = "fork", env = "KSTRESS_STRESSOR")]
    pub stressor: StressorKind,
    /// Instance index of this stressor, only instance 0 reports some diagnostics
    #[clap(long, default_value_t = 0, env = "KSTRESS_INSTANCE")]
    pub instance: u32,
    /// Run time in seconds
    #[clap(long, default_value_t = 60, env = "KSTRESS_TIMEOUT")]
    pub timeout: u64,
    /// Stop after this many bogo operations, 0 means no limit
    #[clap(long, default_value_t = 0, env = "KSTRESS_OPS")]
    pub ops: u64,
    /// Do not touch oom adjustments at all
    #[clap(long, env = "KSTRESS_NO_OOM_ADJUST")]
    pub no_oom_adjust: bool,
    /// Stressors are expected to get oom killed. An oom kill ends the stressor
    /// instead of restarting it.
    #[clap(long, env = "KSTRESS_OOMABLE")]
    pub oomable: bool,
    /// Verify stressor results
    #[clap(long)]
    pub verify: bool,
    /// Do not log stressor failures and restarts
    #[clap(long)]
    pub quiet: bool,
    /// Where per-instance temporary directories are created, defaults to the system temp dir
    #[clap(long, env = "KSTRESS_TEMP_PATH")]
    pub temp_path: Option<PathBuf>,
    /// Log level: error, warn, info, debug or trace
    #[clap(long, default_value = "info", env = "KSTRESS_LOG_LEVEL")]
    pub log_level: log::Level,
    /// Print the run report as json
    #[clap(long)]
    pub json: bool,
    /// Print prometheus metrics after the run
    #[clap(long)]
    pub metrics: bool,
}

impl Settings {
    /// The process wide oom policy
    pub fn oom_policy(&self) -> OomPolicy {
        OomPolicy {
            no_oom_adjust: self.no_oom_adjust,
            oomable: self.oomable,
        }
    }

    /// Options handed to the stressor
    pub fn stressor_options(&self) -> StressorOptions {
        StressorOptions {
            verify: self.verify,
        }
    }

    /// A fresh context for the configured stressor instance, the deadline starts now
    pub fn context(&self) -> StressContext {
        let ctx = StressContext::new(
            self.stressor.name(),
            self.instance,
            Duration::from_secs(self.timeout),
        )
        .with_max_ops(self.ops);
        match self.temp_path {
            Some(ref path) => ctx.with_temp_path(path),
            None => ctx,
        }
    }

    fn validate(self) -> Result<Settings> {
        if self.timeout == 0 && self.ops == 0 {
            bail!("either --timeout or --ops has to be non-zero");
        }
        if let Some(ref path) = self.temp_path {
            if !path.is_dir() {
                bail!("--temp-path {} is not a directory", path.display());
            }
        }
        Ok(self)
    }
}

/// Read and returns settings from the command line and environment variables
pub fn parse_settings() -> Result<Settings> {
    Settings::parse().validate()
}

#[test]
fn test_parse_settings() {
    let settings = Settings::try_parse_from([
        "kstress",
        "--stressor",
        "physmmap",
        "--instance",
        "2",
        "--oomable",
        "--ops",
        "100",
        "--log-level",
        "debug",
    ])
    .unwrap()
    .validate()
    .unwrap();

    assert_eq!(settings.stressor, StressorKind::Physmmap);
    assert_eq!(
        settings.oom_policy(),
        OomPolicy {
            no_oom_adjust: false,
            oomable: true
        }
    );
    assert_eq!(settings.log_level, log::Level::Debug);
    let ctx = settings.context();
    assert_eq!(ctx.name, "physmmap");
    assert_eq!(ctx.instance, 2);
    assert_eq!(ctx.max_ops, 100);
}

#[test]
fn test_invalid_settings() {
    let settings = Settings::try_parse_from(["kstress", "--timeout", "0"]).unwrap();
    assert!(settings.validate().is_err());

    let settings =
        Settings::try_parse_from(["kstress", "--temp-path", "/nonexistent/kstress"]).unwrap();
    assert!(settings.validate().is_err());

    assert!(Settings::try_parse_from(["kstress", "--stressor", "memcpy"]).is_err());
}
