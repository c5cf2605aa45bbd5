#![deny(missing_docs)]
//! kstress executable

use anyhow::{bail, Context, Result};
use kstress::oom_score::set_oom_adjustment;
use kstress::oomable::RunReport;
use kstress::run_state::install_stop_handler;
use kstress::settings::{parse_settings, Settings};
use kstress::stressors::StressorKind;
use log::warn;
use serde::Serialize;

#[derive(Serialize)]
struct JsonReport<'a> {
    stressor: StressorKind,
    instance: u32,
    #[serde(flatten)]
    report: &'a RunReport,
}

fn print_report(settings: &Settings, report: &RunReport) -> Result<()> {
    if settings.json {
        println!(
            "{}",
            serde_json::to_string(&JsonReport {
                stressor: settings.stressor,
                instance: settings.instance,
                report,
            })
            .context("Failed to serialize json")?
        );
    } else {
        println!(
            "{}: exit status {}, OOM restarts: {}, SIGSEGV restarts: {}, SIGBUS restarts: {}",
            settings.stressor.name(),
            report.status,
            report.restarts.ooms,
            report.restarts.segvs,
            report.restarts.buserrs
        );
    }
    if settings.metrics {
        print!("{}", kstress::metrics::encode_metrics()?);
    }
    Ok(())
}

/// The kstress program entry point
pub fn main() -> Result<()> {
    let settings = parse_settings()?;

    if let Err(e) = kstress::log_fmt::init("kstress", settings.log_level) {
        bail!("Failed to setup logger: {:?}", e);
    };
    kstress::metrics::init();
    install_stop_handler()?;

    let policy = settings.oom_policy();
    // the supervisor should outlive the stressors it runs
    if let Err(e) = set_oom_adjustment(&policy, None, false) {
        warn!("Failed to adjust oom score: {}", e);
    }

    let mut ctx = settings.context();
    let report = settings.stressor.run(
        &mut ctx,
        &policy,
        settings.stressor_options(),
        settings.quiet,
    );
    print_report(&settings, &report)?;
    std::process::exit(report.status)
}
