pub mod config;
pub mod driver;
pub mod factory;
pub mod stats;
pub mod thresholds;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::config::{load_config, RunConfig};
use crate::driver::Driver;
use crate::factory::HttpTransport;
use crate::stats::Summary;
use crate::thresholds::ThresholdReport;

fn cli() -> Command {
    Command::new("loadpacer")
        .about("Constant-arrival-rate HTTP load driver with pass/fail thresholds")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (otherwise $CONFIG_DIR is searched)"),
        )
        .arg(
            Arg::new("rate")
                .long("rate")
                .value_name("REQ_PER_SEC")
                .value_parser(clap::value_parser!(u32))
                .help("Override the configured arrival rate"),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u64))
                .help("Override the configured run duration"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Emit the run summary as JSON"),
        )
}

// The run's verdict decides the exit code: every threshold must pass.
#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    match run(&matches).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(matches: &ArgMatches) -> anyhow::Result<bool> {
    let mut settings = load_config(matches.get_one::<String>("config").map(String::as_str))
        .await
        .context("failed to load configuration")?;
    if let Some(rate) = matches.get_one::<u32>("rate") {
        settings.rate = *rate;
    }
    if let Some(duration_secs) = matches.get_one::<u64>("duration") {
        settings.duration_secs = *duration_secs;
    }
    config::validate_settings(&settings).context("invalid configuration")?;
    settings.init_logging();

    let specs = thresholds::parse_specs(&settings.thresholds)?;
    if specs.is_empty() {
        log::warn!("no thresholds configured; the run will always pass");
    }

    let run_config = RunConfig::from_settings(&settings)?;
    let transport = Arc::new(HttpTransport::new(&run_config)?);
    let driver = Driver::new(run_config, transport);

    let record = driver.run().await;
    let summary = Summary::from_outcomes(&record.outcomes, record.dropped_iterations);
    let reports = thresholds::evaluate(&specs, &summary);
    let passed = thresholds::verdict(&reports);

    if matches.get_flag("json") {
        let document = serde_json::json!({
            "summary": summary,
            "thresholds": reports,
            "verdict": if passed { "PASS" } else { "FAIL" },
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
    } else {
        print_report(&summary, &reports, passed);
    }

    Ok(passed)
}

fn print_report(summary: &Summary, reports: &[ThresholdReport], passed: bool) {
    println!("requests issued:    {}", summary.total_requests);
    println!("responses:          {}", summary.responses);
    println!("transport failures: {}", summary.transport_failures);
    println!("dropped iterations: {}", summary.dropped_iterations);
    println!("average duration:   {:.2}ms", summary.average_duration_ms);
    println!("p95 duration:       {:.2}ms", summary.p95_duration_ms);
    println!("check pass rate:    {:.4}", summary.check_pass_rate);
    for report in reports {
        println!(
            "threshold {:<18} {:<10} observed {:>10.2}  {}",
            report.metric,
            report.expression,
            report.observed,
            if report.passed { "PASS" } else { "FAIL" }
        );
    }
    println!("verdict: {}", if passed { "PASS" } else { "FAIL" });
}
