// Command-line front end for the TX <-> RX radio link test.
// Everything interesting lives in bremote_link_core; this file only wires
// flags to a LinkTestConfig and prints the report.

use bremote_link_core::channel::ChannelTarget;
use bremote_link_core::config::LinkTestConfig;
use bremote_link_core::loopback::{run_loopback_test, LoopbackProfile};
use bremote_link_core::orchestrator::{run_integration_test, IntegrationReport};
use bremote_link_core::{LinkError, TestResult};

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bremote-link", about = "Radio link test between a bremote TX and RX")]
struct Args {
    /// TX device: a tty path or tcp://host:port
    #[arg(long, required_unless_present = "simulate")]
    tx: Option<ChannelTarget>,

    /// RX device: a tty path or tcp://host:port
    #[arg(long, required_unless_present = "simulate")]
    rx: Option<ChannelTarget>,

    /// Test duration, e.g. "10s" or "1m"
    #[arg(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// TOML file with test settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against simulated devices instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Skip the per-device checks and run only the link test
    #[arg(long)]
    link_only: bool,

    /// Frame loss probability for --simulate
    #[arg(long, default_value_t = 0.0)]
    loss: f64,

    /// Print the report on a single line
    #[arg(long)]
    compact: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bremote_link=info,bremote_link_core=info"));

    // stdout carries the JSON report, logs go to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn build_config(args: &Args) -> Result<LinkTestConfig, LinkError> {
    let mut config = match &args.config {
        Some(path) => LinkTestConfig::load(path)?,
        None => LinkTestConfig::default(),
    };
    if let Some(duration) = args.duration {
        if duration.subsec_nanos() != 0 || duration.is_zero() {
            return Err(LinkError::Config(format!(
                "--duration must be a whole number of seconds, got {}",
                humantime::format_duration(duration)
            )));
        }
        config.duration_secs = duration.as_secs();
    }
    if args.link_only {
        config.device_checks = false;
    }
    if !(0.0..=1.0).contains(&args.loss) {
        return Err(LinkError::Config(format!("--loss must be within 0..=1, got {}", args.loss)));
    }
    config.validate()?;
    Ok(config)
}

fn print_report(report: &IntegrationReport, compact: bool) -> Result<(), serde_json::Error> {
    let envelope = serde_json::json!({
        "timestamp": chrono::Local::now().to_rfc3339(),
        "individual_tests": report.individual_tests,
        "radio_link_test": report.radio_link_test,
    });
    let text = if compact {
        serde_json::to_string(&envelope)?
    } else {
        serde_json::to_string_pretty(&envelope)?
    };
    println!("{}", text);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    let config = match build_config(&args) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("invalid configuration: {}", e);
            return ExitCode::from(2);
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, stopping the test early");
            ctrl_c.cancel();
        }
    });

    let report = match (args.simulate, &args.tx, &args.rx) {
        (true, _, _) => {
            let profile = LoopbackProfile { loss_rate: args.loss, ..Default::default() };
            run_loopback_test(config, profile, cancel).await
        }
        (false, Some(tx), Some(rx)) => run_integration_test(config, tx, rx, cancel).await,
        _ => {
            error!("--tx and --rx are required without --simulate");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = print_report(&report, args.compact) {
        error!("failed to serialize report: {}", e);
        return ExitCode::from(2);
    }

    match report.result() {
        TestResult::Pass => ExitCode::SUCCESS,
        TestResult::Fail => ExitCode::from(1),
        TestResult::Skip => ExitCode::from(2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["bremote-link", "--simulate"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_whole_second_durations() {
        let config = build_config(&args(&["--duration", "1m"])).unwrap();
        assert_eq!(config.duration_secs, 60);
        assert!(config.device_checks);
    }

    #[test]
    fn test_sub_second_duration_rejected() {
        assert!(matches!(build_config(&args(&["--duration", "500ms"])), Err(LinkError::Config(_))));
        assert!(matches!(build_config(&args(&["--duration", "1s 500ms"])), Err(LinkError::Config(_))));
        assert!(matches!(build_config(&args(&["--duration", "0s"])), Err(LinkError::Config(_))));
    }

    #[test]
    fn test_link_only_and_loss_flags() {
        assert!(!build_config(&args(&["--link-only"])).unwrap().device_checks);
        assert!(build_config(&args(&["--loss", "1.5"])).is_err());
    }

    #[test]
    fn test_targets_required_without_simulate() {
        assert!(Args::try_parse_from(["bremote-link", "--tx", "/dev/ttyUSB0"]).is_err());
        let parsed = Args::try_parse_from(["bremote-link", "--tx", "/dev/ttyUSB0", "--rx", "tcp://10.0.0.2:23"]).unwrap();
        assert_eq!(parsed.rx.unwrap().to_string(), "tcp://10.0.0.2:23");
    }
}
