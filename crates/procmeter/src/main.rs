//! procmeter - records the resource usage of a command and its descendants.
//!
//! Launches the command, samples it and every live descendant once per
//! cycle from /proc, and writes one CSV row per process per cycle.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::fs::File;
use std::process::{ExitCode, ExitStatus};
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use procmeter_core::collector::{ProcFs, RealFs};
use procmeter_core::monitor::{Monitor, MonitorConfig};
use procmeter_core::util::{DEFAULT_TEMPLATE, expand_template};

/// Records the resource usage of a command and its descendants.
#[derive(Parser, Debug)]
#[command(name = "procmeter", about = "Process tree resource usage recorder", version)]
struct Args {
    /// Output file name template. Placeholders: {timestamp}, {hostname}, {pid}.
    #[arg(short, long, env = "PROCMETER_MEASUREMENTS", default_value = DEFAULT_TEMPLATE)]
    measurements: String,

    /// Seconds to wait between sampling cycles.
    #[arg(
        short,
        long,
        env = "PROCMETER_INTERVAL",
        default_value = "1.0",
        value_parser = parse_interval
    )]
    seconds_between_cycles: Duration,

    /// Also record executable, nice, CPU number, ids and children CPU times.
    #[arg(short = 'x', long)]
    extended: bool,

    /// Warn when sampling a single process takes longer than this (milliseconds).
    #[arg(long, default_value = "1000")]
    slow_sample_ms: u64,

    /// Path to /proc filesystem.
    #[arg(long, default_value = "/proc")]
    proc_path: String,

    /// Increase logging verbosity (-v info, -vv debug, -vvv trace). Default is warn level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,

    /// Command to run, followed by its arguments.
    #[arg(
        required = true,
        trailing_var_arg = true,
        value_name = "COMMAND"
    )]
    command: Vec<String>,
}

/// Parses a non-negative, finite number of seconds.
fn parse_interval(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|e| format!("invalid interval '{}': {}", s, e))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("interval must be a non-negative number of seconds, got '{}'", s));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid interval '{}': {}", s, e))
}

/// Initializes the tracing subscriber on stderr.
/// Default level is WARN so the command's own output stays readable.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Exit code mirroring the command: its own code, or 128 + signal.
fn exit_code(status: ExitStatus) -> u8 {
    if let Some(code) = status.code() {
        return u8::try_from(code & 0xff).unwrap_or(1);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return u8::try_from(128 + signal).unwrap_or(1);
        }
    }
    1
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let procfs = ProcFs::new(RealFs, &args.proc_path);
    let hostname = procfs.hostname().unwrap_or_else(|| {
        warn!("Hostname unavailable from {}, using 'localhost'", args.proc_path);
        "localhost".to_string()
    });

    let config = MonitorConfig {
        interval: args.seconds_between_cycles,
        extended_fields: args.extended,
        slow_sample: Duration::from_millis(args.slow_sample_ms),
    };
    let mut monitor = Monitor::new(procfs, config);

    // Setup graceful shutdown
    let running = monitor.running();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let started = Utc::now();
    let template = args.measurements.as_str();
    let result = monitor.run(&args.command, |pid| {
        let path = expand_template(template, started, &hostname, pid);
        info!("Writing measurements to {}", path);
        File::create(&path)
    });

    match result {
        Ok(summary) => {
            if summary.interrupted {
                warn!("Measurement interrupted after {} cycles", summary.cycles);
            }
            ExitCode::from(exit_code(summary.status))
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("procmeter").chain(args.iter().copied()))
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("1.0"), Ok(Duration::from_secs(1)));
        assert_eq!(parse_interval("0.25"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_interval("0"), Ok(Duration::ZERO));
        assert!(parse_interval("-1").is_err());
        assert!(parse_interval("inf").is_err());
        assert!(parse_interval("NaN").is_err());
        assert!(parse_interval("soon").is_err());
    }

    #[test]
    fn test_trailing_command_keeps_its_flags() {
        let args = parse(&["-s", "0.1", "-x", "make", "-j", "8", "--keep-going"]).unwrap();
        assert_eq!(args.seconds_between_cycles, Duration::from_millis(100));
        assert!(args.extended);
        assert_eq!(args.command, ["make", "-j", "8", "--keep-going"]);
    }

    #[test]
    fn test_double_dash_separator() {
        let args = parse(&["-m", "out.csv", "--", "ls", "-l"]).unwrap();
        assert_eq!(args.measurements, "out.csv");
        assert_eq!(args.command, ["ls", "-l"]);
    }

    #[test]
    fn test_missing_command_is_usage_error() {
        let err = parse(&["-s", "0.5"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_negative_interval_rejected() {
        let err = parse(&["-s=-2", "true"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn test_attached_option_values_before_command() {
        let args = parse(&["-s=0.5", "-m=run.csv", "true"]).unwrap();
        assert_eq!(args.seconds_between_cycles, Duration::from_millis(500));
        assert_eq!(args.measurements, "run.csv");
        assert_eq!(args.command, ["true"]);

        let args = parse(&["-x", "-s=0.5", "sh", "-c", "exit 1"]).unwrap();
        assert!(args.extended);
        assert_eq!(args.seconds_between_cycles, Duration::from_millis(500));
        assert_eq!(args.command, ["sh", "-c", "exit 1"]);
    }

    #[test]
    fn test_verbosity_flags() {
        let args = parse(&["-vv", "-q", "true"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert!(args.quiet);
        assert_eq!(args.proc_path, "/proc");
        assert_eq!(args.slow_sample_ms, 1000);
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_mapping() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        // killed by SIGKILL
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
        assert_eq!(exit_code(ExitStatus::from_raw(15)), 143);
    }
}
