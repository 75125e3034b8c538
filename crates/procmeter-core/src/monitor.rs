//! Run Loop: launch a command and sample its process tree until it exits.
//!
//! ```text
//! Starting ──► Sampling ──► Sleeping ──► Sampling ... ──► Draining ──► Stopped
//! ```
//!
//! Cycle 0 samples the root process alone, straight after launch. Every
//! following cycle samples the whole tree and then sleeps. The loop ends
//! once the root is gone or terminal (zombie/dead), or the running flag is
//! cleared; the root is then reaped.
//!
//! A cycle whose process table cannot be read is logged and skipped. When
//! the root's own state is unreadable, the child handle decides whether
//! it is still running.

use std::fmt;
use std::io::{self, Write};
use std::process::{Child, Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::collector::{CollectError, FileSystem, ProcFs};
use crate::sampler::{SampleOptions, SampleRecord, sample_pids, sample_tree};
use crate::writer::{MeasurementWriter, WriteError};

/// Granularity of the interruptible sleep.
const SLEEP_CHUNK: Duration = Duration::from_millis(100);

/// Run loop settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Pause between cycles.
    pub interval: Duration,
    /// Write the extended columns.
    pub extended_fields: bool,
    /// Per-process sampling time above which a warning is logged.
    pub slow_sample: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            extended_fields: false,
            slow_sample: Duration::from_secs(1),
        }
    }
}

impl MonitorConfig {
    fn sample_options(&self) -> SampleOptions {
        SampleOptions {
            extended_fields: self.extended_fields,
            slow_sample: self.slow_sample,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Starting,
    Sampling,
    Sleeping,
    Draining,
    Stopped,
}

/// Error type for fatal run failures.
#[derive(Debug)]
pub enum MonitorError {
    /// The command could not be started.
    Launch { command: String, source: io::Error },
    /// The output stream could not be opened.
    Output(io::Error),
    /// Writing measurements failed.
    Write(WriteError),
    /// Waiting for the command failed.
    Wait(io::Error),
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::Launch { command, source } => {
                write!(f, "failed to launch '{}': {}", command, source)
            }
            MonitorError::Output(e) => write!(f, "failed to open output: {}", e),
            MonitorError::Write(e) => write!(f, "failed to write measurements: {}", e),
            MonitorError::Wait(e) => write!(f, "failed to wait for command: {}", e),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Launch { source, .. } => Some(source),
            MonitorError::Output(e) | MonitorError::Wait(e) => Some(e),
            MonitorError::Write(e) => Some(e),
        }
    }
}

impl From<WriteError> for MonitorError {
    fn from(e: WriteError) -> Self {
        MonitorError::Write(e)
    }
}

/// Outcome of a completed run.
#[derive(Debug)]
pub struct RunSummary {
    /// PID the command ran as.
    pub pid: u32,
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Cycles sampled, including cycle 0.
    pub cycles: u64,
    /// Data rows written.
    pub rows: u64,
    /// The run was stopped through the running flag.
    pub interrupted: bool,
}

struct Progress {
    cycles: u64,
    rows: u64,
}

/// Drives one measured command from launch to exit.
pub struct Monitor<F: FileSystem> {
    procfs: ProcFs<F>,
    config: MonitorConfig,
    running: Arc<AtomicBool>,
    state: RunState,
}

impl<F: FileSystem> Monitor<F> {
    pub fn new(procfs: ProcFs<F>, config: MonitorConfig) -> Self {
        Self {
            procfs,
            config,
            running: Arc::new(AtomicBool::new(true)),
            state: RunState::Idle,
        }
    }

    /// Flag that keeps the loop going; store `false` to stop after the
    /// current cycle.
    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Launches `command`, opens the output with the command's PID, and
    /// samples until the command exits.
    ///
    /// On a fatal error after launch the command is killed and reaped.
    pub fn run<W, O>(&mut self, command: &[String], open_output: O) -> Result<RunSummary, MonitorError>
    where
        W: Write,
        O: FnOnce(u32) -> io::Result<W>,
    {
        self.transition(RunState::Starting);
        let mut child = launch(command)?;
        let pid = child.id();
        info!("Launched '{}' as pid {}", command.join(" "), pid);

        let result = match open_output(pid) {
            Ok(output) => self.sample_until_exit(&mut child, MeasurementWriter::new(output)),
            Err(e) => Err(MonitorError::Output(e)),
        };
        let progress = match result {
            Ok(progress) => progress,
            Err(e) => {
                abort(&mut child);
                self.transition(RunState::Stopped);
                return Err(e);
            }
        };

        self.transition(RunState::Draining);
        let interrupted = !self.is_running();
        if interrupted {
            info!("Interrupted, killing pid {}", pid);
            if let Err(e) = child.kill() {
                warn!("Failed to kill pid {}: {}", pid, e);
            }
        }
        let status = child.wait().map_err(MonitorError::Wait)?;
        self.transition(RunState::Stopped);
        info!(
            "pid {} exited with {} after {} cycles, {} rows",
            pid, status, progress.cycles, progress.rows
        );

        Ok(RunSummary {
            pid,
            status,
            cycles: progress.cycles,
            rows: progress.rows,
            interrupted,
        })
    }

    fn sample_until_exit<W: Write>(
        &mut self,
        child: &mut Child,
        mut writer: MeasurementWriter<W>,
    ) -> Result<Progress, MonitorError> {
        let options = self.config.sample_options();
        let pid = child.id();

        self.transition(RunState::Sampling);
        let mut cycle = 0;
        let mut rows = write_cycle(&mut writer, &sample_pids(&self.procfs, &[pid], cycle, &options))?;

        while self.is_running() && self.root_alive(child)? {
            cycle += 1;
            self.transition(RunState::Sampling);
            match sample_tree(&self.procfs, pid, cycle, &options) {
                Ok(records) => rows += write_cycle(&mut writer, &records)?,
                Err(e) => warn!("skipping cycle {}: {}", cycle, e),
            }

            self.transition(RunState::Sleeping);
            self.sleep(self.config.interval);
        }

        writer.into_inner()?;
        Ok(Progress {
            cycles: cycle + 1,
            rows,
        })
    }

    fn root_alive(&self, child: &mut Child) -> Result<bool, MonitorError> {
        let pid = child.id();
        match self.procfs.status(pid) {
            Ok(status) => {
                if status.is_terminal() {
                    debug!("pid {} is {}", pid, status.as_str());
                }
                Ok(!status.is_terminal())
            }
            Err(CollectError::ProcessGone(_)) => Ok(false),
            Err(e) => {
                warn!("state of pid {} unreadable: {}", pid, e);
                Ok(child.try_wait().map_err(MonitorError::Wait)?.is_none())
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sleeps for `interval` in small chunks, returning early once the
    /// running flag is cleared.
    fn sleep(&self, interval: Duration) {
        let mut remaining = interval;
        while remaining > Duration::ZERO && self.is_running() {
            let sleep_time = remaining.min(SLEEP_CHUNK);
            std::thread::sleep(sleep_time);
            remaining = remaining.saturating_sub(sleep_time);
        }
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            debug!("State {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

fn launch(command: &[String]) -> Result<Child, MonitorError> {
    let launch_error = |source| MonitorError::Launch {
        command: command.join(" "),
        source,
    };
    let (program, args) = command
        .split_first()
        .ok_or_else(|| launch_error(io::Error::new(io::ErrorKind::InvalidInput, "empty command")))?;
    Command::new(program).args(args).spawn().map_err(launch_error)
}

/// Writes one cycle and flushes it, so an interrupted run keeps whole cycles.
fn write_cycle<W: Write>(
    writer: &mut MeasurementWriter<W>,
    records: &[SampleRecord],
) -> Result<u64, MonitorError> {
    for record in records {
        writer.write_record(record)?;
    }
    writer.flush()?;
    Ok(records.len() as u64)
}

fn abort(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill pid {}: {}", child.id(), e);
    }
    if let Err(e) = child.wait() {
        warn!("Failed to reap pid {}: {}", child.id(), e);
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::collector::RealFs;
    use std::collections::BTreeMap;
    use std::fs::File;
    use std::os::unix::process::ExitStatusExt;
    use std::path::{Path, PathBuf};
    use std::time::Instant;

    fn monitor(interval_ms: u64) -> Monitor<RealFs> {
        let config = MonitorConfig {
            interval: Duration::from_millis(interval_ms),
            ..MonitorConfig::default()
        };
        Monitor::new(ProcFs::new(RealFs, "/proc"), config)
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn output_in(dir: &Path) -> impl FnOnce(u32) -> io::Result<File> + '_ {
        move |pid| File::create(dir.join(format!("{}.csv", pid)))
    }

    fn csv_path(dir: &Path, pid: u32) -> PathBuf {
        dir.join(format!("{}.csv", pid))
    }

    /// (cycle, pid) of every data row.
    fn rows(path: &Path) -> Vec<(u64, u32)> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        let headers = reader.headers().unwrap().clone();
        let cycle = headers.iter().position(|h| h == "Cycle").unwrap();
        let pid = headers.iter().position(|h| h == "PID").unwrap();
        reader
            .records()
            .map(|r| {
                let r = r.unwrap();
                assert_eq!(r.len(), headers.len());
                (r[cycle].parse().unwrap(), r[pid].parse().unwrap())
            })
            .collect()
    }

    #[test]
    fn test_short_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor(100);
        let summary = monitor.run(&sh("exit 3"), output_in(dir.path())).unwrap();

        assert_eq!(summary.status.code(), Some(3));
        assert!(!summary.interrupted);
        assert_eq!(monitor.state(), RunState::Stopped);

        let rows = rows(&csv_path(dir.path(), summary.pid));
        assert!(!rows.is_empty());
        assert_eq!(rows[0], (0, summary.pid));
        assert_eq!(rows.len() as u64, summary.rows);
    }

    #[test]
    fn test_children_appear_and_leave() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor(100);
        let summary = monitor
            .run(&sh("sleep 0.6 & sleep 0.6 & wait; exec sleep 0.5"), output_in(dir.path()))
            .unwrap();
        assert!(summary.status.success());

        let mut cycles: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
        for (cycle, pid) in rows(&csv_path(dir.path(), summary.pid)) {
            cycles.entry(cycle).or_default().push(pid);
        }

        assert_eq!(cycles[&0], vec![summary.pid]);
        for pids in cycles.values() {
            assert!(pids.windows(2).all(|w| w[0] < w[1]), "unsorted {:?}", pids);
            assert!(pids.contains(&summary.pid));
        }
        let with_children = cycles.iter().find(|(_, pids)| pids.len() == 3).map(|(c, _)| *c);
        let with_children = with_children.expect("no cycle with both children");
        assert!(
            cycles
                .range(with_children..)
                .any(|(_, pids)| pids == &vec![summary.pid])
        );
    }

    /// Real `/proc`, except that per-process `stat` files and the process
    /// table fail with an I/O error.
    struct FailingStatFs;

    impl FileSystem for FailingStatFs {
        fn read_to_string(&self, path: &Path) -> io::Result<String> {
            let in_pid_dir = path
                .parent()
                .and_then(|dir| dir.file_name())
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.parse::<u32>().is_ok());
            if in_pid_dir && path.ends_with("stat") {
                return Err(io::Error::other("stat unreadable"));
            }
            RealFs.read_to_string(path)
        }

        fn exists(&self, path: &Path) -> bool {
            RealFs.exists(path)
        }

        fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
            if path == Path::new("/proc") {
                return Err(io::Error::other("process table unreadable"));
            }
            RealFs.read_dir(path)
        }

        fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
            RealFs.read_link(path)
        }
    }

    #[test]
    fn test_unreadable_proc_does_not_abort_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = MonitorConfig {
            interval: Duration::from_millis(50),
            ..MonitorConfig::default()
        };
        let mut monitor = Monitor::new(ProcFs::new(FailingStatFs, "/proc"), config);

        let start = Instant::now();
        let summary = monitor.run(&sh("sleep 0.3"), output_in(dir.path())).unwrap();

        assert!(summary.status.success());
        assert!(!summary.interrupted);
        assert!(start.elapsed() < Duration::from_secs(10));
        // every tree cycle was skipped, cycle 0 still wrote the root
        assert!(summary.cycles >= 2);
        assert_eq!(summary.rows, 1);
        assert_eq!(rows(&csv_path(dir.path(), summary.pid)), vec![(0, summary.pid)]);
    }

    #[test]
    fn test_interrupt_kills_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor(100);
        let running = monitor.running();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            running.store(false, Ordering::SeqCst);
        });

        let start = Instant::now();
        let summary = monitor.run(&sh("sleep 30"), output_in(dir.path())).unwrap();
        stopper.join().unwrap();

        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(summary.interrupted);
        assert_eq!(summary.status.signal(), Some(9));
        assert!(summary.cycles >= 1);
    }

    #[test]
    fn test_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor(100);
        let command = vec!["/nonexistent/procmeter-test-binary".to_string()];

        match monitor.run(&command, output_in(dir.path())) {
            Err(MonitorError::Launch { command, .. }) => {
                assert_eq!(command, "/nonexistent/procmeter-test-binary")
            }
            other => panic!("expected launch error, got {:?}", other),
        }
        assert!(matches!(
            monitor.run(&[], output_in(dir.path())),
            Err(MonitorError::Launch { .. })
        ));
    }

    #[test]
    fn test_output_failure_reaps_command() {
        let mut monitor = monitor(100);
        let result = monitor.run(&sh("sleep 30"), |_| -> io::Result<File> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
        });
        assert!(matches!(result, Err(MonitorError::Output(_))));
        assert_eq!(monitor.state(), RunState::Stopped);
    }

    #[test]
    fn test_sleep_is_interruptible() {
        let monitor = monitor(100);
        monitor.running().store(false, Ordering::SeqCst);

        let start = Instant::now();
        monitor.sleep(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
