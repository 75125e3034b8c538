//! Process Sampler: turns one process into one flat, ordered record.
//!
//! Fields come from a fixed registry of `(label, source)` pairs. Most
//! sources are dotted attribute paths read through an [`Accessor`]; the
//! timestamp, elapsed time and cycle number are computed by the sampler.
//!
//! [`sample_tree`] runs one cycle over the root process and its
//! descendants, isolating failures so one vanished process never costs
//! the rest of the cycle.

use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, trace, warn};

use crate::accessor::{Accessor, AttributeSource, Field, Value};
use crate::collector::procfs::tree::tree_pids;
use crate::collector::{CollectError, FileSystem, ProcFs};

/// Where a column's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    /// Sampling time, ISO-8601 with UTC offset.
    Timestamp,
    /// Seconds between sampling time and process creation.
    Elapsed,
    /// Process creation time, ISO-8601 with UTC offset.
    Created,
    /// Current cycle number.
    Cycle,
    /// Dotted attribute path on the process.
    Attr(&'static str),
}

/// One declared column.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub label: &'static str,
    pub source: FieldSource,
}

const fn attr(label: &'static str, path: &'static str) -> FieldSpec {
    FieldSpec {
        label,
        source: FieldSource::Attr(path),
    }
}

const fn computed(label: &'static str, source: FieldSource) -> FieldSpec {
    FieldSpec { label, source }
}

/// Columns written for every process, in output order.
pub const STANDARD_FIELDS: &[FieldSpec] = &[
    computed("Timestamp", FieldSource::Timestamp),
    attr("PID", "pid"),
    attr("PPID", "ppid"),
    attr("Image", "name"),
    computed("Elapsed", FieldSource::Elapsed),
    attr("System time", "cpu_times.system"),
    attr("User time", "cpu_times.user"),
    attr("Threads", "num_threads"),
    attr("Active memory", "memory_info.rss"),
    attr("Virtual memory", "memory_info.vms"),
    attr("Read operations", "io_counters.read_count"),
    attr("Read bytes", "io_counters.read_bytes"),
    attr("Write operations", "io_counters.write_count"),
    attr("Write bytes", "io_counters.write_bytes"),
    computed("Cycle", FieldSource::Cycle),
    attr("State", "status"),
    attr("File descriptors", "num_fds"),
    attr("Shared memory", "memory_info.shared"),
    attr("Voluntary context switches", "num_ctx_switches.voluntary"),
    attr("Involuntary context switches", "num_ctx_switches.involuntary"),
    attr("Current working directory", "cwd"),
];

/// Columns appended after [`STANDARD_FIELDS`] in extended mode.
pub const EXTENDED_FIELDS: &[FieldSpec] = &[
    attr("Executable", "exe"),
    attr("Nice", "nice"),
    attr("CPU number", "cpu_num"),
    attr("UID", "uids.real"),
    attr("Effective UID", "uids.effective"),
    attr("GID", "gids.real"),
    attr("Effective GID", "gids.effective"),
    attr("Children user time", "cpu_times.children_user"),
    attr("Children system time", "cpu_times.children_system"),
    attr("Handles", "num_handles"),
    computed("Created", FieldSource::Created),
    attr("Username", "username"),
    attr("Terminal", "terminal"),
    attr("Memory percent", "memory_percent"),
    attr("CPU percent", "cpu_percent"),
    attr("Text memory", "memory_info.text"),
    attr("Data memory", "memory_info.data"),
    attr("Read characters", "io_counters.read_chars"),
    attr("Write characters", "io_counters.write_chars"),
];

/// Labels of every column written, in order.
pub fn header(extended: bool) -> Vec<&'static str> {
    fields(extended).map(|spec| spec.label).collect()
}

fn fields(extended: bool) -> impl Iterator<Item = &'static FieldSpec> {
    let extra: &'static [FieldSpec] = if extended { EXTENDED_FIELDS } else { &[] };
    STANDARD_FIELDS.iter().chain(extra)
}

/// Options for one sampling pass.
#[derive(Debug, Clone)]
pub struct SampleOptions {
    /// Append [`EXTENDED_FIELDS`].
    pub extended_fields: bool,
    /// A single process taking longer than this to sample is logged.
    pub slow_sample: Duration,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            extended_fields: false,
            slow_sample: Duration::from_secs(1),
        }
    }
}

/// One row of metrics for one process at one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    fields: Vec<(&'static str, Field)>,
}

impl SampleRecord {
    /// Fields in column order.
    pub fn fields(&self) -> &[(&'static str, Field)] {
        &self.fields
    }

    pub fn get(&self, label: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|(name, _)| *name == label)
            .map(|(_, field)| field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Samples one process.
///
/// The batched-read scope is held for the whole call and the wall clock is
/// read once, so `Timestamp` and `Elapsed` agree. Unreadable fields become
/// sentinels; only errors unrelated to a single field (e.g. the process
/// exiting mid-sample) are returned.
pub fn sample_process(
    source: &dyn AttributeSource,
    cycle: u64,
    extended: bool,
) -> Result<SampleRecord, CollectError> {
    let _batch = source.oneshot();
    let now = Utc::now();
    let mut accessor = Accessor::new(source);

    let mut record = Vec::with_capacity(STANDARD_FIELDS.len() + EXTENDED_FIELDS.len());
    for spec in fields(extended) {
        let field = match spec.source {
            FieldSource::Timestamp => Field::Present(Value::Text(format_timestamp(&now))),
            FieldSource::Elapsed => elapsed(&mut accessor, &now)?,
            FieldSource::Created => created(&mut accessor)?,
            FieldSource::Cycle => Field::Present(cycle.into()),
            FieldSource::Attr(path) => accessor.get(path)?,
        };
        record.push((spec.label, field));
    }

    Ok(SampleRecord { fields: record })
}

fn format_timestamp(now: &DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// `create_time` as epoch seconds, or the field to write in its place.
fn create_time(accessor: &mut Accessor<'_>) -> Result<Result<f64, Field>, CollectError> {
    Ok(match accessor.get("create_time")? {
        Field::Present(Value::Float(t)) => Ok(t),
        Field::Present(Value::Int(t)) => Ok(t as f64),
        Field::Present(Value::Text(_)) => Err(Field::Unavailable),
        other => Err(other),
    })
}

fn elapsed(accessor: &mut Accessor<'_>, now: &DateTime<Utc>) -> Result<Field, CollectError> {
    let created = match create_time(accessor)? {
        Ok(t) => t,
        Err(field) => return Ok(field),
    };
    // same precision as the written timestamp
    let sampled = now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6;
    // clock skew between boot time and wall clock can put creation in the future
    Ok(Field::Present(Value::Float((sampled - created).max(0.0))))
}

fn created(accessor: &mut Accessor<'_>) -> Result<Field, CollectError> {
    let created = match create_time(accessor)? {
        Ok(t) => t,
        Err(field) => return Ok(field),
    };
    Ok(DateTime::from_timestamp_micros((created * 1e6).round() as i64)
        .map_or(Field::Unavailable, |t| {
            Field::Present(Value::Text(format_timestamp(&t)))
        }))
}

/// Samples each of `pids` in order, skipping processes that fail.
pub fn sample_pids<F: FileSystem>(
    procfs: &ProcFs<F>,
    pids: &[u32],
    cycle: u64,
    options: &SampleOptions,
) -> Vec<SampleRecord> {
    let mut records = Vec::with_capacity(pids.len());
    for &pid in pids {
        let handle = procfs.process(pid);
        let start = Instant::now();
        let result = sample_process(&handle, cycle, options.extended_fields);
        let took = start.elapsed();
        if took > options.slow_sample {
            warn!("sampling pid {} took {:?} (cycle {})", pid, took, cycle);
        } else {
            trace!("sampled pid {} in {:?}", pid, took);
        }

        match result {
            Ok(record) => records.push(record),
            Err(CollectError::ProcessGone(pid)) => {
                debug!("pid {} exited before it could be sampled", pid);
            }
            Err(e) => warn!("skipping pid {} in cycle {}: {}", pid, cycle, e),
        }
    }
    records
}

/// One tree-wide cycle: `root` and its live descendants, ascending by PID.
///
/// Fails only when the process table itself cannot be enumerated.
pub fn sample_tree<F: FileSystem>(
    procfs: &ProcFs<F>,
    root: u32,
    cycle: u64,
    options: &SampleOptions,
) -> Result<Vec<SampleRecord>, CollectError> {
    let pids = tree_pids(procfs, root)?;
    debug!("cycle {}: {} processes under {}", cycle, pids.len(), root);
    procfs.retain_cpu_marks(&pids);
    Ok(sample_pids(procfs, &pids, cycle, options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::{NOT_AVAILABLE, Nested, Resolved, TRANSIENT_ERROR};
    use crate::collector::mock::{BOOT_TIME, FakeProcess, MEM_TOTAL_KB, MockFs};
    use crate::collector::RealFs;

    fn int(record: &SampleRecord, label: &str) -> i64 {
        match record.get(label) {
            Some(Field::Present(Value::Int(v))) => *v,
            other => panic!("{}: expected int, got {:?}", label, other),
        }
    }

    fn float(record: &SampleRecord, label: &str) -> f64 {
        match record.get(label) {
            Some(Field::Present(Value::Float(v))) => *v,
            other => panic!("{}: expected float, got {:?}", label, other),
        }
    }

    fn text(record: &SampleRecord, label: &str) -> String {
        record
            .get(label)
            .map(|f| f.to_string())
            .unwrap_or_else(|| panic!("{}: missing", label))
    }

    #[test]
    fn test_standard_header_order() {
        assert_eq!(
            header(false),
            vec![
                "Timestamp",
                "PID",
                "PPID",
                "Image",
                "Elapsed",
                "System time",
                "User time",
                "Threads",
                "Active memory",
                "Virtual memory",
                "Read operations",
                "Read bytes",
                "Write operations",
                "Write bytes",
                "Cycle",
                "State",
                "File descriptors",
                "Shared memory",
                "Voluntary context switches",
                "Involuntary context switches",
                "Current working directory",
            ]
        );
        let extended = header(true);
        assert_eq!(extended.len(), STANDARD_FIELDS.len() + EXTENDED_FIELDS.len());
        assert_eq!(extended[21], "Executable");
        assert_eq!(extended[31], "Handles");
        assert_eq!(extended[32], "Created");
        assert_eq!(extended.last(), Some(&"Write characters"));
    }

    #[test]
    fn test_sample_process_values() {
        let procfs = ProcFs::new(MockFs::single_process(), "/proc");
        let record = sample_process(&procfs.process(4242), 3, false).unwrap();

        assert_eq!(record.len(), STANDARD_FIELDS.len());
        assert_eq!(int(&record, "PID"), 4242);
        assert_eq!(int(&record, "PPID"), 1);
        assert_eq!(text(&record, "Image"), "worker");
        assert_eq!(float(&record, "System time"), 0.5);
        assert_eq!(float(&record, "User time"), 1.5);
        assert_eq!(int(&record, "Threads"), 4);
        assert_eq!(int(&record, "Active memory"), 300 * 4096);
        assert_eq!(int(&record, "Virtual memory"), 2500 * 4096);
        assert_eq!(int(&record, "Read operations"), 10);
        assert_eq!(int(&record, "Read bytes"), 4096);
        assert_eq!(int(&record, "Write operations"), 5);
        assert_eq!(int(&record, "Write bytes"), 8192);
        assert_eq!(int(&record, "Cycle"), 3);
        assert_eq!(text(&record, "State"), "sleeping");
        assert_eq!(int(&record, "File descriptors"), 5);
        assert_eq!(int(&record, "Shared memory"), 200 * 4096);
        assert_eq!(int(&record, "Voluntary context switches"), 40);
        assert_eq!(int(&record, "Involuntary context switches"), 3);
        assert_eq!(text(&record, "Current working directory"), "/home/user");
    }

    #[test]
    fn test_elapsed_matches_timestamp() {
        let procfs = ProcFs::new(MockFs::single_process(), "/proc");
        let record = sample_process(&procfs.process(4242), 0, false).unwrap();

        let ts = DateTime::parse_from_rfc3339(&text(&record, "Timestamp")).unwrap();
        assert!(text(&record, "Timestamp").ends_with("+00:00"));
        let sampled = ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_micros()) / 1e6;
        let created = BOOT_TIME as f64 + 1.0;

        let elapsed = float(&record, "Elapsed");
        assert!(elapsed >= 0.0);
        assert!((elapsed - (sampled - created)).abs() < 1e-3);
    }

    #[test]
    fn test_elapsed_clamped_for_future_creation() {
        let source = Nested::new()
            .with("pid", 1u32)
            .with("create_time", 1e12f64);
        let record = sample_process(&source, 0, false).unwrap();
        assert_eq!(float(&record, "Elapsed"), 0.0);
    }

    #[test]
    fn test_elapsed_without_boot_time() {
        let mut fs = MockFs::single_process();
        fs.remove_tree("/proc/stat");
        let procfs = ProcFs::new(fs, "/proc");
        let record = sample_process(&procfs.process(4242), 0, false).unwrap();
        assert_eq!(record.get("Elapsed"), Some(&Field::Unavailable));
    }

    #[test]
    fn test_denied_fields_are_transient_errors() {
        let procfs = ProcFs::new(MockFs::with_denied_child(), "/proc");
        let records = sample_tree(&procfs, 1000, 1, &SampleOptions::default()).unwrap();
        assert_eq!(records.len(), 4);

        let denied = records.iter().find(|r| int(r, "PID") == 1001).unwrap();
        for label in ["Read operations", "Read bytes", "Write operations", "Write bytes"] {
            assert_eq!(text(denied, label), TRANSIENT_ERROR);
        }
        assert_eq!(text(denied, "Current working directory"), TRANSIENT_ERROR);
        assert_eq!(text(denied, "Image"), "sh");
        assert_eq!(int(denied, "Threads"), 1);

        for sibling in records.iter().filter(|r| int(r, "PID") != 1001) {
            assert_eq!(int(sibling, "Read operations"), 10);
            assert_eq!(text(sibling, "Current working directory"), "/home/user");
        }
    }

    #[test]
    fn test_missing_field_is_consistently_unavailable() {
        let procfs = ProcFs::new(MockFs::process_tree(), "/proc");
        let options = SampleOptions {
            extended_fields: true,
            ..SampleOptions::default()
        };
        for cycle in 1..=2 {
            let records = sample_tree(&procfs, 1000, cycle, &options).unwrap();
            for record in &records {
                assert_eq!(record.len(), header(true).len());
                assert_eq!(text(record, "Handles"), NOT_AVAILABLE);
                assert_eq!(text(record, "Executable"), format!("/usr/bin/{}", text(record, "Image")));
                assert_eq!(int(record, "UID"), 1000);
            }
        }
    }

    #[test]
    fn test_tree_rows_ascending() {
        let procfs = ProcFs::new(MockFs::process_tree(), "/proc");
        let records = sample_tree(&procfs, 1000, 2, &SampleOptions::default()).unwrap();

        let pids: Vec<i64> = records.iter().map(|r| int(r, "PID")).collect();
        assert_eq!(pids, vec![1000, 1001, 1002, 1003]);
        assert!(records.iter().all(|r| int(r, "Cycle") == 2));
    }

    #[test]
    fn test_vanished_process_is_skipped() {
        let procfs = ProcFs::new(MockFs::process_tree(), "/proc");
        let records = sample_pids(&procfs, &[1000, 31337, 1001], 1, &SampleOptions::default());

        let pids: Vec<i64> = records.iter().map(|r| int(r, "PID")).collect();
        assert_eq!(pids, vec![1000, 1001]);
    }

    #[test]
    fn test_corrupt_stat_is_isolated() {
        let mut fs = MockFs::process_tree();
        fs.add_file("/proc/1002/stat", "garbage");
        let procfs = ProcFs::new(fs, "/proc");

        let records = sample_pids(&procfs, &[1000, 1002, 1003], 1, &SampleOptions::default());
        let pids: Vec<i64> = records.iter().map(|r| int(r, "PID")).collect();
        assert_eq!(pids, vec![1000, 1002, 1003]);

        let corrupt = &records[1];
        assert_eq!(corrupt.len(), STANDARD_FIELDS.len());
        for label in ["PPID", "Image", "Elapsed", "User time", "Threads", "State"] {
            assert_eq!(text(corrupt, label), NOT_AVAILABLE, "column {}", label);
        }
        // files other than stat still read fine
        assert_eq!(int(corrupt, "Active memory"), 300 * 4096);
        assert_eq!(int(corrupt, "Read operations"), 10);
        assert_eq!(text(&records[2], "Image"), "as");
    }

    #[test]
    fn test_unparsable_io_keeps_the_row() {
        let mut fs = MockFs::single_process();
        fs.add_file("/proc/4242/io", "rchar: lots\n");
        let procfs = ProcFs::new(fs, "/proc");
        let options = SampleOptions {
            extended_fields: true,
            ..SampleOptions::default()
        };

        let records = sample_pids(&procfs, &[4242], 1, &options);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.len(), header(true).len());
        for label in [
            "Read operations",
            "Read bytes",
            "Write operations",
            "Write bytes",
            "Read characters",
            "Write characters",
        ] {
            assert_eq!(text(record, label), NOT_AVAILABLE, "column {}", label);
        }
        assert_eq!(int(record, "PID"), 4242);
        assert_eq!(int(record, "Threads"), 4);
        assert_eq!(int(record, "File descriptors"), 5);
    }

    fn extended_sample(fs: MockFs, pid: u32) -> SampleRecord {
        let procfs = ProcFs::new(fs, "/proc");
        sample_process(&procfs.process(pid), 0, true).unwrap()
    }

    #[test]
    fn test_extended_columns() {
        let record = extended_sample(MockFs::single_process(), 4242);

        assert_eq!(text(&record, "Username"), "user");
        assert_eq!(text(&record, "Terminal"), NOT_AVAILABLE);
        let rss = (300 * 4096) as f64;
        let expected = rss / (MEM_TOTAL_KB * 1024) as f64 * 100.0;
        assert!((float(&record, "Memory percent") - expected).abs() < 1e-9);
        // no earlier observation to compare with
        assert_eq!(text(&record, "CPU percent"), NOT_AVAILABLE);
        assert_eq!(int(&record, "Text memory"), 50 * 4096);
        assert_eq!(int(&record, "Data memory"), 400 * 4096);
        assert_eq!(int(&record, "Read characters"), 8192);
        assert_eq!(int(&record, "Write characters"), 16384);
    }

    #[test]
    fn test_created_column() {
        let record = extended_sample(MockFs::single_process(), 4242);

        let created = DateTime::parse_from_rfc3339(&text(&record, "Created")).unwrap();
        assert_eq!(created.timestamp(), BOOT_TIME as i64 + 1);
        assert!(text(&record, "Created").ends_with("+00:00"));

        let mut fs = MockFs::single_process();
        fs.remove_tree("/proc/stat");
        assert_eq!(text(&extended_sample(fs, 4242), "Created"), NOT_AVAILABLE);
    }

    #[test]
    fn test_terminal_column() {
        let mut fs = MockFs::single_process();
        fs.add_fake_process(&FakeProcess {
            // major 136, minor 3
            tty_nr: (136 << 8) | 3,
            ..FakeProcess::new(4300, 1, "vim")
        });
        fs.add_fake_process(&FakeProcess {
            tty_nr: (4 << 8) | 1,
            ..FakeProcess::new(4301, 1, "getty")
        });
        let procfs = ProcFs::new(fs, "/proc");

        let pts = sample_process(&procfs.process(4300), 0, true).unwrap();
        assert_eq!(text(&pts, "Terminal"), "/dev/pts/3");
        let console = sample_process(&procfs.process(4301), 0, true).unwrap();
        assert_eq!(text(&console, "Terminal"), "/dev/tty1");
    }

    #[test]
    fn test_unknown_uid_falls_back_to_number() {
        let mut fs = MockFs::single_process();
        fs.add_fake_process(&FakeProcess {
            uid: 4711,
            ..FakeProcess::new(4302, 1, "daemon")
        });
        assert_eq!(text(&extended_sample(fs, 4302), "Username"), "4711");
    }

    fn write_proc(dir: &std::path::Path, utime: u64, uptime: f64) {
        std::fs::write(dir.join("stat"), format!("btime {}\n", BOOT_TIME)).unwrap();
        std::fs::write(dir.join("uptime"), format!("{:.2} 0.00\n", uptime)).unwrap();
        std::fs::create_dir_all(dir.join("77")).unwrap();
        std::fs::write(
            dir.join("77/stat"),
            format!("77 (spin) R 1 77 77 0 -1 0 0 0 0 0 {} 0 0 0 20 0 1 0 500 0 0", utime),
        )
        .unwrap();
    }

    #[test]
    fn test_cpu_percent_between_cycles() {
        let dir = tempfile::tempdir().unwrap();
        write_proc(dir.path(), 100, 50.0);
        let procfs = ProcFs::new(RealFs, dir.path());
        let options = SampleOptions {
            extended_fields: true,
            ..SampleOptions::default()
        };

        let first = sample_tree(&procfs, 77, 1, &options).unwrap();
        assert_eq!(text(&first[0], "CPU percent"), NOT_AVAILABLE);

        // 1.5 s of CPU over 2 s of wall time
        write_proc(dir.path(), 250, 52.0);
        let second = sample_tree(&procfs, 77, 2, &options).unwrap();
        assert!((float(&second[0], "CPU percent") - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_stat_read_once_per_sample() {
        let fs = MockFs::single_process();
        let observer = fs.clone();
        let procfs = ProcFs::new(fs, "/proc");

        sample_process(&procfs.process(4242), 0, true).unwrap();
        assert_eq!(observer.read_count("/proc/4242/stat"), 1);
        assert_eq!(observer.read_count("/proc/4242/status"), 1);
        assert_eq!(observer.read_count("/proc/4242/io"), 1);
    }

    #[test]
    fn test_zombie_row() {
        let procfs = ProcFs::new(MockFs::with_zombie_process(), "/proc");
        let record = sample_process(&procfs.process(4000), 5, false).unwrap();

        assert_eq!(text(&record, "State"), "zombie");
        assert_eq!(int(&record, "Active memory"), 0);
        assert_eq!(text(&record, "Current working directory"), NOT_AVAILABLE);
    }

    #[test]
    fn test_generic_source_without_fields() {
        let source = Nested::new().with("pid", Resolved::from(7u32));
        let record = sample_process(&source, 0, false).unwrap();

        assert_eq!(int(&record, "PID"), 7);
        assert_eq!(record.get("Elapsed"), Some(&Field::Unavailable));
        assert_eq!(text(&record, "Active memory"), NOT_AVAILABLE);
        assert_eq!(int(&record, "Cycle"), 0);
    }
}
