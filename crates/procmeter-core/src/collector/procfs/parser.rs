//! Pure parsers for the `/proc` files a process sample is built from.

use std::collections::HashMap;
use std::str::FromStr;

/// Error type for parsing failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// The fields of `/proc/[pid]/stat` the provider reads.
#[derive(Debug, Clone, Default)]
pub struct ProcStat {
    pub pid: u32,
    pub comm: String,
    pub state: char,
    pub ppid: u32,
    /// Controlling terminal device number, 0 for none.
    pub tty_nr: i32,
    /// CPU times in clock ticks.
    pub utime: u64,
    pub stime: u64,
    pub cutime: i64,
    pub cstime: i64,
    pub nice: i32,
    pub num_threads: u32,
    /// Clock ticks after boot.
    pub starttime: u64,
    /// CPU last executed on; `None` on kernels that do not report it.
    pub processor: Option<u32>,
}

/// Splits a stat line into pid, comm and the fields after comm (`state` is index 0).
///
/// comm may contain spaces and parentheses, so it spans from the first '('
/// to the last ')'.
fn split_stat(content: &str) -> Result<(&str, &str, Vec<&str>), ParseError> {
    let content = content.trim();
    let (open, close) = match (content.find('('), content.rfind(')')) {
        (Some(open), Some(close)) if open < close => (open, close),
        _ => return Err(ParseError::new("malformed comm in stat")),
    };
    Ok((
        content[..open].trim(),
        &content[open + 1..close],
        content[close + 1..].split_whitespace().collect(),
    ))
}

fn stat_field<T: FromStr>(fields: &[&str], idx: usize, name: &str) -> Result<T, ParseError> {
    let raw = fields
        .get(idx)
        .ok_or_else(|| ParseError::new(format!("missing field {}", name)))?;
    raw.parse()
        .map_err(|_| ParseError::new(format!("invalid {} '{}'", name, raw)))
}

/// Parses `/proc/[pid]/stat` content.
pub fn parse_proc_stat(content: &str) -> Result<ProcStat, ParseError> {
    let (pid, comm, fields) = split_stat(content)?;
    if fields.len() < 20 {
        return Err(ParseError::new(format!(
            "not enough fields in stat: expected 20+, got {}",
            fields.len()
        )));
    }

    Ok(ProcStat {
        pid: pid.parse().map_err(|_| ParseError::new("invalid pid"))?,
        comm: comm.to_string(),
        state: fields[0].chars().next().unwrap_or('?'),
        ppid: stat_field(&fields, 1, "ppid")?,
        tty_nr: stat_field(&fields, 4, "tty_nr")?,
        utime: stat_field(&fields, 11, "utime")?,
        stime: stat_field(&fields, 12, "stime")?,
        cutime: stat_field(&fields, 13, "cutime")?,
        cstime: stat_field(&fields, 14, "cstime")?,
        nice: stat_field(&fields, 16, "nice")?,
        num_threads: stat_field(&fields, 17, "num_threads")?,
        starttime: stat_field(&fields, 19, "starttime")?,
        processor: stat_field(&fields, 36, "processor").ok(),
    })
}

/// Reads only the PPID out of `/proc/[pid]/stat`.
///
/// Used when scanning every process for the tree, where the full parse is wasted.
pub fn parse_stat_ppid(content: &str) -> Result<u32, ParseError> {
    let close = content
        .rfind(')')
        .ok_or_else(|| ParseError::new("malformed comm in stat"))?;
    let fields: Vec<&str> = content[close + 1..].split_whitespace().take(2).collect();
    stat_field(&fields, 1, "ppid")
}

/// Real and effective ids plus context switches from `/proc/[pid]/status`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcStatus {
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
    /// `None` on kernels that do not report context switches.
    pub voluntary_ctxt_switches: Option<u64>,
    pub nonvoluntary_ctxt_switches: Option<u64>,
}

/// Parses `/proc/[pid]/status` content (`Key:\tvalue` lines).
pub fn parse_proc_status(content: &str) -> Result<ProcStatus, ParseError> {
    let mut status = ProcStatus::default();
    let mut seen = false;

    for (key, value) in content.lines().filter_map(|line| line.split_once(':')) {
        seen = true;
        let value = value.trim();
        match key.trim() {
            // real effective saved fs
            "Uid" => (status.uid, status.euid) = real_effective(value),
            "Gid" => (status.gid, status.egid) = real_effective(value),
            "voluntary_ctxt_switches" => status.voluntary_ctxt_switches = value.parse().ok(),
            "nonvoluntary_ctxt_switches" => {
                status.nonvoluntary_ctxt_switches = value.parse().ok()
            }
            _ => {}
        }
    }

    if !seen {
        return Err(ParseError::new("empty status"));
    }
    Ok(status)
}

fn real_effective(value: &str) -> (u32, u32) {
    let mut ids = value.split_whitespace().map(|id| id.parse().unwrap_or(0));
    let real = ids.next().unwrap_or(0);
    (real, ids.next().unwrap_or(real))
}

/// Parsed data from `/proc/[pid]/statm`, in pages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcStatm {
    pub size: u64,
    pub resident: u64,
    pub shared: u64,
    pub text: u64,
    pub data: u64,
}

/// Parses `/proc/[pid]/statm` content.
///
/// Format: size resident shared text lib data dt
pub fn parse_proc_statm(content: &str) -> Result<ProcStatm, ParseError> {
    let fields: Vec<u64> = content
        .split_whitespace()
        .map(|s| {
            s.parse()
                .map_err(|_| ParseError::new(format!("invalid statm field '{}'", s)))
        })
        .collect::<Result<_, _>>()?;

    if fields.len() < 6 {
        return Err(ParseError::new(format!(
            "not enough fields in statm: expected 6+, got {}",
            fields.len()
        )));
    }

    Ok(ProcStatm {
        size: fields[0],
        resident: fields[1],
        shared: fields[2],
        text: fields[3],
        data: fields[5],
    })
}

/// I/O counters from `/proc/[pid]/io`.
#[derive(Debug, Clone, Default)]
pub struct ProcIo {
    /// Bytes passed to read()/write(), cache hits included.
    pub rchar: u64,
    pub wchar: u64,
    /// read()/write() syscalls.
    pub syscr: u64,
    pub syscw: u64,
    /// Bytes that actually reached the storage layer.
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Parses `/proc/[pid]/io` content (`key: value` lines).
pub fn parse_proc_io(content: &str) -> Result<ProcIo, ParseError> {
    let mut io = ProcIo::default();

    for (key, value) in content.lines().filter_map(|line| line.split_once(':')) {
        let slot = match key.trim() {
            "rchar" => &mut io.rchar,
            "wchar" => &mut io.wchar,
            "syscr" => &mut io.syscr,
            "syscw" => &mut io.syscw,
            "read_bytes" => &mut io.read_bytes,
            "write_bytes" => &mut io.write_bytes,
            _ => continue,
        };
        let value = value.trim();
        *slot = value
            .parse()
            .map_err(|_| ParseError::new(format!("invalid io counter {} '{}'", key, value)))?;
    }

    Ok(io)
}

/// Extracts `btime` (boot time, seconds since epoch) from `/proc/stat`.
pub fn parse_boot_time(content: &str) -> Result<u64, ParseError> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("btime "))
        .ok_or_else(|| ParseError::new("missing btime in stat"))?
        .trim()
        .parse()
        .map_err(|_| ParseError::new("invalid btime"))
}

/// Extracts `MemTotal` (kB) from `/proc/meminfo`.
pub fn parse_mem_total(content: &str) -> Result<u64, ParseError> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|value| value.split_whitespace().next())
        .ok_or_else(|| ParseError::new("missing MemTotal in meminfo"))?
        .parse()
        .map_err(|_| ParseError::new("invalid MemTotal"))
}

/// Seconds since boot, the first field of `/proc/uptime`.
pub fn parse_uptime(content: &str) -> Result<f64, ParseError> {
    content
        .split_whitespace()
        .next()
        .ok_or_else(|| ParseError::new("empty uptime"))?
        .parse()
        .map_err(|_| ParseError::new("invalid uptime"))
}

/// Maps uid to user name from `/etc/passwd` content.
///
/// Malformed lines are skipped; the first entry for a uid wins.
pub fn parse_passwd(content: &str) -> HashMap<u32, String> {
    let mut users = HashMap::new();
    for line in content.lines().filter(|l| !l.starts_with('#')) {
        let mut parts = line.split(':');
        let (Some(name), Some(_), Some(uid)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        if let Ok(uid) = uid.parse() {
            users.entry(uid).or_insert_with(|| name.to_string());
        }
    }
    users
}
