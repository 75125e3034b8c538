//! Per-process attribute provider over `/proc/[pid]/`.

use std::cell::{OnceCell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::accessor::{AttributeSource, Nested, Oneshot, Resolved};
use crate::collector::procfs::parser::{
    ParseError, ProcIo, ProcStat, ProcStatm, ProcStatus, parse_boot_time, parse_mem_total,
    parse_passwd, parse_proc_io, parse_proc_stat, parse_proc_statm, parse_proc_status,
    parse_stat_ppid, parse_uptime,
};
use crate::collector::traits::FileSystem;

/// Clock ticks per second (USER_HZ). Standard value for Linux.
const CLK_TCK: u64 = 100;

/// Page size used to convert `statm` pages to bytes.
const PAGE_SIZE: u64 = 4096;

/// Error type for collection failures.
#[derive(Debug)]
pub enum CollectError {
    /// Process disappeared during collection.
    ProcessGone(u32),
    /// The kernel refused the read (usually another user's process).
    AccessDenied(String),
    /// I/O error reading process files.
    Io(io::Error),
    /// Parse error in process files.
    Parse(String),
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::ProcessGone(pid) => write!(f, "process {} disappeared", pid),
            CollectError::AccessDenied(path) => write!(f, "access denied: {}", path),
            CollectError::Io(e) => write!(f, "I/O error: {}", e),
            CollectError::Parse(msg) => write!(f, "parse error: {}", msg),
        }
    }
}

impl std::error::Error for CollectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CollectError {
    fn from(e: io::Error) -> Self {
        CollectError::Io(e)
    }
}

impl From<ParseError> for CollectError {
    fn from(e: ParseError) -> Self {
        CollectError::Parse(e.message)
    }
}

/// Scheduler state of a process, from the state letter in `/proc/[pid]/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    TracingStop,
    Zombie,
    Dead,
    WakeKill,
    Waking,
    Parked,
    Idle,
    Unknown,
}

impl ProcessStatus {
    pub fn from_state(state: char) -> Self {
        match state {
            'R' => ProcessStatus::Running,
            'S' => ProcessStatus::Sleeping,
            'D' => ProcessStatus::DiskSleep,
            'T' => ProcessStatus::Stopped,
            't' => ProcessStatus::TracingStop,
            'Z' => ProcessStatus::Zombie,
            'X' | 'x' => ProcessStatus::Dead,
            'K' => ProcessStatus::WakeKill,
            'W' => ProcessStatus::Waking,
            'P' => ProcessStatus::Parked,
            'I' => ProcessStatus::Idle,
            _ => ProcessStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Sleeping => "sleeping",
            ProcessStatus::DiskSleep => "disk-sleep",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::TracingStop => "tracing-stop",
            ProcessStatus::Zombie => "zombie",
            ProcessStatus::Dead => "dead",
            ProcessStatus::WakeKill => "wake-kill",
            ProcessStatus::Waking => "waking",
            ProcessStatus::Parked => "parked",
            ProcessStatus::Idle => "idle",
            ProcessStatus::Unknown => "unknown",
        }
    }

    /// Terminated but not yet reaped.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Zombie | ProcessStatus::Dead)
    }
}

/// CPU time of a process at one observation.
#[derive(Debug, Clone, Copy)]
struct CpuMark {
    /// Tells a reused pid apart from the process seen before.
    starttime: u64,
    ticks: u64,
    uptime: f64,
}

/// Process-information provider backed by a proc filesystem.
pub struct ProcFs<F: FileSystem> {
    fs: F,
    proc_path: PathBuf,
    /// System boot time (seconds since epoch), used to calculate process start time.
    boot_time: Option<u64>,
    /// `MemTotal` in kB, the base of `memory_percent`.
    mem_total: Option<u64>,
    passwd_path: PathBuf,
    users: OnceCell<HashMap<u32, String>>,
    /// Last CPU observation per pid, the base of `cpu_percent`.
    cpu_marks: RefCell<HashMap<u32, CpuMark>>,
}

impl<F: FileSystem> ProcFs<F> {
    /// Creates a provider rooted at `proc_path` (usually "/proc").
    ///
    /// Boot time is read once from `{proc_path}/stat`; without it every
    /// `create_time` is unavailable.
    pub fn new(fs: F, proc_path: impl Into<PathBuf>) -> Self {
        let proc_path = proc_path.into();
        let boot_time = fs
            .read_to_string(&proc_path.join("stat"))
            .map_err(CollectError::from)
            .and_then(|content| parse_boot_time(&content).map_err(CollectError::from));
        let boot_time = match boot_time {
            Ok(bt) => Some(bt),
            Err(e) => {
                debug!("boot time unavailable: {}", e);
                None
            }
        };
        let mem_total = fs
            .read_to_string(&proc_path.join("meminfo"))
            .map_err(CollectError::from)
            .and_then(|content| parse_mem_total(&content).map_err(CollectError::from));
        let mem_total = match mem_total {
            Ok(kb) if kb > 0 => Some(kb),
            Ok(_) => None,
            Err(e) => {
                debug!("total memory unavailable: {}", e);
                None
            }
        };

        Self {
            fs,
            proc_path,
            boot_time,
            mem_total,
            passwd_path: PathBuf::from("/etc/passwd"),
            users: OnceCell::new(),
            cpu_marks: RefCell::new(HashMap::new()),
        }
    }

    /// Reads user names from `path` instead of `/etc/passwd`.
    pub fn with_passwd_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.passwd_path = path.into();
        self.users = OnceCell::new();
        self
    }

    pub fn boot_time(&self) -> Option<u64> {
        self.boot_time
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.proc_path.join(pid.to_string())
    }

    /// Classifies a failed read: `Ok(None)` when the file is simply absent
    /// for a process that still exists.
    fn classify<T>(
        &self,
        pid: u32,
        path: &Path,
        result: io::Result<T>,
    ) -> Result<Option<T>, CollectError> {
        let err = match result {
            Ok(value) => return Ok(Some(value)),
            Err(err) => err,
        };
        match err.kind() {
            io::ErrorKind::PermissionDenied => {
                Err(CollectError::AccessDenied(path.display().to_string()))
            }
            _ if !self.fs.exists(&self.pid_dir(pid)) => Err(CollectError::ProcessGone(pid)),
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(CollectError::Io(err)),
        }
    }

    /// Parses `/proc/[pid]/stat`; a process without one is gone.
    pub fn stat(&self, pid: u32) -> Result<ProcStat, CollectError> {
        let path = self.pid_dir(pid).join("stat");
        let content = self
            .classify(pid, &path, self.fs.read_to_string(&path))?
            .ok_or(CollectError::ProcessGone(pid))?;
        Ok(parse_proc_stat(&content)?)
    }

    pub fn status(&self, pid: u32) -> Result<ProcessStatus, CollectError> {
        self.stat(pid).map(|stat| ProcessStatus::from_state(stat.state))
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.stat(pid).is_ok()
    }

    /// Returns the children of `pid`, or with `recursive` all descendants,
    /// in breadth-first discovery order.
    ///
    /// Processes that disappear during the scan are silently skipped.
    pub fn children(&self, pid: u32, recursive: bool) -> Result<Vec<u32>, CollectError> {
        let entries = self.fs.read_dir(&self.proc_path)?;

        let mut by_parent: HashMap<u32, Vec<u32>> = HashMap::new();
        for entry in entries {
            let Some(child) = entry
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let Ok(content) = self.fs.read_to_string(&entry.join("stat")) else {
                continue;
            };
            match parse_stat_ppid(&content) {
                Ok(ppid) => by_parent.entry(ppid).or_default().push(child),
                Err(e) => debug!("skipping pid {}: {}", child, e),
            }
        }
        for kids in by_parent.values_mut() {
            kids.sort_unstable();
        }

        let mut found = Vec::new();
        let mut seen = HashSet::from([pid]);
        let mut queue = VecDeque::from([pid]);
        while let Some(parent) = queue.pop_front() {
            for &child in by_parent.get(&parent).into_iter().flatten() {
                if seen.insert(child) {
                    found.push(child);
                    if recursive {
                        queue.push_back(child);
                    }
                }
            }
        }

        Ok(found)
    }

    /// Host name from `{proc}/sys/kernel/hostname`.
    pub fn hostname(&self) -> Option<String> {
        self.fs
            .read_to_string(&self.proc_path.join("sys/kernel/hostname"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// User name for `uid`, or the uid itself when it has no passwd entry.
    fn username(&self, uid: u32) -> String {
        let users = self.users.get_or_init(|| match self.fs.read_to_string(&self.passwd_path) {
            Ok(content) => parse_passwd(&content),
            Err(e) => {
                debug!("user names unavailable from {}: {}", self.passwd_path.display(), e);
                HashMap::new()
            }
        });
        users.get(&uid).cloned().unwrap_or_else(|| uid.to_string())
    }

    fn uptime(&self) -> Option<f64> {
        let content = self.fs.read_to_string(&self.proc_path.join("uptime")).ok()?;
        parse_uptime(&content).ok()
    }

    /// CPU usage in percent of one CPU since the previous call for `pid`.
    ///
    /// `None` on the first observation of a process.
    fn cpu_percent(&self, pid: u32, stat: &ProcStat) -> Option<f64> {
        let now = CpuMark {
            starttime: stat.starttime,
            ticks: stat.utime + stat.stime,
            uptime: self.uptime()?,
        };
        let prev = self
            .cpu_marks
            .borrow_mut()
            .insert(pid, now)
            .filter(|prev| prev.starttime == now.starttime)?;

        let wall = now.uptime - prev.uptime;
        if wall <= 0.0 {
            return None;
        }
        Some(ticks_to_secs(now.ticks.saturating_sub(prev.ticks)) / wall * 100.0)
    }

    /// Drops CPU observations of processes not in `live`.
    pub fn retain_cpu_marks(&self, live: &[u32]) {
        self.cpu_marks
            .borrow_mut()
            .retain(|pid, _| live.binary_search(pid).is_ok());
    }

    /// A handle for reading attributes of `pid`.
    pub fn process(&self, pid: u32) -> ProcessHandle<'_, F> {
        ProcessHandle {
            procfs: self,
            pid,
            batch: RefCell::new(None),
        }
    }
}

/// One process as an [`AttributeSource`].
///
/// Inside a [`oneshot`](AttributeSource::oneshot) scope each of `stat`,
/// `status`, `statm` and `io` is read at most once.
pub struct ProcessHandle<'a, F: FileSystem> {
    procfs: &'a ProcFs<F>,
    pid: u32,
    batch: RefCell<Option<HashMap<&'static str, Option<String>>>>,
}

impl<F: FileSystem> ProcessHandle<'_, F> {
    fn path(&self, name: &str) -> PathBuf {
        self.procfs.pid_dir(self.pid).join(name)
    }

    fn read(&self, name: &'static str) -> Result<Option<String>, CollectError> {
        if let Some(cached) = self.batch.borrow().as_ref().and_then(|b| b.get(name)) {
            return Ok(cached.clone());
        }

        let path = self.path(name);
        let content = self
            .procfs
            .classify(self.pid, &path, self.procfs.fs.read_to_string(&path))?;

        if let Some(batch) = self.batch.borrow_mut().as_mut() {
            batch.insert(name, content.clone());
        }
        Ok(content)
    }

    fn read_link(&self, name: &str) -> Result<Option<String>, CollectError> {
        let path = self.path(name);
        let target = self
            .procfs
            .classify(self.pid, &path, self.procfs.fs.read_link(&path))?;
        Ok(target.map(|t| t.to_string_lossy().into_owned()))
    }

    fn stat(&self) -> Result<ProcStat, CollectError> {
        // no stat means no process
        let content = self.read("stat")?.ok_or(CollectError::ProcessGone(self.pid))?;
        Ok(parse_proc_stat(&content)?)
    }

    fn status(&self) -> Result<Option<ProcStatus>, CollectError> {
        Ok(self
            .read("status")?
            .map(|c| parse_proc_status(&c))
            .transpose()?)
    }

    fn statm(&self) -> Result<Option<ProcStatm>, CollectError> {
        Ok(self.read("statm")?.map(|c| parse_proc_statm(&c)).transpose()?)
    }

    fn io(&self) -> Result<Option<ProcIo>, CollectError> {
        Ok(self.read("io")?.map(|c| parse_proc_io(&c)).transpose()?)
    }

    fn num_fds(&self) -> Result<Option<u64>, CollectError> {
        let path = self.path("fd");
        let entries = self
            .procfs
            .classify(self.pid, &path, self.procfs.fs.read_dir(&path))?;
        Ok(entries.map(|e| e.len() as u64))
    }

    fn create_time(&self, stat: &ProcStat) -> Option<f64> {
        self.procfs
            .boot_time
            .map(|bt| bt as f64 + stat.starttime as f64 / CLK_TCK as f64)
    }
}

fn ticks_to_secs(ticks: u64) -> f64 {
    ticks as f64 / CLK_TCK as f64
}

/// Device path of a controlling terminal, from the `tty_nr` of `stat`.
fn terminal_name(tty_nr: i32) -> Option<String> {
    let dev = u32::try_from(tty_nr).ok().filter(|&dev| dev != 0)?;
    let major = (dev >> 8) & 0xfff;
    let minor = (dev & 0xff) | ((dev >> 12) & 0xfff00);
    match major {
        // unix98 pseudo terminals
        136..=143 => Some(format!("/dev/pts/{}", (major - 136) * 256 + minor)),
        4 if minor < 64 => Some(format!("/dev/tty{}", minor)),
        4 => Some(format!("/dev/ttyS{}", minor - 64)),
        5 if minor == 0 => Some("/dev/tty".to_string()),
        5 if minor == 1 => Some("/dev/console".to_string()),
        _ => None,
    }
}

impl<F: FileSystem> AttributeSource for ProcessHandle<'_, F> {
    fn resolve(&self, name: &str) -> Result<Option<Resolved>, CollectError> {
        let resolved: Option<Resolved> = match name {
            "pid" => Some(self.pid.into()),
            "ppid" => Some(self.stat()?.ppid.into()),
            "name" => Some(self.stat()?.comm.into()),
            "status" => Some(ProcessStatus::from_state(self.stat()?.state).as_str().into()),
            "create_time" => self.create_time(&self.stat()?).map(Resolved::from),
            "num_threads" => Some(self.stat()?.num_threads.into()),
            "nice" => Some(self.stat()?.nice.into()),
            "cpu_num" => self.stat()?.processor.map(Resolved::from),
            "terminal" => terminal_name(self.stat()?.tty_nr).map(Resolved::from),
            "cpu_percent" => self
                .procfs
                .cpu_percent(self.pid, &self.stat()?)
                .map(Resolved::from),
            "memory_percent" => match (self.statm()?, self.procfs.mem_total) {
                (Some(m), Some(total_kb)) => {
                    let rss = (m.resident * PAGE_SIZE) as f64;
                    Some((rss / (total_kb * 1024) as f64 * 100.0).into())
                }
                _ => None,
            },
            "username" => self
                .status()?
                .map(|s| self.procfs.username(s.uid).into()),
            "cpu_times" => {
                let s = self.stat()?;
                Some(
                    Nested::new()
                        .with("user", ticks_to_secs(s.utime))
                        .with("system", ticks_to_secs(s.stime))
                        .with("children_user", ticks_to_secs(s.cutime.max(0) as u64))
                        .with("children_system", ticks_to_secs(s.cstime.max(0) as u64))
                        .into(),
                )
            }
            "memory_info" => self.statm()?.map(|m| {
                Nested::new()
                    .with("rss", m.resident * PAGE_SIZE)
                    .with("vms", m.size * PAGE_SIZE)
                    .with("shared", m.shared * PAGE_SIZE)
                    .with("text", m.text * PAGE_SIZE)
                    .with("data", m.data * PAGE_SIZE)
                    .into()
            }),
            "io_counters" => self.io()?.map(|io| {
                Nested::new()
                    .with("read_count", io.syscr)
                    .with("write_count", io.syscw)
                    .with("read_bytes", io.read_bytes)
                    .with("write_bytes", io.write_bytes)
                    .with("read_chars", io.rchar)
                    .with("write_chars", io.wchar)
                    .into()
            }),
            "num_ctx_switches" => self.status()?.map(|s| {
                Nested::new()
                    .with_opt("voluntary", s.voluntary_ctxt_switches)
                    .with_opt("involuntary", s.nonvoluntary_ctxt_switches)
                    .into()
            }),
            "uids" => self.status()?.map(|s| {
                Nested::new()
                    .with("real", s.uid)
                    .with("effective", s.euid)
                    .into()
            }),
            "gids" => self.status()?.map(|s| {
                Nested::new()
                    .with("real", s.gid)
                    .with("effective", s.egid)
                    .into()
            }),
            "num_fds" => self.num_fds()?.map(Resolved::from),
            "cwd" => self.read_link("cwd")?.map(Resolved::from),
            "exe" => self.read_link("exe")?.map(Resolved::from),
            _ => None,
        };
        Ok(resolved)
    }

    fn oneshot(&self) -> Oneshot<'_> {
        let mut batch = self.batch.borrow_mut();
        if batch.is_some() {
            return Oneshot::noop();
        }
        *batch = Some(HashMap::new());
        drop(batch);

        Oneshot::new(move || {
            self.batch.borrow_mut().take();
        })
    }
}
