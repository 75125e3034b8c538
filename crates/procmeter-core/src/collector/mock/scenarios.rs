//! Pre-built mock `/proc` scenarios for testing.

use super::filesystem::MockFs;

/// Boot time written to `/proc/stat` by every scenario.
pub const BOOT_TIME: u64 = 1_700_000_000;

/// `MemTotal` written to `/proc/meminfo` by every scenario.
pub const MEM_TOTAL_KB: u64 = 4_096_000;

/// Description of one fake process, rendered into `/proc/[pid]/*` files.
#[derive(Debug, Clone)]
pub struct FakeProcess {
    pub pid: u32,
    pub ppid: u32,
    pub comm: String,
    pub state: char,
    /// Controlling terminal device number, 0 for none.
    pub tty_nr: i32,
    /// CPU times in clock ticks.
    pub utime: u64,
    pub stime: u64,
    pub cutime: u64,
    pub cstime: u64,
    pub nice: i32,
    pub threads: u32,
    /// Start time in clock ticks after boot.
    pub starttime: u64,
    pub processor: u32,
    /// `statm` fields in pages: size, resident, shared, text, data.
    pub statm: [u64; 5],
    pub syscr: u64,
    pub syscw: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub voluntary_ctxt_switches: u64,
    pub nonvoluntary_ctxt_switches: u64,
    pub uid: u32,
    pub gid: u32,
    pub cwd: String,
    pub exe: String,
    pub fds: usize,
}

impl Default for FakeProcess {
    fn default() -> Self {
        Self {
            pid: 1,
            ppid: 0,
            comm: "init".to_string(),
            state: 'S',
            tty_nr: 0,
            utime: 150,
            stime: 50,
            cutime: 0,
            cstime: 0,
            nice: 0,
            threads: 1,
            starttime: 100,
            processor: 0,
            statm: [2500, 300, 200, 50, 400],
            syscr: 10,
            syscw: 5,
            read_bytes: 4096,
            write_bytes: 8192,
            voluntary_ctxt_switches: 40,
            nonvoluntary_ctxt_switches: 3,
            uid: 1000,
            gid: 1000,
            cwd: "/home/user".to_string(),
            exe: "/usr/bin/init".to_string(),
            fds: 3,
        }
    }
}

impl FakeProcess {
    pub fn new(pid: u32, ppid: u32, comm: &str) -> Self {
        Self {
            pid,
            ppid,
            comm: comm.to_string(),
            exe: format!("/usr/bin/{}", comm),
            ..Self::default()
        }
    }

    fn stat_line(&self) -> String {
        format!(
            "{pid} ({comm}) {state} {ppid} {pid} {pid} {tty_nr} -1 4194304 100 0 0 0 {utime} {stime} {cutime} {cstime} 20 {nice} {threads} 0 {starttime} {vsize} {rss} 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 {processor} 0 0 0 0 0 0 0 0 0 0 0 0 0",
            pid = self.pid,
            comm = self.comm,
            state = self.state,
            ppid = self.ppid,
            tty_nr = self.tty_nr,
            utime = self.utime,
            stime = self.stime,
            cutime = self.cutime,
            cstime = self.cstime,
            nice = self.nice,
            threads = self.threads,
            starttime = self.starttime,
            vsize = self.statm[0] * 4096,
            rss = self.statm[1],
            processor = self.processor,
        )
    }

    fn status_text(&self) -> String {
        format!(
            "Name:\t{comm}\nState:\t{state}\nPid:\t{pid}\nPPid:\t{ppid}\n\
             Uid:\t{uid}\t{uid}\t{uid}\t{uid}\nGid:\t{gid}\t{gid}\t{gid}\t{gid}\n\
             VmSize:\t{vm_size} kB\nVmRSS:\t{vm_rss} kB\nThreads:\t{threads}\n\
             voluntary_ctxt_switches:\t{vcs}\nnonvoluntary_ctxt_switches:\t{nvcs}\n",
            comm = self.comm,
            state = self.state,
            pid = self.pid,
            ppid = self.ppid,
            uid = self.uid,
            gid = self.gid,
            vm_size = self.statm[0] * 4,
            vm_rss = self.statm[1] * 4,
            threads = self.threads,
            vcs = self.voluntary_ctxt_switches,
            nvcs = self.nonvoluntary_ctxt_switches,
        )
    }

    fn statm_line(&self) -> String {
        let [size, resident, shared, text, data] = self.statm;
        format!("{} {} {} {} 0 {} 0\n", size, resident, shared, text, data)
    }

    fn io_text(&self) -> String {
        format!(
            "rchar: {}\nwchar: {}\nsyscr: {}\nsyscw: {}\nread_bytes: {}\nwrite_bytes: {}\ncancelled_write_bytes: 0\n",
            self.read_bytes * 2,
            self.write_bytes * 2,
            self.syscr,
            self.syscw,
            self.read_bytes,
            self.write_bytes,
        )
    }
}

impl MockFs {
    /// Renders `process` into `/proc/[pid]/`.
    pub fn add_fake_process(&mut self, process: &FakeProcess) {
        let base = format!("/proc/{}", process.pid);
        self.add_dir(&base);
        self.add_file(format!("{}/stat", base), process.stat_line());
        self.add_file(format!("{}/status", base), process.status_text());
        self.add_file(format!("{}/statm", base), process.statm_line());
        self.add_file(format!("{}/io", base), process.io_text());
        self.add_file(format!("{}/comm", base), format!("{}\n", process.comm));
        self.add_link(format!("{}/cwd", base), process.cwd.as_str());
        self.add_link(format!("{}/exe", base), process.exe.as_str());
        self.add_dir(format!("{}/fd", base));
        for fd in 0..process.fds {
            self.add_link(format!("{}/fd/{}", base, fd), "/dev/null");
        }
    }

    /// Removes `/proc/[pid]` entirely, as if the process had been reaped.
    pub fn remove_process(&mut self, pid: u32) {
        self.remove_tree(format!("/proc/{}", pid));
    }

    /// Just the system-wide files, no processes.
    pub fn empty_system() -> Self {
        let mut fs = Self::new();
        fs.add_file(
            "/proc/stat",
            format!(
                "cpu  10000 500 3000 80000 1000 200 100 0 0 0\nctxt 500000\nbtime {}\nprocesses 10000\n",
                BOOT_TIME
            ),
        );
        fs.add_file("/proc/sys/kernel/hostname", "testhost\n");
        fs.add_file(
            "/proc/meminfo",
            format!("MemTotal:       {} kB\nMemFree:         1048576 kB\n", MEM_TOTAL_KB),
        );
        fs.add_file("/proc/uptime", "1000.00 3600.00\n");
        fs.add_file(
            "/etc/passwd",
            "root:x:0:0:root:/root:/bin/bash\nuser:x:1000:1000:User:/home/user:/bin/sh\n",
        );
        fs
    }

    /// A single process (PID 4242) under init.
    pub fn single_process() -> Self {
        let mut fs = Self::empty_system();
        fs.add_fake_process(&FakeProcess::default());
        fs.add_fake_process(&FakeProcess {
            threads: 4,
            fds: 5,
            ..FakeProcess::new(4242, 1, "worker")
        });
        fs
    }

    /// A launched command with descendants and unrelated neighbours.
    ///
    /// Tree: 1000 (make) -> {1002 (cc), 1001 (sh)}, 1002 -> 1003 (as).
    /// Unrelated: 1 (init), 500 (sshd), 999 (bash, parent of 1000).
    pub fn process_tree() -> Self {
        let mut fs = Self::empty_system();
        fs.add_fake_process(&FakeProcess::default());
        fs.add_fake_process(&FakeProcess::new(500, 1, "sshd"));
        fs.add_fake_process(&FakeProcess::new(999, 500, "bash"));
        fs.add_fake_process(&FakeProcess {
            starttime: 5000,
            ..FakeProcess::new(1000, 999, "make")
        });
        fs.add_fake_process(&FakeProcess {
            starttime: 5010,
            ..FakeProcess::new(1002, 1000, "cc")
        });
        fs.add_fake_process(&FakeProcess {
            starttime: 5020,
            ..FakeProcess::new(1001, 1000, "sh")
        });
        fs.add_fake_process(&FakeProcess {
            starttime: 5030,
            ..FakeProcess::new(1003, 1002, "as")
        });
        fs
    }

    /// `process_tree` where `/proc/1001/io` and `/proc/1001/cwd` are unreadable.
    pub fn with_denied_child() -> Self {
        let mut fs = Self::process_tree();
        fs.deny("/proc/1001/io");
        fs.deny("/proc/1001/cwd");
        fs
    }

    /// A zombie process (PID 4000) awaiting its parent's `wait`.
    pub fn with_zombie_process() -> Self {
        let mut fs = Self::empty_system();
        fs.add_fake_process(&FakeProcess::default());
        let zombie = FakeProcess {
            state: 'Z',
            threads: 1,
            statm: [0, 0, 0, 0, 0],
            ..FakeProcess::new(4000, 1, "defunct")
        };
        fs.add_fake_process(&zombie);
        fs.remove_tree("/proc/4000/cwd");
        fs.remove_tree("/proc/4000/exe");
        fs
    }
}
