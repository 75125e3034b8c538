//! Process-information collection from the Linux `/proc` filesystem.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                    ProcFs                     │
//! │  - children / status / boot time / hostname   │
//! │  - ProcessHandle: /proc/[pid]/* attributes    │
//! └───────────────────────┬──────────────────────┘
//!                         │
//!                  ┌──────▼──────┐
//!                  │  FileSystem │ (trait)
//!                  └──────┬──────┘
//!              ┌──────────┴──────────┐
//!       ┌──────▼──────┐        ┌──────▼──────┐
//!       │   RealFs    │        │   MockFs    │
//!       │ (Linux)     │        │ (Testing)   │
//!       └─────────────┘        └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use procmeter_core::accessor::{Accessor, Field, Value};
//! use procmeter_core::collector::{MockFs, ProcFs};
//!
//! let procfs = ProcFs::new(MockFs::single_process(), "/proc");
//! let handle = procfs.process(4242);
//! let mut accessor = Accessor::new(&handle);
//! assert_eq!(accessor.get("ppid").unwrap(), Field::Present(Value::Int(1)));
//! ```

pub mod mock;
pub mod procfs;
pub mod traits;

pub use mock::MockFs;
pub use procfs::{CollectError, ProcFs, ProcessHandle, ProcessStatus, tree_pids};
pub use traits::{FileSystem, RealFs};
