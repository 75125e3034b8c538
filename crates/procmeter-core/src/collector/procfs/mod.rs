//! Process-information provider over the Linux `/proc` filesystem.

pub mod parser;
pub mod process;
pub mod tree;

pub use process::{CollectError, ProcFs, ProcessHandle, ProcessStatus};
pub use tree::tree_pids;
