//! Mock filesystem and `/proc` fixtures for tests.

mod filesystem;
mod scenarios;

pub use filesystem::MockFs;
pub use scenarios::{BOOT_TIME, FakeProcess, MEM_TOTAL_KB};
