//! procmeter-core - resource usage recording for a command and its process tree.
//!
//! Provides:
//! - `collector` - process information from the Linux `/proc` filesystem
//! - `accessor` - fault-tolerant, memoizing attribute access over a process
//! - `sampler` - declared columns and per-process / per-cycle sampling
//! - `writer` - streaming CSV output with a header pinned by the first row
//! - `monitor` - the launch, sample, sleep and reap run loop
//! - `util` - output filename templates

pub mod accessor;
pub mod collector;
pub mod monitor;
pub mod sampler;
pub mod util;
pub mod writer;
