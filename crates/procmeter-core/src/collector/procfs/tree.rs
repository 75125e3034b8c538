//! Process tree enumeration: a root process plus its live descendants.

use crate::collector::procfs::process::{CollectError, ProcFs};
use crate::collector::traits::FileSystem;

/// Returns `root` and all of its current descendants, sorted by PID.
///
/// The root is always included, even if it already exited, so its final
/// state is still sampled.
pub fn tree_pids<F: FileSystem>(procfs: &ProcFs<F>, root: u32) -> Result<Vec<u32>, CollectError> {
    let mut pids = procfs.children(root, true)?;
    pids.push(root);
    pids.sort_unstable();
    pids.dedup();
    Ok(pids)
}
