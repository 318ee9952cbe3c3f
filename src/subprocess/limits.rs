//! Address-space limit (§5 resource policy `asLimit`), applied in the
//! child before `exec` to bound the target's memory footprint.

use nix::sys::resource::{setrlimit, Resource};

/// Apply an `RLIMIT_AS` of `mib` mebibytes to the current (child) process.
/// Best-effort: a failure here is not fatal, it just leaves the target
/// unconstrained, matching the original's tolerance for platforms where
/// the limit can't be set.
pub fn apply_address_space_limit(mib: u64) {
    let bytes = mib.saturating_mul(1024 * 1024);
    let _ = setrlimit(Resource::RLIMIT_AS, bytes, bytes);
}
