//! Sanitizer-coverage accounting (§3 `SancovState`, `MemMap`).
//!
//! The child process, compiled with `-fsanitize-coverage=trace-pc-guard` (or
//! similar), writes one bitmap file per DSO into the work directory on exit.
//! The parent scrapes those files and folds them into a trie keyed by module
//! name, protected by a single mutex (updates happen once per iteration, not
//! per program point, so contention is a non-issue).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// A mapped region of the target's address space, used to attribute
/// basic-block hits to the DSO that owns them.
#[derive(Debug, Clone)]
pub struct MemMap {
    pub start: u64,
    pub end: u64,
    pub base: u64,
    pub module_name: String,
    pub bb_cnt: u64,
    pub new_bb_cnt: u64,
}

/// One DSO's leaf in the [`SancovState`] trie: a bitmap of basic-block
/// indices observed hit at least once.
#[derive(Debug, Default, Clone)]
struct DsoBitmap {
    hit: Vec<bool>,
}

impl DsoBitmap {
    fn mark(&mut self, index: usize) -> bool {
        if index >= self.hit.len() {
            self.hit.resize(index + 1, false);
        }
        if self.hit[index] {
            false
        } else {
            self.hit[index] = true;
            true
        }
    }

    fn hit_count(&self) -> u64 {
        self.hit.iter().filter(|b| **b).count() as u64
    }
}

/// Aggregate sanitizer-coverage counters (§3 `sancovcnt_t`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SancovCounts {
    pub hit_bb_cnt: u64,
    pub total_bb_cnt: u64,
    pub dso_cnt: u64,
    pub new_bb_cnt: u64,
}

struct Inner {
    dsos: HashMap<String, DsoBitmap>,
}

/// The process-global sancov trie. One instance is shared (behind an `Arc`)
/// across all workers.
pub struct SancovState {
    inner: Mutex<Inner>,
}

impl SancovState {
    pub fn new() -> Self {
        SancovState {
            inner: Mutex::new(Inner {
                dsos: HashMap::new(),
            }),
        }
    }

    /// Parse a sancov file dropped by the child for `module`, marking each
    /// basic-block index it lists as hit. Returns the number of indices that
    /// were newly marked in this call.
    pub fn fold_file(&self, module: &str, indices: &[u32]) -> u64 {
        let mut inner = self.inner.lock().expect("sancov mutex poisoned");
        let entry = inner.dsos.entry(module.to_string()).or_default();
        let mut new = 0u64;
        for &idx in indices {
            if entry.mark(idx as usize) {
                new += 1;
            }
        }
        new
    }

    /// Scrape every `*.sancov` file under `workdir` written since the last
    /// call and fold it in. Returns the aggregate new-basic-block delta for
    /// this iteration — used by the engine to decide "was there new
    /// coverage?" (§4.7 step 8).
    pub fn scrape_dir(&self, workdir: &Path) -> std::io::Result<u64> {
        let mut new_total = 0u64;
        if !workdir.is_dir() {
            return Ok(0);
        }
        for entry in std::fs::read_dir(workdir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sancov") {
                continue;
            }
            let Some(module) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let bytes = std::fs::read(&path)?;
            let indices: Vec<u32> = bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            new_total += self.fold_file(module, &indices);
            let _ = std::fs::remove_file(&path);
        }
        Ok(new_total)
    }

    /// Aggregate counters across every known DSO.
    pub fn counts(&self) -> SancovCounts {
        let inner = self.inner.lock().expect("sancov mutex poisoned");
        let mut counts = SancovCounts {
            dso_cnt: inner.dsos.len() as u64,
            ..Default::default()
        };
        for bm in inner.dsos.values() {
            counts.hit_bb_cnt += bm.hit_count();
            counts.total_bb_cnt += bm.hit.len() as u64;
        }
        counts
    }
}

impl Default for SancovState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folding_same_indices_twice_reports_no_new_blocks() {
        let state = SancovState::new();
        assert_eq!(state.fold_file("libfoo.so", &[1, 2, 3]), 3);
        assert_eq!(state.fold_file("libfoo.so", &[1, 2, 3]), 0);
        assert_eq!(state.fold_file("libfoo.so", &[4]), 1);
    }

    #[test]
    fn separate_modules_are_independent() {
        let state = SancovState::new();
        state.fold_file("a.so", &[1]);
        state.fold_file("b.so", &[1]);
        let counts = state.counts();
        assert_eq!(counts.dso_cnt, 2);
        assert_eq!(counts.hit_bb_cnt, 2);
    }

    #[test]
    fn scrape_dir_consumes_sancov_files() {
        let dir = tempfile::tempdir().unwrap();
        let sancov_path = dir.path().join("libbar.so.sancov");
        std::fs::write(&sancov_path, 7u32.to_le_bytes()).unwrap();
        let state = SancovState::new();
        let new_blocks = state.scrape_dir(dir.path()).unwrap();
        assert_eq!(new_blocks, 1);
        assert!(!sancov_path.exists());
    }
}
