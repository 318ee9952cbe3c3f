//! §4.2 Corpus: the original seed set plus the dynamic queue of
//! coverage-increasing inputs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::state::FuzzState;

/// An immutable byte sequence (§3 `Input`): either a seed read from disk or
/// a [`DynEntry`] retained because it grew coverage.
#[derive(Debug, Clone)]
pub struct Input {
    pub bytes: std::sync::Arc<Vec<u8>>,
    pub source: InputSource,
}

#[derive(Debug, Clone)]
pub enum InputSource {
    Seed(PathBuf),
    Dynamic(usize),
}

impl Input {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// An input retained because it grew coverage (§3 `DynEntry`). Appears in
/// the dynamic queue exactly once; lifetime spans the run.
#[derive(Debug, Clone)]
pub struct DynEntry {
    pub bytes: std::sync::Arc<Vec<u8>>,
}

struct DynamicQueue {
    entries: Mutex<Vec<DynEntry>>,
}

/// The seed set plus the dynamic queue, and the round-robin cursors each
/// needs (§4.2).
pub struct Corpus {
    seeds: Vec<PathBuf>,
    max_file_sz: usize,
    dynamic: DynamicQueue,
    seed_cursor: AtomicUsize,
    dyn_cursor: AtomicUsize,
    done_file_index: AtomicUsize,
}

impl Corpus {
    /// Load every regular file directly under `input` (or just `input`
    /// itself if it names a single seed file).
    pub fn load(input: &Path, max_file_sz: usize) -> Result<Self> {
        let mut seeds = Vec::new();
        if input.is_file() {
            seeds.push(input.to_path_buf());
        } else if input.is_dir() {
            for entry in std::fs::read_dir(input)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    seeds.push(entry.path());
                }
            }
            seeds.sort();
        } else {
            return Err(Error::Config(format!(
                "input path '{}' is neither a file nor a directory",
                input.display()
            )));
        }
        if seeds.is_empty() {
            return Err(Error::Config(format!(
                "no seed files found under '{}'",
                input.display()
            )));
        }
        Ok(Corpus {
            seeds,
            max_file_sz,
            dynamic: DynamicQueue {
                entries: Mutex::new(Vec::new()),
            },
            seed_cursor: AtomicUsize::new(0),
            dyn_cursor: AtomicUsize::new(0),
            done_file_index: AtomicUsize::new(0),
        })
    }

    pub fn seed_count(&self) -> usize {
        self.seeds.len()
    }

    pub fn dynamic_len(&self) -> usize {
        self.dynamic.entries.lock().expect("corpus mutex poisoned").len()
    }

    /// Round-robin over the original file set during *static*/*dynamic-pre*;
    /// round-robin over the dynamic queue during *dynamic-main*, falling
    /// back to the original set if the queue is empty.
    pub fn select_parent(&self, phase: FuzzState) -> Result<Input> {
        if phase == FuzzState::DynamicMain {
            let entries = self.dynamic.entries.lock().expect("corpus mutex poisoned");
            if !entries.is_empty() {
                let idx = self.dyn_cursor.fetch_add(1, Ordering::Relaxed) % entries.len();
                return Ok(Input {
                    bytes: entries[idx].bytes.clone(),
                    source: InputSource::Dynamic(idx),
                });
            }
        }
        let idx = self.seed_cursor.fetch_add(1, Ordering::Relaxed) % self.seeds.len();
        let path = &self.seeds[idx];
        let bytes = std::fs::read(path)?;
        Ok(Input {
            bytes: std::sync::Arc::new(bytes),
            source: InputSource::Seed(path.clone()),
        })
    }

    /// If `had_new_coverage`, append to the dynamic queue provided size
    /// fits; otherwise discard. All concurrent offers for the same
    /// newly-discovered bit are accepted (§4.2 tie-break note).
    pub fn offer(&self, bytes: std::sync::Arc<Vec<u8>>, had_new_coverage: bool) {
        if !had_new_coverage || bytes.len() > self.max_file_sz {
            return;
        }
        let mut entries = self.dynamic.entries.lock().expect("corpus mutex poisoned");
        entries.push(DynEntry { bytes });
    }

    /// Advance the "done file index" cursor used to terminate *dynamic-pre*.
    /// Returns `true` iff every seed has now been marked done at least once.
    pub fn mark_done(&self, _index: usize) -> bool {
        let done = self.done_file_index.fetch_add(1, Ordering::AcqRel) + 1;
        done >= self.seeds.len()
    }

    pub fn seeds(&self) -> &[PathBuf] {
        &self.seeds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn loads_seed_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"AAAA").unwrap();
        fs::write(dir.path().join("b"), b"BBBB").unwrap();
        let corpus = Corpus::load(dir.path(), 1024).unwrap();
        assert_eq!(corpus.seed_count(), 2);
    }

    #[test]
    fn rejects_empty_seed_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Corpus::load(dir.path(), 1024).is_err());
    }

    #[test]
    fn select_parent_round_robins_seeds() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"A").unwrap();
        fs::write(dir.path().join("b"), b"B").unwrap();
        let corpus = Corpus::load(dir.path(), 1024).unwrap();
        let first = corpus.select_parent(FuzzState::Static).unwrap();
        let second = corpus.select_parent(FuzzState::Static).unwrap();
        let third = corpus.select_parent(FuzzState::Static).unwrap();
        assert_ne!(*first.bytes, *second.bytes);
        assert_eq!(*first.bytes, *third.bytes);
    }

    #[test]
    fn offer_rejects_oversized_and_non_new_inputs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"A").unwrap();
        let corpus = Corpus::load(dir.path(), 4).unwrap();
        corpus.offer(std::sync::Arc::new(vec![0u8; 2]), false);
        assert_eq!(corpus.dynamic_len(), 0);
        corpus.offer(std::sync::Arc::new(vec![0u8; 100]), true);
        assert_eq!(corpus.dynamic_len(), 0);
        corpus.offer(std::sync::Arc::new(vec![0u8; 2]), true);
        assert_eq!(corpus.dynamic_len(), 1);
    }

    #[test]
    fn falls_back_to_seeds_when_dynamic_queue_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"A").unwrap();
        let corpus = Corpus::load(dir.path(), 1024).unwrap();
        let input = corpus.select_parent(FuzzState::DynamicMain).unwrap();
        assert_eq!(*input.bytes, b"A".to_vec());
    }

    #[test]
    fn mark_done_signals_completion_after_every_seed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"A").unwrap();
        fs::write(dir.path().join("b"), b"B").unwrap();
        let corpus = Corpus::load(dir.path(), 1024).unwrap();
        assert!(!corpus.mark_done(0));
        assert!(corpus.mark_done(1));
    }
}
