//! §4.6 CrashClassifier: maps child termination to an [`Outcome`], computes
//! crash uniqueness, and drives the stability verifier.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::config::VERIFIER_ITERATIONS;
use crate::error::{Error, Result};
use crate::subprocess::WaitOutcome;

/// The five signals honggfuzz treats as "interesting" (§3, §4.6).
const INTERESTING_SIGNALS: [Signal; 5] = [
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGABRT,
];

/// §3 `CrashRecord`.
#[derive(Debug, Clone)]
pub struct CrashRecord {
    pub signal: Signal,
    pub pid: Pid,
    pub faulting_pc: u64,
    pub backtrace_fingerprint: u64,
    pub access_address: u64,
    pub report_text: String,
    pub offending_file: PathBuf,
}

impl CrashRecord {
    /// The triple that identifies this crash for uniqueness (§4.6).
    pub fn fingerprint(&self) -> (i32, u64, u64) {
        (self.signal as i32, self.faulting_pc, self.backtrace_fingerprint)
    }
}

/// Result of classifying one iteration's termination (§4.6).
pub enum Outcome {
    Boring(i32),
    Timeout,
    Interesting(CrashRecord),
}

/// A stub collaborator: the real stack unwinder/BFD symbol resolver is out
/// of scope (SPEC_FULL §1). [`NullBacktraceResolver`] always returns a zero
/// fingerprint, matching §4.6's "or leave zero if unavailable"; this trait
/// is the seam a real libunwind-backed resolver would implement.
pub trait BacktraceResolver: Send + Sync {
    fn resolve(&self, pid: Pid, pc: u64) -> u64;
}

pub struct NullBacktraceResolver;

impl BacktraceResolver for NullBacktraceResolver {
    fn resolve(&self, _pid: Pid, _pc: u64) -> u64 {
        0
    }
}

/// §3 `BlacklistSet`: crash fingerprints that must be discarded rather than
/// saved.
#[derive(Debug, Default)]
pub struct BlacklistSet {
    fingerprints: Vec<u64>,
}

impl BlacklistSet {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut fingerprints: Vec<u64> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| {
                u64::from_str_radix(l.trim_start_matches("0x"), 16)
                    .map_err(|e| Error::Config(format!("bad blacklist entry '{l}': {e}")))
            })
            .collect::<Result<_>>()?;
        fingerprints.sort_unstable();
        Ok(BlacklistSet { fingerprints })
    }

    pub fn contains(&self, fingerprint: u64) -> bool {
        self.fingerprints.binary_search(&fingerprint).is_ok()
    }
}

/// A simple hash folding the uniqueness triple down to one `u64`, used both
/// for blacklist lookups and for naming purposes.
pub fn fold_fingerprint(record: &CrashRecord) -> u64 {
    let (signal, pc, bt) = record.fingerprint();
    let mut h = signal as u64;
    h = h.wrapping_mul(0x100000001b3).wrapping_add(pc);
    h = h.wrapping_mul(0x100000001b3).wrapping_add(bt);
    h
}

/// The in-memory set of unique crash fingerprints observed so far this run.
pub struct UniqueCrashSet {
    seen: Mutex<HashSet<(i32, u64, u64)>>,
}

impl UniqueCrashSet {
    pub fn new() -> Self {
        UniqueCrashSet {
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Returns `true` iff this fingerprint had never been seen before.
    pub fn insert_if_new(&self, fingerprint: (i32, u64, u64)) -> bool {
        self.seen.lock().expect("unique-crash mutex poisoned").insert(fingerprint)
    }
}

impl Default for UniqueCrashSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Classifies terminations and drives the verifier (§4.6).
pub struct CrashClassifier {
    resolver: Box<dyn BacktraceResolver>,
}

impl CrashClassifier {
    pub fn new(resolver: Box<dyn BacktraceResolver>) -> Self {
        CrashClassifier { resolver }
    }

    /// `WIFEXITED` -> Boring. `WIFSIGNALED` with an interesting signal ->
    /// Interesting. Any other signal -> Boring. A timer-triggered kill ->
    /// Timeout (§4.6).
    pub fn classify(
        &self,
        wait_outcome: &WaitOutcome,
        pid: Pid,
        offending_file: &Path,
        access_address: u64,
    ) -> Outcome {
        let status = match wait_outcome {
            WaitOutcome::TimedOut => return Outcome::Timeout,
            WaitOutcome::Exited(status) => status,
        };
        match status {
            WaitStatus::Exited(_, code) => Outcome::Boring(*code),
            WaitStatus::Signaled(_, signal, _) => {
                if INTERESTING_SIGNALS.contains(signal) {
                    let faulting_pc = 0u64; // requires PTRACE_GETREGS; not wired in here
                    let backtrace_fingerprint = self.resolver.resolve(pid, faulting_pc);
                    Outcome::Interesting(CrashRecord {
                        signal: *signal,
                        pid,
                        faulting_pc,
                        backtrace_fingerprint,
                        access_address,
                        report_text: format!(
                            "pid={pid} signal={signal:?} pc={faulting_pc:#x} addr={access_address:#x}"
                        ),
                        offending_file: offending_file.to_path_buf(),
                    })
                } else {
                    Outcome::Boring(128 + *signal as i32)
                }
            }
            _ => Outcome::Boring(0),
        }
    }

    /// Re-execute the offending input up to [`VERIFIER_ITERATIONS`] times;
    /// `relaunch_fn` performs one relaunch and returns the fingerprint it
    /// observed (or `None` if that relaunch didn't crash). The crash is
    /// *stable* iff every relaunch produces the same fingerprint.
    pub fn verify<F>(&self, record: &CrashRecord, mut relaunch_fn: F) -> bool
    where
        F: FnMut() -> Option<(i32, u64, u64)>,
    {
        let expected = record.fingerprint();
        for _ in 0..VERIFIER_ITERATIONS {
            match relaunch_fn() {
                Some(fp) if fp == expected => continue,
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_record(signal: Signal, pc: u64, bt: u64) -> CrashRecord {
        CrashRecord {
            signal,
            pid: Pid::from_raw(1),
            faulting_pc: pc,
            backtrace_fingerprint: bt,
            access_address: 0,
            report_text: String::new(),
            offending_file: PathBuf::from("/tmp/x"),
        }
    }

    #[test]
    fn verify_succeeds_when_every_relaunch_matches() {
        let classifier = CrashClassifier::new(Box::new(NullBacktraceResolver));
        let record = fake_record(Signal::SIGSEGV, 0x1000, 0);
        let expected = record.fingerprint();
        let stable = classifier.verify(&record, || Some(expected));
        assert!(stable);
    }

    #[test]
    fn verify_fails_on_a_single_disagreement() {
        let classifier = CrashClassifier::new(Box::new(NullBacktraceResolver));
        let record = fake_record(Signal::SIGSEGV, 0x1000, 0);
        let mut calls = 0;
        let stable = classifier.verify(&record, || {
            calls += 1;
            if calls == 3 {
                Some((Signal::SIGSEGV as i32, 0x2000, 0))
            } else {
                Some(record.fingerprint())
            }
        });
        assert!(!stable);
    }

    #[test]
    fn unique_crash_set_reports_new_once() {
        let set = UniqueCrashSet::new();
        assert!(set.insert_if_new((11, 0x1000, 0)));
        assert!(!set.insert_if_new((11, 0x1000, 0)));
    }

    #[test]
    fn blacklist_lookup_after_loading_hex_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bl.txt");
        std::fs::write(&path, "0xdeadbeef\ncafef00d\n").unwrap();
        let bl = BlacklistSet::load(&path).unwrap();
        assert!(bl.contains(0xdeadbeef));
        assert!(bl.contains(0xcafef00d));
        assert!(!bl.contains(0x1));
    }
}
