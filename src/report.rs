//! §4.9 ReportSink: append-only, per-crash human-readable reports plus a
//! run-level summary counters file written on shutdown. Structured as
//! newline-delimited JSON via `serde` rather than hand-rolled formatting.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

use crate::crash::CrashRecord;
use crate::error::{Error, Result};

const MAX_REPORT_LINE: usize = 8 * 1024;

#[derive(Serialize)]
struct CrashLine<'a> {
    signal: String,
    pid: i32,
    faulting_pc: u64,
    access_address: u64,
    fingerprint: String,
    offending_file: &'a str,
    verified: bool,
}

/// §3 run-level counters (`mutationsCnt`, `crashesCnt`, ... ), snapshotted
/// and serialized at shutdown.
#[derive(Serialize, Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub mutations_cnt: u64,
    pub crashes_cnt: u64,
    pub unique_crashes_cnt: u64,
    pub verified_crashes_cnt: u64,
    pub bl_crashes_cnt: u64,
    pub timeouted_cnt: u64,
}

/// Appends one line per interesting crash to `report_file`, and writes the
/// final [`RunSummary`] to `<report_file>.summary.json` on shutdown.
pub struct ReportSink {
    report_file: PathBuf,
    handle: Mutex<std::fs::File>,
}

impl ReportSink {
    pub fn open(report_file: &Path) -> Result<Self> {
        let handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(report_file)?;
        Ok(ReportSink {
            report_file: report_file.to_path_buf(),
            handle: Mutex::new(handle),
        })
    }

    /// Append one newline-delimited JSON line describing `record`. Lines
    /// longer than [`MAX_REPORT_LINE`] have their offending-file field
    /// truncated rather than growing the report unbounded.
    pub fn record_crash(&self, record: &CrashRecord, fingerprint_hex: &str, verified: bool) -> Result<()> {
        let mut offending_file = record.offending_file.to_string_lossy().to_string();
        let mut line = CrashLine {
            signal: format!("{:?}", record.signal),
            pid: record.pid.as_raw(),
            faulting_pc: record.faulting_pc,
            access_address: record.access_address,
            fingerprint: fingerprint_hex.to_string(),
            offending_file: &offending_file,
            verified,
        };
        let mut encoded = serde_json::to_string(&line).map_err(Error::from)?;
        if encoded.len() > MAX_REPORT_LINE {
            offending_file.truncate(64);
            line.offending_file = &offending_file;
            encoded = serde_json::to_string(&line).map_err(Error::from)?;
        }
        let mut handle = self.handle.lock().expect("report sink mutex poisoned");
        writeln!(handle, "{encoded}")?;
        Ok(())
    }

    /// Write the final summary alongside the report file.
    pub fn write_summary(&self, summary: &RunSummary) -> Result<()> {
        let summary_path = {
            let mut p = self.report_file.clone();
            let ext = p
                .extension()
                .map(|e| format!("{}.summary.json", e.to_string_lossy()))
                .unwrap_or_else(|| "summary.json".to_string());
            p.set_extension(ext);
            p
        };
        let encoded = serde_json::to_string_pretty(summary).map_err(Error::from)?;
        std::fs::write(summary_path, encoded)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;
    use nix::unistd::Pid;
    use std::path::PathBuf;

    fn fake_record() -> CrashRecord {
        CrashRecord {
            signal: Signal::SIGSEGV,
            pid: Pid::from_raw(123),
            faulting_pc: 0xdead,
            backtrace_fingerprint: 0,
            access_address: 0,
            report_text: String::new(),
            offending_file: PathBuf::from("/tmp/crash.fuzz"),
        }
    }

    #[test]
    fn appends_one_json_line_per_crash() {
        let dir = tempfile::tempdir().unwrap();
        let report_path = dir.path().join("r.txt");
        let sink = ReportSink::open(&report_path).unwrap();
        sink.record_crash(&fake_record(), "abc123", true).unwrap();
        sink.record_crash(&fake_record(), "abc123", true).unwrap();
        let text = std::fs::read_to_string(&report_path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().next().unwrap().contains("SIGSEGV"));
    }

    #[test]
    fn writes_summary_alongside_report() {
        let dir = tempfile::tempdir().unwrap();
        let report_path = dir.path().join("r.txt");
        let sink = ReportSink::open(&report_path).unwrap();
        let summary = RunSummary {
            mutations_cnt: 10,
            crashes_cnt: 1,
            unique_crashes_cnt: 1,
            verified_crashes_cnt: 1,
            bl_crashes_cnt: 0,
            timeouted_cnt: 0,
        };
        sink.write_summary(&summary).unwrap();
        let summary_path = dir.path().join("r.txt.summary.json");
        assert!(summary_path.exists());
    }
}
