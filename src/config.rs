//! Invocation surface (§6): a `clap`-derived CLI parser plus the validated
//! [`Config`] it produces.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};
use crate::feedback::backend::BackendKind;

/// Default timer tick honggfuzz itself uses to poll for timeout expiry.
pub const TIMER_TICK: Duration = Duration::from_millis(250);
/// Number of re-executions the verifier performs before declaring stability.
pub const VERIFIER_ITERATIONS: u32 = 5;
/// Size, in bytes, of each of the two feedback bitmaps.
pub const BITMAP_SIZE: usize = 16 * 1024 * 1024;
/// Mask applied to a hashed program-point key before indexing a bitmap.
pub const BITMAP_MASK: u32 = 0x7ff_ffff;
/// Hard cap on concurrently running workers.
pub const MAX_THREADS: usize = 1024;
/// Well-known FD the child writes software-bitmap coverage records to.
pub const BITMAP_FD: std::os::unix::io::RawFd = 1022;
/// Well-known FD used for the persistent-mode handshake socket.
pub const PERSISTENT_FD: std::os::unix::io::RawFd = 1023;
/// The token substituted with the scratch file path in argv.
pub const FILE_PLACEHOLDER: &str = "___FILE___";

#[derive(Parser, Debug)]
#[command(
    name = "rfuzz",
    about = "A multi-process, coverage-guided fuzzing loop engine",
    version
)]
pub struct Cli {
    /// Directory of seed inputs, or a single seed file.
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,

    /// Work directory: crash artifacts and reports are written here.
    #[arg(short = 'o', long = "workdir")]
    pub workdir: PathBuf,

    /// Feed the input via stdin instead of an argv path / `___FILE___`.
    #[arg(long = "stdin")]
    pub fuzz_stdin: bool,

    /// Save only unique-by-fingerprint crashes (default: true).
    #[arg(long = "save-all", action = clap::ArgAction::SetFalse)]
    pub save_unique: bool,

    /// Re-run crashing inputs to confirm fingerprint stability.
    #[arg(long = "verifier")]
    pub use_verifier: bool,

    /// Assume the target implements the persistent-mode iteration handshake.
    #[arg(short = 'P', long = "persistent")]
    pub persistent: bool,

    /// Coverage feedback channel to attach to each launched target.
    #[arg(long = "feedback", value_enum, default_value_t = BackendKind::SoftwareBitmap)]
    pub feedback: BackendKind,

    /// Scrub the child's environment before exec.
    #[arg(long = "clear-env")]
    pub clear_env: bool,

    /// Redirect the child's stdio to /dev/null.
    #[arg(short = 'q', long = "nullify-stdio")]
    pub nullify_stdio: bool,

    /// Number of concurrent worker processes.
    #[arg(short = 'n', long = "threads", default_value_t = 1)]
    pub threads_max: usize,

    /// Stop after this many total iterations (0 = unbounded).
    #[arg(short = 'N', long = "iterations", default_value_t = 0)]
    pub mutations_max: u64,

    /// Maximum size, in bytes, of any mutated or retained input.
    #[arg(long = "max-file-size", default_value_t = 1024 * 1024)]
    pub max_file_sz: usize,

    /// Per-launch timeout in seconds.
    #[arg(short = 't', long = "timeout", default_value_t = 5)]
    pub tm_out: u64,

    /// Address-space limit applied to the child, in MiB (0 = unlimited).
    #[arg(long = "rlimit-as", default_value_t = 0)]
    pub as_limit: u64,

    /// Fraction of bytes flipped per mutation, in [0.0, 1.0].
    #[arg(short = 'F', long = "flip-rate", default_value_t = 0.001)]
    pub orig_flip_rate: f64,

    /// One-token-per-line dictionary used to splice tokens into mutations.
    #[arg(short = 'x', long = "dict")]
    pub dictionary: Option<PathBuf>,

    /// One-fingerprint-per-line (hex) blacklist of crashes to discard.
    #[arg(short = 'b', long = "blacklist")]
    pub blacklist: Option<PathBuf>,

    /// External mutator command line: reads the parent on stdin, writes the
    /// mutated child on stdout.
    #[arg(long = "external-mutator")]
    pub external_mutator: Option<String>,

    /// Run-level report file (summary counters on shutdown).
    #[arg(short = 'r', long = "report", default_value = "rfuzz.report.txt")]
    pub report_file: PathBuf,

    /// Extension used for saved crash artifacts.
    #[arg(short = 'e', long = "extension", default_value = "fuzz")]
    pub extension: String,

    /// Target command line. Use `___FILE___` as a placeholder for the
    /// scratch file path.
    #[arg(trailing_var_arg = true, required = true)]
    pub cmdline: Vec<String>,
}

/// Validated, run-ready configuration. Built once in `main`, then shared
/// read-only (behind an `Arc`) across every worker.
#[derive(Debug, Clone)]
pub struct Config {
    pub cmdline: Vec<String>,
    pub input: PathBuf,
    pub workdir: PathBuf,
    pub fuzz_stdin: bool,
    pub save_unique: bool,
    pub use_verifier: bool,
    pub persistent: bool,
    pub feedback: BackendKind,
    pub clear_env: bool,
    pub nullify_stdio: bool,
    pub threads_max: usize,
    pub mutations_max: u64,
    pub max_file_sz: usize,
    pub tm_out: Duration,
    pub as_limit: u64,
    pub orig_flip_rate: f64,
    pub dictionary: Option<PathBuf>,
    pub blacklist: Option<PathBuf>,
    pub external_mutator: Option<String>,
    pub report_file: PathBuf,
    pub extension: String,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        if cli.cmdline.is_empty() {
            return Err(Error::Config("target command line is empty".into()));
        }
        if !cli.input.exists() {
            return Err(Error::Config(format!(
                "input path '{}' does not exist",
                cli.input.display()
            )));
        }
        if cli.threads_max == 0 || cli.threads_max > MAX_THREADS {
            return Err(Error::Config(format!(
                "threads must be in 1..={MAX_THREADS}, got {}",
                cli.threads_max
            )));
        }
        if !(0.0..=1.0).contains(&cli.orig_flip_rate) {
            return Err(Error::Config(format!(
                "flip-rate must be in [0.0, 1.0], got {}",
                cli.orig_flip_rate
            )));
        }
        std::fs::create_dir_all(&cli.workdir)?;

        Ok(Config {
            cmdline: cli.cmdline,
            input: cli.input,
            workdir: cli.workdir,
            fuzz_stdin: cli.fuzz_stdin,
            save_unique: cli.save_unique,
            use_verifier: cli.use_verifier,
            persistent: cli.persistent,
            feedback: cli.feedback,
            clear_env: cli.clear_env,
            nullify_stdio: cli.nullify_stdio,
            threads_max: cli.threads_max,
            mutations_max: cli.mutations_max,
            max_file_sz: cli.max_file_sz,
            tm_out: Duration::from_secs(cli.tm_out.max(1)),
            as_limit: cli.as_limit,
            orig_flip_rate: cli.orig_flip_rate,
            dictionary: cli.dictionary,
            blacklist: cli.blacklist,
            external_mutator: cli.external_mutator,
            report_file: cli.report_file,
            extension: cli.extension,
        })
    }

    pub fn parse() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    /// `true` if `input` names a single seed file rather than a directory.
    pub fn input_is_file(&self) -> bool {
        self.input.is_file()
    }

    pub fn workdir_path(&self, name: &str) -> PathBuf {
        self.workdir.join(name)
    }
}

pub(crate) fn is_seed_file(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_cmdline() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            input: dir.path().to_path_buf(),
            workdir: dir.path().join("out"),
            fuzz_stdin: false,
            save_unique: true,
            use_verifier: false,
            persistent: false,
            feedback: BackendKind::Posix,
            clear_env: false,
            nullify_stdio: false,
            threads_max: 1,
            mutations_max: 0,
            max_file_sz: 1024,
            tm_out: 1,
            as_limit: 0,
            orig_flip_rate: 0.01,
            dictionary: None,
            blacklist: None,
            external_mutator: None,
            report_file: PathBuf::from("r.txt"),
            extension: "fuzz".into(),
            cmdline: vec![],
        };
        assert!(matches!(Config::from_cli(cli), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_out_of_range_flip_rate() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            input: dir.path().to_path_buf(),
            workdir: dir.path().join("out"),
            fuzz_stdin: false,
            save_unique: true,
            use_verifier: false,
            persistent: false,
            feedback: BackendKind::Posix,
            clear_env: false,
            nullify_stdio: false,
            threads_max: 1,
            mutations_max: 0,
            max_file_sz: 1024,
            tm_out: 1,
            as_limit: 0,
            orig_flip_rate: 2.0,
            dictionary: None,
            blacklist: None,
            external_mutator: None,
            report_file: PathBuf::from("r.txt"),
            extension: "fuzz".into(),
            cmdline: vec!["/bin/true".into()],
        };
        assert!(matches!(Config::from_cli(cli), Err(Error::Config(_))));
    }
}
