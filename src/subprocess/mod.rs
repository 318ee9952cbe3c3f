//! §4.5 Subprocess: fork/exec discipline, stdio/FD plumbing, and the
//! persistent-mode wire protocol (§6).

pub mod limits;

use std::ffi::CString;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, ForkResult, Pid};

use crate::config::{BITMAP_FD, FILE_PLACEHOLDER, PERSISTENT_FD};
use crate::error::{Error, Result};
use crate::feedback::backend::ChildFds;

/// How the target receives its input for a given iteration.
pub enum Delivery<'a> {
    /// `___FILE___` substitution (or a trailing argv path) pointing at the
    /// scratch file.
    Argv(&'a Path),
    /// stdin is redirected from the scratch file.
    Stdin(&'a Path),
    /// Persistent-mode handshake over a socketpair (§6 wire format).
    Persistent(&'a UnixStream),
}

/// Environment and process-launch policy (§6 toggles/limits).
#[derive(Debug, Clone)]
pub struct LaunchPolicy {
    pub clear_env: bool,
    pub nullify_stdio: bool,
    pub as_limit_mib: u64,
}

/// Outcome of waiting for a child: either it terminated (with a wait
/// status), or the per-worker timer fired and it was killed.
pub enum WaitOutcome {
    Exited(WaitStatus),
    TimedOut,
}

/// One worker's reusable scratch-file path (§5 resource policy: one path
/// per worker, reused across iterations, unlinked on clean exit).
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn new(workdir: &Path, worker: usize) -> Self {
        ScratchFile {
            path: workdir.join(format!(".rfuzz-scratch.{worker}")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    /// Unlink on a boring exit (§4.5 invariant).
    pub fn unlink(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    /// Save the scratch file's current bytes as a new artifact at `dest`,
    /// under `O_EXCL` semantics: if `dest` already exists, another worker
    /// (or an earlier relaunch) already claimed this crash name and this
    /// one is dropped rather than overwriting it (§4.6 cross-worker drop
    /// invariant). Returns `true` if the artifact was saved, `false` if it
    /// was dropped on collision.
    pub fn save_exclusive(&self, dest: &Path) -> Result<bool> {
        let bytes = std::fs::read(&self.path)?;
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dest)
        {
            Ok(mut f) => {
                f.write_all(&bytes)?;
                self.unlink();
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                self.unlink();
                Ok(false)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

fn substitute_placeholder(arg: &str, file: &Path) -> String {
    arg.replace(FILE_PLACEHOLDER, &file.to_string_lossy())
}

/// Fork/exec the target, installing the prepared FDs at well-known numbers,
/// nullifying stdio, applying the address-space limit, and substituting
/// `___FILE___` in argv (§4.5).
///
/// # Safety / design note
/// The child performs only async-signal-safe operations between `fork` and
/// `exec`: `dup2`, `close`, `setrlimit`, and `execvp`. No allocation happens
/// in the child after fork beyond what was prepared by the parent.
pub fn launch(
    cmdline: &[String],
    delivery: &Delivery<'_>,
    policy: &LaunchPolicy,
    child_fds: ChildFds,
) -> Result<Pid> {
    let file_path = match delivery {
        Delivery::Argv(p) | Delivery::Stdin(p) => Some((*p).to_path_buf()),
        Delivery::Persistent(_) => None,
    };

    let argv: Vec<CString> = cmdline
        .iter()
        .map(|a| {
            let substituted = match &file_path {
                Some(p) if !matches!(delivery, Delivery::Stdin(_)) => substitute_placeholder(a, p),
                _ => a.clone(),
            };
            CString::new(substituted).unwrap_or_else(|_| CString::new("").unwrap())
        })
        .collect();

    let bitmap_write_fd = child_fds.bitmap_write.as_ref().map(|f| f.as_raw_fd());
    let persistent_fd = match delivery {
        Delivery::Persistent(sock) => Some(sock.as_raw_fd()),
        _ => None,
    };
    let stdin_path = match delivery {
        Delivery::Stdin(p) => Some((*p).to_path_buf()),
        _ => None,
    };

    // SAFETY: between fork and exec only async-signal-safe syscalls run.
    match unsafe { fork() }.map_err(Error::from)? {
        ForkResult::Parent { child } => {
            // The parent's copy of the child's dup-source FDs must be
            // dropped so EOF is observed correctly on our read ends.
            drop(child_fds);
            Ok(child)
        }
        ForkResult::Child => {
            if let Some(fd) = bitmap_write_fd {
                let _ = dup2(fd, BITMAP_FD);
                if fd != BITMAP_FD {
                    let _ = close(fd);
                }
            }
            if let Some(fd) = persistent_fd {
                let _ = dup2(fd, PERSISTENT_FD);
                if fd != PERSISTENT_FD {
                    let _ = close(fd);
                }
            }
            if let Some(stdin_path) = &stdin_path {
                if let Ok(f) = std::fs::File::open(stdin_path) {
                    let _ = dup2(f.as_raw_fd(), 0);
                }
            }
            if policy.nullify_stdio {
                if let Ok(devnull) = std::fs::OpenOptions::new().read(true).write(true).open("/dev/null")
                {
                    let fd = devnull.as_raw_fd();
                    let _ = dup2(fd, 1);
                    let _ = dup2(fd, 2);
                }
            }
            if policy.as_limit_mib > 0 {
                limits::apply_address_space_limit(policy.as_limit_mib);
            }
            if policy.clear_env {
                for (key, _) in std::env::vars() {
                    std::env::remove_var(key);
                }
            }
            if argv.is_empty() {
                std::process::exit(127);
            }
            let _ = execvp(&argv[0], &argv);
            // execvp only returns on failure.
            std::process::exit(127);
        }
    }
}

/// Block in a wait with signal-interruption retry; if `timeout` elapses
/// first, escalate from `SIGTERM` to `SIGKILL` and return `TimedOut` (§4.5,
/// §5 cancellation and timeout).
pub fn wait(pid: Pid, timeout: Duration) -> Result<WaitOutcome> {
    const TICK: Duration = crate::config::TIMER_TICK;
    let deadline = Instant::now() + timeout;
    let mut sent_soft_kill = false;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if Instant::now() >= deadline {
                    if !sent_soft_kill {
                        let _ = kill(pid, Signal::SIGTERM);
                        sent_soft_kill = true;
                        std::thread::sleep(TICK);
                        continue;
                    }
                    let _ = kill(pid, Signal::SIGKILL);
                    let _ = waitpid(pid, None).map_err(Error::from)?;
                    return Ok(WaitOutcome::TimedOut);
                }
                std::thread::sleep(TICK.min(deadline.saturating_duration_since(Instant::now())));
            }
            Ok(status) => return Ok(WaitOutcome::Exited(status)),
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
}

/// §6 persistent-mode wire format: parent writes a 4-byte little-endian
/// length followed by the input, then reads a single `'A'` completion byte
/// before the next iteration can proceed.
pub fn persistent_cycle(socket: &mut UnixStream, input: &[u8]) -> Result<()> {
    let len = input.len() as u32;
    socket.write_all(&len.to_le_bytes()).map_err(Error::Io)?;
    socket.write_all(input).map_err(Error::Io)?;
    let mut marker = [0u8; 1];
    socket.read_exact(&mut marker).map_err(Error::Io)?;
    if marker[0] != b'A' {
        return Err(Error::Launch(format!(
            "persistent handshake: unexpected marker byte {:#x}",
            marker[0]
        )));
    }
    Ok(())
}

/// Create the parent/child socketpair used for persistent mode before
/// `fork` (§5 resource policy).
pub fn persistent_socketpair() -> Result<(UnixStream, UnixStream)> {
    UnixStream::pair().map_err(Error::Io)
}

/// Arm the parent's end of a persistent-mode socket with the per-launch
/// timeout, so a silent child surfaces as a read/write timeout rather than
/// hanging the worker loop forever.
pub fn set_persistent_timeout(socket: &UnixStream, timeout: Duration) -> Result<()> {
    socket.set_read_timeout(Some(timeout)).map_err(Error::Io)?;
    socket.set_write_timeout(Some(timeout)).map_err(Error::Io)
}

/// How one persistent-mode iteration over an already-forked child ended.
pub enum PersistentOutcome {
    /// The child ran the iteration and signaled completion normally.
    Completed,
    /// No response within the configured timeout.
    TimedOut,
    /// The socket broke (child crashed, or exited) before completing.
    Crashed,
}

/// Run one [`persistent_cycle`], translating its `Result` into an outcome
/// the engine can act on without inspecting I/O error kinds itself.
pub fn run_persistent_cycle(socket: &mut UnixStream, input: &[u8]) -> PersistentOutcome {
    match persistent_cycle(socket, input) {
        Ok(()) => PersistentOutcome::Completed,
        Err(Error::Io(e))
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            PersistentOutcome::TimedOut
        }
        Err(_) => PersistentOutcome::Crashed,
    }
}

/// Reap a child the caller already knows is dead (its persistent-mode
/// socket broke or hit EOF).
pub fn reap(pid: Pid) -> Result<WaitStatus> {
    waitpid(pid, None).map_err(Error::from)
}

/// Kill and reap a child whose persistent-mode iteration timed out.
pub fn kill_and_reap(pid: Pid) -> Result<WaitStatus> {
    let _ = kill(pid, Signal::SIGKILL);
    waitpid(pid, None).map_err(Error::from)
}

#[allow(dead_code)]
fn close_fd(fd: RawFd) {
    let _ = close(fd);
}

#[allow(dead_code)]
fn owned(fd: RawFd) -> OwnedFd {
    // SAFETY: caller guarantees `fd` is open and uniquely owned.
    unsafe { OwnedFd::from_raw_fd(fd) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_file_placeholder() {
        let out = substitute_placeholder("--in=___FILE___", Path::new("/tmp/x"));
        assert_eq!(out, "--in=/tmp/x");
    }

    #[test]
    fn leaves_args_without_placeholder_untouched() {
        let out = substitute_placeholder("--verbose", Path::new("/tmp/x"));
        assert_eq!(out, "--verbose");
    }

    #[test]
    fn scratch_file_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchFile::new(dir.path(), 0);
        scratch.write(b"hello").unwrap();
        assert_eq!(std::fs::read(scratch.path()).unwrap(), b"hello");
        scratch.unlink();
        assert!(!scratch.path().exists());
    }

    #[test]
    fn persistent_cycle_rejects_wrong_marker() {
        let (mut parent, mut child) = UnixStream::pair().unwrap();
        std::thread::spawn(move || {
            let mut len_buf = [0u8; 4];
            child.read_exact(&mut len_buf).unwrap();
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut data = vec![0u8; len];
            child.read_exact(&mut data).unwrap();
            child.write_all(&[b'Z']).unwrap();
        });
        let result = persistent_cycle(&mut parent, b"hi");
        assert!(result.is_err());
    }

    #[test]
    fn persistent_cycle_accepts_completion_marker() {
        let (mut parent, mut child) = UnixStream::pair().unwrap();
        std::thread::spawn(move || {
            let mut len_buf = [0u8; 4];
            child.read_exact(&mut len_buf).unwrap();
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut data = vec![0u8; len];
            child.read_exact(&mut data).unwrap();
            assert_eq!(data, b"hi");
            child.write_all(&[b'A']).unwrap();
        });
        persistent_cycle(&mut parent, b"hi").unwrap();
    }

    #[test]
    fn run_persistent_cycle_reports_timed_out_on_silence() {
        let (mut parent, _child) = UnixStream::pair().unwrap();
        set_persistent_timeout(&parent, Duration::from_millis(50)).unwrap();
        let outcome = run_persistent_cycle(&mut parent, b"hi");
        assert!(matches!(outcome, PersistentOutcome::TimedOut));
    }

    #[test]
    fn run_persistent_cycle_reports_crashed_when_peer_drops() {
        let (mut parent, child) = UnixStream::pair().unwrap();
        drop(child);
        let outcome = run_persistent_cycle(&mut parent, b"hi");
        assert!(matches!(outcome, PersistentOutcome::Crashed));
    }

    #[test]
    fn save_exclusive_writes_artifact_and_unlinks_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchFile::new(dir.path(), 0);
        scratch.write(b"crashy").unwrap();
        let dest = dir.path().join("artifact.fuzz");
        let saved = scratch.save_exclusive(&dest).unwrap();
        assert!(saved);
        assert!(!scratch.path().exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"crashy");
    }

    #[test]
    fn save_exclusive_drops_on_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchFile::new(dir.path(), 0);
        scratch.write(b"second").unwrap();
        let dest = dir.path().join("artifact.fuzz");
        std::fs::write(&dest, b"first").unwrap();
        let saved = scratch.save_exclusive(&dest).unwrap();
        assert!(!saved);
        assert!(!scratch.path().exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"first");
    }
}
