//! §4.7 Engine: the worker loop that ties every other module together, and
//! the `FuzzState` machine that advances it from *static* mutation through
//! the dynamic feedback-guided phases.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::Pid;

use crate::config::Config;
use crate::corpus::Corpus;
use crate::crash::{
    fold_fingerprint, BlacklistSet, CrashClassifier, NullBacktraceResolver, Outcome,
    UniqueCrashSet,
};
use crate::error::Result;
use crate::feedback::backend::{Backend, BackendKind, HardwareCounters};
use crate::feedback::sancov::SancovState;
use crate::feedback::FeedbackStore;
use crate::mutator::{Dictionary, ExternalMutator, Mutator};
use crate::report::{ReportSink, RunSummary};
use crate::rng::Lcg;
use crate::state::{FuzzState, SharedFuzzState};
use crate::subprocess::{self, Delivery, LaunchPolicy, PersistentOutcome, ScratchFile, WaitOutcome};

/// Set from a `SIGINT`/`SIGTERM` handler; every worker checks this once per
/// iteration and exits its loop promptly (§5 cancellation semantics).
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: i32) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs a best-effort `SIGINT`/`SIGTERM` handler. Failure to install is
/// logged and otherwise ignored — the run still stops via `mutations_max` or
/// an external `kill -9`.
pub fn install_shutdown_handler() {
    let handler = SigHandler::Handler(request_shutdown);
    unsafe {
        if let Err(e) = signal::signal(Signal::SIGINT, handler) {
            warn!("failed to install SIGINT handler: {e}");
        }
        if let Err(e) = signal::signal(Signal::SIGTERM, handler) {
            warn!("failed to install SIGTERM handler: {e}");
        }
    }
}

/// §3 run-level atomic counters, incremented by every worker concurrently.
#[derive(Default)]
pub struct RunCounters {
    mutations_cnt: AtomicU64,
    crashes_cnt: AtomicU64,
    unique_crashes_cnt: AtomicU64,
    verified_crashes_cnt: AtomicU64,
    bl_crashes_cnt: AtomicU64,
    timeouted_cnt: AtomicU64,
}

impl RunCounters {
    pub fn snapshot(&self) -> RunSummary {
        RunSummary {
            mutations_cnt: self.mutations_cnt.load(Ordering::Relaxed),
            crashes_cnt: self.crashes_cnt.load(Ordering::Relaxed),
            unique_crashes_cnt: self.unique_crashes_cnt.load(Ordering::Relaxed),
            verified_crashes_cnt: self.verified_crashes_cnt.load(Ordering::Relaxed),
            bl_crashes_cnt: self.bl_crashes_cnt.load(Ordering::Relaxed),
            timeouted_cnt: self.timeouted_cnt.load(Ordering::Relaxed),
        }
    }
}

/// A worker's live persistent-mode child: the parent-held end of the
/// FD-1023 socket plus the child's pid, reused across iterations until a
/// timeout or crash ends the session.
struct PersistentSession {
    socket: UnixStream,
    pid: Pid,
}

/// Everything a worker needs, shared read-only or behind atomics/mutexes
/// across every thread (§4.7).
pub struct Engine {
    config: Arc<Config>,
    corpus: Arc<Corpus>,
    feedback: Arc<FeedbackStore>,
    sancov: Arc<SancovState>,
    state: Arc<SharedFuzzState>,
    report: Arc<ReportSink>,
    unique_crashes: Arc<UniqueCrashSet>,
    blacklist: Option<Arc<BlacklistSet>>,
    dictionary: Option<Arc<Dictionary>>,
    external_mutator: Option<Arc<ExternalMutator>>,
    mutator: Arc<Mutator>,
    classifier: Arc<CrashClassifier>,
    counters: Arc<RunCounters>,
    backend_kind: BackendKind,
}

impl Engine {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let corpus = Arc::new(Corpus::load(&config.input, config.max_file_sz)?);
        let feedback = Arc::new(FeedbackStore::new(config.threads_max));
        let sancov = Arc::new(SancovState::new());
        let backend_kind = config.feedback;
        let initial_state = if backend_kind == BackendKind::Posix {
            FuzzState::Static
        } else {
            FuzzState::DynamicPre
        };
        let dictionary = match &config.dictionary {
            Some(path) => Some(Arc::new(Dictionary::load(path)?)),
            None => None,
        };
        let external_mutator = config
            .external_mutator
            .clone()
            .map(|cmd| Arc::new(ExternalMutator::new(cmd)));
        let blacklist = match &config.blacklist {
            Some(path) => Some(Arc::new(BlacklistSet::load(path)?)),
            None => None,
        };
        let report_path = if config.report_file.is_absolute() {
            config.report_file.clone()
        } else {
            config.workdir.join(&config.report_file)
        };
        let report = Arc::new(ReportSink::open(&report_path)?);

        Ok(Arc::new(Engine {
            corpus,
            feedback,
            sancov,
            state: Arc::new(SharedFuzzState::new(initial_state)),
            report,
            unique_crashes: Arc::new(UniqueCrashSet::new()),
            blacklist,
            dictionary,
            external_mutator,
            mutator: Arc::new(Mutator::new(config.max_file_sz)),
            classifier: Arc::new(CrashClassifier::new(Box::new(NullBacktraceResolver))),
            counters: Arc::new(RunCounters::default()),
            backend_kind,
            config,
        }))
    }

    /// Spawn `threads_max` worker threads and block until they all exit,
    /// then write the run summary (§4.7, §4.9).
    pub fn run(self: Arc<Self>) -> Result<RunSummary> {
        install_shutdown_handler();
        info!(
            "starting {} worker(s) against '{}'",
            self.config.threads_max,
            self.config.cmdline.join(" ")
        );
        let mut handles = Vec::with_capacity(self.config.threads_max);
        for worker in 0..self.config.threads_max {
            let engine = Arc::clone(&self);
            handles.push(std::thread::spawn(move || engine.worker_loop(worker)));
        }
        for handle in handles {
            let _ = handle.join();
        }
        let summary = self.counters.snapshot();
        self.report.write_summary(&summary)?;
        info!("run complete: {summary:?}");
        Ok(summary)
    }

    fn should_stop(&self, iterations_done: u64) -> bool {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            return true;
        }
        self.config.mutations_max != 0 && iterations_done >= self.config.mutations_max
    }

    fn worker_loop(&self, worker: usize) {
        if self.config.persistent {
            self.worker_loop_persistent(worker);
        } else {
            self.worker_loop_standard(worker);
        }
    }

    /// One worker's run loop: select a parent, mutate (or warm up
    /// unmutated during `DynamicPre`), launch, wait, classify, and fold
    /// feedback back into the corpus (§4.7 steps 1-10).
    fn worker_loop_standard(&self, worker: usize) {
        let mut rng = match Lcg::seeded() {
            Ok(r) => r,
            Err(e) => {
                warn!("worker {worker}: failed to seed RNG: {e}");
                return;
            }
        };
        let scratch = ScratchFile::new(&self.config.workdir, worker);
        let mut backend = Backend::new(
            self.backend_kind,
            worker,
            Arc::clone(&self.feedback),
            Arc::clone(&self.sancov),
            self.config.workdir.clone(),
        );

        loop {
            let done = self.counters.mutations_cnt.load(Ordering::Relaxed);
            if self.should_stop(done) {
                break;
            }

            let phase = self.state.get();
            let parent = match self.corpus.select_parent(phase) {
                Ok(p) => p,
                Err(e) => {
                    warn!("worker {worker}: failed to select parent: {e}");
                    continue;
                }
            };

            let warming_up = phase == FuzzState::DynamicPre;
            let bytes = if warming_up {
                (*parent.bytes).clone()
            } else {
                match self.mutator.mutate(
                    &parent.bytes,
                    &mut rng,
                    self.config.orig_flip_rate,
                    self.dictionary.as_deref(),
                    self.external_mutator.as_deref(),
                ) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("worker {worker}: mutation failed: {e}");
                        continue;
                    }
                }
            };

            self.counters.mutations_cnt.fetch_add(1, Ordering::Relaxed);

            let mut hwcnt = HardwareCounters::default();
            let had_new = match self.run_once(worker, &scratch, &bytes, &mut backend, &mut hwcnt) {
                Some(outcome) => outcome,
                None => continue,
            };

            if warming_up && self.corpus.mark_done(worker) {
                self.state.advance_to(FuzzState::DynamicMain);
                debug!("worker {worker}: seed warm-up complete, entering dynamic-main");
            }

            if !warming_up {
                self.corpus
                    .offer(Arc::new(bytes), had_new);
            }
        }
    }

    /// A worker's run loop when the target implements the persistent-mode
    /// handshake (§6): fork exactly one child per session and cycle
    /// mutated inputs over its FD-1023 socket instead of relaunching per
    /// iteration. A timeout or crash ends the session and a fresh child is
    /// forked for the next one.
    fn worker_loop_persistent(&self, worker: usize) {
        let mut rng = match Lcg::seeded() {
            Ok(r) => r,
            Err(e) => {
                warn!("worker {worker}: failed to seed RNG: {e}");
                return;
            }
        };
        let scratch = ScratchFile::new(&self.config.workdir, worker);
        let mut backend = Backend::new(
            self.backend_kind,
            worker,
            Arc::clone(&self.feedback),
            Arc::clone(&self.sancov),
            self.config.workdir.clone(),
        );

        let mut session = match self.spawn_persistent_child(&mut backend) {
            Some(s) => s,
            None => {
                warn!("worker {worker}: failed to spawn persistent child");
                return;
            }
        };

        loop {
            let done = self.counters.mutations_cnt.load(Ordering::Relaxed);
            if self.should_stop(done) {
                break;
            }

            let phase = self.state.get();
            let parent = match self.corpus.select_parent(phase) {
                Ok(p) => p,
                Err(e) => {
                    warn!("worker {worker}: failed to select parent: {e}");
                    continue;
                }
            };

            let warming_up = phase == FuzzState::DynamicPre;
            let bytes = if warming_up {
                (*parent.bytes).clone()
            } else {
                match self.mutator.mutate(
                    &parent.bytes,
                    &mut rng,
                    self.config.orig_flip_rate,
                    self.dictionary.as_deref(),
                    self.external_mutator.as_deref(),
                ) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("worker {worker}: mutation failed: {e}");
                        continue;
                    }
                }
            };

            self.counters.mutations_cnt.fetch_add(1, Ordering::Relaxed);
            if scratch.write(&bytes).is_err() {
                continue;
            }

            match subprocess::run_persistent_cycle(&mut session.socket, &bytes) {
                PersistentOutcome::Completed => {
                    backend.poll();
                    let mut hwcnt = HardwareCounters::default();
                    let had_new = backend.merge(&mut hwcnt);
                    scratch.unlink();

                    if warming_up && self.corpus.mark_done(worker) {
                        self.state.advance_to(FuzzState::DynamicMain);
                        debug!("worker {worker}: seed warm-up complete, entering dynamic-main");
                    }
                    if !warming_up {
                        self.corpus.offer(Arc::new(bytes), had_new);
                    }
                }
                PersistentOutcome::TimedOut => {
                    self.counters.timeouted_cnt.fetch_add(1, Ordering::Relaxed);
                    let _ = subprocess::kill_and_reap(session.pid);
                    let _ = backend.detach(session.pid);
                    scratch.unlink();
                    session = match self.spawn_persistent_child(&mut backend) {
                        Some(s) => s,
                        None => {
                            warn!("worker {worker}: failed to respawn persistent child after timeout");
                            return;
                        }
                    };
                }
                PersistentOutcome::Crashed => {
                    let wait_status = subprocess::reap(session.pid);
                    let _ = backend.detach(session.pid);
                    match wait_status {
                        Ok(status) => {
                            let wait_outcome = WaitOutcome::Exited(status);
                            match self
                                .classifier
                                .classify(&wait_outcome, session.pid, scratch.path(), 0)
                            {
                                Outcome::Interesting(record) => {
                                    self.handle_crash(worker, &scratch, &bytes, record);
                                }
                                _ => scratch.unlink(),
                            }
                        }
                        Err(e) => {
                            warn!("worker {worker}: failed to reap persistent child: {e}");
                            scratch.unlink();
                        }
                    }
                    session = match self.spawn_persistent_child(&mut backend) {
                        Some(s) => s,
                        None => {
                            warn!("worker {worker}: failed to respawn persistent child after crash");
                            return;
                        }
                    };
                }
            }
        }

        let _ = subprocess::kill_and_reap(session.pid);
    }

    /// Fork a fresh persistent-mode child: build the FD-1023 socketpair
    /// before forking, attach the coverage backend, and hand back the
    /// parent-held session (§6).
    fn spawn_persistent_child(&self, backend: &mut Backend) -> Option<PersistentSession> {
        let (parent_sock, child_sock) = subprocess::persistent_socketpair().ok()?;
        if let Err(e) = subprocess::set_persistent_timeout(&parent_sock, self.config.tm_out) {
            warn!("failed to arm persistent-mode timeout: {e}");
        }
        let child_fds = backend.prepare_child().unwrap_or_default();
        let delivery = Delivery::Persistent(&child_sock);
        let policy = LaunchPolicy {
            clear_env: self.config.clear_env,
            nullify_stdio: self.config.nullify_stdio,
            as_limit_mib: self.config.as_limit,
        };
        let pid = subprocess::launch(&self.config.cmdline, &delivery, &policy, child_fds).ok()?;
        drop(child_sock);
        backend.attach(pid).ok()?;
        Some(PersistentSession {
            socket: parent_sock,
            pid,
        })
    }

    /// Launch+wait+classify a single iteration. Returns `Some(had_new)` on a
    /// boring exit, or `None` if the iteration itself failed to launch
    /// (counted as a worker error, not a fuzzing result). A crash is
    /// recorded as a side effect before returning.
    fn run_once(
        &self,
        worker: usize,
        scratch: &ScratchFile,
        bytes: &[u8],
        backend: &mut Backend,
        hwcnt: &mut HardwareCounters,
    ) -> Option<bool> {
        if scratch.write(bytes).is_err() {
            return None;
        }
        let child_fds = backend.prepare_child().unwrap_or_default();
        let delivery = if self.config.fuzz_stdin {
            Delivery::Stdin(scratch.path())
        } else {
            Delivery::Argv(scratch.path())
        };
        let policy = LaunchPolicy {
            clear_env: self.config.clear_env,
            nullify_stdio: self.config.nullify_stdio,
            as_limit_mib: self.config.as_limit,
        };
        let pid = match subprocess::launch(&self.config.cmdline, &delivery, &policy, child_fds) {
            Ok(pid) => pid,
            Err(e) => {
                warn!("worker {worker}: launch failed: {e}");
                return None;
            }
        };
        let _ = backend.attach(pid);
        let wait_outcome = match subprocess::wait(pid, self.config.tm_out) {
            Ok(o) => o,
            Err(e) => {
                warn!("worker {worker}: wait failed: {e}");
                return None;
            }
        };
        backend.poll();
        let _ = backend.detach(pid);
        let had_new = backend.merge(hwcnt);

        if matches!(wait_outcome, WaitOutcome::TimedOut) {
            self.counters.timeouted_cnt.fetch_add(1, Ordering::Relaxed);
            scratch.unlink();
            return Some(false);
        }

        match self.classifier.classify(&wait_outcome, pid, scratch.path(), 0) {
            Outcome::Boring(_) => {
                scratch.unlink();
                Some(had_new)
            }
            Outcome::Timeout => {
                self.counters.timeouted_cnt.fetch_add(1, Ordering::Relaxed);
                scratch.unlink();
                Some(false)
            }
            Outcome::Interesting(record) => {
                self.handle_crash(worker, scratch, bytes, record);
                Some(had_new)
            }
        }
    }

    fn handle_crash(&self, worker: usize, scratch: &ScratchFile, bytes: &[u8], record: crate::crash::CrashRecord) {
        self.counters.crashes_cnt.fetch_add(1, Ordering::Relaxed);
        let fingerprint = fold_fingerprint(&record);

        if let Some(bl) = &self.blacklist {
            if bl.contains(fingerprint) {
                self.counters.bl_crashes_cnt.fetch_add(1, Ordering::Relaxed);
                scratch.unlink();
                return;
            }
        }

        let is_new = self.unique_crashes.insert_if_new(record.fingerprint());
        if self.config.save_unique && !is_new {
            scratch.unlink();
            return;
        }
        if is_new {
            self.counters.unique_crashes_cnt.fetch_add(1, Ordering::Relaxed);
        }

        let verified = if self.config.use_verifier {
            let stable = self.classifier.verify(&record, || {
                self.relaunch_fingerprint(worker, bytes)
            });
            if stable {
                self.counters.verified_crashes_cnt.fetch_add(1, Ordering::Relaxed);
            }
            stable
        } else {
            false
        };

        let artifact_path = self.artifact_path(worker, &record);
        match scratch.save_exclusive(&artifact_path) {
            Ok(true) => {
                if let Err(e) = self
                    .report
                    .record_crash(&record, &format!("{fingerprint:016x}"), verified)
                {
                    warn!("worker {worker}: failed to append crash report: {e}");
                }
            }
            Ok(false) => {
                debug!(
                    "worker {worker}: dropped crash, artifact name already claimed: {}",
                    artifact_path.display()
                );
            }
            Err(e) => warn!("worker {worker}: failed to save crash artifact: {e}"),
        }
    }

    /// Re-execute `bytes` once more, bypassing feedback collection, purely
    /// to observe whether the same `(signal, pc, backtrace)` fingerprint
    /// reproduces (§4.6 verifier).
    fn relaunch_fingerprint(&self, worker: usize, bytes: &[u8]) -> Option<(i32, u64, u64)> {
        let scratch = ScratchFile::new(&self.config.workdir, worker);
        scratch.write(bytes).ok()?;
        let delivery = if self.config.fuzz_stdin {
            Delivery::Stdin(scratch.path())
        } else {
            Delivery::Argv(scratch.path())
        };
        let policy = LaunchPolicy {
            clear_env: self.config.clear_env,
            nullify_stdio: self.config.nullify_stdio,
            as_limit_mib: self.config.as_limit,
        };
        let pid = subprocess::launch(&self.config.cmdline, &delivery, &policy, Default::default()).ok()?;
        let wait_outcome = subprocess::wait(pid, self.config.tm_out).ok()?;
        let outcome = self.classifier.classify(&wait_outcome, pid, scratch.path(), 0);
        scratch.unlink();
        match outcome {
            Outcome::Interesting(r) => Some(r.fingerprint()),
            _ => None,
        }
    }

    /// Worker-id-suffixed artifact name (§6: `<signal>.PID.<pid>.TIME.<ts>`).
    /// `save_exclusive` is what actually guards against a same-name
    /// collision across workers; the worker suffix just keeps the common
    /// case readable.
    fn artifact_path(&self, worker: usize, record: &crate::crash::CrashRecord) -> PathBuf {
        let ts = Utc::now().format("%Y-%m-%d.%H:%M:%S");
        let name = format!(
            "{:?}.PID.{}.TIME.{}.worker{}.{}",
            record.signal, record.pid, ts, worker, self.config.extension
        );
        self.config.workdir.join(name)
    }
}
