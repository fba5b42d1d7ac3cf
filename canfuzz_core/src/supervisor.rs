use crate::case_store::CaseStore;
use crate::classifier::ClassifierTable;
use crate::record::{Case, FailureCaseRecord, RunEntry, RunStatus};
use crossbeam_channel::{Receiver, Sender, unbounded};
use indexmap::IndexMap;
use std::io::{BufRead, BufReader, PipeReader};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Another job holds the single-flight slot.
    #[error("A '{module}' job is already running")]
    Busy { module: String },

    /// The worker could not be started.
    #[error("{0}")]
    Launch(String),

    /// Reading the worker's output failed.
    #[error("{0}")]
    Io(String),

    /// No worker arguments could be recovered from a stored case.
    #[error("Could not recover a command for {module} case {timestamp}")]
    Unreplayable { module: String, timestamp: String },
}

/// Structured notifications published while jobs run.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// A line for the console, in worker output order.
    Console(String),
    /// A classified case, published right after it is recorded.
    Case(Case),
    /// The run changed state or gained a case.
    RunUpdated(RunProgress),
    /// The run entry reached its final state.
    RunFinished(RunEntry),
}

/// Counters of a run in progress. The full entry is only sent on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunProgress {
    pub job_id: u64,
    pub module: String,
    pub status: RunStatus,
    pub success_cases: usize,
    pub failure_cases: usize,
}

/// Fan-out of events to the receivers handed out by [`Supervisor::events`].
///
/// Only live subscribers are kept; a dropped receiver is pruned on the next send.
#[derive(Clone, Default)]
struct Subscribers {
    senders: Arc<Mutex<Vec<Sender<SupervisorEvent>>>>,
}

impl Subscribers {
    fn lock(&self) -> MutexGuard<'_, Vec<Sender<SupervisorEvent>>> {
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn subscribe(&self) -> Receiver<SupervisorEvent> {
        let (tx, rx) = unbounded();
        self.lock().push(tx);
        rx
    }

    fn emit(&self, event: SupervisorEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// How workers are launched.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: PathBuf,
    /// Arguments placed before the per-run arguments.
    pub base_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: IndexMap<String, String>,
}

impl SupervisorConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            working_dir: None,
            env: IndexMap::new(),
        }
    }

    fn command_line(&self, args: &[String]) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.base_args.iter().cloned())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug)]
struct ActiveJob {
    job_id: u64,
    module: String,
    pid: Option<u32>,
}

type Slot = Arc<Mutex<Option<ActiveJob>>>;

fn lock_slot(slot: &Mutex<Option<ActiveJob>>) -> MutexGuard<'_, Option<ActiveJob>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A started job. Dropping the handle leaves the job running.
pub struct RunHandle {
    job_id: u64,
    thread: JoinHandle<RunEntry>,
}

impl RunHandle {
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Blocks until the job has been finalized.
    pub fn wait(self) -> RunEntry {
        match self.thread.join() {
            Ok(entry) => entry,
            Err(_) => {
                error!(job = self.job_id, "supervisor thread panicked");
                let mut entry = RunEntry::new("unknown", "");
                entry.transition(RunStatus::Error);
                entry
            }
        }
    }
}

/// Runs fuzzing workers one at a time and turns their output into records.
///
/// At most one job is active. Its output is pumped on a background thread,
/// classified line by line, and every failure is written to the shared
/// [`CaseStore`] as soon as it is seen. Progress is published as
/// [`SupervisorEvent`]s; each receiver obtained from [`Supervisor::events`]
/// gets its own copy of every event sent after it subscribed.
pub struct Supervisor {
    config: SupervisorConfig,
    store: Arc<CaseStore>,
    classifier: ClassifierTable,
    slot: Slot,
    history: Arc<Mutex<Vec<RunEntry>>>,
    next_job: AtomicU64,
    events: Subscribers,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, store: Arc<CaseStore>) -> Self {
        Self::with_classifier(config, store, ClassifierTable::default())
    }

    pub fn with_classifier(
        config: SupervisorConfig,
        store: Arc<CaseStore>,
        classifier: ClassifierTable,
    ) -> Self {
        Self {
            config,
            store,
            classifier,
            slot: Arc::new(Mutex::new(None)),
            history: Arc::new(Mutex::new(Vec::new())),
            next_job: AtomicU64::new(1),
            events: Subscribers::default(),
        }
    }

    /// Subscribes to events from now on. Dropping the receiver unsubscribes.
    pub fn events(&self) -> Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<CaseStore> {
        &self.store
    }

    pub fn is_busy(&self) -> bool {
        lock_slot(&self.slot).is_some()
    }

    /// Module of the active job, if any.
    pub fn active_module(&self) -> Option<String> {
        lock_slot(&self.slot).as_ref().map(|job| job.module.clone())
    }

    /// Every run finalized during this session, oldest first.
    pub fn history(&self) -> Vec<RunEntry> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Starts a worker with `args` for `module`.
    ///
    /// Fails with [`SupervisorError::Busy`] while another job is active; in
    /// that case nothing is spawned and the active job is untouched. Launch
    /// problems are not returned here: they finalize the run as `Error`.
    pub fn run(&self, args: &[String], module: &str) -> Result<RunHandle, SupervisorError> {
        let job_id = {
            let mut slot = lock_slot(&self.slot);
            if let Some(active) = slot.as_ref() {
                warn!(active = %active.module, requested = module, "rejecting run while busy");
                return Err(SupervisorError::Busy {
                    module: active.module.clone(),
                });
            }
            let job_id = self.next_job.fetch_add(1, Ordering::Relaxed);
            *slot = Some(ActiveJob {
                job_id,
                module: module.to_string(),
                pid: None,
            });
            job_id
        };

        let job = Job {
            job_id,
            module: module.to_string(),
            args: args.to_vec(),
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            classifier: self.classifier.clone(),
            slot: Arc::clone(&self.slot),
            history: Arc::clone(&self.history),
            events: self.events.clone(),
        };

        let spawned = thread::Builder::new()
            .name(format!("canfuzz-job-{job_id}"))
            .spawn(move || job.execute());
        match spawned {
            Ok(thread) => Ok(RunHandle { job_id, thread }),
            Err(e) => {
                lock_slot(&self.slot).take();
                Err(SupervisorError::Launch(format!("Failed to start supervisor thread: {e}")))
            }
        }
    }

    /// Terminates the active worker and frees the slot.
    ///
    /// The run itself is finalized by its own pump once the worker exits.
    /// Returns false when nothing was running.
    pub fn stop(&self) -> bool {
        let Some(job) = lock_slot(&self.slot).take() else {
            return false;
        };
        match job.pid {
            Some(pid) => {
                info!(module = %job.module, pid, "stopping worker");
                if let Err(e) = terminate(pid) {
                    warn!(pid, error = %e, "failed to terminate worker");
                }
            }
            // The pump kills the child itself once it sees the slot was released.
            None => debug!(module = %job.module, "stop requested before worker started"),
        }
        self.events
            .emit(SupervisorEvent::Console("[Process Stopped by User]".to_string()));
        true
    }

    /// Runs the worker again with arguments recovered from a stored failure.
    pub fn replay(&self, record: &FailureCaseRecord) -> Result<RunHandle, SupervisorError> {
        let args = record
            .replay_args()
            .ok_or_else(|| SupervisorError::Unreplayable {
                module: record.module.clone(),
                timestamp: record.timestamp.clone(),
            })?;
        info!(module = %record.module, args = ?args, "replaying failure case");
        self.run(&args, &record.module)
    }

    /// Replays each record in turn, waiting for every run to finish before
    /// starting the next. Records that cannot be replayed are skipped.
    pub fn replay_all(&self, records: &[FailureCaseRecord], idle_wait: Duration) -> Vec<RunEntry> {
        let mut finished = Vec::new();
        for record in records {
            if !self.wait_idle(idle_wait) {
                warn!(module = %record.module, "supervisor still busy, skipping replay");
                continue;
            }
            match self.replay(record) {
                Ok(handle) => finished.push(handle.wait()),
                Err(e) => warn!(error = %e, "skipping failure case"),
            }
        }
        finished
    }

    /// Waits up to `timeout` for the slot to free up.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_busy() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
        true
    }
}

/// Everything the pump thread needs for one run.
struct Job {
    job_id: u64,
    module: String,
    args: Vec<String>,
    config: SupervisorConfig,
    store: Arc<CaseStore>,
    classifier: ClassifierTable,
    slot: Slot,
    history: Arc<Mutex<Vec<RunEntry>>>,
    events: Subscribers,
}

impl Job {
    fn emit(&self, event: SupervisorEvent) {
        self.events.emit(event);
    }

    fn progress(&self, entry: &RunEntry) {
        self.emit(SupervisorEvent::RunUpdated(RunProgress {
            job_id: self.job_id,
            module: self.module.clone(),
            status: entry.status,
            success_cases: entry.success_cases.len(),
            failure_cases: entry.failure_cases.len(),
        }));
    }

    fn console(&self, line: impl Into<String>) {
        self.emit(SupervisorEvent::Console(line.into()));
    }

    fn execute(self) -> RunEntry {
        let command = self.config.command_line(&self.args);
        let mut entry = RunEntry::new(&self.module, &command);
        entry.transition(RunStatus::Running);

        let cwd = self
            .config
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        self.console(format!(">>> [{}] START: {}", self.module, command));
        self.console(format!(">>> CWD: {cwd}"));
        info!(module = %self.module, job = self.job_id, %command, "starting worker");
        self.progress(&entry);

        if let Err(e) = self.supervise(&mut entry) {
            self.fail(&mut entry, &e);
        }

        {
            let mut slot = lock_slot(&self.slot);
            if slot.as_ref().is_some_and(|job| job.job_id == self.job_id) {
                *slot = None;
            }
        }
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry.clone());
        self.emit(SupervisorEvent::RunFinished(entry.clone()));
        entry
    }

    fn supervise(&self, entry: &mut RunEntry) -> Result<(), SupervisorError> {
        let (mut child, reader) = launch(&self.config, &self.args)?;
        let pid = child.id();

        let released = {
            let mut slot = lock_slot(&self.slot);
            match slot.as_mut() {
                Some(job) if job.job_id == self.job_id => {
                    job.pid = Some(pid);
                    false
                }
                _ => true,
            }
        };
        if released {
            debug!(pid, "slot released before worker started, terminating it");
            if let Err(e) = terminate(pid) {
                warn!(pid, error = %e, "failed to terminate worker");
            }
        }

        if let Err(e) = self.pump(entry, reader) {
            abort_worker(&mut child, pid);
            return Err(e);
        }

        let status = child
            .wait()
            .map_err(|e| SupervisorError::Io(format!("Error waiting for worker: {e}")))?;
        let code = exit_code(status);
        let final_status = RunStatus::from_exit(code, entry.failure_cases.len());
        entry.transition(final_status);

        self.console(format!("<<< FINISHED (Code: {code}) - Status: {final_status}"));
        if !entry.failure_cases.is_empty() {
            self.console(format!(
                "[INFO] {} failure cases stored for review",
                entry.failure_cases.len()
            ));
        }
        info!(module = %self.module, pid, code, status = %final_status, "worker finished");
        Ok(())
    }

    fn pump(&self, entry: &mut RunEntry, reader: PipeReader) -> Result<(), SupervisorError> {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| SupervisorError::Io(format!("Failed to read worker output: {e}")))?;
            if n == 0 {
                return Ok(());
            }
            let text = String::from_utf8_lossy(&buf);
            let line = text.trim_end_matches(['\n', '\r']);
            entry.push_output(line);
            self.console(line);

            if let Some(case) = self.classifier.classify(&self.module, line) {
                if case.kind.is_failure() {
                    let record = FailureCaseRecord::from_case(&self.module, &entry.command, &case);
                    self.store.add(&self.module, record);
                }
                self.emit(SupervisorEvent::Case(case.clone()));
                entry.record(case);
                self.progress(entry);
            }
        }
    }

    fn fail(&self, entry: &mut RunEntry, err: &SupervisorError) {
        let message = err.to_string();
        error!(module = %self.module, error = %message, "worker run failed");
        self.console(format!("ERROR: {message}"));
        entry.output.push_str(&format!("\nError: {message}"));
        entry.transition(RunStatus::Error);

        let case = Case::execution_error(&message);
        let record = FailureCaseRecord::from_case(&self.module, &entry.command, &case);
        self.store.add(&self.module, record);
        self.emit(SupervisorEvent::Case(case.clone()));
        entry.record(case);
    }
}

fn launch(
    config: &SupervisorConfig,
    args: &[String],
) -> Result<(Child, PipeReader), SupervisorError> {
    let (reader, writer) = std::io::pipe()
        .map_err(|e| SupervisorError::Io(format!("Failed to create output pipe: {e}")))?;
    let stderr = writer
        .try_clone()
        .map_err(|e| SupervisorError::Io(format!("Failed to duplicate output pipe: {e}")))?;

    let mut cmd = Command::new(&config.program);
    cmd.args(&config.base_args)
        .args(args)
        .envs(&config.env)
        .stdin(Stdio::null())
        .stdout(writer)
        .stderr(stderr);
    if let Some(cwd) = &config.working_dir {
        cmd.current_dir(cwd);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd.spawn().map_err(|e| {
        SupervisorError::Launch(format!(
            "Failed to spawn command '{}': {}",
            config.program.display(),
            e
        ))
    })?;
    // The command still owns the write ends; they must close for EOF to arrive.
    drop(cmd);
    Ok((child, reader))
}

/// Kills the worker together with anything it spawned, then reaps it.
fn abort_worker(child: &mut Child, pid: u32) {
    if let Err(e) = terminate(pid) {
        warn!(pid, error = %e, "failed to terminate worker group");
        let _ = child.kill();
    }
    let _ = child.wait();
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

/// Terminates the worker's process group.
#[cfg(unix)]
fn terminate(pid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: kill(2) with a negative pid signals the process group; no memory is touched.
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Terminates the worker and its children.
#[cfg(windows)]
fn terminate(pid: u32) -> std::io::Result<()> {
    let status = Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if !status.success() {
        return Err(std::io::Error::other(format!("taskkill exited with {status}")));
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod supervisor_tests {
    use super::*;
    use crate::record::CaseKind;
    use tempfile::tempdir;

    fn target(name: &str) -> String {
        format!("{}/../test_targets/{}", env!("CARGO_MANIFEST_DIR"), name)
    }

    fn supervisor_for(script: &str, store: Arc<CaseStore>) -> Supervisor {
        let mut config = SupervisorConfig::new("sh");
        config.base_args = vec![target(script)];
        Supervisor::new(config, store)
    }

    fn console_lines(rx: &Receiver<SupervisorEvent>) -> Vec<String> {
        rx.try_iter()
            .filter_map(|e| match e {
                SupervisorEvent::Console(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn clean_run_is_success() {
        let store = Arc::new(CaseStore::in_memory());
        let sup = supervisor_for("worker_success.sh", Arc::clone(&store));
        let entry = sup.run(&[], "lenattack").unwrap().wait();

        assert_eq!(entry.status, RunStatus::Success);
        assert_eq!(entry.success_cases.len(), 3);
        assert!(entry.failure_cases.is_empty());
        assert!(store.is_empty());
        assert!(!sup.is_busy());
        assert_eq!(sup.history().len(), 1);
    }

    #[test]
    fn failures_are_stored_and_counted() {
        let store = Arc::new(CaseStore::in_memory());
        let sup = supervisor_for("worker_failures.sh", Arc::clone(&store));
        let rx = sup.events();
        let entry = sup.run(&["0x100".to_string()], "lenattack").unwrap().wait();

        assert_eq!(entry.status, RunStatus::CompletedWithFailures(2));
        assert_eq!(entry.success_cases.len(), 1);
        let stored = store.get(Some("lenattack"));
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].case_details.id.as_deref(), Some("0x101"));
        assert_eq!(stored[0].case_details.error_type.as_deref(), Some("Socket/Bus Error"));
        assert_eq!(stored[1].case_details.error_type.as_deref(), Some("No buffer space available"));
        assert!(stored[0].command.ends_with("worker_failures.sh 0x100"));

        let lines = console_lines(&rx);
        assert!(lines[0].starts_with(">>> [lenattack] START: sh "));
        let finished = "<<< FINISHED (Code: 0) - Status: Completed with 2 failures";
        assert!(lines.iter().any(|l| l == finished));
    }

    #[test]
    fn output_order_is_preserved_across_stdout_and_stderr() {
        let store = Arc::new(CaseStore::in_memory());
        let sup = supervisor_for("worker_interleaved.sh", store);
        let entry = sup.run(&[], "uds").unwrap().wait();
        let lines: Vec<&str> = entry.output.lines().collect();
        assert_eq!(lines, vec!["out 1", "err 2", "out 3", "err 4"]);
    }

    #[test]
    fn nonzero_exit_is_failed_with_code() {
        let store = Arc::new(CaseStore::in_memory());
        let sup = supervisor_for("worker_exit_code.sh", Arc::clone(&store));
        let entry = sup.run(&[], "uds").unwrap().wait();
        assert_eq!(entry.status, RunStatus::Failed(3));
        assert_eq!(store.get(Some("uds")).len(), 1);
        assert_eq!(
            store.get(Some("uds"))[0].case_details.error_type.as_deref(),
            Some("Module Error")
        );
    }

    #[test]
    fn missing_executable_is_execution_error() {
        let store = Arc::new(CaseStore::in_memory());
        let sup = Supervisor::new(
            SupervisorConfig::new("/nonexistent/canfuzz-worker"),
            Arc::clone(&store),
        );
        let entry = sup.run(&["lenattack".to_string()], "lenattack").unwrap().wait();

        assert_eq!(entry.status, RunStatus::Error);
        assert_eq!(entry.failure_cases.len(), 1);
        assert_eq!(entry.failure_cases[0].kind, CaseKind::ExecutionError);
        let stored = store.get(Some("lenattack"));
        assert_eq!(stored.len(), 1);
        assert!(stored[0].output.contains("Failed to spawn command"));
        assert!(!sup.is_busy());
    }

    #[test]
    fn second_run_while_busy_is_rejected() {
        let store = Arc::new(CaseStore::in_memory());
        let sup = supervisor_for("worker_sleep.sh", store);
        let first = sup.run(&[], "lenattack").unwrap();

        match sup.run(&[], "uds") {
            Err(SupervisorError::Busy { module }) => assert_eq!(module, "lenattack"),
            Err(other) => panic!("Expected Busy, got {other:?}"),
            Ok(_) => panic!("Expected Busy, got a second job"),
        }
        assert_eq!(sup.active_module().as_deref(), Some("lenattack"));

        assert!(sup.stop());
        let entry = first.wait();
        assert_eq!(entry.status, RunStatus::Failed(-libc::SIGTERM));
        assert!(!sup.is_busy());
        assert_eq!(sup.history().len(), 1);
    }

    #[test]
    fn stop_when_idle_is_noop() {
        let sup = supervisor_for("worker_success.sh", Arc::new(CaseStore::in_memory()));
        assert!(!sup.stop());
    }

    #[test]
    fn stop_announces_on_console_and_frees_slot() {
        let sup = supervisor_for("worker_sleep.sh", Arc::new(CaseStore::in_memory()));
        let rx = sup.events();
        let handle = sup.run(&[], "lenattack").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !rx.try_iter().any(|e| matches!(&e, SupervisorEvent::Console(l) if l == "sleeping")) {
            assert!(Instant::now() < deadline, "worker never started");
            thread::sleep(Duration::from_millis(10));
        }
        assert!(sup.stop());
        assert!(!sup.is_busy());
        handle.wait();
        assert!(console_lines(&rx).iter().any(|l| l == "[Process Stopped by User]"));
    }

    #[test]
    fn replay_reuses_stored_arguments() {
        let dir = tempdir().unwrap();
        let store = Arc::new(CaseStore::open(dir.path().join("failure_cases.json")));
        let sup = supervisor_for("worker_echo_args.sh", Arc::clone(&store));

        let case = Case::new(CaseKind::Failure, "2025-01-01T00:00:00.1".into(), "[FAIL] x");
        let command = "canfuzz lenattack 0x7 --pattern zeros";
        let record = FailureCaseRecord::from_case("lenattack", command, &case);
        let entry = sup.replay(&record).unwrap().wait();
        assert_eq!(entry.output.trim(), "ARGS: lenattack 0x7 --pattern zeros");

        let unreplayable = FailureCaseRecord::from_case("dcm", "worker", &case);
        assert!(matches!(
            sup.replay(&unreplayable),
            Err(SupervisorError::Unreplayable { .. })
        ));

        let records = [record.clone(), unreplayable, record];
        let entries = sup.replay_all(&records, Duration::from_secs(5));
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.status == RunStatus::Success));
    }

    #[test]
    fn events_report_cases_and_finish() {
        let sup = supervisor_for("worker_failures.sh", Arc::new(CaseStore::in_memory()));
        let rx = sup.events();
        sup.run(&[], "lenattack").unwrap().wait();

        let events: Vec<SupervisorEvent> = rx.try_iter().collect();
        let cases = events
            .iter()
            .filter(|e| matches!(e, SupervisorEvent::Case(_)))
            .count();
        assert_eq!(cases, 3);
        match events.last() {
            Some(SupervisorEvent::RunFinished(entry)) => {
                assert_eq!(entry.status, RunStatus::CompletedWithFailures(2))
            }
            other => panic!("Expected RunFinished last, got {other:?}"),
        }
    }

    fn event_bytes(event: &SupervisorEvent) -> usize {
        match event {
            SupervisorEvent::Console(line) => line.len(),
            SupervisorEvent::Case(case) => {
                case.message.len() + case.details.as_ref().map_or(0, String::len)
            }
            SupervisorEvent::RunUpdated(progress) => {
                progress.module.len() + std::mem::size_of::<RunProgress>()
            }
            SupervisorEvent::RunFinished(entry) => entry.output.len() + entry.command.len(),
        }
    }

    #[test]
    fn queued_events_stay_proportional_to_output() {
        let sup = supervisor_for("worker_many_lines.sh", Arc::new(CaseStore::in_memory()));
        let rx = sup.events();
        let entry = sup.run(&["4000".to_string()], "lenattack").unwrap().wait();
        assert_eq!(entry.success_cases.len(), 4000);

        let events: Vec<SupervisorEvent> = rx.try_iter().collect();
        let updates = events
            .iter()
            .filter(|e| matches!(e, SupervisorEvent::RunUpdated(_)))
            .count();
        assert_eq!(updates, 4001);
        match events.last() {
            Some(SupervisorEvent::RunFinished(finished)) => {
                assert_eq!(finished.success_cases.len(), 4000)
            }
            other => panic!("Expected RunFinished last, got {other:?}"),
        }

        let queued: usize = events.iter().map(event_bytes).sum();
        let output = entry.output.len();
        assert!(
            queued < output * 8,
            "queued {queued} bytes of events for {output} bytes of output"
        );
    }

    #[test]
    fn dropped_receivers_are_unsubscribed() {
        let sup = supervisor_for("worker_success.sh", Arc::new(CaseStore::in_memory()));
        sup.run(&[], "lenattack").unwrap().wait();
        assert_eq!(sup.events.len(), 0);

        let kept = sup.events();
        drop(sup.events());
        assert_eq!(sup.events.len(), 2);
        sup.run(&[], "lenattack").unwrap().wait();
        assert_eq!(sup.events.len(), 1);

        let progress: Vec<RunProgress> = kept
            .try_iter()
            .filter_map(|e| match e {
                SupervisorEvent::RunUpdated(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(progress.first().map(|p| p.status), Some(RunStatus::Running));
        assert_eq!(progress.last().map(|p| p.success_cases), Some(3));
    }

    #[test]
    fn aborted_worker_takes_its_children_down() {
        let mut config = SupervisorConfig::new("sh");
        config.base_args = vec![target("worker_with_child.sh")];
        let (mut child, reader) = launch(&config, &[]).unwrap();
        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).unwrap();
        let background: libc::pid_t = line
            .trim()
            .strip_prefix("child ")
            .and_then(|pid| pid.parse().ok())
            .unwrap_or_else(|| panic!("Expected a child pid line, got {line:?}"));

        let pid = child.id();
        abort_worker(&mut child, pid);

        let deadline = Instant::now() + Duration::from_secs(5);
        // SAFETY: signal 0 only checks that the process exists.
        while unsafe { libc::kill(background, 0) } == 0 {
            assert!(Instant::now() < deadline, "background child {background} survived");
            thread::sleep(Duration::from_millis(20));
        }
    }
}
