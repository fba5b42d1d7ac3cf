use crate::bus::{BusError, CanBus};
use crate::frame::CanFrame;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long one receive call may block before the stop flag is checked again.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(200);
/// How long `stop` waits for the receive loop before abandoning it.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of stopping a [`Listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerShutdown {
    /// The loop observed the stop flag and exited; carries the frame count.
    Joined(u64),
    /// The loop did not exit within the wait and was left running detached.
    Abandoned,
}

/// Background receiver that reports every frame seen on a bus.
///
/// The loop polls with a bounded timeout and checks a cancellation flag
/// between polls, so a stop request is honoured within one poll period.
pub struct Listener {
    stop: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    pub fn spawn<F>(
        bus: Arc<dyn CanBus>,
        poll_timeout: Duration,
        mut on_frame: F,
    ) -> std::io::Result<Self>
    where
        F: FnMut(&CanFrame) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));
        let loop_stop = Arc::clone(&stop);
        let loop_frames = Arc::clone(&frames);

        let handle = thread::Builder::new()
            .name("canfuzz-listener".to_string())
            .spawn(move || {
                debug!(channel = bus.channel(), "listener started");
                while !loop_stop.load(Ordering::SeqCst) {
                    match bus.recv(poll_timeout) {
                        Ok(Some(frame)) => {
                            loop_frames.fetch_add(1, Ordering::Relaxed);
                            on_frame(&frame);
                        }
                        Ok(None) => {}
                        Err(BusError::Closed) => break,
                        Err(e) => {
                            debug!(error = %e, "listener receive failed");
                            thread::sleep(poll_timeout);
                        }
                    }
                }
                debug!(channel = bus.channel(), "listener stopped");
            })?;

        Ok(Self {
            stop,
            frames,
            handle: Some(handle),
        })
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the loop to stop and waits up to `wait` for it to exit.
    pub fn stop(mut self, wait: Duration) -> ListenerShutdown {
        self.stop.store(true, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return ListenerShutdown::Joined(self.frames_seen());
        };

        let deadline = Instant::now() + wait;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("listener did not stop in time, abandoning it");
                return ListenerShutdown::Abandoned;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if handle.join().is_err() {
            warn!("listener thread panicked");
        }
        ListenerShutdown::Joined(self.frames_seen())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Hit counts per arbitration id, in first-seen order.
#[derive(Debug, Default, Clone)]
pub struct ArbIdCounter {
    hits: IndexMap<u32, u64>,
}

impl ArbIdCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one frame. Returns true when the id had not been seen before.
    pub fn record(&mut self, arbitration_id: u32) -> bool {
        let entry = self.hits.entry(arbitration_id).or_insert(0);
        *entry += 1;
        *entry == 1
    }

    pub fn unique(&self) -> usize {
        self.hits.len()
    }

    pub fn hits(&self, arbitration_id: u32) -> u64 {
        self.hits.get(&arbitration_id).copied().unwrap_or(0)
    }

    /// Ids ordered by hit count, ascending unless `reverse`. Ties keep first-seen order.
    pub fn sorted(&self, reverse: bool) -> Vec<(u32, u64)> {
        let mut entries: Vec<(u32, u64)> = self.hits.iter().map(|(id, n)| (*id, *n)).collect();
        if reverse {
            entries.sort_by_key(|(_, n)| std::cmp::Reverse(*n));
        } else {
            entries.sort_by_key(|(_, n)| *n);
        }
        entries
    }

    /// Progress line printed when a new id shows up.
    pub fn progress_line(arbitration_id: u32, unique: usize) -> String {
        format!("Last ID: 0x{arbitration_id:08x} ({unique} unique arbitration IDs found)")
    }

    /// Final report lines, one per id.
    pub fn report(&self, reverse: bool) -> Vec<String> {
        if self.hits.is_empty() {
            return vec!["No arbitration IDs were detected.".to_string()];
        }
        let mut lines = vec!["Detected arbitration IDs:".to_string()];
        lines.extend(
            self.sorted(reverse)
                .into_iter()
                .map(|(id, n)| format!("Arb id 0x{id:08x} {n} hits")),
        );
        lines
    }
}

/// Counts arbitration ids on `bus` until `cancel` is raised.
///
/// `on_new_id` is called with the id and the unique count each time an id
/// is seen for the first time.
pub fn count_arbitration_ids<F>(
    bus: Arc<dyn CanBus>,
    poll_timeout: Duration,
    cancel: &AtomicBool,
    mut on_new_id: F,
) -> std::io::Result<ArbIdCounter>
where
    F: FnMut(u32, usize) + Send + 'static,
{
    let counter = Arc::new(Mutex::new(ArbIdCounter::new()));
    let loop_counter = Arc::clone(&counter);
    let listener = Listener::spawn(bus, poll_timeout, move |frame| {
        let mut counter = loop_counter.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if counter.record(frame.arbitration_id) {
            let unique = counter.unique();
            drop(counter);
            on_new_id(frame.arbitration_id, unique);
        }
    })?;

    while !cancel.load(Ordering::SeqCst) && listener.is_running() {
        thread::sleep(poll_timeout.min(Duration::from_millis(50)));
    }
    listener.stop(DEFAULT_JOIN_TIMEOUT);

    let counter = counter.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    Ok(counter.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::VirtualHub;

    #[test]
    fn listener_reports_frames_and_stops_promptly() {
        let hub = VirtualHub::new("vcan-test");
        let sender = hub.endpoint();
        let receiver: Arc<dyn CanBus> = Arc::new(hub.endpoint());

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let listener = Listener::spawn(receiver, Duration::from_millis(20), move |frame| {
            sink.lock().unwrap().push(frame.recv_line());
        })
        .unwrap();

        sender.send(&CanFrame::new(0x321, 2, &[0xAB, 0xCD])).unwrap();
        sender.send(&CanFrame::new(0x322, 0, &[])).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while listener.frames_seen() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(listener.is_running());

        let started = Instant::now();
        assert_eq!(listener.stop(Duration::from_secs(1)), ListenerShutdown::Joined(2));
        assert!(started.elapsed() < Duration::from_millis(500));

        let lines = lines.lock().unwrap();
        assert_eq!(lines[0], "[RECV] ID=0x321 DLC=2 LEN=2 FD=false DATA=abcd");
        assert_eq!(lines[1], "[RECV] ID=0x322 DLC=0 LEN=0 FD=false DATA=");
    }

    #[test]
    fn listener_exits_when_bus_closes() {
        let hub = VirtualHub::new("vcan-test");
        let bus = Arc::new(hub.endpoint());
        let listener = Listener::spawn(bus.clone(), Duration::from_millis(10), |_| {}).unwrap();
        bus.close();

        let deadline = Instant::now() + Duration::from_secs(1);
        while listener.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!listener.is_running());
        assert_eq!(listener.stop(Duration::from_millis(10)), ListenerShutdown::Joined(0));
    }

    struct StuckBus;

    impl CanBus for StuckBus {
        fn channel(&self) -> &str {
            "stuck"
        }
        fn send(&self, _frame: &CanFrame) -> Result<(), BusError> {
            Ok(())
        }
        fn recv(&self, _timeout: Duration) -> Result<Option<CanFrame>, BusError> {
            thread::sleep(Duration::from_millis(400));
            Ok(None)
        }
        fn close(&self) {}
    }

    #[test]
    fn slow_listener_is_abandoned_after_bounded_wait() {
        let listener =
            Listener::spawn(Arc::new(StuckBus), Duration::from_millis(10), |_| {}).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(listener.stop(Duration::from_millis(50)), ListenerShutdown::Abandoned);
    }

    #[test]
    fn counter_reports_by_hits_with_stable_ties() {
        let mut counter = ArbIdCounter::new();
        for id in [0x200, 0x100, 0x200, 0x300, 0x200, 0x100] {
            counter.record(id);
        }
        assert_eq!(counter.unique(), 3);
        assert_eq!(counter.hits(0x200), 3);
        assert!(!counter.record(0x300));
        assert!(counter.record(0x7FF));

        assert_eq!(
            counter.sorted(false),
            vec![(0x7FF, 1), (0x100, 2), (0x300, 2), (0x200, 3)]
        );
        assert_eq!(
            counter.sorted(true),
            vec![(0x200, 3), (0x100, 2), (0x300, 2), (0x7FF, 1)]
        );
        let report = counter.report(true);
        assert_eq!(report[0], "Detected arbitration IDs:");
        assert_eq!(report[1], "Arb id 0x00000200 3 hits");
        assert_eq!(ArbIdCounter::new().report(false), vec!["No arbitration IDs were detected."]);
        assert_eq!(
            ArbIdCounter::progress_line(0x1AB, 4),
            "Last ID: 0x000001ab (4 unique arbitration IDs found)"
        );
    }

    #[test]
    fn counting_stops_on_cancel() {
        let hub = VirtualHub::new("vcan-test");
        let sender = hub.endpoint();
        let bus: Arc<dyn CanBus> = Arc::new(hub.endpoint());
        let cancel = Arc::new(AtomicBool::new(false));
        let announced = Arc::new(Mutex::new(Vec::new()));

        let flag = Arc::clone(&cancel);
        let feeder = thread::spawn(move || {
            for id in [0x10, 0x20, 0x10] {
                sender.send(&CanFrame::new(id, 0, &[])).unwrap();
            }
            thread::sleep(Duration::from_millis(150));
            flag.store(true, Ordering::SeqCst);
        });

        let sink = Arc::clone(&announced);
        let poll = Duration::from_millis(10);
        let counter = count_arbitration_ids(bus, poll, &cancel, move |id, unique| {
            sink.lock().unwrap().push((id, unique));
        })
        .unwrap();
        feeder.join().unwrap();

        assert_eq!(counter.hits(0x10), 2);
        assert_eq!(counter.hits(0x20), 1);
        assert_eq!(*announced.lock().unwrap(), vec![(0x10, 1), (0x20, 2)]);
    }
}
