use crate::frame::CanFrame;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while opening a bus. These abort a run before any frame is sent.
#[derive(Error, Debug)]
pub enum BusOpenError {
    /// The named interface does not exist.
    #[error(
        "CAN interface '{channel}' not found. Create it first:\n  sudo modprobe vcan\n  \
         sudo ip link add dev {channel} type vcan\n  sudo ip link set up {channel}"
    )]
    InterfaceMissing { channel: String },

    /// The interface exists but is administratively down.
    #[error(
        "CAN interface '{channel}' is down. Bring it up with:\n  sudo ip link set up {channel}"
    )]
    InterfaceDown { channel: String },

    /// Any other operating system failure while creating or binding the socket.
    #[error("Could not open CAN interface '{channel}': {source}")]
    Os {
        channel: String,
        #[source]
        source: std::io::Error,
    },

    /// The requested bus kind has no driver on this platform.
    #[error("Bus kind '{0}' is not supported on this platform")]
    Unsupported(BusKind),
}

/// Per-frame failures. Callers record these and carry on with the sweep.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Receive failed: {0}")]
    Recv(String),
    #[error("Bus is closed")]
    Closed,
}

/// Which driver backs a bus.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    SocketCan,
    Virtual,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::SocketCan => f.write_str("socketcan"),
            BusKind::Virtual => f.write_str("virtual"),
        }
    }
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "socketcan" => Ok(BusKind::SocketCan),
            "virtual" => Ok(BusKind::Virtual),
            other => Err(format!("unknown bus kind '{other}' (expected socketcan|virtual)")),
        }
    }
}

/// Send/receive access to a CAN interface.
///
/// Implementations take `&self` so one handle can be shared between the
/// sending loop and the listener thread.
pub trait CanBus: Send + Sync {
    fn channel(&self) -> &str;

    /// Sends one frame. Failures are returned, never panicked.
    fn send(&self, frame: &CanFrame) -> Result<(), BusError>;

    /// Waits up to `timeout` for a frame. `Ok(None)` means the wait timed out.
    fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, BusError>;

    /// Releases the interface. Later sends fail with [`BusError::Closed`].
    fn close(&self);
}

/// Opens a bus of the given kind on `channel`.
///
/// A virtual bus opened this way is a fresh hub with a single endpoint;
/// use [`VirtualHub`] directly to wire several endpoints together.
pub fn open(kind: BusKind, channel: &str) -> Result<Arc<dyn CanBus>, BusOpenError> {
    match kind {
        BusKind::Virtual => {
            let hub = VirtualHub::new(channel);
            Ok(Arc::new(hub.endpoint()))
        }
        #[cfg(target_os = "linux")]
        BusKind::SocketCan => {
            let bus = crate::socketcan::SocketCanBus::open(channel)?;
            info!(channel, "opened socketcan interface");
            Ok(Arc::new(bus))
        }
        #[cfg(not(target_os = "linux"))]
        BusKind::SocketCan => Err(BusOpenError::Unsupported(kind)),
    }
}

struct HubInner {
    channel: String,
    next_id: AtomicU64,
    endpoints: Mutex<Vec<(u64, Sender<CanFrame>)>>,
}

/// In-process broadcast medium standing in for a virtual CAN interface.
///
/// Every endpoint receives the frames sent by every other endpoint, the way
/// separate sockets bound to the same vcan device do.
#[derive(Clone)]
pub struct VirtualHub {
    inner: Arc<HubInner>,
}

impl VirtualHub {
    pub fn new(channel: &str) -> Self {
        Self {
            inner: Arc::new(HubInner {
                channel: channel.to_string(),
                next_id: AtomicU64::new(0),
                endpoints: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn endpoint(&self) -> VirtualBus {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        self.inner
            .endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, tx));
        debug!(channel = %self.inner.channel, endpoint = id, "virtual endpoint attached");
        VirtualBus {
            id,
            hub: Arc::clone(&self.inner),
            rx,
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner
            .endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// One attachment point on a [`VirtualHub`].
pub struct VirtualBus {
    id: u64,
    hub: Arc<HubInner>,
    rx: Receiver<CanFrame>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
}

impl VirtualBus {
    /// Makes every following send fail, to simulate a bus-off controller.
    pub fn set_send_failure(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    fn detach(&self) {
        self.hub
            .endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|(id, _)| *id != self.id);
    }
}

impl CanBus for VirtualBus {
    fn channel(&self) -> &str {
        &self.hub.channel
    }

    fn send(&self, frame: &CanFrame) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BusError::Send("simulated bus error".to_string()));
        }
        let endpoints = self
            .hub
            .endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (id, tx) in endpoints.iter() {
            if *id != self.id {
                // A receiver that went away without detaching is not our failure.
                let _ = tx.send(frame.clone());
            }
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(BusError::Closed),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.detach();
        }
    }
}

impl Drop for VirtualBus {
    fn drop(&mut self) {
        self.close();
    }
}
