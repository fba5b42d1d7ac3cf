//! Raw SocketCAN driver (Linux only).
//!
//! Talks to the kernel directly through `libc`; the structs below mirror
//! `struct sockaddr_can` and `struct can_frame` from `<linux/can.h>`.

use crate::bus::{BusError, BusOpenError, CanBus};
use crate::frame::{CLASSIC_MAX_DLEN, CanFrame};
use chrono::Local;
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const CAN_RAW: libc::c_int = 1;
const CAN_EFF_FLAG: u32 = 0x8000_0000;
const CAN_RTR_FLAG: u32 = 0x4000_0000;
const CAN_ERR_FLAG: u32 = 0x2000_0000;
const CAN_SFF_MASK: u32 = 0x0000_07FF;
const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

#[repr(C)]
struct SockAddrCan {
    can_family: libc::sa_family_t,
    can_ifindex: libc::c_int,
    can_addr: [u64; 2],
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
#[allow(dead_code)]
struct RawCanFrame {
    can_id: u32,
    len: u8,
    pad: u8,
    res0: u8,
    len8_dlc: u8,
    data: [u8; CLASSIC_MAX_DLEN],
}

pub struct SocketCanBus {
    channel: String,
    fd: OwnedFd,
    closed: AtomicBool,
}

impl SocketCanBus {
    pub fn open(channel: &str) -> Result<Self, BusOpenError> {
        let os_err = |source: io::Error| BusOpenError::Os {
            channel: channel.to_string(),
            source,
        };

        let name = CString::new(channel)
            .map_err(|e| os_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return Err(BusOpenError::InterfaceMissing {
                channel: channel.to_string(),
            });
        }

        // SAFETY: plain socket(2) call; the result is checked before use.
        let raw_fd =
            unsafe { libc::socket(libc::PF_CAN, libc::SOCK_RAW | libc::SOCK_CLOEXEC, CAN_RAW) };
        if raw_fd < 0 {
            return Err(os_err(io::Error::last_os_error()));
        }
        // SAFETY: `raw_fd` was just returned by socket(2) and is owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        let addr = SockAddrCan {
            can_family: libc::AF_CAN as libc::sa_family_t,
            can_ifindex: ifindex as libc::c_int,
            can_addr: [0; 2],
        };
        // SAFETY: `addr` is a properly laid out sockaddr_can and the length matches it.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const SockAddrCan as *const libc::sockaddr,
                mem::size_of::<SockAddrCan>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENODEV) => BusOpenError::InterfaceMissing {
                    channel: channel.to_string(),
                },
                Some(libc::ENETDOWN) => BusOpenError::InterfaceDown {
                    channel: channel.to_string(),
                },
                _ => os_err(err),
            });
        }

        Ok(Self {
            channel: channel.to_string(),
            fd,
            closed: AtomicBool::new(false),
        })
    }

    fn set_recv_timeout(&self, timeout: Duration) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        // SAFETY: `tv` outlives the call and the option length matches its type.
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn to_raw(frame: &CanFrame) -> RawCanFrame {
    let can_id = if frame.is_extended {
        (frame.arbitration_id & CAN_EFF_MASK) | CAN_EFF_FLAG
    } else {
        frame.arbitration_id & CAN_SFF_MASK
    };
    // The advertised DLC goes on the wire; a shorter payload is zero padded.
    let mut data = [0u8; CLASSIC_MAX_DLEN];
    let n = frame.data.len().min(CLASSIC_MAX_DLEN);
    data[..n].copy_from_slice(&frame.data[..n]);
    RawCanFrame {
        can_id,
        len: frame.dlc.min(CLASSIC_MAX_DLEN as u8),
        data,
        ..RawCanFrame::default()
    }
}

fn from_raw(raw: &RawCanFrame) -> CanFrame {
    let is_extended = raw.can_id & CAN_EFF_FLAG != 0;
    let arbitration_id = if is_extended {
        raw.can_id & CAN_EFF_MASK
    } else {
        raw.can_id & CAN_SFF_MASK
    };
    let len = usize::from(raw.len).min(CLASSIC_MAX_DLEN);
    let data = if raw.can_id & (CAN_RTR_FLAG | CAN_ERR_FLAG) == CAN_RTR_FLAG {
        Vec::new()
    } else {
        raw.data[..len].to_vec()
    };
    CanFrame {
        arbitration_id,
        dlc: len as u8,
        data,
        is_extended,
        timestamp: Local::now(),
    }
}

impl CanBus for SocketCanBus {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn send(&self, frame: &CanFrame) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let raw = to_raw(frame);
        let size = mem::size_of::<RawCanFrame>();
        // SAFETY: `raw` is a plain repr(C) value of exactly `size` bytes.
        let written = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &raw as *const RawCanFrame as *const libc::c_void,
                size,
            )
        };
        if written < 0 {
            return Err(BusError::Send(io::Error::last_os_error().to_string()));
        }
        if written as usize != size {
            return Err(BusError::Send(format!("short write of {written} bytes")));
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        // A zero timeval means "block forever" to the kernel.
        let timeout = timeout.max(Duration::from_micros(1));
        self.set_recv_timeout(timeout)
            .map_err(|e| BusError::Recv(e.to_string()))?;

        let mut raw = RawCanFrame::default();
        let size = mem::size_of::<RawCanFrame>();
        // SAFETY: `raw` is a writable buffer of exactly `size` bytes.
        let read = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut raw as *mut RawCanFrame as *mut libc::c_void,
                size,
            )
        };
        if read < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock
                | io::ErrorKind::TimedOut
                | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(BusError::Recv(err.to_string())),
            };
        }
        if (read as usize) < size {
            return Err(BusError::Recv(format!("short read of {read} bytes")));
        }
        Ok(Some(from_raw(&raw)))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_layout_matches_kernel_abi() {
        assert_eq!(mem::size_of::<RawCanFrame>(), 16);
        assert_eq!(mem::size_of::<SockAddrCan>(), 24);
    }

    #[test]
    fn standard_frame_round_trips_through_raw() {
        let frame = CanFrame::new(0x123, 3, &[1, 2, 3]);
        let raw = to_raw(&frame);
        assert_eq!(raw.can_id, 0x123);
        assert_eq!(raw.len, 3);
        let back = from_raw(&raw);
        assert_eq!(back.arbitration_id, 0x123);
        assert_eq!(back.data, vec![1, 2, 3]);
        assert!(!back.is_extended);
    }

    #[test]
    fn mismatched_frame_advertises_dlc_with_padding() {
        let frame = CanFrame::new(0x100, 6, &[0xAA, 0xBB]);
        let raw = to_raw(&frame);
        assert_eq!(raw.len, 6);
        assert_eq!(&raw.data[..6], &[0xAA, 0xBB, 0, 0, 0, 0]);
    }

    #[test]
    fn extended_ids_set_eff_flag() {
        let frame = CanFrame::new(0x18DA_F110, 8, &[0; 8]);
        let raw = to_raw(&frame);
        assert_eq!(raw.can_id & CAN_EFF_FLAG, CAN_EFF_FLAG);
        let back = from_raw(&raw);
        assert_eq!(back.arbitration_id, 0x18DA_F110);
        assert!(back.is_extended);
    }

    #[test]
    fn opening_missing_interface_reports_remediation() {
        match SocketCanBus::open("nonexistent-can-if") {
            Err(BusOpenError::InterfaceMissing { channel }) => {
                assert_eq!(channel, "nonexistent-can-if")
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("interface should not exist"),
        }
    }
}
