//! Socket observer that prints a timestamp for every block written or read.
//!
//! On Linux the observer tries to enable kernel software TX timestamps
//! (SO_TIMESTAMPING) and drains them from the socket error queue after each
//! write. RX timestamps are always taken in user space; kernel RX
//! timestamps are not meaningful for TCP. If the error queue yields nothing
//! within three seconds, the observer falls back to user-space timestamps
//! for all subsequent writes.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use cfg_if::cfg_if;
use tlsprobe_tooling::logging::{LogLevel, Logger};
use tlsprobe_tooling::trace_line;

use crate::network::tcp::{SocketObserver, TcpConnection};

const CATEGORY: &str = "Network";
const ERRQUEUE_BOUND: Duration = Duration::from_secs(3);

pub struct TimestampObserver {
    logger: Logger,
    #[cfg(target_os = "linux")]
    fd: Option<std::os::unix::io::RawFd>,
    use_so_timestamping: bool,
}

fn user_space_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

cfg_if! {
    if #[cfg(target_os = "linux")] {
        use std::os::unix::io::RawFd;

        #[repr(C)]
        struct ScmTimestamping {
            ts: [libc::timespec; 3],
        }

        fn enable_so_timestamping(fd: RawFd, logger: &Logger) -> bool {
            let flags: libc::c_int = (libc::SOF_TIMESTAMPING_TX_SOFTWARE
                | libc::SOF_TIMESTAMPING_SOFTWARE
                | libc::SOF_TIMESTAMPING_OPT_TSONLY) as libc::c_int;
            let result = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_TIMESTAMPING,
                    &flags as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if result < 0 {
                trace_line!(
                    logger,
                    LogLevel::High,
                    CATEGORY,
                    "setsockopt with SO_TIMESTAMPING failed: {}",
                    std::io::Error::last_os_error()
                );
                return false;
            }
            let mut actual: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            let result = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_TIMESTAMPING,
                    &mut actual as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };
            if result < 0 {
                trace_line!(
                    logger,
                    LogLevel::High,
                    CATEGORY,
                    "getsockopt with SO_TIMESTAMPING failed: {}",
                    std::io::Error::last_os_error()
                );
                false
            } else if actual != flags {
                trace_line!(
                    logger,
                    LogLevel::High,
                    CATEGORY,
                    "Expected SO_TIMESTAMPING flags equal {}, actual SO_TIMESTAMPING flags equal {}.",
                    flags,
                    actual
                );
                false
            } else {
                true
            }
        }

        /// Drain one TX timestamp from the error queue. `Ok(Some(ns))` on a
        /// kernel timestamp, `Ok(None)` on a bounded-wait expiry (caller
        /// falls back permanently), `Err` on a hard recvmsg failure.
        fn read_tx_timestamp(fd: RawFd) -> Result<Option<u128>, std::io::Error> {
            let mut control = [0u8; 512];
            let deadline = Instant::now() + ERRQUEUE_BOUND;
            loop {
                let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
                msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
                msg.msg_controllen = control.len();
                let received = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE) };
                if received < 0 {
                    let error = std::io::Error::last_os_error();
                    match error.raw_os_error() {
                        Some(libc::EAGAIN) => {
                            if Instant::now() > deadline {
                                return Ok(None);
                            }
                        }
                        _ => return Err(error),
                    }
                    continue;
                }
                let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
                while !cmsg.is_null() {
                    let header = unsafe { &*cmsg };
                    if header.cmsg_level == libc::SOL_SOCKET
                        && header.cmsg_type == libc::SCM_TIMESTAMPING
                    {
                        let data = unsafe {
                            &*(libc::CMSG_DATA(cmsg) as *const ScmTimestamping)
                        };
                        // ts[0] carries the software timestamp.
                        let seconds = data.ts[0].tv_sec as u128;
                        let nanos = data.ts[0].tv_nsec as u128;
                        return Ok(Some(seconds * 1_000_000_000 + nanos));
                    }
                    cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
                }
                // Error-queue message without a timestamp; keep draining.
                if Instant::now() > deadline {
                    return Ok(None);
                }
            }
        }
    }
}

impl TimestampObserver {
    pub fn new(socket: &TcpConnection, logger: Logger) -> TimestampObserver {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                let fd = socket.raw_fd();
                let use_so_timestamping = match fd {
                    Some(fd) => enable_so_timestamping(fd, &logger),
                    None => false,
                };
                let observer = TimestampObserver { logger, fd, use_so_timestamping };
            } else {
                let _ = socket;
                let observer = TimestampObserver { logger, use_so_timestamping: false };
            }
        }
        if observer.use_so_timestamping {
            trace_line!(
                observer.logger,
                LogLevel::High,
                CATEGORY,
                "Create timestamps with SO_TIMESTAMPING (TX) and the system clock (RX)."
            );
        } else {
            trace_line!(
                observer.logger,
                LogLevel::High,
                CATEGORY,
                "Create timestamps with the system clock."
            );
        }
        observer
    }

    fn log_write_timestamp_fallback(&self) {
        trace_line!(
            self.logger,
            LogLevel::High,
            CATEGORY,
            "Write.timestamp={}",
            user_space_nanos()
        );
    }
}

impl SocketObserver for TimestampObserver {
    fn on_block_written(&mut self, length: usize) {
        trace_line!(self.logger, LogLevel::High, CATEGORY, "Write.size={}", length);
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                if self.use_so_timestamping {
                    if let Some(fd) = self.fd {
                        match read_tx_timestamp(fd) {
                            Ok(Some(nanos)) => {
                                trace_line!(
                                    self.logger,
                                    LogLevel::High,
                                    CATEGORY,
                                    "Write.timestamp={}",
                                    nanos
                                );
                                return;
                            }
                            Ok(None) => {
                                trace_line!(
                                    self.logger,
                                    LogLevel::High,
                                    CATEGORY,
                                    "SO_TIMESTAMPING (TX) failed. Falling back to the system clock."
                                );
                                self.use_so_timestamping = false;
                            }
                            Err(error) => {
                                trace_line!(
                                    self.logger,
                                    LogLevel::High,
                                    CATEGORY,
                                    "recvmsg failed: {}",
                                    error
                                );
                            }
                        }
                    }
                }
            }
        }
        self.log_write_timestamp_fallback();
    }

    fn on_block_read(&mut self, length: usize) {
        trace_line!(self.logger, LogLevel::High, CATEGORY, "Read.size={}", length);
        trace_line!(
            self.logger,
            LogLevel::High,
            CATEGORY,
            "Read.timestamp={}",
            user_space_nanos()
        );
    }
}
