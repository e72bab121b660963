//! OS-level waitable handles, so a host event loop can wait on manager readiness.
//!
//! On Unix a handle is the read end of a non-blocking self-pipe: it is readable while
//! signaled. On Windows it is a manual-reset event object.

use core::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Waitable handle signaled while events are pending
///
/// Cloning yields another reference to the same OS object.
#[derive(Clone)]
pub struct WaitHandle {
    inner: Arc<Signal>,
}

struct Signal {
    signaled: AtomicBool,
    raw: sys::RawSignal,
}

impl fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitHandle")
            .field("signaled", &self.is_set())
            .finish_non_exhaustive()
    }
}

impl WaitHandle {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Signal {
                signaled: AtomicBool::new(false),
                raw: sys::RawSignal::new()?,
            }),
        })
    }

    pub fn is_set(&self) -> bool {
        self.inner.signaled.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self) {
        if !self.inner.signaled.swap(true, Ordering::AcqRel) {
            if let Err(error) = self.inner.raw.notify() {
                warn!(%error, "Failed to signal wait handle");
            }
        }
    }

    pub(crate) fn reset(&self) {
        if self.inner.signaled.swap(false, Ordering::AcqRel) {
            if let Err(error) = self.inner.raw.clear() {
                warn!(%error, "Failed to reset wait handle");
            }
        }
    }

    /// Returns `true` if both values refer to the same OS object.
    pub fn same_as(&self, other: &WaitHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[cfg(windows)]
    pub fn raw(&self) -> windows::Win32::Foundation::HANDLE {
        self.inner.raw.handle()
    }
}

#[cfg(unix)]
impl std::os::fd::AsRawFd for WaitHandle {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.inner.raw.read_fd()
    }
}

#[cfg(unix)]
impl std::os::fd::AsFd for WaitHandle {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.inner.raw.as_fd()
    }
}

#[cfg(unix)]
mod sys {
    use std::io;
    use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

    pub(super) struct RawSignal {
        read: OwnedFd,
        write: OwnedFd,
    }

    impl RawSignal {
        pub(super) fn new() -> io::Result<Self> {
            let mut fds: [libc::c_int; 2] = [-1; 2];

            // SAFETY: `fds` points to an array of two integers, as pipe(2) requires.
            let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };

            if ret != 0 {
                return Err(io::Error::last_os_error());
            }

            // SAFETY: pipe(2) succeeded, so the descriptor is open and owned by no one else.
            let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };

            // SAFETY: Same as above.
            let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };

            set_nonblocking_cloexec(read.as_raw_fd())?;
            set_nonblocking_cloexec(write.as_raw_fd())?;

            Ok(Self { read, write })
        }

        pub(super) fn read_fd(&self) -> RawFd {
            self.read.as_raw_fd()
        }

        pub(super) fn as_fd(&self) -> BorrowedFd<'_> {
            self.read.as_fd()
        }

        pub(super) fn notify(&self) -> io::Result<()> {
            let byte = 1u8;

            // SAFETY: The buffer is valid for reads of one byte and the descriptor is owned by `self`.
            let ret = unsafe { libc::write(self.write.as_raw_fd(), (&raw const byte).cast(), 1) };

            if ret < 0 {
                let error = io::Error::last_os_error();

                // A full pipe is still readable.
                if error.kind() != io::ErrorKind::WouldBlock {
                    return Err(error);
                }
            }

            Ok(())
        }

        pub(super) fn clear(&self) -> io::Result<()> {
            let mut buf = [0u8; 64];

            loop {
                // SAFETY: The buffer is valid for writes of `buf.len()` bytes and the descriptor is owned by `self`.
                let ret = unsafe { libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };

                if ret > 0 {
                    continue;
                }

                if ret == 0 {
                    return Ok(());
                }

                let error = io::Error::last_os_error();

                return match error.kind() {
                    io::ErrorKind::WouldBlock => Ok(()),
                    io::ErrorKind::Interrupted => continue,
                    _ => Err(error),
                };
            }
        }
    }

    fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
        // SAFETY: `fd` is an open descriptor; F_GETFL has no other precondition.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `fd` is an open descriptor and `flags` comes from F_GETFL.
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `fd` is an open descriptor.
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

#[cfg(windows)]
mod sys {
    use std::io;

    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::Threading::{CreateEventW, ResetEvent, SetEvent};

    pub(super) struct RawSignal {
        handle: HANDLE,
    }

    // SAFETY: Event objects can be signaled and reset from any thread.
    unsafe impl Send for RawSignal {}

    // SAFETY: Same as above, every operation goes through the kernel object.
    unsafe impl Sync for RawSignal {}

    impl RawSignal {
        pub(super) fn new() -> io::Result<Self> {
            // SAFETY: No preconditions. Manual-reset, initially non-signaled, unnamed.
            let handle = unsafe { CreateEventW(None, true, false, None) }.map_err(io::Error::from)?;
            Ok(Self { handle })
        }

        pub(super) fn handle(&self) -> HANDLE {
            self.handle
        }

        pub(super) fn notify(&self) -> io::Result<()> {
            // SAFETY: `handle` is a valid event handle owned by `self`.
            unsafe { SetEvent(self.handle) }.map_err(io::Error::from)
        }

        pub(super) fn clear(&self) -> io::Result<()> {
            // SAFETY: `handle` is a valid event handle owned by `self`.
            unsafe { ResetEvent(self.handle) }.map_err(io::Error::from)
        }
    }

    impl Drop for RawSignal {
        fn drop(&mut self) {
            // SAFETY: `handle` is owned by `self` and is not used after this point.
            let _ = unsafe { CloseHandle(self.handle) };
        }
    }
}
