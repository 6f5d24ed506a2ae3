//! Permission-gate backend: mount-wide fanotify marks, with the mandatory
//! synchronous allow protocol and a signal-driven mark-table flush.

mod gate;
mod wire;

pub use gate::decode_batch;
pub use wire::{
    FAN_ALLOW, FAN_DENY, FAN_NOFD, FanotifyMask, GateRecord, METADATA_LEN, MIN_VERSION,
    RESPONSE_LEN, encode_response, parse_metadata,
};

use crate::backend::{Backend, StopHandle};
use crate::error::MonitorError;
use crate::event::FileSystemEvent;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Set from the SIGUSR1 handler, consumed at the top of each read
/// iteration. The flush syscall itself never runs in signal context.
static FLUSH_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Ask the backend to flush and re-evaluate its kernel mark table before
/// the next read, picking up files created since the marks were installed.
pub fn request_mark_flush() {
    FLUSH_REQUESTED.store(true, Ordering::SeqCst);
}

fn take_flush_request() -> bool {
    FLUSH_REQUESTED.swap(false, Ordering::SeqCst)
}

pub struct FanotifyBackend {
    stop: StopHandle,
    root: PathBuf,
}

impl Default for FanotifyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FanotifyBackend {
    pub fn new() -> Self {
        FanotifyBackend {
            stop: StopHandle::new(),
            root: PathBuf::from("/"),
        }
    }

    /// Everything we register interest in: the informational classes plus
    /// their permission-checking counterparts, on directories and children.
    fn event_mask() -> FanotifyMask {
        FanotifyMask::OPEN
            | FanotifyMask::CLOSE_WRITE
            | FanotifyMask::CLOSE_NOWRITE
            | FanotifyMask::ACCESS
            | FanotifyMask::MODIFY
            | FanotifyMask::OPEN_PERM
            | FanotifyMask::ACCESS_PERM
            | FanotifyMask::ONDIR
            | FanotifyMask::EVENT_ON_CHILD
    }
}

impl Backend for FanotifyBackend {
    fn name(&self) -> &'static str {
        "fanotify"
    }

    #[cfg(target_os = "linux")]
    fn begin(&mut self, root: Option<&Path>) -> Result<(), MonitorError> {
        self.root = root.unwrap_or(Path::new("/")).to_path_buf();
        sys::install_usr1_handler()
            .map_err(|err| MonitorError::setup("sigaction(SIGUSR1)", err))?;

        let mask = Self::event_mask();
        let class = if mask.is_permission() {
            libc::FAN_CLASS_CONTENT
        } else {
            libc::FAN_CLASS_NOTIF
        };
        let fd = unsafe { libc::fanotify_init(class, libc::O_RDONLY as u32) };
        if fd < 0 {
            return Err(MonitorError::last_os("fanotify_init"));
        }
        if let Err(err) = sys::mark_add_mount(fd, &self.root, mask.bits()) {
            unsafe { libc::close(fd) };
            return Err(MonitorError::setup("fanotify_mark", err));
        }
        self.stop.reset();
        self.stop.set_fd(fd);
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn begin(&mut self, _root: Option<&Path>) -> Result<(), MonitorError> {
        Err(MonitorError::Unsupported("fanotify"))
    }

    #[cfg(target_os = "linux")]
    fn run(
        &mut self,
        cb: &mut dyn FnMut(&FileSystemEvent) -> bool,
    ) -> Result<(), MonitorError> {
        let mut buf = vec![0u8; 4096];
        while self.stop.is_running() {
            let fd = self.stop.fd();
            if fd < 0 {
                break;
            }
            if take_flush_request() {
                sys::mark_flush(fd);
            }
            match sys::wait_readable(fd) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if !self.stop.is_running() {
                        break;
                    }
                    return Err(MonitorError::Read(err));
                }
            }
            match sys::read_fd(fd, &mut buf) {
                Ok(0) => {
                    return Err(MonitorError::Read(std::io::Error::from(
                        std::io::ErrorKind::UnexpectedEof,
                    )));
                }
                Ok(n) => {
                    let mut responses = sys::FdWriter(fd);
                    let mut resolve = |event_fd: i32| {
                        std::fs::read_link(format!("/proc/self/fd/{event_fd}")).ok()
                    };
                    let mut dispose = |event_fd: i32| {
                        unsafe { libc::close(event_fd) };
                    };
                    decode_batch(&buf[..n], &mut responses, &mut resolve, &mut dispose, cb)
                        .map_err(MonitorError::Read)?;
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if !self.stop.is_running() {
                        break;
                    }
                    return Err(MonitorError::Read(err));
                }
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn run(
        &mut self,
        _cb: &mut dyn FnMut(&FileSystemEvent) -> bool,
    ) -> Result<(), MonitorError> {
        Err(MonitorError::Unsupported("fanotify"))
    }

    fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn end(&mut self) -> bool {
        let fd = self.stop.take_fd();
        let released = fd >= 0;
        if released {
            unsafe { libc::close(fd) };
        }
        released
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::ffi::CString;
    use std::io;
    use std::os::fd::{BorrowedFd, RawFd};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    extern "C" fn usr1_handler(_sig: libc::c_int) {
        super::FLUSH_REQUESTED.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn install_usr1_handler() -> io::Result<()> {
        use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
        let action = SigAction::new(
            SigHandler::Handler(usr1_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGUSR1, &action) }
            .map(|_| ())
            .map_err(io::Error::from)
    }

    pub fn mark_add_mount(fd: RawFd, root: &Path, mask: u64) -> io::Result<()> {
        let cpath = CString::new(root.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let rc = unsafe {
            libc::fanotify_mark(
                fd,
                libc::FAN_MARK_ADD | libc::FAN_MARK_MOUNT,
                mask,
                libc::AT_FDCWD,
                cpath.as_ptr(),
            )
        };
        if rc != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn mark_flush(fd: RawFd) {
        unsafe {
            libc::fanotify_mark(fd, libc::FAN_MARK_FLUSH, 0, libc::AT_FDCWD, std::ptr::null());
        }
    }

    /// Select-style wait for the gate descriptor to become readable.
    pub fn wait_readable(fd: RawFd) -> io::Result<()> {
        use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::NONE)
            .map(|_| ())
            .map_err(io::Error::from)
    }

    pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub struct FdWriter(pub RawFd);

    impl io::Write for FdWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = unsafe { libc::write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
