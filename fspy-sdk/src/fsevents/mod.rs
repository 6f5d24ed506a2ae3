//! Raw fsevents device backend: clones /dev/fsevents, asks for extended
//! per-event info, and feeds the byte stream through the assembler.

mod parser;
mod wire;

pub use parser::EventAssembler;
pub use wire::{
    ARG_HEADER_LEN, EVENT_HEADER_LEN, FSE_ARG_DEV, FSE_ARG_DONE, FSE_ARG_GID, FSE_ARG_INO,
    FSE_ARG_INT64, FSE_ARG_MODE, FSE_ARG_STRING, FSE_ARG_UID, FSE_CHOWN, FSE_CONTENT_MODIFIED,
    FSE_CREATE_DIR, FSE_CREATE_FILE, FSE_DELETE, FSE_EVENTS_DROPPED, FSE_EXCHANGE,
    FSE_MAX_EVENTS, FSE_RENAME, FSE_STAT_CHANGED, RESYNC_MARKER, kind_of, split_dev,
};

use crate::backend::{Backend, StopHandle};
use crate::error::MonitorError;
use crate::event::FileSystemEvent;
use std::io;
use std::path::Path;

pub struct FseventsBackend {
    assembler: EventAssembler,
    stop: StopHandle,
}

impl Default for FseventsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FseventsBackend {
    pub fn new() -> Self {
        FseventsBackend {
            assembler: EventAssembler::new(),
            stop: StopHandle::new(),
        }
    }

    pub fn assembler_mut(&mut self) -> &mut EventAssembler {
        &mut self.assembler
    }
}

impl Backend for FseventsBackend {
    fn name(&self) -> &'static str {
        "fsevents"
    }

    /// The device reports the whole filesystem; `root` scoping happens in
    /// the caller's filter callback.
    #[cfg(target_os = "macos")]
    fn begin(&mut self, _root: Option<&Path>) -> Result<(), MonitorError> {
        let fd = sys::open_cloned_device()
            .map_err(|err| MonitorError::setup("open /dev/fsevents", err))?;
        self.stop.reset();
        self.stop.set_fd(fd);
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    fn begin(&mut self, _root: Option<&Path>) -> Result<(), MonitorError> {
        Err(MonitorError::Unsupported("fsevents"))
    }

    #[cfg(target_os = "macos")]
    fn run(
        &mut self,
        cb: &mut dyn FnMut(&FileSystemEvent) -> bool,
    ) -> Result<(), MonitorError> {
        let mut buf = vec![0u8; 64 * 1024];
        while self.stop.is_running() {
            let fd = self.stop.fd();
            if fd < 0 {
                break;
            }
            match sys::read_fd(fd, &mut buf) {
                Ok(0) => {
                    return Err(MonitorError::Read(io::Error::from(
                        io::ErrorKind::UnexpectedEof,
                    )));
                }
                Ok(n) => self.assembler.feed(&buf[..n], cb),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
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

    #[cfg(not(target_os = "macos"))]
    fn run(
        &mut self,
        _cb: &mut dyn FnMut(&FileSystemEvent) -> bool,
    ) -> Result<(), MonitorError> {
        Err(MonitorError::Unsupported("fsevents"))
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
        self.assembler = EventAssembler::new();
        released
    }
}

#[cfg(target_os = "macos")]
mod sys {
    use super::wire::FSE_MAX_EVENTS;
    use std::io;
    use std::os::fd::RawFd;

    const FM_DEV: &str = "/dev/fsevents\0";

    /// ioctl selectors from the fsevents headers.
    const FSEVENTS_CLONE: libc::c_ulong = 0x8018_7301; // _IOW('s', 1, fsevent_clone_args)
    const FSEVENTS_WANT_EXTENDED_INFO: libc::c_ulong = 0x2000_7366; // _IO('s', 102)

    /// Ask the kernel to report (not gate) every event type.
    const FSE_REPORT: i8 = 1;

    #[repr(C)]
    struct FseventCloneArgs {
        event_list: *mut i8,
        num_events: i32,
        event_queue_depth: i32,
        fd: *mut i32,
    }

    pub fn open_cloned_device() -> io::Result<RawFd> {
        let fd = unsafe { libc::open(FM_DEV.as_ptr() as *const libc::c_char, libc::O_RDONLY) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut events = [FSE_REPORT; FSE_MAX_EVENTS];
        let mut cloned_fd: i32 = -1;
        let mut clone_args = FseventCloneArgs {
            event_list: events.as_mut_ptr(),
            num_events: FSE_MAX_EVENTS as i32,
            event_queue_depth: 10,
            fd: &mut cloned_fd,
        };
        let rc = unsafe { libc::ioctl(fd, FSEVENTS_CLONE, &mut clone_args as *mut FseventCloneArgs) };
        unsafe { libc::close(fd) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = unsafe { libc::ioctl(cloned_fd, FSEVENTS_WANT_EXTENDED_INFO) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(cloned_fd) };
            return Err(err);
        }
        Ok(cloned_fd)
    }

    pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}
