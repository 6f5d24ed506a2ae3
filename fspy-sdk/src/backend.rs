use crate::error::MonitorError;
use crate::event::FileSystemEvent;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// One kernel notification facility behind a uniform lifecycle.
///
/// `begin` acquires kernel resources and installs the initial watch tree or
/// trace filters, `run` blocks dispatching events into the callback until
/// stopped or a terminal read error, `end` releases everything it finds
/// still held. The callback's return value is a rendering hint for the
/// caller; decoders never consult it.
pub trait Backend {
    fn name(&self) -> &'static str;

    fn begin(&mut self, root: Option<&Path>) -> Result<(), MonitorError>;

    fn run(
        &mut self,
        cb: &mut dyn FnMut(&FileSystemEvent) -> bool,
    ) -> Result<(), MonitorError>;

    /// Handle whose `stop()` may be called from a signal context.
    fn stop_handle(&self) -> StopHandle;

    /// Returns true iff some resource was actually released. Safe to call
    /// twice, or after a `begin` that failed partway.
    fn end(&mut self) -> bool;
}

/// Cloneable stop switch shared with signal handlers. `stop` flips a flag
/// and closes the registered kernel descriptor; it performs no allocation
/// and is idempotent, so it is safe inside a signal handler.
#[derive(Clone)]
pub struct StopHandle {
    inner: Arc<StopState>,
}

struct StopState {
    running: AtomicBool,
    fd: AtomicI32,
}

impl StopHandle {
    pub(crate) fn new() -> Self {
        StopHandle {
            inner: Arc::new(StopState {
                running: AtomicBool::new(true),
                fd: AtomicI32::new(-1),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let fd = self.inner.fd.swap(-1, Ordering::SeqCst);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }

    /// Register the blocking descriptor `stop` should close to interrupt a
    /// read in progress.
    pub(crate) fn set_fd(&self, fd: RawFd) {
        self.inner.fd.store(fd, Ordering::SeqCst);
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.inner.fd.load(Ordering::SeqCst)
    }

    /// Detach and return the descriptor, leaving -1 behind. Used by `end`
    /// so release happens exactly once even if `stop` raced us.
    pub(crate) fn take_fd(&self) -> RawFd {
        self.inner.fd.swap(-1, Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
    }
}

/// The closed set of backends. Selection is a data lookup by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Inotify,
    Fanotify,
    Kdebug,
    Fsevents,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Inotify,
        BackendKind::Fanotify,
        BackendKind::Kdebug,
        BackendKind::Fsevents,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Inotify => "inotify",
            BackendKind::Fanotify => "fanotify",
            BackendKind::Kdebug => "kdebug",
            BackendKind::Fsevents => "fsevents",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// The facility a host gets when none is named: fanotify covers whole
    /// mounts on Linux, the raw fsevents device is the richest source on
    /// macOS.
    pub fn host_default() -> Self {
        if cfg!(target_os = "macos") {
            BackendKind::Fsevents
        } else {
            BackendKind::Fanotify
        }
    }

    pub fn create(self) -> Box<dyn Backend> {
        match self {
            BackendKind::Inotify => Box::new(crate::inotify::InotifyBackend::new()),
            BackendKind::Fanotify => Box::new(crate::fanotify::FanotifyBackend::new()),
            BackendKind::Kdebug => Box::new(crate::kdebug::KdebugBackend::new()),
            BackendKind::Fsevents => Box::new(crate::fsevents::FseventsBackend::new()),
        }
    }
}
