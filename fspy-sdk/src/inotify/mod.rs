//! Inode-watch backend: recursive directory watches with descriptor→path
//! bookkeeping and moved-from/moved-to cookie pairing.

mod registry;
mod rename;
mod wire;

pub use registry::WatchRegistry;
pub use rename::RenameCorrelator;
pub use wire::{EVENT_HEADER_LEN, InotifyMask, WatchRecord, parse_record};

use crate::backend::{Backend, StopHandle};
use crate::error::MonitorError;
use crate::event::{EventKind, FileSystemEvent};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct InotifyBackend {
    registry: WatchRegistry,
    rename: RenameCorrelator,
    root: PathBuf,
    stop: StopHandle,
}

impl Default for InotifyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InotifyBackend {
    pub fn new() -> Self {
        InotifyBackend {
            registry: WatchRegistry::new(),
            rename: RenameCorrelator::new(),
            root: PathBuf::from("/"),
            stop: StopHandle::new(),
        }
    }

    pub fn registry(&self) -> &WatchRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut WatchRegistry {
        &mut self.registry
    }

    /// Decode one batch of raw records. `add_watch` installs a watch for a
    /// directory observed being created, so nested creation keeps being
    /// monitored without a restart; the driver passes the real syscall, the
    /// tests a fake.
    pub fn decode_buffer<F>(
        &mut self,
        buf: &[u8],
        add_watch: &mut F,
        cb: &mut dyn FnMut(&FileSystemEvent) -> bool,
    ) where
        F: FnMut(&Path) -> io::Result<i32>,
    {
        let mut offset = 0;
        while offset < buf.len() {
            let Some((record, used)) = parse_record(&buf[offset..]) else {
                break;
            };
            offset += used;
            self.handle_record(&record, add_watch, cb);
        }
    }

    fn handle_record<F>(
        &mut self,
        record: &WatchRecord<'_>,
        add_watch: &mut F,
        cb: &mut dyn FnMut(&FileSystemEvent) -> bool,
    ) where
        F: FnMut(&Path) -> io::Result<i32>,
    {
        let mask = record.mask;
        if mask.contains(InotifyMask::Q_OVERFLOW) {
            warn!("inotify queue overflowed, events were dropped");
            return;
        }
        if mask.contains(InotifyMask::IGNORED) {
            // the kernel destroyed this watch; drop the mapping before the
            // descriptor can be reused
            self.registry.remove(record.wd);
            return;
        }

        let path = self.resolve_path(record);

        if mask.contains(InotifyMask::MOVED_FROM) && record.cookie != 0 {
            self.rename.arm(record.cookie, path);
            return;
        }
        if let Some(old_path) = self.rename.take() {
            if mask.contains(InotifyMask::MOVED_TO) {
                let mut ev = FileSystemEvent::new(EventKind::Rename, old_path);
                ev.new_path = Some(path);
                cb(&ev);
                return;
            }
            // unrelated record while pending: the half-seen rename is
            // dropped and the record handled on its own
            debug!(old = %old_path.display(), "rename pair broken, pending half dropped");
        }

        let Some(kind) = classify(mask) else {
            return;
        };
        if kind == EventKind::CreateDir {
            self.registry.register_tree(&path, add_watch);
        }
        let ev = FileSystemEvent::new(kind, path);
        cb(&ev);
    }

    fn resolve_path(&self, record: &WatchRecord<'_>) -> PathBuf {
        match record.name {
            Some(name) => match self.registry.path_of(record.wd) {
                Some(dir) => dir.join(name),
                None => PathBuf::from(name),
            },
            None => self
                .registry
                .path_of(record.wd)
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.root.clone()),
        }
    }
}

/// Mask to event kind. None means the record is administrative noise at the
/// event level (e.g. directory reads) and is consumed silently.
fn classify(mask: InotifyMask) -> Option<EventKind> {
    let is_dir = mask.contains(InotifyMask::ISDIR);
    if mask.contains(InotifyMask::ACCESS) {
        return (!is_dir).then_some(EventKind::StatChanged);
    }
    if mask.contains(InotifyMask::MODIFY) {
        return Some(EventKind::ContentModified);
    }
    if mask.contains(InotifyMask::ATTRIB) {
        return Some(EventKind::StatChanged);
    }
    if mask.contains(InotifyMask::OPEN) {
        return (!is_dir).then_some(EventKind::Open);
    }
    if mask.contains(InotifyMask::CREATE) {
        return Some(if is_dir {
            EventKind::CreateDir
        } else {
            EventKind::CreateFile
        });
    }
    if mask.intersects(InotifyMask::DELETE | InotifyMask::DELETE_SELF) {
        return Some(EventKind::Delete);
    }
    if mask.intersects(InotifyMask::MOVE_SELF | InotifyMask::MOVED_FROM | InotifyMask::MOVED_TO) {
        return Some(EventKind::Rename);
    }
    if mask.contains(InotifyMask::CLOSE_WRITE) {
        return Some(EventKind::CloseWritable);
    }
    if mask.contains(InotifyMask::CLOSE_NOWRITE) {
        return (!is_dir).then_some(EventKind::Close);
    }
    None
}

impl Backend for InotifyBackend {
    fn name(&self) -> &'static str {
        "inotify"
    }

    #[cfg(target_os = "linux")]
    fn begin(&mut self, root: Option<&Path>) -> Result<(), MonitorError> {
        let root = root.unwrap_or(Path::new("/")).to_path_buf();
        let fd = unsafe { libc::inotify_init1(libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(MonitorError::last_os("inotify_init1"));
        }
        self.stop.reset();
        self.stop.set_fd(fd);
        self.root = root.clone();
        let mut add = |path: &Path| sys::add_watch(fd, path);
        let added = self.registry.register_tree(&root, &mut add);
        debug!(watches = added, root = %root.display(), "inotify watch tree installed");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn begin(&mut self, _root: Option<&Path>) -> Result<(), MonitorError> {
        Err(MonitorError::Unsupported("inotify"))
    }

    #[cfg(target_os = "linux")]
    fn run(
        &mut self,
        cb: &mut dyn FnMut(&FileSystemEvent) -> bool,
    ) -> Result<(), MonitorError> {
        // ten max-size records per read, same sizing the kernel docs suggest
        let mut buf = vec![0u8; 10 * (EVENT_HEADER_LEN + 256)];
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
                Ok(n) => {
                    let mut add = |path: &Path| sys::add_watch(fd, path);
                    self.decode_buffer(&buf[..n], &mut add, cb);
                }
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

    #[cfg(not(target_os = "linux"))]
    fn run(
        &mut self,
        _cb: &mut dyn FnMut(&FileSystemEvent) -> bool,
    ) -> Result<(), MonitorError> {
        Err(MonitorError::Unsupported("inotify"))
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
        self.registry.clear();
        self.rename.clear();
        released
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::ffi::CString;
    use std::io;
    use std::os::fd::RawFd;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    pub fn add_watch(fd: RawFd, path: &Path) -> io::Result<i32> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let wd = unsafe { libc::inotify_add_watch(fd, cpath.as_ptr(), libc::IN_ALL_EVENTS) };
        if wd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(wd)
        }
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
