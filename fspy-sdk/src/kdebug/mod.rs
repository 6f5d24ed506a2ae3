//! Kernel trace backend: drains the kdebug buffer and correlates raw trace
//! records into filesystem events.

mod caches;
pub mod codes;
mod decoder;

pub use caches::{ThreadInfo, ThreadMap, VnodeMap};
pub use decoder::{TraceDecoder, TraceRecord};

use crate::backend::{Backend, StopHandle};
use crate::error::MonitorError;
use crate::event::FileSystemEvent;
use std::path::Path;

pub struct KdebugBackend {
    decoder: TraceDecoder,
    stop: StopHandle,
    armed: bool,
}

impl Default for KdebugBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl KdebugBackend {
    pub fn new() -> Self {
        KdebugBackend {
            decoder: TraceDecoder::new(),
            stop: StopHandle::new(),
            armed: false,
        }
    }

    pub fn decoder(&self) -> &TraceDecoder {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut TraceDecoder {
        &mut self.decoder
    }
}

impl Backend for KdebugBackend {
    fn name(&self) -> &'static str {
        "kdebug"
    }

    /// The trace facility is system-wide; `root` scoping happens in the
    /// caller's filter callback.
    #[cfg(target_os = "macos")]
    fn begin(&mut self, _root: Option<&Path>) -> Result<(), MonitorError> {
        sys::setup().map_err(|err| MonitorError::setup("kdebug trace setup", err))?;
        // our own syscalls would otherwise dominate the stream
        sys::exclude_pid(std::process::id() as i32);
        sys::preload_threadmap(&mut self.decoder);
        self.armed = true;
        self.stop.reset();
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    fn begin(&mut self, _root: Option<&Path>) -> Result<(), MonitorError> {
        Err(MonitorError::Unsupported("kdebug"))
    }

    #[cfg(target_os = "macos")]
    fn run(
        &mut self,
        cb: &mut dyn FnMut(&FileSystemEvent) -> bool,
    ) -> Result<(), MonitorError> {
        while self.stop.is_running() {
            let (records, wrapped) = sys::read_trace().map_err(MonitorError::Read)?;
            if wrapped {
                // in-flight correlations across the overflow are gone;
                // disable/enable re-arms delivery
                sys::rearm();
            }
            self.decoder.process(&records, wrapped, cb);
            if records.is_empty() {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    fn run(
        &mut self,
        _cb: &mut dyn FnMut(&FileSystemEvent) -> bool,
    ) -> Result<(), MonitorError> {
        Err(MonitorError::Unsupported("kdebug"))
    }

    fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn end(&mut self) -> bool {
        let released = self.armed;
        if self.armed {
            #[cfg(target_os = "macos")]
            sys::teardown();
            self.armed = false;
        }
        self.decoder.clear();
        released
    }
}

#[cfg(target_os = "macos")]
mod sys {
    use super::decoder::{TraceDecoder, TraceRecord};
    use std::io;
    use std::mem;

    const EVENT_BASE: usize = 60_000;
    /// Sized well above the kernel default to ride out load spikes.
    const NUM_EVENTS: usize = EVENT_BASE * 8;

    // Trace facility sysctl selectors (kernel contract).
    const KERN_KDEBUG: libc::c_int = 59;
    const KERN_KDENABLE: libc::c_int = 3;
    const KERN_KDSETBUF: libc::c_int = 4;
    const KERN_KDGETBUF: libc::c_int = 5;
    const KERN_KDSETUP: libc::c_int = 6;
    const KERN_KDREMOVE: libc::c_int = 7;
    const KERN_KDSETREG: libc::c_int = 8;
    const KERN_KDREADTR: libc::c_int = 10;
    const KERN_KDTHRMAP: libc::c_int = 12;
    const KERN_KDPIDEX: libc::c_int = 14;
    const KERN_KDSET_TYPEFILTER: libc::c_int = 22;

    const KDBG_RANGETYPE: u32 = 0x40000;
    const KDBG_TYPENONE: u32 = 0x80000;
    const KDBG_WRAPPED: u32 = 0x008;

    const TYPEFILTER_BITMAP_SIZE: usize = (256 * 256) / 8;

    #[repr(C)]
    struct KdRegtype {
        kind: u32,
        value1: u32,
        value2: u32,
        value3: u32,
        value4: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    struct KdBufinfo {
        nkdbufs: libc::c_int,
        nolog: libc::c_int,
        flags: libc::c_uint,
        nkdthreads: libc::c_int,
        bufid: libc::c_int,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct KdBuf {
        timestamp: u64,
        arg1: u64,
        arg2: u64,
        arg3: u64,
        arg4: u64,
        arg5: u64, // thread id
        debugid: u32,
        cpuid: u32,
        unused: u64,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct KdThreadmap {
        thread: u64,
        valid: libc::c_int,
        command: [libc::c_char; 20],
    }

    fn kd_sysctl(op: libc::c_int, buf: *mut libc::c_void, len: &mut usize) -> io::Result<()> {
        let mut mib = [libc::CTL_KERN, KERN_KDEBUG, op, 0, 0, 0];
        let rc = unsafe { libc::sysctl(mib.as_mut_ptr(), 3, buf, len, std::ptr::null_mut(), 0) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn set_numbufs(count: usize) -> io::Result<()> {
        let mut mib = [
            libc::CTL_KERN,
            KERN_KDEBUG,
            KERN_KDSETBUF,
            count as libc::c_int,
            0,
            0,
        ];
        let mut len = 0usize;
        let rc = unsafe {
            libc::sysctl(
                mib.as_mut_ptr(),
                4,
                std::ptr::null_mut(),
                &mut len,
                std::ptr::null_mut(),
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut len = 0usize;
        kd_sysctl(KERN_KDSETUP, std::ptr::null_mut(), &mut len)
    }

    fn set_init() -> io::Result<()> {
        let mut reg = KdRegtype {
            kind: KDBG_RANGETYPE,
            value1: 0,
            value2: u32::MAX,
            value3: 0,
            value4: 0,
        };
        let mut len = mem::size_of::<KdRegtype>();
        kd_sysctl(KERN_KDSETREG, &mut reg as *mut _ as *mut libc::c_void, &mut len)?;
        let mut len = 0usize;
        kd_sysctl(KERN_KDSETUP, std::ptr::null_mut(), &mut len)
    }

    fn set_typefilter() -> io::Result<()> {
        const fn csc(class: u16, subclass: u16) -> u16 {
            ((class & 0xff) << 8) | (subclass & 0xff)
        }
        let mut bitmap = [0u8; TYPEFILTER_BITMAP_SIZE];
        let mut set = |pair: u16| {
            bitmap[(pair >> 3) as usize] |= 1 << (pair & 7);
        };
        set(csc(7, 0)); // trace data
        set(csc(7, 1)); // trace strings
        set(csc(1, 0x0c)); // mach syscalls
        set(csc(1, 0x30)); // mach vm
        set(csc(3, 1)); // fs reads/writes + vfs lookup
        set(csc(3, 2)); // disk io
        set(csc(3, 7)); // bootcache
        set(csc(4, 0x0c)); // bsd syscalls
        set(csc(4, 1)); // bsd proc
        set(csc(4, 0x0e)); // bsd syscalls, extended info
        set(csc(4, 0x0f));
        set(csc(10, 0)); // corestorage io
        set(csc(10, 1));
        let mut len = TYPEFILTER_BITMAP_SIZE;
        kd_sysctl(
            KERN_KDSET_TYPEFILTER,
            bitmap.as_mut_ptr() as *mut libc::c_void,
            &mut len,
        )
    }

    fn set_enable(on: bool) -> io::Result<()> {
        let mut mib = [
            libc::CTL_KERN,
            KERN_KDEBUG,
            KERN_KDENABLE,
            on as libc::c_int,
            0,
            0,
        ];
        let mut len = 0usize;
        let rc = unsafe {
            libc::sysctl(
                mib.as_mut_ptr(),
                4,
                std::ptr::null_mut(),
                &mut len,
                std::ptr::null_mut(),
                0,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn set_remove() {
        let mut len = 0usize;
        let _ = kd_sysctl(KERN_KDREMOVE, std::ptr::null_mut(), &mut len);
    }

    fn get_bufinfo() -> io::Result<KdBufinfo> {
        let mut info = KdBufinfo::default();
        let mut len = mem::size_of::<KdBufinfo>();
        kd_sysctl(
            KERN_KDGETBUF,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )?;
        Ok(info)
    }

    pub fn exclude_pid(pid: i32) {
        let mut reg = KdRegtype {
            kind: KDBG_TYPENONE,
            value1: pid as u32,
            value2: 1,
            value3: 0,
            value4: 0,
        };
        let mut len = mem::size_of::<KdRegtype>();
        let _ = kd_sysctl(KERN_KDPIDEX, &mut reg as *mut _ as *mut libc::c_void, &mut len);
    }

    pub fn preload_threadmap(decoder: &mut TraceDecoder) {
        let Ok(info) = get_bufinfo() else { return };
        let count = info.nkdthreads.max(0) as usize;
        if count == 0 {
            return;
        }
        let mut map = vec![
            KdThreadmap {
                thread: 0,
                valid: 0,
                command: [0; 20],
            };
            count
        ];
        let mut len = count * mem::size_of::<KdThreadmap>();
        if kd_sysctl(
            KERN_KDTHRMAP,
            map.as_mut_ptr() as *mut libc::c_void,
            &mut len,
        )
        .is_err()
        {
            return;
        }
        for entry in &map {
            let command = unsafe { std::ffi::CStr::from_ptr(entry.command.as_ptr()) };
            decoder.preload_thread(entry.thread, entry.valid, &command.to_string_lossy());
        }
    }

    pub fn setup() -> io::Result<()> {
        set_remove();
        set_numbufs(NUM_EVENTS)?;
        set_init()?;
        set_typefilter()?;
        set_enable(true)
    }

    pub fn rearm() {
        let _ = set_enable(false);
        let _ = set_enable(true);
    }

    pub fn teardown() {
        let _ = set_enable(false);
        set_remove();
    }

    /// Drain whatever the kernel buffered, translating to the decoder's
    /// record type. Returns the batch plus the wrapped flag covering it.
    pub fn read_trace() -> io::Result<(Vec<TraceRecord>, bool)> {
        let info = get_bufinfo()?;
        let wrapped = info.flags & KDBG_WRAPPED != 0;
        let capacity = info.nkdbufs.max(0) as usize;
        if capacity == 0 {
            return Ok((Vec::new(), wrapped));
        }
        let mut raw: Vec<KdBuf> = vec![
            KdBuf {
                timestamp: 0,
                arg1: 0,
                arg2: 0,
                arg3: 0,
                arg4: 0,
                arg5: 0,
                debugid: 0,
                cpuid: 0,
                unused: 0,
            };
            capacity
        ];
        // in: byte capacity, out: number of records drained
        let mut count = capacity * mem::size_of::<KdBuf>();
        kd_sysctl(
            KERN_KDREADTR,
            raw.as_mut_ptr() as *mut libc::c_void,
            &mut count,
        )?;
        let records = raw
            .iter()
            .take(count.min(capacity))
            .map(|kd| TraceRecord {
                debugid: kd.debugid,
                thread: kd.arg5,
                timestamp: kd.timestamp,
                args: [kd.arg1, kd.arg2, kd.arg3, kd.arg4],
            })
            .collect();
        Ok((records, wrapped))
    }
}
