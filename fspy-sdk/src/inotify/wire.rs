//! Raw inotify record layout. The kernel hands back packed records of
//! `struct inotify_event` (wd, mask, cookie, len) followed by `len` bytes of
//! NUL-padded name; records never split across reads.

use bitflags::bitflags;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

pub const EVENT_HEADER_LEN: usize = 16;

bitflags! {
    /// Kernel-defined event mask bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InotifyMask: u32 {
        const ACCESS        = 0x0000_0001;
        const MODIFY        = 0x0000_0002;
        const ATTRIB        = 0x0000_0004;
        const CLOSE_WRITE   = 0x0000_0008;
        const CLOSE_NOWRITE = 0x0000_0010;
        const OPEN          = 0x0000_0020;
        const MOVED_FROM    = 0x0000_0040;
        const MOVED_TO      = 0x0000_0080;
        const CREATE        = 0x0000_0100;
        const DELETE        = 0x0000_0200;
        const DELETE_SELF   = 0x0000_0400;
        const MOVE_SELF     = 0x0000_0800;
        const UNMOUNT       = 0x0000_2000;
        const Q_OVERFLOW    = 0x0000_4000;
        const IGNORED       = 0x0000_8000;
        const ISDIR         = 0x4000_0000;
    }
}

#[derive(Debug)]
pub struct WatchRecord<'a> {
    pub wd: i32,
    pub mask: InotifyMask,
    pub cookie: u32,
    /// Entry name relative to the watched directory; None when the watched
    /// entry itself is the subject.
    pub name: Option<&'a OsStr>,
}

/// Parse the record at the front of `buf`, returning it plus the bytes
/// consumed. None if the buffer holds less than the record claims — the
/// remainder of a batch is then discarded, since the kernel only ever
/// delivers whole records.
pub fn parse_record(buf: &[u8]) -> Option<(WatchRecord<'_>, usize)> {
    if buf.len() < EVENT_HEADER_LEN {
        return None;
    }
    let wd = i32::from_ne_bytes(buf[0..4].try_into().unwrap());
    let mask = u32::from_ne_bytes(buf[4..8].try_into().unwrap());
    let cookie = u32::from_ne_bytes(buf[8..12].try_into().unwrap());
    let len = u32::from_ne_bytes(buf[12..16].try_into().unwrap()) as usize;
    let total = EVENT_HEADER_LEN.checked_add(len)?;
    if buf.len() < total {
        return None;
    }
    let raw_name = &buf[EVENT_HEADER_LEN..total];
    let trimmed = match raw_name.iter().position(|&b| b == 0) {
        Some(nul) => &raw_name[..nul],
        None => raw_name,
    };
    let name = (!trimmed.is_empty()).then(|| OsStr::from_bytes(trimmed));
    Some((
        WatchRecord {
            wd,
            mask: InotifyMask::from_bits_retain(mask),
            cookie,
            name,
        },
        total,
    ))
}

#[cfg(test)]
pub(crate) fn encode_record(wd: i32, mask: InotifyMask, cookie: u32, name: Option<&str>) -> Vec<u8> {
    let mut out = Vec::new();
    let name_bytes = name.map(str::as_bytes).unwrap_or_default();
    // kernel pads names to a multiple of the header alignment
    let padded = if name_bytes.is_empty() {
        0
    } else {
        (name_bytes.len() + 1).next_multiple_of(4)
    };
    out.extend_from_slice(&wd.to_ne_bytes());
    out.extend_from_slice(&mask.bits().to_ne_bytes());
    out.extend_from_slice(&cookie.to_ne_bytes());
    out.extend_from_slice(&(padded as u32).to_ne_bytes());
    out.extend_from_slice(name_bytes);
    out.resize(EVENT_HEADER_LEN + padded, 0);
    out
}
