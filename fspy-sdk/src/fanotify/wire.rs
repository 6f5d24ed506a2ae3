//! Raw fanotify record layout: 24-byte `fanotify_event_metadata` per event,
//! 8-byte `fanotify_response` written back for permission-class events.

use bitflags::bitflags;

pub const METADATA_LEN: usize = 24;
pub const RESPONSE_LEN: usize = 8;

/// Protocol version this decoder speaks; older kernels are refused.
pub const MIN_VERSION: u8 = 2;

pub const FAN_ALLOW: u32 = 0x01;
pub const FAN_DENY: u32 = 0x02;

/// Kernel's "no file descriptor" sentinel (queue overflow records).
pub const FAN_NOFD: i32 = -1;

bitflags! {
    /// Kernel-defined fanotify mask bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FanotifyMask: u64 {
        const ACCESS         = 0x0000_0001;
        const MODIFY         = 0x0000_0002;
        const CLOSE_WRITE    = 0x0000_0008;
        const CLOSE_NOWRITE  = 0x0000_0010;
        const OPEN           = 0x0000_0020;
        const Q_OVERFLOW     = 0x0000_4000;
        const OPEN_PERM      = 0x0001_0000;
        const ACCESS_PERM    = 0x0002_0000;
        const ONDIR          = 0x4000_0000;
        const EVENT_ON_CHILD = 0x0800_0000;
    }
}

impl FanotifyMask {
    pub const PERM_EVENTS: FanotifyMask =
        FanotifyMask::OPEN_PERM.union(FanotifyMask::ACCESS_PERM);

    /// True when the kernel is blocked waiting for our allow/deny answer.
    pub fn is_permission(self) -> bool {
        self.intersects(Self::PERM_EVENTS)
    }
}

#[derive(Debug)]
pub struct GateRecord {
    pub version: u8,
    pub mask: FanotifyMask,
    /// Open descriptor onto the subject file, or [`FAN_NOFD`].
    pub fd: i32,
    pub pid: i32,
}

/// Parse the record at the front of `buf` (the FAN_EVENT_OK rules): the
/// buffer must hold the fixed header and the whole `event_len` it declares.
pub fn parse_metadata(buf: &[u8]) -> Option<(GateRecord, usize)> {
    if buf.len() < METADATA_LEN {
        return None;
    }
    let event_len = u32::from_ne_bytes(buf[0..4].try_into().unwrap()) as usize;
    let version = buf[4];
    let mask = u64::from_ne_bytes(buf[8..16].try_into().unwrap());
    let fd = i32::from_ne_bytes(buf[16..20].try_into().unwrap());
    let pid = i32::from_ne_bytes(buf[20..24].try_into().unwrap());
    if event_len < METADATA_LEN || buf.len() < event_len {
        return None;
    }
    Some((
        GateRecord {
            version,
            mask: FanotifyMask::from_bits_retain(mask),
            fd,
            pid,
        },
        event_len,
    ))
}

pub fn encode_response(fd: i32, response: u32) -> [u8; RESPONSE_LEN] {
    let mut out = [0u8; RESPONSE_LEN];
    out[0..4].copy_from_slice(&fd.to_ne_bytes());
    out[4..8].copy_from_slice(&response.to_ne_bytes());
    out
}

#[cfg(test)]
pub(crate) fn encode_metadata(mask: FanotifyMask, fd: i32, pid: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(METADATA_LEN);
    out.extend_from_slice(&(METADATA_LEN as u32).to_ne_bytes());
    out.push(3); // vers
    out.push(0); // reserved
    out.extend_from_slice(&(METADATA_LEN as u16).to_ne_bytes());
    out.extend_from_slice(&mask.bits().to_ne_bytes());
    out.extend_from_slice(&fd.to_ne_bytes());
    out.extend_from_slice(&pid.to_ne_bytes());
    out
}
