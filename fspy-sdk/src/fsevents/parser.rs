//! Reassembles the self-describing device stream: variable-length events
//! that may straddle reads, desynchronize after a dropped kernel record,
//! and must be resynchronized from byte patterns alone.

use super::wire::{
    ARG_HEADER_LEN, EVENT_HEADER_LEN, FSE_ARG_DEV, FSE_ARG_DONE, FSE_ARG_FINFO, FSE_ARG_GID,
    FSE_ARG_INO, FSE_ARG_INT32, FSE_ARG_INT64, FSE_ARG_MODE, FSE_ARG_PATH, FSE_ARG_RAW,
    FSE_ARG_STRING, FSE_ARG_UID, FSE_ARG_VNODE, FSE_EVENTS_DROPPED, RESYNC_MARKER, kind_of,
    split_dev,
};
use crate::event::{EventKind, FileSystemEvent};
use memchr::memmem;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use tracing::warn;

/// Carried bytes are capped; a stream that cannot complete an event within
/// this window has lost data and is reset.
const MAX_CARRY: usize = 64 * 1024;

enum ArgOutcome {
    /// Terminal sentinel seen; `0` is total bytes consumed.
    Complete(usize),
    /// Arguments continue past the buffered data; consume nothing and wait
    /// for the next read.
    NeedMore,
    /// Unrecognized argument type at offset `0`; the current event is
    /// abandoned and parsing resumes there.
    Abort(usize),
}

/// Streaming event assembler. Feed raw device reads in, completed events
/// come out of the callback.
#[derive(Default)]
pub struct EventAssembler {
    carry: Vec<u8>,
    /// Event whose header and path were consumed but whose argument list
    /// is still arriving.
    pending: Option<FileSystemEvent>,
}

impl EventAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held over waiting for the next read.
    pub fn carried(&self) -> usize {
        self.carry.len()
    }

    pub fn feed(&mut self, chunk: &[u8], cb: &mut dyn FnMut(&FileSystemEvent) -> bool) {
        self.carry.extend_from_slice(chunk);
        let mut pos = 0;

        loop {
            if let Some(mut ev) = self.pending.take() {
                match parse_args(&mut ev, &self.carry[pos..]) {
                    ArgOutcome::Complete(used) => {
                        pos += used;
                        emit(ev, cb);
                        continue;
                    }
                    ArgOutcome::NeedMore => {
                        self.pending = Some(ev);
                        break;
                    }
                    ArgOutcome::Abort(used) => {
                        pos += used;
                        warn!("unrecognized fsevents argument, event dropped");
                        continue;
                    }
                }
            }

            let remaining = &self.carry[pos..];
            if remaining.len() < EVENT_HEADER_LEN {
                break;
            }
            let event_type = u16::from_ne_bytes(remaining[0..2].try_into().unwrap());

            if event_type == 0 {
                // a dropped kernel record desynchronized us; hunt for the
                // next plausible header
                match memmem::find(remaining, &RESYNC_MARKER) {
                    Some(idx) => {
                        warn!(skipped = idx + 2, "fsevents stream desynchronized, resynced");
                        pos += idx + 2;
                        continue;
                    }
                    None => {
                        warn!("fsevents stream desynchronized, no marker in buffer");
                        pos = self.carry.len();
                        break;
                    }
                }
            }

            if event_type == FSE_EVENTS_DROPPED {
                // type + pid header followed by a bare done sentinel
                if remaining.len() < EVENT_HEADER_LEN + 2 {
                    break;
                }
                warn!("kernel dropped fsevents, stream continues");
                pos += EVENT_HEADER_LEN;
                let sentinel =
                    u16::from_ne_bytes(self.carry[pos..pos + 2].try_into().unwrap());
                if sentinel == FSE_ARG_DONE {
                    pos += 2;
                }
                continue;
            }

            // path block directly follows the header
            if remaining.len() < EVENT_HEADER_LEN + ARG_HEADER_LEN {
                break;
            }
            let pathlen =
                u16::from_ne_bytes(remaining[10..12].try_into().unwrap()) as usize;
            let total = EVENT_HEADER_LEN + ARG_HEADER_LEN + pathlen;
            if remaining.len() < total {
                // declared length runs past the read; carry the prefix over
                break;
            }
            let pid = i32::from_ne_bytes(remaining[4..8].try_into().unwrap());
            let raw_path = &remaining[EVENT_HEADER_LEN + ARG_HEADER_LEN..total];
            let path = trimmed_path(raw_path);
            let kind = kind_of(event_type).unwrap_or(EventKind::Unknown);
            let mut ev = FileSystemEvent::new(kind, path);
            ev.pid = pid;
            pos += total;
            self.pending = Some(ev);
        }

        self.carry.drain(..pos);
        if self.carry.len() > MAX_CARRY {
            warn!(lost = self.carry.len(), "fsevents carry overflow, data dropped");
            self.carry.clear();
            self.pending = None;
        }
    }
}

/// Walk the argument records in `buf`. Field updates are idempotent, so a
/// NeedMore retry re-applies the same prefix harmlessly.
fn parse_args(ev: &mut FileSystemEvent, buf: &[u8]) -> ArgOutcome {
    let mut used = 0;
    loop {
        let rest = &buf[used..];
        if rest.len() < 2 {
            return ArgOutcome::NeedMore;
        }
        let arg_type = u16::from_ne_bytes(rest[0..2].try_into().unwrap());
        if arg_type == FSE_ARG_DONE {
            return ArgOutcome::Complete(used + 2);
        }
        if rest.len() < ARG_HEADER_LEN {
            return ArgOutcome::NeedMore;
        }
        let len = u16::from_ne_bytes(rest[2..4].try_into().unwrap()) as usize;
        if rest.len() < ARG_HEADER_LEN + len {
            return ArgOutcome::NeedMore;
        }
        let value = &rest[ARG_HEADER_LEN..ARG_HEADER_LEN + len];
        match arg_type {
            FSE_ARG_INT64 => {
                if len == 8 {
                    ev.timestamp = u64::from_ne_bytes(value.try_into().unwrap());
                }
            }
            FSE_ARG_STRING => {
                ev.new_path = Some(trimmed_path(value));
            }
            FSE_ARG_DEV => {
                if len >= 4 {
                    let dev = u32::from_ne_bytes(value[0..4].try_into().unwrap());
                    (ev.dev_major, ev.dev_minor) = split_dev(dev);
                }
            }
            FSE_ARG_MODE => {
                if len >= 4 {
                    ev.mode = u32::from_ne_bytes(value[0..4].try_into().unwrap());
                }
            }
            FSE_ARG_INO => match len {
                4 => ev.inode = u32::from_ne_bytes(value.try_into().unwrap()) as u64,
                8 => ev.inode = u64::from_ne_bytes(value.try_into().unwrap()),
                _ => {}
            },
            FSE_ARG_UID => {
                if len >= 4 {
                    ev.uid = u32::from_ne_bytes(value[0..4].try_into().unwrap());
                }
            }
            FSE_ARG_GID => {
                if len >= 4 {
                    ev.gid = u32::from_ne_bytes(value[0..4].try_into().unwrap());
                }
            }
            FSE_ARG_VNODE | FSE_ARG_PATH | FSE_ARG_INT32 | FSE_ARG_RAW | FSE_ARG_FINFO => {}
            _ => return ArgOutcome::Abort(used),
        }
        used += ARG_HEADER_LEN + len;
    }
}

fn emit(mut ev: FileSystemEvent, cb: &mut dyn FnMut(&FileSystemEvent) -> bool) {
    if ev.kind == EventKind::Unknown {
        return;
    }
    // rename carries the destination as a string argument
    if ev.new_path.is_some()
        && !matches!(ev.kind, EventKind::Rename | EventKind::Exchange)
    {
        ev.new_path = None;
    }
    let pid = ev.pid;
    ev.attach_process(pid);
    cb(&ev);
}

fn trimmed_path(raw: &[u8]) -> PathBuf {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    PathBuf::from(OsStr::from_bytes(&raw[..end]))
}

#[cfg(test)]
mod tests {
    use super::super::wire::*;
    use super::*;

    pub(crate) fn encode_event(event_type: u16, pid: i32, path: &str, args: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&event_type.to_ne_bytes());
        out.extend_from_slice(&0u16.to_ne_bytes()); // refcount
        out.extend_from_slice(&pid.to_ne_bytes());
        let path_bytes = path.as_bytes();
        out.extend_from_slice(&FSE_ARG_STRING.to_ne_bytes());
        out.extend_from_slice(&((path_bytes.len() + 1) as u16).to_ne_bytes());
        out.extend_from_slice(path_bytes);
        out.push(0);
        for (arg_type, value) in args {
            out.extend_from_slice(&arg_type.to_ne_bytes());
            out.extend_from_slice(&(value.len() as u16).to_ne_bytes());
            out.extend_from_slice(value);
        }
        out.extend_from_slice(&FSE_ARG_DONE.to_ne_bytes());
        out
    }

    fn collect(assembler: &mut EventAssembler, chunk: &[u8]) -> Vec<FileSystemEvent> {
        let mut events = Vec::new();
        assembler.feed(chunk, &mut |ev| {
            events.push(ev.clone());
            true
        });
        events
    }

    #[test]
    fn single_event_decodes() {
        let mut assembler = EventAssembler::new();
        let buf = encode_event(
            FSE_CREATE_FILE,
            321,
            "/tmp/new",
            &[
                (FSE_ARG_INT64, 987u64.to_ne_bytes().to_vec()),
                (FSE_ARG_MODE, 0o644u32.to_ne_bytes().to_vec()),
                (FSE_ARG_INO, 42u32.to_ne_bytes().to_vec()),
                (FSE_ARG_UID, 501u32.to_ne_bytes().to_vec()),
                (FSE_ARG_GID, 20u32.to_ne_bytes().to_vec()),
            ],
        );
        let events = collect(&mut assembler, &buf);
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.kind, EventKind::CreateFile);
        assert_eq!(ev.path, PathBuf::from("/tmp/new"));
        assert_eq!(ev.pid, 321);
        assert_eq!(ev.timestamp, 987);
        assert_eq!(ev.mode, 0o644);
        assert_eq!((ev.inode, ev.uid, ev.gid), (42, 501, 20));
        assert_eq!(assembler.carried(), 0);
    }

    #[test]
    fn rename_picks_up_string_argument() {
        let mut assembler = EventAssembler::new();
        let buf = encode_event(
            FSE_RENAME,
            1,
            "/tmp/old",
            &[(FSE_ARG_STRING, b"/tmp/new\0".to_vec())],
        );
        let events = collect(&mut assembler, &buf);
        assert_eq!(events[0].kind, EventKind::Rename);
        assert_eq!(events[0].path, PathBuf::from("/tmp/old"));
        assert_eq!(events[0].new_path.as_deref(), Some(std::path::Path::new("/tmp/new")));
    }

    #[test]
    fn device_argument_splits_major_minor() {
        let mut assembler = EventAssembler::new();
        let dev: u32 = (3 << 24) | 9;
        let buf = encode_event(
            FSE_CONTENT_MODIFIED,
            1,
            "/f",
            &[(FSE_ARG_DEV, dev.to_ne_bytes().to_vec())],
        );
        let events = collect(&mut assembler, &buf);
        assert_eq!((events[0].dev_major, events[0].dev_minor), (3, 9));
    }

    #[test]
    fn event_split_across_reads_is_reassembled() {
        let mut assembler = EventAssembler::new();
        let buf = encode_event(
            FSE_DELETE,
            7,
            "/tmp/going",
            &[(FSE_ARG_INT64, 5u64.to_ne_bytes().to_vec())],
        );
        let (first, second) = buf.split_at(EVENT_HEADER_LEN + ARG_HEADER_LEN + 3);
        assert!(collect(&mut assembler, first).is_empty());
        assert!(assembler.carried() > 0);
        let events = collect(&mut assembler, second);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Delete);
        assert_eq!(events[0].path, PathBuf::from("/tmp/going"));
    }

    #[test]
    fn argument_split_across_reads_is_reassembled() {
        let mut assembler = EventAssembler::new();
        let buf = encode_event(
            FSE_DELETE,
            7,
            "/tmp/x",
            &[(FSE_ARG_INT64, 5u64.to_ne_bytes().to_vec())],
        );
        // cut inside the INT64 argument value
        let cut = buf.len() - 6;
        assert!(collect(&mut assembler, &buf[..cut]).is_empty());
        let events = collect(&mut assembler, &buf[cut..]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, 5);
    }

    #[test]
    fn garbage_resyncs_to_next_event() {
        let mut assembler = EventAssembler::new();
        let mut buf = encode_event(FSE_CREATE_FILE, 1, "/a", &[]);
        buf.extend_from_slice(&[0u8; 6]); // dropped-record garbage
        // next event's header starts with type STAT_CHANGED = 2, which the
        // preceding zero bytes turn into the resync marker
        buf.extend_from_slice(&encode_event(FSE_STAT_CHANGED, 2, "/b", &[]));
        let events = collect(&mut assembler, &buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::CreateFile);
        assert_eq!(events[1].kind, EventKind::StatChanged);
        assert_eq!(events[1].path, PathBuf::from("/b"));
    }

    #[test]
    fn garbage_without_marker_drops_buffer_only() {
        let mut assembler = EventAssembler::new();
        let events = collect(&mut assembler, &[0u8; 32]);
        assert!(events.is_empty());
        // a following clean read still decodes
        let buf = encode_event(FSE_DELETE, 1, "/ok", &[]);
        let events = collect(&mut assembler, &buf);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn dropped_events_record_is_consumed() {
        let mut assembler = EventAssembler::new();
        let mut buf = Vec::new();
        buf.extend_from_slice(&FSE_EVENTS_DROPPED.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        buf.extend_from_slice(&0i32.to_ne_bytes());
        buf.extend_from_slice(&FSE_ARG_DONE.to_ne_bytes());
        buf.extend_from_slice(&encode_event(FSE_CREATE_DIR, 3, "/dir", &[]));
        let events = collect(&mut assembler, &buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::CreateDir);
    }

    #[test]
    fn unknown_argument_aborts_event_only() {
        let mut assembler = EventAssembler::new();
        let mut buf = encode_event(FSE_CREATE_FILE, 1, "/bad", &[]);
        // splice an unknown argument type before the sentinel
        let done = buf.len() - 2;
        buf.truncate(done);
        buf.extend_from_slice(&0x0077u16.to_ne_bytes());
        buf.extend_from_slice(&2u16.to_ne_bytes());
        buf.extend_from_slice(&[0xaa, 0xbb]);
        buf.extend_from_slice(&FSE_ARG_DONE.to_ne_bytes());
        let events = collect(&mut assembler, &buf);
        // event dropped, no panic, nothing spurious
        assert!(events.is_empty());
    }

    #[test]
    fn unknown_event_type_is_consumed_silently() {
        let mut assembler = EventAssembler::new();
        let mut buf = encode_event(88, 1, "/whatever", &[]);
        buf.extend_from_slice(&encode_event(FSE_DELETE, 1, "/real", &[]));
        let events = collect(&mut assembler, &buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Delete);
    }
}
