//! The synchronous allow protocol. Every permission-class record blocks a
//! kernel operation until a response is written back; the decode path must
//! answer each one before touching the next record, even when the event
//! itself cannot be resolved into anything reportable.

use super::wire::{self, FAN_ALLOW, FAN_NOFD, FanotifyMask, GateRecord, MIN_VERSION};
use crate::event::{EventKind, FileSystemEvent};
use std::io;
use std::path::PathBuf;
use tracing::warn;

/// Decode one read's worth of metadata records.
///
/// `responses` receives the fixed-size allow record for every
/// permission-class event, in record order. `resolve_path` turns the
/// kernel-supplied descriptor into the subject path (the driver readlinks
/// /proc/self/fd; tests inject). `dispose_fd` is handed every valid
/// descriptor once decoding of its record is finished.
///
/// Errors are terminal for the run loop: a too-old protocol version or a
/// failed response write leaves the kernel blocked and cannot be recovered.
pub fn decode_batch<W, R, D>(
    buf: &[u8],
    responses: &mut W,
    resolve_path: &mut R,
    dispose_fd: &mut D,
    cb: &mut dyn FnMut(&FileSystemEvent) -> bool,
) -> io::Result<()>
where
    W: io::Write,
    R: FnMut(i32) -> Option<PathBuf>,
    D: FnMut(i32),
{
    let mut offset = 0;
    while let Some((record, used)) = wire::parse_metadata(&buf[offset..]) {
        offset += used;
        if record.version < MIN_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "kernel fanotify version too old",
            ));
        }
        handle_record(&record, responses, resolve_path, cb)?;
        if record.fd >= 0 {
            dispose_fd(record.fd);
        }
    }
    Ok(())
}

fn handle_record<W, R>(
    record: &GateRecord,
    responses: &mut W,
    resolve_path: &mut R,
    cb: &mut dyn FnMut(&FileSystemEvent) -> bool,
) -> io::Result<()>
where
    W: io::Write,
    R: FnMut(i32) -> Option<PathBuf>,
{
    if record.mask.contains(FanotifyMask::Q_OVERFLOW) {
        warn!("fanotify queue overflowed, events were dropped");
        return Ok(());
    }

    let kind = classify(record.mask);
    let path = if record.fd == FAN_NOFD {
        Some(PathBuf::from("."))
    } else {
        resolve_path(record.fd)
    };

    // the blocked operation is released no matter how decoding went
    if record.mask.is_permission() {
        responses.write_all(&wire::encode_response(record.fd, FAN_ALLOW))?;
    }

    let (Some(kind), Some(path)) = (kind, path) else {
        return Ok(());
    };
    let mut ev = FileSystemEvent::new(kind, path);
    ev.attach_process(record.pid);
    cb(&ev);
    Ok(())
}

/// Mask to event kind; when several bits are set, later checks override
/// earlier ones (close-write outranks open, permission bits outrank both).
fn classify(mask: FanotifyMask) -> Option<EventKind> {
    let mut kind = None;
    if mask.contains(FanotifyMask::ACCESS) {
        kind = Some(EventKind::StatChanged);
    }
    if mask.contains(FanotifyMask::OPEN) {
        kind = Some(EventKind::Open);
    }
    if mask.contains(FanotifyMask::MODIFY) {
        kind = Some(EventKind::ContentModified);
    }
    if mask.contains(FanotifyMask::CLOSE_WRITE) {
        kind = Some(EventKind::CreateFile);
    }
    if mask.contains(FanotifyMask::CLOSE_NOWRITE) {
        kind = Some(EventKind::StatChanged);
    }
    if mask.contains(FanotifyMask::OPEN_PERM) {
        kind = Some(EventKind::Open);
    }
    if mask.contains(FanotifyMask::ACCESS_PERM) {
        kind = Some(EventKind::StatChanged);
    }
    kind
}

#[cfg(test)]
mod tests {
    use super::super::wire::encode_metadata;
    use super::*;

    fn run_batch(
        buf: &[u8],
        resolve: impl FnMut(i32) -> Option<PathBuf>,
    ) -> (Vec<u8>, Vec<i32>, Vec<FileSystemEvent>) {
        let mut responses = Vec::new();
        let mut disposed = Vec::new();
        let mut events = Vec::new();
        let mut resolve = resolve;
        decode_batch(
            buf,
            &mut responses,
            &mut resolve,
            &mut |fd| disposed.push(fd),
            &mut |ev| {
                events.push(ev.clone());
                true
            },
        )
        .unwrap();
        (responses, disposed, events)
    }

    #[test]
    fn informational_record_needs_no_response() {
        let buf = encode_metadata(FanotifyMask::MODIFY, 5, 10);
        let (responses, disposed, events) = run_batch(&buf, |_| Some(PathBuf::from("/x")));
        assert!(responses.is_empty());
        assert_eq!(disposed, vec![5]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ContentModified);
    }

    #[test]
    fn every_permission_record_gets_one_response() {
        let mut buf = encode_metadata(FanotifyMask::OPEN | FanotifyMask::OPEN_PERM, 4, 1);
        buf.extend_from_slice(&encode_metadata(
            FanotifyMask::ACCESS | FanotifyMask::ACCESS_PERM,
            6,
            1,
        ));
        let (responses, _, events) = run_batch(&buf, |_| Some(PathBuf::from("/x")));
        assert_eq!(responses.len(), 2 * wire::RESPONSE_LEN);
        assert_eq!(events.len(), 2);
        let first_fd = i32::from_ne_bytes(responses[0..4].try_into().unwrap());
        let second_fd = i32::from_ne_bytes(responses[8..12].try_into().unwrap());
        assert_eq!((first_fd, second_fd), (4, 6));
    }

    #[test]
    fn unresolvable_path_still_answers_the_gate() {
        let buf = encode_metadata(FanotifyMask::OPEN | FanotifyMask::OPEN_PERM, 4, 1);
        let (responses, disposed, events) = run_batch(&buf, |_| None);
        assert_eq!(responses.len(), wire::RESPONSE_LEN);
        assert_eq!(disposed, vec![4]);
        assert!(events.is_empty());
    }

    #[test]
    fn old_protocol_version_is_terminal() {
        let mut buf = encode_metadata(FanotifyMask::OPEN, 4, 1);
        buf[4] = 1;
        let err = decode_batch(
            &buf,
            &mut Vec::new(),
            &mut |_| Some(PathBuf::from("/x")),
            &mut |_| {},
            &mut |_| true,
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn close_write_reports_create() {
        let buf = encode_metadata(FanotifyMask::CLOSE_WRITE, 3, 1);
        let (_, _, events) = run_batch(&buf, |_| Some(PathBuf::from("/new")));
        assert_eq!(events[0].kind, EventKind::CreateFile);
    }

    #[test]
    fn overflow_record_is_consumed_silently() {
        let buf = encode_metadata(FanotifyMask::Q_OVERFLOW, FAN_NOFD, 0);
        let (responses, disposed, events) = run_batch(&buf, |_| None);
        assert!(responses.is_empty());
        assert!(disposed.is_empty());
        assert!(events.is_empty());
    }
}
