//! The trace-record state machine: correlates thread bookkeeping, pathname
//! lookups and syscall completions that arrive deeply interleaved across
//! kernel threads.

use super::caches::{ThreadMap, VnodeMap};
use super::codes::{
    self, BSC_THREAD_TERMINATE, DBG_FUNC_END, DBG_FUNC_MASK, DBG_FUNC_START, MAX_PATH_BYTES,
    MAX_SCALL_PATHNAMES, PROC_EXIT, TRACE_DATA_EXEC, TRACE_DATA_NEWTHREAD, TRACE_STRING_EXEC,
    TRACE_STRING_NEWTHREAD, VFS_LOOKUP,
};
use crate::event::{EventKind, FileSystemEvent};
use rustc_hash::FxHashMap;
use tracing::warn;

/// One fixed-size kernel trace record (kd_buf): a debug identifier, the
/// emitting thread, and four generic argument words whose meaning depends
/// on the identifier.
#[derive(Debug, Clone, Copy)]
pub struct TraceRecord {
    pub debugid: u32,
    pub thread: u64,
    pub timestamp: u64,
    pub args: [u64; 4],
}

impl TraceRecord {
    pub fn new(debugid: u32, thread: u64, args: [u64; 4]) -> Self {
        TraceRecord {
            debugid,
            thread,
            timestamp: 0,
            args,
        }
    }
}

/// One in-flight pathname lookup: fragments accumulate 8 bytes per
/// argument word until the end qualifier closes the assembly.
#[derive(Debug, Default)]
struct LookupAccum {
    active: bool,
    vnode: u64,
    buf: Vec<u8>,
    assembled: Option<String>,
}

impl LookupAccum {
    fn reset(&mut self) {
        self.active = false;
        self.vnode = 0;
        self.buf.clear();
        self.assembled = None;
    }

    fn push_words(&mut self, words: &[u64]) {
        for word in words {
            if self.buf.len() >= MAX_PATH_BYTES {
                return;
            }
            self.buf.extend_from_slice(&word.to_ne_bytes());
        }
    }

    fn finish(&mut self) -> String {
        let end = self.buf.iter().position(|&b| b == 0).unwrap_or(self.buf.len());
        let path = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.active = false;
        self.assembled = Some(path.clone());
        path
    }
}

/// Per-thread in-flight correlation state. Discarded wholesale when the
/// kernel reports a wrapped buffer; the committed caches survive.
#[derive(Debug, Default)]
struct ThreadState {
    /// Vnode id captured at the most recent lookup start.
    vnode: u64,
    lookups: [LookupAccum; MAX_SCALL_PATHNAMES],
    /// Slot currently being assembled / next free slot.
    work: usize,
    scall: usize,
    /// Child thread + pid from a fork data record, waiting for its name.
    pending_fork: Option<(u64, i32)>,
    /// Pid from an exec data record, waiting for its name.
    pending_exec: Option<i32>,
}

impl ThreadState {
    fn reset_syscall(&mut self) {
        self.vnode = 0;
        self.work = 0;
        self.scall = 0;
        for lookup in &mut self.lookups {
            lookup.reset();
        }
    }
}

#[derive(Default)]
pub struct TraceDecoder {
    threads: ThreadMap,
    vnodes: VnodeMap,
    inflight: FxHashMap<u64, ThreadState>,
}

impl TraceDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threads(&self) -> &ThreadMap {
        &self.threads
    }

    pub fn vnodes(&self) -> &VnodeMap {
        &self.vnodes
    }

    /// Number of threads with un-committed correlation state.
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Seed a thread entry from outside the stream (the driver preloads the
    /// kernel's thread map at startup).
    pub fn preload_thread(&mut self, thread: u64, pid: i32, command: &str) {
        self.threads.insert(thread, pid, command);
    }

    /// Decode one drained batch in arrival order. `wrapped` is the kernel's
    /// buffer-overrun flag for this batch: correlations spanning the
    /// overflow are unrecoverable, so all in-flight state is dropped while
    /// the committed caches stay.
    pub fn process(
        &mut self,
        records: &[TraceRecord],
        wrapped: bool,
        cb: &mut dyn FnMut(&FileSystemEvent) -> bool,
    ) {
        if wrapped {
            warn!("trace buffer wrapped, events were generated faster than drained");
            self.inflight.clear();
        }
        for record in records {
            self.dispatch(record, cb);
        }
    }

    pub fn clear(&mut self) {
        self.threads.clear();
        self.vnodes.clear();
        self.inflight.clear();
    }

    fn dispatch(&mut self, record: &TraceRecord, cb: &mut dyn FnMut(&FileSystemEvent) -> bool) {
        let id = record.debugid & DBG_FUNC_MASK;
        match id {
            TRACE_DATA_NEWTHREAD => {
                if record.args[0] != 0 {
                    let state = self.inflight.entry(record.thread).or_default();
                    state.pending_fork = Some((record.args[0], record.args[1] as i32));
                }
            }
            TRACE_STRING_NEWTHREAD => {
                let pending = self
                    .inflight
                    .get_mut(&record.thread)
                    .and_then(|state| state.pending_fork.take());
                if let Some((child, pid)) = pending {
                    self.threads.insert(child, pid, &words_to_name(&record.args));
                }
            }
            TRACE_DATA_EXEC => {
                let state = self.inflight.entry(record.thread).or_default();
                state.pending_exec = Some(record.args[0] as i32);
            }
            TRACE_STRING_EXEC => {
                let pending = self
                    .inflight
                    .get_mut(&record.thread)
                    .and_then(|state| state.pending_exec.take());
                if let Some(pid) = pending {
                    self.threads
                        .insert(record.thread, pid, &words_to_name(&record.args));
                }
            }
            BSC_THREAD_TERMINATE | PROC_EXIT => {
                self.threads.remove(record.thread);
                self.inflight.remove(&record.thread);
            }
            VFS_LOOKUP => self.handle_lookup(record),
            _ => {
                if codes::is_bsd_syscall(id) {
                    if record.debugid & DBG_FUNC_START != 0 {
                        self.inflight
                            .entry(record.thread)
                            .or_default()
                            .reset_syscall();
                    } else if record.debugid & DBG_FUNC_END != 0 {
                        self.finish_syscall(id, record, cb);
                    }
                }
            }
        }
    }

    fn handle_lookup(&mut self, record: &TraceRecord) {
        let state = self.inflight.entry(record.thread).or_default();
        if record.debugid & DBG_FUNC_START != 0 {
            if state.scall >= MAX_SCALL_PATHNAMES {
                return;
            }
            state.work = state.scall;
            let slot = &mut state.lookups[state.work];
            slot.reset();
            slot.active = true;
            slot.vnode = record.args[0];
            state.vnode = record.args[0];
            // the start record already carries the first three path words
            slot.push_words(&record.args[1..]);
        } else {
            let slot = &mut state.lookups[state.work];
            if !slot.active {
                // a fragment or end with no open lookup is malformed; do
                // not guess at a path
                return;
            }
            slot.push_words(&record.args);
        }
        if record.debugid & DBG_FUNC_END != 0 {
            let slot = &mut state.lookups[state.work];
            if !slot.active {
                return;
            }
            let vnode = slot.vnode;
            let path = slot.finish();
            if state.work == state.scall {
                state.scall += 1;
            }
            self.vnodes.set(vnode, &path);
        }
    }

    fn finish_syscall(
        &mut self,
        code: u32,
        record: &TraceRecord,
        cb: &mut dyn FnMut(&FileSystemEvent) -> bool,
    ) {
        let Some(class) = codes::classify_syscall(code) else {
            // an unmonitored syscall still closes this thread's window
            if let Some(state) = self.inflight.get_mut(&record.thread) {
                state.reset_syscall();
            }
            return;
        };

        let (vnode, first, second) = match self.inflight.get(&record.thread) {
            Some(state) => (
                state.vnode,
                state.lookups[0].assembled.clone(),
                state.lookups[1].assembled.clone(),
            ),
            None => (0, None, None),
        };
        let vnode_path = (vnode != 0)
            .then(|| self.vnodes.get(vnode).map(str::to_owned))
            .flatten();
        let primary = first
            .filter(|path| !path.is_empty())
            .or_else(|| vnode_path.filter(|path| !path.is_empty()));

        if class.needs_path && primary.is_none() {
            if let Some(state) = self.inflight.get_mut(&record.thread) {
                state.reset_syscall();
            }
            return;
        }

        let mut ev = FileSystemEvent::new(class.kind, primary.unwrap_or_default());
        match self.threads.get(record.thread) {
            Some(info) => {
                ev.pid = info.pid;
                ev.process_name = Some(info.command.clone());
            }
            // no snapshot for this thread; the raw id is the best handle
            None => ev.pid = record.thread as i32,
        }
        ev.timestamp = record.timestamp;
        ev.syscall = Some(class.name);
        if class.has_mode {
            ev.mode = record.args[1] as u32;
        }
        if matches!(class.kind, EventKind::Rename | EventKind::Exchange) {
            ev.new_path = Some(
                second
                    .filter(|path| !path.is_empty())
                    .map(Into::into)
                    .unwrap_or_else(|| ev.path.clone()),
            );
        }
        cb(&ev);

        if let Some(state) = self.inflight.get_mut(&record.thread) {
            state.reset_syscall();
        }
    }
}

/// String trace records pack raw name bytes into the argument words.
fn words_to_name(args: &[u64; 4]) -> String {
    let mut bytes = Vec::with_capacity(args.len() * 8);
    for word in args {
        bytes.extend_from_slice(&word.to_ne_bytes());
    }
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Pack a path into lookup argument words, test helper style: first word is
/// the vnode id for start records.
#[cfg(test)]
pub(crate) fn pack_words(text: &str) -> Vec<u64> {
    let mut words = Vec::new();
    for chunk in text.as_bytes().chunks(8) {
        let mut buf = [0u8; 8];
        buf[..chunk.len()].copy_from_slice(chunk);
        words.push(u64::from_ne_bytes(buf));
    }
    if text.len() % 8 == 0 {
        words.push(0);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::super::codes::*;
    use super::*;

    fn rec(debugid: u32, thread: u64, args: [u64; 4]) -> TraceRecord {
        TraceRecord::new(debugid, thread, args)
    }

    fn lookup_records(thread: u64, vnode: u64, path: &str) -> Vec<TraceRecord> {
        let words = pack_words(path);
        let mut records = Vec::new();
        let mut first = [0u64; 4];
        first[0] = vnode;
        let take = words.len().min(3);
        first[1..1 + take].copy_from_slice(&words[..take]);
        let mut qual = DBG_FUNC_START;
        if words.len() <= 3 {
            qual |= DBG_FUNC_END;
        }
        records.push(rec(VFS_LOOKUP | qual, thread, first));
        let mut rest = &words[take..];
        while !rest.is_empty() {
            let take = rest.len().min(4);
            let mut args = [0u64; 4];
            args[..take].copy_from_slice(&rest[..take]);
            rest = &rest[take..];
            let qual = if rest.is_empty() { DBG_FUNC_END } else { 0 };
            records.push(rec(VFS_LOOKUP | qual, thread, args));
        }
        records
    }

    fn collect(decoder: &mut TraceDecoder, records: &[TraceRecord]) -> Vec<FileSystemEvent> {
        collect_wrapped(decoder, records, false)
    }

    fn collect_wrapped(
        decoder: &mut TraceDecoder,
        records: &[TraceRecord],
        wrapped: bool,
    ) -> Vec<FileSystemEvent> {
        let mut events = Vec::new();
        decoder.process(records, wrapped, &mut |ev| {
            events.push(ev.clone());
            true
        });
        events
    }

    #[test]
    fn thread_creation_pair_commits_snapshot() {
        let mut decoder = TraceDecoder::new();
        let name = pack_words("worker");
        let records = [
            rec(TRACE_DATA_NEWTHREAD, 0x10, [0x99, 321, 0, 0]),
            rec(
                TRACE_STRING_NEWTHREAD,
                0x10,
                [name[0], 0, 0, 0],
            ),
        ];
        collect(&mut decoder, &records);
        let info = decoder.threads().get(0x99).unwrap();
        assert_eq!(info.pid, 321);
        assert_eq!(info.command, "worker");
    }

    #[test]
    fn terminate_deletes_snapshot_without_event() {
        let mut decoder = TraceDecoder::new();
        decoder.preload_thread(0x42, 7, "sh");
        let events = collect(&mut decoder, &[rec(BSC_THREAD_TERMINATE, 0x42, [0; 4])]);
        assert!(events.is_empty());
        assert!(decoder.threads().get(0x42).is_none());
    }

    #[test]
    fn lookup_then_unlink_yields_delete_with_assembled_path() {
        let mut decoder = TraceDecoder::new();
        let mut records = lookup_records(1, 0xbeef, "/tmp/target");
        records.push(rec(BSC_UNLINK | DBG_FUNC_END, 1, [0; 4]));
        let events = collect(&mut decoder, &records);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Delete);
        assert_eq!(events[0].path, std::path::PathBuf::from("/tmp/target"));
        assert_eq!(events[0].syscall, Some("unlink"));
    }

    #[test]
    fn lookup_end_before_fragment_yields_nothing() {
        let mut decoder = TraceDecoder::new();
        let fragment = pack_words("/tmp/ghost");
        let records = [
            rec(VFS_LOOKUP | DBG_FUNC_START, 1, [0xabc, 0, 0, 0]),
            rec(VFS_LOOKUP | DBG_FUNC_END, 1, [0, 0, 0, 0]),
            rec(VFS_LOOKUP, 1, [fragment[0], 0, 0, 0]),
            rec(BSC_UNLINK | DBG_FUNC_END, 1, [0; 4]),
        ];
        let events = collect(&mut decoder, &records);
        assert!(events.is_empty());
    }

    #[test]
    fn pathless_syscall_is_suppressed() {
        let mut decoder = TraceDecoder::new();
        let events = collect(&mut decoder, &[rec(BSC_UNLINK | DBG_FUNC_END, 5, [0; 4])]);
        assert!(events.is_empty());
    }

    #[test]
    fn chmod_reports_even_without_path() {
        let mut decoder = TraceDecoder::new();
        let events = collect(&mut decoder, &[rec(BSC_CHMOD | DBG_FUNC_END, 5, [0; 4])]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::StatChanged);
        assert_eq!(events[0].syscall, Some("chmod"));
    }

    #[test]
    fn rename_uses_both_lookup_slots() {
        let mut decoder = TraceDecoder::new();
        let mut records = lookup_records(9, 0x100, "/src/name");
        records.extend(lookup_records(9, 0x200, "/dst/name"));
        records.push(rec(BSC_RENAME | DBG_FUNC_END, 9, [0; 4]));
        let events = collect(&mut decoder, &records);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, std::path::PathBuf::from("/src/name"));
        assert_eq!(
            events[0].new_path.as_deref(),
            Some(std::path::Path::new("/dst/name"))
        );
    }

    #[test]
    fn third_lookup_on_same_syscall_is_ignored() {
        let mut decoder = TraceDecoder::new();
        let mut records = lookup_records(9, 0x1, "/one");
        records.extend(lookup_records(9, 0x2, "/two"));
        records.extend(lookup_records(9, 0x3, "/three"));
        collect(&mut decoder, &records);
        assert!(decoder.vnodes().get(0x3).is_none());
        assert_eq!(decoder.vnodes().get(0x2).unwrap(), "/two");
    }

    #[test]
    fn wrapped_flag_clears_inflight_but_not_caches() {
        let mut decoder = TraceDecoder::new();
        decoder.preload_thread(0x5, 55, "daemon");
        // open a lookup that will never complete
        collect(
            &mut decoder,
            &[rec(VFS_LOOKUP | DBG_FUNC_START, 0x5, [0xddd, 0, 0, 0])],
        );
        assert_eq!(decoder.inflight_len(), 1);

        // overflow: in-flight dropped, snapshot kept
        let events = collect_wrapped(&mut decoder, &[], true);
        assert!(events.is_empty());
        assert_eq!(decoder.inflight_len(), 0);
        assert!(decoder.threads().get(0x5).is_some());

        // a well-formed sequence after the wrap still resolves
        let mut records = lookup_records(0x5, 0xeee, "/after/wrap");
        records.push(rec(BSC_UNLINK | DBG_FUNC_END, 0x5, [0; 4]));
        let events = collect(&mut decoder, &records);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pid, 55);
        assert_eq!(events[0].process_name.as_deref(), Some("daemon"));
        assert_eq!(events[0].path, std::path::PathBuf::from("/after/wrap"));
    }

    #[test]
    fn open_mode_comes_from_second_arg() {
        let mut decoder = TraceDecoder::new();
        let mut records = lookup_records(3, 0x9, "/etc/hosts");
        let mut end = rec(BSC_OPEN | DBG_FUNC_END, 3, [0; 4]);
        end.args[1] = 0o644;
        records.push(end);
        let events = collect(&mut decoder, &records);
        assert_eq!(events[0].kind, EventKind::Open);
        assert_eq!(events[0].mode, 0o644);
    }

    #[test]
    fn long_path_assembles_across_fragments() {
        let mut decoder = TraceDecoder::new();
        let path = "/a/rather/long/path/name/that/spans/several/records/x";
        let mut records = lookup_records(2, 0x77, path);
        assert!(records.len() > 2);
        records.push(rec(BSC_UNLINK | DBG_FUNC_END, 2, [0; 4]));
        let events = collect(&mut decoder, &records);
        assert_eq!(events[0].path, std::path::PathBuf::from(path));
    }
}
