//! Committed decoder state: thread and vnode caches. Trace volume is high,
//! so both live in slab arenas with an index on top — slots are recycled,
//! never freed one by one.

use rustc_hash::FxHashMap;
use slab::Slab;

#[derive(Debug)]
pub struct ThreadInfo {
    pub pid: i32,
    /// Command name snapshot taken when the thread entry was created. Not
    /// refreshed; a long-lived thread renamed later keeps the stale name.
    pub command: String,
}

/// thread id → process identity.
#[derive(Debug, Default)]
pub struct ThreadMap {
    slots: Slab<ThreadInfo>,
    index: FxHashMap<u64, usize>,
}

impl ThreadMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn insert(&mut self, thread: u64, pid: i32, command: &str) {
        match self.index.get(&thread) {
            Some(&slot) => {
                let info = &mut self.slots[slot];
                info.pid = pid;
                info.command.clear();
                info.command.push_str(command);
            }
            None => {
                let slot = self.slots.insert(ThreadInfo {
                    pid,
                    command: command.to_owned(),
                });
                self.index.insert(thread, slot);
            }
        }
    }

    pub fn get(&self, thread: u64) -> Option<&ThreadInfo> {
        self.index.get(&thread).map(|&slot| &self.slots[slot])
    }

    pub fn remove(&mut self, thread: u64) {
        if let Some(slot) = self.index.remove(&thread) {
            self.slots.remove(slot);
        }
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
    }
}

/// vnode id → the last path the kernel resolved for it. One entry per id:
/// a fresh lookup overwrites in place rather than chaining duplicates.
#[derive(Debug, Default)]
pub struct VnodeMap {
    slots: Slab<String>,
    index: FxHashMap<u64, usize>,
}

impl VnodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn set(&mut self, vnode: u64, path: &str) {
        match self.index.get(&vnode) {
            Some(&slot) => {
                let entry = &mut self.slots[slot];
                entry.clear();
                entry.push_str(path);
            }
            None => {
                let slot = self.slots.insert(path.to_owned());
                self.index.insert(vnode, slot);
            }
        }
    }

    pub fn get(&self, vnode: u64) -> Option<&str> {
        self.index.get(&vnode).map(|&slot| self.slots[slot].as_str())
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
    }
}
