use rustc_hash::FxHashMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Watch-descriptor to directory-path bookkeeping. Descriptors are small
/// reused integers, so an entry must be removed the moment the kernel
/// reports its watch destroyed or a later event resolves to a stale path.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    by_wd: FxHashMap<i32, PathBuf>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_wd.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_wd.is_empty()
    }

    pub fn insert(&mut self, wd: i32, path: PathBuf) {
        self.by_wd.insert(wd, path);
    }

    pub fn remove(&mut self, wd: i32) -> Option<PathBuf> {
        self.by_wd.remove(&wd)
    }

    pub fn path_of(&self, wd: i32) -> Option<&Path> {
        self.by_wd.get(&wd).map(PathBuf::as_path)
    }

    pub fn clear(&mut self) {
        self.by_wd.clear();
    }

    /// Walk `root` and register a watch on every directory, the parent
    /// before its children so no event window opens between them. A
    /// directory that vanishes between listing and registration is skipped,
    /// never retried, and does not abort the walk. Returns how many watches
    /// were installed.
    pub fn register_tree<F>(&mut self, root: &Path, add_watch: &mut F) -> usize
    where
        F: FnMut(&Path) -> io::Result<i32>,
    {
        let mut added = 0;
        let walker = WalkDir::new(root).follow_links(false).into_iter();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(%err, "directory listing skipped");
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            match add_watch(entry.path()) {
                Ok(wd) => {
                    self.insert(wd, entry.path().to_path_buf());
                    added += 1;
                }
                Err(err) => {
                    debug!(path = %entry.path().display(), %err, "watch registration skipped");
                }
            }
        }
        added
    }
}
