use serde::Serialize;
use std::path::PathBuf;

/// What happened to the subject path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    CreateFile,
    CreateDir,
    Delete,
    Rename,
    Exchange,
    ContentModified,
    StatChanged,
    Open,
    Close,
    CloseWritable,
    Chown,
    Unknown,
}

impl EventKind {
    pub fn label(self) -> &'static str {
        match self {
            EventKind::CreateFile => "CREATE_FILE",
            EventKind::CreateDir => "CREATE_DIR",
            EventKind::Delete => "DELETE",
            EventKind::Rename => "RENAME",
            EventKind::Exchange => "EXCHANGE",
            EventKind::ContentModified => "CONTENT_MODIFIED",
            EventKind::StatChanged => "STAT_CHANGED",
            EventKind::Open => "OPEN",
            EventKind::Close => "CLOSE",
            EventKind::CloseWritable => "CLOSE_WRITABLE",
            EventKind::Chown => "CHOWN",
            EventKind::Unknown => "UNKNOWN",
        }
    }
}

/// One decoded kernel notification, handed to the run-loop callback and then
/// dropped. `new_path` is only set for `Rename` and `Exchange`.
#[derive(Debug, Clone, Serialize)]
pub struct FileSystemEvent {
    pub kind: EventKind,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_path: Option<PathBuf>,
    pub pid: i32,
    pub ppid: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub inode: u64,
    pub dev_major: i32,
    pub dev_minor: i32,
    /// Kernel-assigned, monotonic. Not a wall clock.
    pub timestamp: u64,
    /// Human label of the originating syscall, trace-decoder events only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syscall: Option<&'static str>,
}

impl FileSystemEvent {
    pub fn new(kind: EventKind, path: impl Into<PathBuf>) -> Self {
        FileSystemEvent {
            kind,
            path: path.into(),
            new_path: None,
            pid: 0,
            ppid: 0,
            process_name: None,
            uid: 0,
            gid: 0,
            mode: 0,
            inode: 0,
            dev_major: 0,
            dev_minor: 0,
            timestamp: 0,
            syscall: None,
        }
    }

    /// Set the acting pid and resolve its name/ppid best-effort.
    pub(crate) fn attach_process(&mut self, pid: i32) {
        self.pid = pid;
        if let Some(info) = crate::procinfo::resolve(pid) {
            self.ppid = info.ppid;
            self.process_name = Some(info.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_serializes_new_path() {
        let mut ev = FileSystemEvent::new(EventKind::Rename, "/a/old");
        ev.new_path = Some("/a/new".into());
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "RENAME");
        assert_eq!(json["new_path"], "/a/new");
    }

    #[test]
    fn plain_event_omits_optional_fields() {
        let ev = FileSystemEvent::new(EventKind::Open, "/etc/hosts");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(!json.contains("new_path"));
        assert!(!json.contains("syscall"));
    }
}
