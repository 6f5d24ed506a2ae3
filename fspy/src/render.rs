use fspy_sdk::{EventKind, FileSystemEvent};

const RESET: &str = "\x1b[0m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const MAGENTA: &str = "\x1b[35m";

fn color_for(kind: EventKind) -> &'static str {
    match kind {
        EventKind::CreateFile
        | EventKind::CreateDir
        | EventKind::Rename
        | EventKind::Exchange
        | EventKind::CloseWritable => GREEN,
        EventKind::Delete => RED,
        EventKind::StatChanged
        | EventKind::ContentModified
        | EventKind::Chown
        | EventKind::Open
        | EventKind::Close => YELLOW,
        EventKind::Unknown => "",
    }
}

pub struct Renderer {
    json: bool,
    filename_only: bool,
    first: bool,
}

impl Renderer {
    pub fn new(json: bool, filename_only: bool) -> Self {
        Renderer {
            json,
            filename_only,
            first: true,
        }
    }

    pub fn begin(&self) {
        if self.json {
            print!("[");
        }
    }

    pub fn event(&mut self, ev: &FileSystemEvent) {
        if self.json {
            let sep = if self.first { "" } else { "," };
            self.first = false;
            if let Ok(body) = serde_json::to_string(ev) {
                print!("{sep}{body}");
            }
            return;
        }
        let color = color_for(ev.kind);
        let proc_name = ev.process_name.as_deref().unwrap_or("");
        let path = if self.filename_only {
            ev.path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| ev.path.display().to_string())
        } else {
            ev.path.display().to_string()
        };
        match &ev.new_path {
            Some(new_path) => println!(
                "{color}{}{RESET}\t{}\t\"{MAGENTA}{proc_name}{RESET}\"\t{path} -> {}",
                ev.kind.label(),
                ev.pid,
                new_path.display(),
            ),
            None => println!(
                "{color}{}{RESET}\t{}\t\"{MAGENTA}{proc_name}{RESET}\"\t{path}",
                ev.kind.label(),
                ev.pid,
            ),
        }
    }

    pub fn finish(&self) {
        if self.json {
            println!("]");
        }
    }
}
