mod render;

use anyhow::{Context, Result, bail};
use clap::Parser;
use fspy_sdk::{BackendKind, FileSystemEvent};
use render::Renderer;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "fspy",
    version,
    about = "Stream filesystem events with the acting process attached"
)]
struct Cli {
    /// Stop monitoring after N seconds.
    #[clap(short = 'a', long, value_name = "SEC")]
    alarm: Option<u64>,

    /// Copy each event's subject file into DIR (experimental).
    #[clap(short = 'b', long, value_name = "DIR")]
    backup: Option<PathBuf>,

    /// Follow children of the pid given with -p.
    #[clap(short = 'c', long, requires = "pid")]
    children: bool,

    /// Show only file names, not full paths.
    #[clap(short = 'f', long)]
    filename_only: bool,

    /// Output a JSON array instead of colored text.
    #[clap(short = 'j', long)]
    json: bool,

    /// Only show events from this pid.
    #[clap(short = 'p', long)]
    pid: Option<i32>,

    /// Only show events whose process name contains NAME.
    #[clap(short = 'P', long = "proc", value_name = "NAME")]
    proc_name: Option<String>,

    /// Kernel facility to use (inotify, fanotify, kdebug, fsevents).
    #[clap(long)]
    backend: Option<String>,

    /// Only report events under this path.
    path: Option<PathBuf>,
}

/// The callback-side filter: decides rendering, never decoder behavior.
struct EventFilter {
    pid: Option<i32>,
    children: bool,
    proc_name: Option<String>,
    root: Option<PathBuf>,
    backup: Option<PathBuf>,
}

impl EventFilter {
    fn admits(&self, ev: &FileSystemEvent) -> bool {
        if let Some(pid) = self.pid {
            let matches_child = self.children && ev.ppid == pid;
            if ev.pid != pid && !matches_child {
                return false;
            }
        }
        if let Some(root) = &self.root {
            if !ev.path.starts_with(root) {
                return false;
            }
        }
        // never report our own backup copies
        if let Some(backup) = &self.backup {
            if ev.path.starts_with(backup) {
                return false;
            }
        }
        if let Some(needle) = &self.proc_name {
            match &ev.process_name {
                Some(name) if name.contains(needle.as_str()) => {}
                _ => return false,
            }
        }
        true
    }
}

fn backup_event(ev: &FileSystemEvent, dir: &Path) {
    let src = ev.new_path.as_deref().unwrap_or(&ev.path);
    if src.is_dir() {
        return;
    }
    let flattened: String = src
        .display()
        .to_string()
        .chars()
        .map(|c| if c == '/' { '_' } else { c })
        .collect();
    let dst = dir.join(flattened);
    if let Err(err) = std::fs::copy(src, &dst) {
        warn!(src = %src.display(), %err, "backup copy failed");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let kind = match &cli.backend {
        Some(name) => match BackendKind::from_name(name) {
            Some(kind) => kind,
            None => {
                let known: Vec<&str> = BackendKind::ALL.iter().map(|k| k.name()).collect();
                bail!("unknown backend `{name}`, expected one of: {}", known.join(", "));
            }
        },
        None => BackendKind::host_default(),
    };

    let filter = EventFilter {
        pid: cli.pid,
        children: cli.children,
        proc_name: cli.proc_name.clone(),
        root: cli.path.clone(),
        backup: cli.backup.clone(),
    };
    let mut renderer = Renderer::new(cli.json, cli.filename_only);
    let backup_dir = cli.backup.clone();
    if let Some(dir) = &backup_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create backup dir {}", dir.display()))?;
    }

    let mut backend = kind.create();
    backend
        .begin(cli.path.as_deref())
        .with_context(|| format!("backend `{}` failed to start", kind.name()))?;

    let stop = backend.stop_handle();
    let ctrlc_stop = stop.clone();
    ctrlc::set_handler(move || ctrlc_stop.stop()).context("cannot install signal handler")?;
    if let Some(secs) = cli.alarm {
        let alarm_stop = stop.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(secs));
            alarm_stop.stop();
        });
    }

    renderer.begin();
    let result = backend.run(&mut |ev| {
        if !filter.admits(ev) {
            return false;
        }
        renderer.event(ev);
        if let Some(dir) = &backup_dir {
            backup_event(ev, dir);
        }
        true
    });
    renderer.finish();
    backend.end();

    result.map_err(Into::into)
}
