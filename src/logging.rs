//! Tracing setup.
//!
//! Output goes through a `tracing-appender` non-blocking writer to either
//! stderr or a log file. The file can be reopened after external rotation
//! and retargeted when a reloaded config names a different path. Stdout is
//! never written: in worker children it is the liveness pipe.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct Target {
    path: Option<PathBuf>,
    file: Option<File>,
}

#[derive(Default)]
struct SharedTarget(Mutex<Target>);

impl SharedTarget {
    fn lock(&self) -> MutexGuard<'_, Target> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self, path: Option<&Path>) -> io::Result<()> {
        let file = path.map(open_append).transpose()?;
        let mut target = self.lock();
        target.path = path.map(Path::to_path_buf);
        target.file = file;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

struct TargetWriter(Arc<SharedTarget>);

impl Write for TargetWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut target = self.0.lock();
        match target.file.as_mut() {
            Some(file) => file.write(buf),
            None => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut target = self.0.lock();
        match target.file.as_mut() {
            Some(file) => file.flush(),
            None => io::stderr().flush(),
        }
    }
}

/// Keeps the background writer alive and controls the log file.
pub struct LogHandle {
    target: Arc<SharedTarget>,
    _guard: WorkerGuard,
}

impl LogHandle {
    /// Write to `path`, or to stderr when `None`.
    pub fn set_path(&self, path: Option<&Path>) -> io::Result<()> {
        if self.target.lock().path.as_deref() == path {
            return Ok(());
        }
        self.target.open(path)
    }

    /// Reopen the current file, picking up a rotated path.
    pub fn reopen(&self) -> io::Result<()> {
        let path = self.target.lock().path.clone();
        self.target.open(path.as_deref())
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.target.lock().path.clone()
    }
}

/// Install the global subscriber. `RUST_LOG` filters, default `info`.
pub fn init(path: Option<&Path>) -> io::Result<LogHandle> {
    let target = Arc::new(SharedTarget::default());
    target.open(path)?;
    let (writer, guard) = tracing_appender::non_blocking(TargetWriter(Arc::clone(&target)));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_ansi(path.is_none())
        .with_writer(writer)
        .try_init();
    if let Err(e) = installed {
        eprintln!("Warning: tracing subscriber already installed: {e}");
    }

    Ok(LogHandle {
        target,
        _guard: guard,
    })
}
