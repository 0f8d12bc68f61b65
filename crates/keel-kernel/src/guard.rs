//! [`SingletonGuard`] – one supervisor per host.
//!
//! An advisory `flock` on `<dir>/<name>.lock`.  The kernel drops the lock
//! when the file is closed, which includes every way the process can die, so
//! there is no unlock call to forget.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use keel_types::KeelError;
use tracing::debug;

/// Exclusive lock held for the lifetime of the value.
#[derive(Debug)]
pub struct SingletonGuard {
    // Held only to keep the lock.
    _file: File,
    path: PathBuf,
}

impl SingletonGuard {
    /// Take the lock without blocking and record our PID in the lock file.
    ///
    /// # Errors
    ///
    /// [`KeelError::LockContention`] when another process holds the lock;
    /// [`KeelError::Fault`] when the lock file cannot be opened.
    pub fn acquire(dir: impl AsRef<Path>, name: &str) -> Result<Self, KeelError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|e| KeelError::Fault(format!("cannot create {}: {e}", dir.display())))?;
        let path = dir.join(format!("{name}.lock"));
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| KeelError::Fault(format!("cannot open {}: {e}", path.display())))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
            {
                return Err(KeelError::LockContention(path.display().to_string()));
            }
            Err(e) => {
                return Err(KeelError::Fault(format!("cannot lock {}: {e}", path.display())));
            }
        }

        // Diagnostics only; the lock is what matters.
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        debug!(path = %path.display(), "singleton lock acquired");
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
