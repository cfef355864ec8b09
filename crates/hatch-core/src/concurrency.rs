use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Exclusive advisory lock on the environment store, released on drop.
pub struct StoreLock {
    file: File,
}

fn open_lock_file(path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?)
}

impl StoreLock {
    /// Block until the lock at `path` is held.
    pub fn acquire(path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Lock(format!("{}: {e}", path.display())))?;
        Ok(Self { file })
    }

    /// `None` when another process holds the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(path)?;
        Ok(file.try_lock_exclusive().ok().map(|()| Self { file }))
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Route Ctrl-C into a process-wide flag the orchestrator polls. A second
/// interrupt exits immediately.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("\ninterrupt received, cancelling and rolling back...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/store.lock");
        let _lock = StoreLock::acquire(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn try_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.lock");
        let held = StoreLock::acquire(&path).unwrap();
        assert!(StoreLock::try_acquire(&path).unwrap().is_none());
        drop(held);
        assert!(StoreLock::try_acquire(&path).unwrap().is_some());
    }
}
