use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug)]
pub struct RootLockedError;

impl std::fmt::Display for RootLockedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sync root locked by another process")
    }
}

impl std::error::Error for RootLockedError {}

/// Exclusive per-root lock so two daemons never sync the same tree.
#[derive(Debug)]
pub struct RootLock {
    #[allow(dead_code)]
    file: fs::File,
    path: PathBuf,
}

pub const LOCK_FILE_NAME: &str = ".davsync.lock";

impl RootLock {
    pub fn try_lock(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
        let lock_path = root.join(LOCK_FILE_NAME);
        let file = open_lock_file(&lock_path)?;
        lock_file(&file).context("lock")?;

        Ok(Self {
            file,
            path: lock_path,
        })
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn lock_file(file: &fs::File) -> Result<()> {
    use std::os::fd::AsRawFd;
    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;

    let rc = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    let raw = err.raw_os_error();
    // macOS uses EWOULDBLOCK=35; Linux typically EWOULDBLOCK/EAGAIN=11.
    if err.kind() == std::io::ErrorKind::WouldBlock || raw == Some(11) || raw == Some(35) {
        return Err(RootLockedError.into());
    }
    Err(err).context("flock")
}

#[cfg(unix)]
fn unlock_file(file: &fs::File) -> Result<()> {
    use std::os::fd::AsRawFd;
    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }
    const LOCK_UN: i32 = 8;
    let rc = unsafe { flock(file.as_raw_fd(), LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error()).context("flock unlock")
    }
}

#[cfg(windows)]
fn lock_file(_file: &fs::File) -> Result<()> {
    // open_lock_file() uses create_new so locking is implicit.
    Ok(())
}

#[cfg(windows)]
fn unlock_file(_file: &fs::File) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn open_lock_file(lock_path: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("open {}", lock_path.display()))
}

#[cfg(windows)]
fn open_lock_file(lock_path: &Path) -> Result<fs::File> {
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(lock_path);
    match file {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(RootLockedError.into()),
        Err(e) => Err(e).with_context(|| format!("open {}", lock_path.display())),
    }
}
