//! Single-Instance Lock Files
//!
//! Each long-running role holds a PID-stamped lock file in its working
//! directory so two fetchers (or two appliers) never operate on the same
//! directory. A lock whose PID is no longer alive is stale and is taken over.
//! The lock is released on drop.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    acquired: bool,
}

impl PidLock {
    /// Acquires the lock at `path`, replacing a stale one.
    ///
    /// The PID is written and synced to a staging file first, then
    /// hard-linked to `path`, so the lock never exists without a PID in it.
    ///
    /// # Errors
    ///
    /// [`Error::LockHeld`] if another live process holds it.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let pid = std::process::id();
        let staged = staging_path(&path, pid);
        write_pid(&staged, pid)?;
        let result = Self::link_into_place(&staged, path, pid);
        if let Err(e) = crate::artifact::remove_if_exists(&staged) {
            warn!(path = %staged.display(), error = %e, "Failed to remove staged lock");
        }
        result
    }

    fn link_into_place(staged: &Path, path: PathBuf, pid: u32) -> Result<Self> {
        // Second attempt only after removing a stale lock.
        for _ in 0..2 {
            match fs::hard_link(staged, &path) {
                Ok(()) => {
                    info!(path = %path.display(), pid, "Lock acquired");
                    return Ok(Self {
                        path,
                        acquired: true,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if let Some(holder) = Self::holder(&path)? {
                        if holder != pid && is_pid_alive(holder) {
                            return Err(Error::LockHeld { path, pid: holder });
                        }
                        warn!(path = %path.display(), pid = holder, "Removing stale lock");
                    } else {
                        warn!(path = %path.display(), "Removing unreadable lock");
                    }
                    crate::artifact::remove_if_exists(&path)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Io(io::Error::new(
            io::ErrorKind::WouldBlock,
            format!("lock {} was re-created concurrently", path.display()),
        )))
    }

    /// PID recorded in the lock file, `None` if absent or unparseable.
    pub fn holder(path: &Path) -> Result<Option<u32>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(text.trim().parse().ok().filter(|&pid| pid > 0)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(&mut self) {
        if !self.acquired {
            return;
        }
        self.acquired = false;
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Lock released"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove lock"),
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// `<lock>.<pid>.tmp`, private to this process.
fn staging_path(path: &Path, pid: u32) -> PathBuf {
    let mut staged = path.as_os_str().to_owned();
    staged.push(format!(".{pid}.tmp"));
    PathBuf::from(staged)
}

fn write_pid(path: &Path, pid: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    writeln!(file, "{pid}")?;
    file.sync_all()?;
    Ok(())
}

/// Signal 0 checks for existence; EPERM still means the process exists.
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
