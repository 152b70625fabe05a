//! A PID file lock keeps a second copy of a driver from fighting over the
//! radio or the storage tree. The file is created with O_CREAT|O_EXCL; a
//! leftover file from a crashed run is detected by probing the recorded
//! PID and removed.
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::warn;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::{error::Error, Result};

#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    /// Acquire the lock, replacing a stale file whose recorded process no
    /// longer exists. Fails with [`Error::AlreadyRunning`] when the holder
    /// is alive.
    pub fn acquire(path: &Path) -> Result<PidLock> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    return Ok(PidLock {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let contents = fs::read_to_string(path)?;
                    let pid: i32 = contents.trim().parse().unwrap_or(0);
                    if pid > 0 && process_exists(pid) {
                        return Err(Error::AlreadyRunning(pid));
                    }
                    warn!("removing stale PID file {} (PID {})", path.display(), pid);
                    fs::remove_file(path)?;
                    // and try again
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn process_exists(pid: i32) -> bool {
    // Signal 0 probes for existence. EPERM still means the process is
    // there, just owned by someone else.
    match kill(Pid::from_raw(pid), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_dir;

    #[test]
    fn second_acquire_is_refused_while_holder_lives() {
        let path = temp_dir("pidlock").join("lock.pid");
        let lock = PidLock::acquire(&path).unwrap();
        // The file records our own (very much alive) PID.
        match PidLock::acquire(&path) {
            Err(Error::AlreadyRunning(pid)) => assert_eq!(pid, std::process::id() as i32),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        drop(lock);
        assert!(!path.exists());
        // Once released, the next acquisition succeeds.
        let _lock = PidLock::acquire(&path).unwrap();
    }

    #[test]
    fn stale_pid_file_is_replaced() {
        let path = temp_dir("pidlock-stale").join("lock.pid");
        // i32::MAX is above any real pid_max, so this process never exists.
        fs::write(&path, i32::MAX.to_string()).unwrap();
        let _lock = PidLock::acquire(&path).unwrap();
        let recorded: i32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(recorded, std::process::id() as i32);
    }

    #[test]
    fn unparsable_pid_file_is_replaced() {
        let path = temp_dir("pidlock-garbage").join("lock.pid");
        fs::write(&path, "not a pid").unwrap();
        let _lock = PidLock::acquire(&path).unwrap();
    }
}
