//! Per-backup exclusive lock files with stale-owner detection.
//!
//! A lock is a PID-stamped file created with create-if-absent semantics.
//! If the file already exists, its owner PID is probed: a PID equal to
//! our own or our parent's is treated as stale (we are re-entering after
//! a restart under the same process tree), a dead PID (`ESRCH` on a
//! zero-signal probe) is stale, and a live PID means the lock is
//! genuinely held elsewhere.
//!
//! Two process-global structures back this: the list of lock paths we
//! currently hold, and whether the exit hook that unlinks them has been
//! installed. Both are touched only from [`lock_backup`]; the engine is
//! single-threaded, so no additional synchronization is required beyond
//! what protects the statics themselves.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};

use anyhow::{bail, Context, Error};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use thiserror::Error as ThisError;

/// Bound on the stale-owner retry loop (step 5 of the acquisition
/// algorithm); exceeding it is a fatal, not a recoverable, condition.
const MAX_ACQUIRE_ITERATIONS: usize = 100;

/// The two ways [`lock_backup`] can fail to hand back a held lock:
/// contention by a live peer (recoverable, class 4 of the error
/// taxonomy — callers decide whether to wait or give up) versus
/// everything else (fatal, class 1/5/6).
#[derive(Debug, ThisError)]
pub enum LockError {
    #[error("lock {0:?} is held by running process {1}")]
    Contended(PathBuf, i32),
    #[error("{0}")]
    Fatal(#[from] Error),
}

enum LockOutcome {
    Acquired,
    Contended(i32),
}

static HELD_LOCKS: Lazy<Mutex<Vec<PathBuf>>> = Lazy::new(|| Mutex::new(Vec::new()));
static EXIT_HOOK_INSTALLED: Once = Once::new();

extern "C" fn release_held_locks() {
    if let Ok(mut held) = HELD_LOCKS.lock() {
        for path in held.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) | Err(_) if !path.exists() => {}
                Err(err) => log::warn!("failed to remove lock file {:?} on exit: {}", path, err),
            }
        }
    }
}

fn install_exit_hook() {
    EXIT_HOOK_INSTALLED.call_once(|| unsafe {
        libc::atexit(release_held_locks);
    });
}

fn register_held_lock(path: &Path) {
    install_exit_hook();
    HELD_LOCKS.lock().expect("lock registry poisoned").push(path.to_path_buf());
}

/// Unregister a lock path without touching the filesystem. Used by tests
/// and by callers that release a lock deliberately before process exit.
pub fn forget_held_lock(path: &Path) {
    if let Ok(mut held) = HELD_LOCKS.lock() {
        held.retain(|p| p != path);
    }
}

fn parse_owner_pid(contents: &str) -> Result<i32, Error> {
    let pid: i64 = contents
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .parse()
        .with_context(|| format!("lock file contains no valid PID: {:?}", contents))?;
    if pid <= 0 {
        bail!("lock file contains a non-positive PID: {}", pid);
    }
    Ok(pid as i32)
}

fn is_stale_owner(owner_pid: i32) -> Result<bool, Error> {
    let own_pid = std::process::id() as i32;
    let parent_pid = nix::unistd::getppid().as_raw();
    if owner_pid == own_pid || owner_pid == parent_pid {
        return Ok(true);
    }

    match kill(Pid::from_raw(owner_pid), None) {
        Ok(()) => Ok(false), // alive
        Err(nix::errno::Errno::ESRCH) => Ok(true), // dead, stale
        Err(err) => bail!("unable to probe lock owner pid {}: {}", owner_pid, err),
    }
}

/// Attempt to acquire the exclusive lock at `path`.
///
/// `Ok(())`: acquired. `Err(LockError::Contended)`: a live peer process
/// holds it (non-fatal — class 4 of the error taxonomy, the caller
/// decides what to do). `Err(LockError::Fatal)`: an I/O fault or lock
/// corruption.
pub fn lock_backup(path: &Path) -> Result<(), LockError> {
    match try_lock(path) {
        Ok(LockOutcome::Acquired) => Ok(()),
        Ok(LockOutcome::Contended(owner_pid)) => Err(LockError::Contended(path.to_path_buf(), owner_pid)),
        Err(err) => Err(LockError::Fatal(err)),
    }
}

fn try_lock(path: &Path) -> Result<LockOutcome, Error> {
    for _ in 0..MAX_ACQUIRE_ITERATIONS {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let write_result = (|| -> std::io::Result<()> {
                    file.write_all(format!("{}\n", std::process::id()).as_bytes())?;
                    file.flush()
                })();
                if let Err(err) = write_result {
                    let _ = fs::remove_file(path);
                    bail!("failed writing lock file {:?}: {}", path, err);
                }
                register_held_lock(path);
                return Ok(LockOutcome::Acquired);
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                match fs::File::open(path) {
                    Ok(mut existing) => {
                        let mut contents = String::new();
                        match existing.read_to_string(&mut contents) {
                            Ok(_) => {}
                            Err(_) if !path.exists() => continue, // disappeared, retry create
                            Err(err) => bail!("unable to read lock file {:?}: {}", path, err),
                        }
                        drop(existing);

                        let owner_pid = parse_owner_pid(&contents)?;
                        if is_stale_owner(owner_pid)? {
                            match fs::remove_file(path) {
                                Ok(()) => continue,
                                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                                Err(err) => bail!("unable to remove stale lock file {:?}: {}", path, err),
                            }
                        } else {
                            log::warn!("backup lock {:?} held by running process {}", path, owner_pid);
                            return Ok(LockOutcome::Contended(owner_pid));
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue, // disappeared, retry create
                    Err(err) => bail!("unable to open lock file {:?}: {}", path, err),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                // Treated the same as AlreadyExists: inspect the existing owner.
                match fs::File::open(path) {
                    Ok(mut existing) => {
                        let mut contents = String::new();
                        existing
                            .read_to_string(&mut contents)
                            .with_context(|| format!("unable to read lock file {:?}", path))?;
                        let owner_pid = parse_owner_pid(&contents)?;
                        if is_stale_owner(owner_pid)? {
                            fs::remove_file(path).with_context(|| format!("unable to remove stale lock file {:?}", path))?;
                            continue;
                        } else {
                            log::warn!("backup lock {:?} held by running process {}", path, owner_pid);
                            return Ok(LockOutcome::Contended(owner_pid));
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => bail!("unable to open lock file {:?}: {}", path, err),
                }
            }
            Err(err) => bail!("unable to create lock file {:?}: {}", path, err),
        }
    }

    bail!("exceeded {} iterations acquiring lock {:?}", MAX_ACQUIRE_ITERATIONS, path)
}

/// Lock a sequence of backup directories, highest to lowest (the caller
/// supplies the order already). The first failure — contention or a
/// fatal error — aborts the whole operation; locks already acquired
/// remain held until process exit.
pub fn lock_backups_bulk(lock_paths: &[PathBuf]) -> Result<(), LockError> {
    for path in lock_paths {
        lock_backup(path)?;
    }
    Ok(())
}
