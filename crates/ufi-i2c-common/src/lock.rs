//! Cross-process advisory lock around the shared bus.
//!
//! Every process touching the bus (daemons, CLI tools, test harnesses) takes
//! an `flock(2)` on one well-known file before selecting mux channels. The
//! lock is attempted without blocking and retried a bounded number of times,
//! so a stuck holder turns into [`I2cError::LockTimeout`] instead of a hang.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{I2cError, I2cResult};

/// Default lock file path.
pub const DEFAULT_LOCK_PATH: &str = "/var/lib/ufi-platform/i2c.lock";

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default pause between attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Excludes every other holder. Required for writes and for anything
    /// that depends on a mux channel staying selected.
    Exclusive,
    /// Coexists with other shared holders, excludes exclusive ones.
    Shared,
}

impl LockMode {
    fn flock_arg(self) -> FlockArg {
        match self {
            LockMode::Exclusive => FlockArg::LockExclusiveNonblock,
            LockMode::Shared => FlockArg::LockSharedNonblock,
        }
    }
}

/// Retry budget for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Retries after the first attempt; total attempts is one more.
    pub max_retries: u32,
    /// Sleep between attempts.
    pub retry_interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Hands out scoped locks on one lock file.
#[derive(Debug, Clone)]
pub struct LockBroker {
    path: PathBuf,
    policy: LockPolicy,
}

impl LockBroker {
    /// Creates a broker for `path` with the default retry policy.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            policy: LockPolicy::default(),
        }
    }

    /// Replaces the retry policy.
    pub fn with_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Retry policy in use.
    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Acquires the lock in `mode`.
    ///
    /// Makes up to `max_retries + 1` non-blocking attempts, sleeping
    /// `retry_interval` between them. The returned guard releases the lock
    /// and closes the file when dropped. On timeout the file is closed
    /// before returning.
    pub fn acquire(&self, mode: LockMode) -> I2cResult<BusLock> {
        let mut file = self.open()?;
        let attempts = self.policy.max_retries + 1;
        for attempt in 1..=attempts {
            match Flock::lock(file, mode.flock_arg()) {
                Ok(flock) => {
                    trace!(path = %self.path.display(), ?mode, attempt, "Acquired bus lock");
                    return Ok(BusLock { _flock: flock, mode });
                }
                Err((returned, errno)) if errno == Errno::EWOULDBLOCK => {
                    file = returned;
                    if attempt < attempts {
                        debug!(
                            path = %self.path.display(),
                            ?mode,
                            attempt,
                            "Bus lock busy, retrying"
                        );
                        thread::sleep(self.policy.retry_interval);
                    }
                }
                Err((_, errno)) => {
                    return Err(I2cError::LockFile {
                        path: self.path.clone(),
                        source: io::Error::from(errno),
                    });
                }
            }
        }
        drop(file);
        Err(I2cError::LockTimeout {
            path: self.path.clone(),
            attempts,
        })
    }

    /// Runs `f` while holding the lock in `mode`. The lock is released on
    /// every exit path, including unwinding. `f` is not called if the lock
    /// cannot be acquired.
    pub fn with_lock<R, E, F>(&self, mode: LockMode, f: F) -> Result<R, E>
    where
        E: From<I2cError>,
        F: FnOnce() -> Result<R, E>,
    {
        let _lock = self.acquire(mode)?;
        f()
    }

    /// Opens the lock file, creating it (and its directory) if absent.
    fn open(&self) -> I2cResult<File> {
        let lock_err = |source| I2cError::LockFile {
            path: self.path.clone(),
            source,
        };
        match File::open(&self.path) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).map_err(lock_err)?;
                }
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&self.path)
                    .map_err(lock_err)
            }
            Err(e) => Err(lock_err(e)),
        }
    }
}

/// A held bus lock. Released and closed on drop.
pub struct BusLock {
    _flock: Flock<File>,
    mode: LockMode,
}

impl std::fmt::Debug for BusLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusLock").field("mode", &self.mode).finish()
    }
}

impl BusLock {
    /// Mode the lock is held in.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}
