//! Inter-process lock
//!
//! Advisory `flock` on a dedicated handle of the data file. Acquisitions
//! are counted per thread so nested scopes in one process share a single
//! OS lock:
//!
//! ```text
//!   thread A: shared ──┐
//!   thread B: shared ──┼──► one flock(LOCK_SH)
//!   thread C: exclusive ── waits until A and B release, then LOCK_EX
//! ```
//!
//! A thread asking for exclusive while it alone holds shared upgrades in
//! place, and releasing that exclusive hold downgrades back to shared.
//! `flock` upgrades are not atomic, so a thread never upgrades while other
//! threads of this process still read under the shared lock.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use fs2::FileExt;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{trace, warn};

use crate::error::{MapKvError, Result};

/// Requested lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn name(self) -> &'static str {
        match self {
            LockMode::Shared => "shared",
            LockMode::Exclusive => "exclusive",
        }
    }
}

#[derive(Debug, Default)]
struct HoldCounts {
    shared: usize,
    shared_by: HashMap<ThreadId, usize>,
    exclusive: usize,
    exclusive_owner: Option<ThreadId>,
}

impl HoldCounts {
    fn shared_of(&self, thread: ThreadId) -> usize {
        self.shared_by.get(&thread).copied().unwrap_or(0)
    }

    /// Whether another thread's holds keep `thread` from taking `mode`
    fn blocks(&self, mode: LockMode, thread: ThreadId) -> bool {
        let foreign_exclusive = self.exclusive_owner.is_some_and(|owner| owner != thread);
        match mode {
            LockMode::Shared => foreign_exclusive,
            LockMode::Exclusive => foreign_exclusive || self.shared > self.shared_of(thread),
        }
    }
}

/// Re-entrant advisory file lock
#[derive(Debug)]
pub struct InterProcessLock {
    /// None in single-process mode: every acquisition is a no-op
    file: Option<File>,
    holds: Mutex<HoldCounts>,
    released: Condvar,
    timeout: Option<Duration>,
}

/// Releases its hold when dropped
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a InterProcessLock,
    mode: LockMode,
    thread: ThreadId,
}

impl InterProcessLock {
    /// Lock over `path`, opened through a separate handle
    pub fn open(path: &Path, timeout: Option<Duration>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self {
            file: Some(file),
            holds: Mutex::new(HoldCounts::default()),
            released: Condvar::new(),
            timeout,
        })
    }

    /// A lock that never touches the OS (single-process mode)
    pub fn disabled() -> Self {
        Self {
            file: None,
            holds: Mutex::new(HoldCounts::default()),
            released: Condvar::new(),
            timeout: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    pub fn acquire_shared(&self) -> Result<LockGuard<'_>> {
        self.acquire(LockMode::Shared)
    }

    pub fn acquire_exclusive(&self) -> Result<LockGuard<'_>> {
        self.acquire(LockMode::Exclusive)
    }

    /// Current (shared, exclusive) hold counts across all threads
    pub fn holds(&self) -> (usize, usize) {
        let holds = self.holds.lock();
        (holds.shared, holds.exclusive)
    }

    fn acquire(&self, mode: LockMode) -> Result<LockGuard<'_>> {
        let thread = thread::current().id();
        let Some(file) = &self.file else {
            return Ok(LockGuard { lock: self, mode, thread });
        };

        let start = Instant::now();
        let mut holds = self.holds.lock();
        let owns_exclusive = holds.exclusive_owner == Some(thread);
        match mode {
            LockMode::Shared => {
                if !owns_exclusive {
                    self.wait_turn(&mut holds, mode, thread, start)?;
                    if holds.shared == 0 {
                        self.os_lock(file, LockMode::Shared, start)?;
                    }
                }
                holds.shared += 1;
                *holds.shared_by.entry(thread).or_insert(0) += 1;
            }
            LockMode::Exclusive => {
                if !owns_exclusive {
                    self.wait_turn(&mut holds, mode, thread, start)?;
                    if let Err(e) = self.os_lock(file, LockMode::Exclusive, start) {
                        // A failed flock upgrade may have dropped our shared lock
                        if holds.shared > 0 {
                            self.os_lock(file, LockMode::Shared, Instant::now())?;
                        }
                        return Err(e);
                    }
                    holds.exclusive_owner = Some(thread);
                }
                holds.exclusive += 1;
            }
        }
        trace!(mode = mode.name(), "file lock acquired");
        Ok(LockGuard { lock: self, mode, thread })
    }

    fn release(&self, mode: LockMode, thread: ThreadId) -> io::Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };

        let mut holds = self.holds.lock();
        match mode {
            LockMode::Shared => {
                holds.shared = holds.shared.saturating_sub(1);
                let remaining = holds.shared_by.get_mut(&thread).map(|count| {
                    *count = count.saturating_sub(1);
                    *count
                });
                if remaining == Some(0) {
                    holds.shared_by.remove(&thread);
                }
                if holds.shared == 0 && holds.exclusive == 0 {
                    FileExt::unlock(file)?;
                }
            }
            LockMode::Exclusive => {
                holds.exclusive = holds.exclusive.saturating_sub(1);
                if holds.exclusive == 0 {
                    holds.exclusive_owner = None;
                    if holds.shared > 0 {
                        FileExt::lock_shared(file)?;
                    } else {
                        FileExt::unlock(file)?;
                    }
                }
            }
        }
        self.released.notify_all();
        trace!(mode = mode.name(), "file lock released");
        Ok(())
    }

    /// Wait for other threads of this process to release conflicting holds
    fn wait_turn(
        &self,
        holds: &mut MutexGuard<'_, HoldCounts>,
        mode: LockMode,
        thread: ThreadId,
        start: Instant,
    ) -> Result<()> {
        while holds.blocks(mode, thread) {
            match self.timeout {
                None => self.released.wait(holds),
                Some(timeout) => {
                    let waited = start.elapsed();
                    if waited >= timeout {
                        warn!(mode = mode.name(), ?waited, "lock timed out behind another thread");
                        return Err(MapKvError::LockTimeout {
                            mode: mode.name(),
                            waited,
                        });
                    }
                    self.released.wait_for(holds, timeout - waited);
                }
            }
        }
        Ok(())
    }

    /// Take the OS lock, blocking or polling until `start + timeout`
    fn os_lock(&self, file: &File, mode: LockMode, start: Instant) -> Result<()> {
        let Some(timeout) = self.timeout else {
            match mode {
                LockMode::Shared => FileExt::lock_shared(file)?,
                LockMode::Exclusive => FileExt::lock_exclusive(file)?,
            }
            return Ok(());
        };

        let mut backoff = Duration::from_millis(1);
        loop {
            let attempt = match mode {
                LockMode::Shared => FileExt::try_lock_shared(file),
                LockMode::Exclusive => FileExt::try_lock_exclusive(file),
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if is_contended(&e) => {
                    let waited = start.elapsed();
                    if waited >= timeout {
                        warn!(mode = mode.name(), ?waited, "file lock timed out");
                        return Err(MapKvError::LockTimeout {
                            mode: mode.name(),
                            waited,
                        });
                    }
                    thread::sleep(backoff.min(timeout - waited));
                    backoff = (backoff * 2).min(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release(self.mode, self.thread) {
            warn!(mode = self.mode.name(), error = %e, "failed to release file lock");
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
