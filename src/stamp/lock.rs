//! Advisory byte-range locks on time stamp files
//!
//! Locks are POSIX `fcntl` write locks on absolute offsets. They belong to
//! the process: any descriptor of the same file closed by this process drops
//! them, and they never conflict with other locks held by this process.
//!
//! A blocking wait can be interrupted with SIGINT or SIGQUIT. The signal is
//! then delivered again once the previous dispositions are back in place, so
//! a ^C at a stuck prompt behaves exactly as it would anywhere else.

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::signal::{
    self, pthread_sigmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use nix::unistd::getpid;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

/// Signal number recorded by the temporary handler, 0 if none fired
static CAUGHT_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signo: libc::c_int) {
    CAUGHT_SIGNAL.store(signo, Ordering::SeqCst);
}

/// How to behave when another process holds the region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Block until the lock is granted or an interrupt arrives
    Wait,
    /// Fail immediately with [`LockError::WouldBlock`]
    Try,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock wait interrupted by signal {signal}")]
    Interrupted { signal: i32 },

    #[error("time stamp record is locked by another process")]
    WouldBlock,

    #[error("unable to lock offset {offset}: {source}")]
    Os {
        offset: u64,
        #[source]
        source: io::Error,
    },
}

const INTERRUPTS: [Signal; 2] = [Signal::SIGINT, Signal::SIGQUIT];

/// Installs the interrupt handlers and unblocks SIGINT/SIGQUIT; everything is
/// put back when dropped
struct InterruptGuard {
    saved: Vec<(Signal, SigAction)>,
    saved_mask: Option<SigSet>,
}

impl InterruptGuard {
    fn install() -> Self {
        CAUGHT_SIGNAL.store(0, Ordering::SeqCst);

        // No SA_RESTART: the pending fcntl must return EINTR.
        let action = SigAction::new(
            SigHandler::Handler(record_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let mut saved = Vec::with_capacity(INTERRUPTS.len());
        for sig in INTERRUPTS {
            // SAFETY: the handler only stores into an atomic, which is
            // async-signal-safe.
            match unsafe { signal::sigaction(sig, &action) } {
                Ok(old) => saved.push((sig, old)),
                Err(e) => debug!("unable to catch {}: {}", sig, e),
            }
        }

        let mut unblock = SigSet::empty();
        for sig in INTERRUPTS {
            unblock.add(sig);
        }
        let mut old_mask = SigSet::empty();
        let saved_mask =
            match pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&unblock), Some(&mut old_mask)) {
                Ok(()) => Some(old_mask),
                Err(e) => {
                    debug!("unable to unblock interrupts: {}", e);
                    None
                }
            };

        Self { saved, saved_mask }
    }

    fn caught(&self) -> Option<i32> {
        match CAUGHT_SIGNAL.load(Ordering::SeqCst) {
            0 => None,
            signo => Some(signo),
        }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if let Some(mask) = &self.saved_mask {
            if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(mask), None) {
                debug!("unable to restore signal mask: {}", e);
            }
        }
        for (sig, old) in &self.saved {
            // SAFETY: reinstates a disposition previously returned by the kernel.
            if let Err(e) = unsafe { signal::sigaction(*sig, old) } {
                debug!("unable to restore {} handler: {}", sig, e);
            }
        }
    }
}

fn to_off(value: u64) -> io::Result<libc::off_t> {
    libc::off_t::try_from(value)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "lock offset out of range"))
}

fn lock_request(lock_type: libc::c_int, offset: u64, len: u64) -> io::Result<libc::flock> {
    Ok(libc::flock {
        l_type: lock_type as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: to_off(offset)?,
        l_len: to_off(len)?,
        l_pid: 0,
    })
}

/// Take a write lock on `len` bytes at `offset`.
///
/// Never retries: an interrupted or failed wait is reported as is.
pub fn lock_region(file: &File, offset: u64, len: u64, mode: LockMode) -> Result<(), LockError> {
    let fl = lock_request(libc::F_WRLCK, offset, len)
        .map_err(|source| LockError::Os { offset, source })?;
    let fd = file.as_raw_fd();
    match mode {
        LockMode::Try => match fcntl(fd, FcntlArg::F_SETLK(&fl)) {
            Ok(_) => Ok(()),
            Err(Errno::EAGAIN | Errno::EACCES) => Err(LockError::WouldBlock),
            Err(e) => Err(LockError::Os {
                offset,
                source: e.into(),
            }),
        },
        LockMode::Wait => {
            let guard = InterruptGuard::install();
            let result = fcntl(fd, FcntlArg::F_SETLKW(&fl));
            let caught = guard.caught();
            drop(guard);

            let Err(errno) = result else {
                return Ok(());
            };
            debug!("failed to lock [{}, +{}]: {}", offset, len, errno);

            match caught {
                Some(signo) => {
                    warn!("time stamp lock wait interrupted by signal {}", signo);
                    if let Ok(sig) = Signal::try_from(signo) {
                        if let Err(e) = signal::kill(getpid(), sig) {
                            debug!("unable to resend {}: {}", sig, e);
                        }
                    }
                    Err(LockError::Interrupted { signal: signo })
                }
                None => Err(LockError::Os {
                    offset,
                    source: errno.into(),
                }),
            }
        }
    }
}

/// Release a lock taken by [`lock_region`]
pub fn unlock_region(file: &File, offset: u64, len: u64) -> Result<(), LockError> {
    let fl = lock_request(libc::F_UNLCK, offset, len)
        .map_err(|source| LockError::Os { offset, source })?;
    fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&fl))
        .map(|_| ())
        .map_err(|e| LockError::Os {
            offset,
            source: e.into(),
        })
}

/// A region lock released on drop
pub struct RegionGuard<'a> {
    file: &'a File,
    offset: u64,
    len: u64,
}

impl<'a> RegionGuard<'a> {
    pub fn acquire(file: &'a File, offset: u64, len: u64, mode: LockMode) -> Result<Self, LockError> {
        lock_region(file, offset, len, mode)?;
        Ok(Self { file, offset, len })
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = unlock_region(self.file, self.offset, self.len) {
            debug!("unable to unlock [{}, +{}]: {}", self.offset, self.len, e);
        }
    }
}
