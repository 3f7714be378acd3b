//! Kernel-held authentication tickets
//!
//! Some platforms can remember a successful authentication on the terminal
//! itself. When such a ticket is available in kernel scope the record store
//! is not consulted at all.

use std::io;
use std::time::Duration;

/// Answer from a kernel ticket check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelVerdict {
    Current,
    Old,
    /// No ticket facility; fall back to the time stamp file
    Unsupported,
}

/// A kernel facility that can hold an authentication ticket.
///
/// `set` and `clear` return `Ok(false)` when the facility is not available
/// for the calling process.
pub trait KernelTicket {
    fn check(&self) -> KernelVerdict;

    /// Record a successful authentication valid for `window`
    fn set(&self, window: Duration) -> io::Result<bool>;

    fn clear(&self) -> io::Result<bool>;
}
