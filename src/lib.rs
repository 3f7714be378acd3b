//! credstamp - credential time stamp cache
//!
//! Remembers, per user and per terminal, parent process or login, that the
//! user recently authenticated, so a privilege elevation tool can skip the
//! password prompt for a short while.

pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod stamp;
pub mod users;

pub use error::{StampError, StampResult};
