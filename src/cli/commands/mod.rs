//! CLI command implementations

pub mod completions;
pub mod config;
pub mod invalidate;
pub mod lecture;
pub mod refresh;
pub mod status;

pub use completions::execute as completions;
pub use config::execute as config;
pub use invalidate::execute as invalidate;
pub use invalidate::reset;
pub use lecture::execute as lecture;
pub use refresh::execute as refresh;
pub use status::execute as status;

use crate::error::{StampError, StampResult};
use crate::users::{Account, PasswdCache};
use nix::unistd::{geteuid, getuid};
use tracing::debug;

/// Resolve the user a command acts on.
///
/// Without a name this is the invoking (real) user. Naming anyone else
/// requires an effective uid of 0.
pub(crate) fn resolve_target(user: Option<&str>, users: &mut PasswdCache) -> StampResult<Account> {
    let invoker = users.lookup_uid(getuid().as_raw())?;

    let Some(name) = user else {
        return Ok(invoker);
    };
    if name == invoker.name {
        return Ok(invoker);
    }
    if !geteuid().is_root() {
        return Err(StampError::PermissionDenied(format!(
            "only root may act on the time stamps of {}",
            name
        )));
    }
    let account = users.lookup_name(name)?;
    debug!("acting on behalf of {} ({})", account.name, account.uid);
    Ok(account)
}
