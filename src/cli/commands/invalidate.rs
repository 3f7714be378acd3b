//! Invalidate and reset commands - forget cached authentications

use crate::audit::{AuditEvent, AuditLog};
use crate::cli::args::TargetArgs;
use crate::cli::commands::resolve_target;
use crate::config::Config;
use crate::error::StampResult;
use crate::stamp::{remove, SessionEnv};
use crate::users::PasswdCache;
use console::style;

/// Execute the invalidate command: disable matching records in place
pub async fn execute(args: TargetArgs, config: &Config) -> StampResult<()> {
    forget(args, config, false).await
}

/// Execute the reset command: remove the whole time stamp file
pub async fn reset(args: TargetArgs, config: &Config) -> StampResult<()> {
    forget(args, config, true).await
}

async fn forget(args: TargetArgs, config: &Config, unlink: bool) -> StampResult<()> {
    let mut users = PasswdCache::new();
    let settings = config.settings(&mut users)?;
    let target = resolve_target(args.user.as_deref(), &mut users)?;

    remove(&settings, &target.name, &SessionEnv::system(), unlink)?;

    let event = if unlink {
        AuditEvent::Reset {
            user: target.name.clone(),
        }
    } else {
        AuditEvent::Invalidated {
            user: target.name.clone(),
            scope: settings.scope,
        }
    };
    AuditLog::new(config).record(&event).await;

    let what = if unlink { "removed" } else { "invalidated" };
    println!(
        "  {} Time stamps {} for {}",
        style("[OK]").green(),
        what,
        target.name
    );
    Ok(())
}
