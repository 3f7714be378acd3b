//! Refresh command - record a successful authentication

use crate::audit::{AuditEvent, AuditLog, RecordTarget};
use crate::cli::args::TargetArgs;
use crate::cli::commands::resolve_target;
use crate::config::Config;
use crate::error::{StampError, StampResult};
use crate::stamp::{CacheSession, SessionEnv};
use crate::users::PasswdCache;
use console::style;

/// Execute the refresh command.
///
/// Meant to be run by the authenticating program once the user proved
/// their identity, so it is restricted to root and the time stamp owner.
pub async fn execute(args: TargetArgs, config: &Config) -> StampResult<()> {
    let mut users = PasswdCache::new();
    let settings = config.settings(&mut users)?;

    let euid = nix::unistd::geteuid();
    if !euid.is_root() && euid.as_raw() != settings.owner.uid {
        return Err(StampError::PermissionDenied(
            "refreshing time stamps".to_string(),
        ));
    }
    let target = resolve_target(args.user.as_deref(), &mut users)?;

    let env = SessionEnv::system();
    let session_id = env.facts.session_id;
    let mut session = CacheSession::open_with(&settings, &target.name, session_id, env)?;
    session.lock(target.uid)?;
    let record = session.update()?;
    let offset = session.record_offset();
    session.close();

    AuditLog::new(config)
        .record(&AuditEvent::Refreshed {
            user: target.name.clone(),
            uid: target.uid,
            scope: settings.scope,
            session_id,
            record: RecordTarget::from(&record),
            offset,
        })
        .await;

    println!(
        "  {} Time stamp refreshed for {} ({})",
        style("[OK]").green(),
        target.name,
        record.kind
    );
    Ok(())
}
