//! Status command - classify the caller's time stamp

use crate::audit::{AuditEvent, AuditLog};
use crate::cli::args::{OutputFormat, StatusArgs};
use crate::cli::commands::resolve_target;
use crate::config::Config;
use crate::error::StampResult;
use crate::stamp::{CacheSession, LockMode, SessionEnv, StatusCheck, TimestampStatus};
use crate::users::PasswdCache;
use console::style;
use std::process::ExitCode;

/// Execute the status command.
///
/// Exits 0 only when the time stamp is current.
pub async fn execute(args: StatusArgs, config: &Config) -> StampResult<ExitCode> {
    let mut users = PasswdCache::new();
    let settings = config.settings(&mut users)?;
    let target = resolve_target(args.user.as_deref(), &mut users)?;
    let env = SessionEnv::system();
    let session_id = env.facts.session_id;

    let check = match CacheSession::open_with(&settings, &target.name, session_id, env) {
        Ok(mut session) => {
            let mode = if args.no_wait {
                LockMode::Try
            } else {
                LockMode::Wait
            };
            session.lock_with(target.uid, mode)?;
            let check = session.status();
            session.close();
            check
        }
        Err(e) if !e.is_fatal() && e.is_recoverable() => StatusCheck::from_error(&e),
        Err(e) => return Err(e),
    };

    if check.reason.is_tamper() {
        AuditLog::new(config)
            .record(&AuditEvent::Tamper {
                user: target.name.clone(),
                scope: settings.scope,
                reason: check.reason,
            })
            .await;
    }

    match args.format {
        OutputFormat::Json => {
            let out = serde_json::json!({
                "user": target.name,
                "scope": settings.scope.to_string(),
                "status": check.status,
                "reason": check.reason,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => print_check(&target.name, &check),
    }

    Ok(if check.is_current() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn print_check(user: &str, check: &StatusCheck) {
    let status = match check.status {
        TimestampStatus::Current => style(check.status.to_string()).green().bold(),
        TimestampStatus::Old | TimestampStatus::Missing => {
            style(check.status.to_string()).yellow().bold()
        }
        TimestampStatus::Error | TimestampStatus::Fatal => {
            style(check.status.to_string()).red().bold()
        }
    };
    println!("{}: {} ({})", style(user).bold(), status, check.reason);
}
