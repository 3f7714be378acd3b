//! Lecture command - first-use notice marker

use crate::cli::args::LectureArgs;
use crate::cli::commands::resolve_target;
use crate::config::Config;
use crate::error::StampResult;
use crate::stamp::{already_lectured, set_lectured};
use crate::users::PasswdCache;
use console::style;

/// Execute the lecture command
pub async fn execute(args: LectureArgs, config: &Config) -> StampResult<()> {
    let mut users = PasswdCache::new();
    let settings = config.settings(&mut users)?;
    let target = resolve_target(args.user.as_deref(), &mut users)?;

    if args.mark {
        set_lectured(&settings, &target.name)?;
        println!("  {} Notice recorded for {}", style("[OK]").green(), target.name);
    } else if already_lectured(&settings, &target.name) {
        println!("{}: lectured", target.name);
    } else {
        println!("{}: not lectured", target.name);
    }
    Ok(())
}
