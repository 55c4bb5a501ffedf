//! `restart`: bounce the session on one allocation without touching its
//! allocation or forward, requesting the same display so existing tunnels
//! keep working.

use vdesk::discover::DiscoveryCorrelator;
use vdesk::error::{Result, VdeskError};
use vdesk::session::SessionController;
use vdesk::types::JobId;

use crate::context::CommandContext;

pub async fn run(ctx: &CommandContext, job_id: &str) -> Result<()> {
	let id = JobId::new(job_id);
	let view = DiscoveryCorrelator::new(&ctx.cfg, &ctx.runner, &ctx.store).discover(&ctx.cfg.job_name).await?;

	let Some(entry) = view.find(&id) else {
		return Err(VdeskError::NotFound(format!("job {id} is not claimed or already killed")));
	};
	let Some(session) = entry.session.live() else {
		return Err(VdeskError::NotFound(format!("job {id} has no live session to restart")));
	};

	let sessions = SessionController::new(&ctx.cfg, &ctx.runner, &ctx.store);
	let restarted = sessions
		.restart(&entry.node, &id, session.display, ctx.cfg.session_start_timeout, &ctx.cancel)
		.await?;

	println!("Session restarted on {} at display {} (port {})", entry.node, restarted.display, restarted.port);
	Ok(())
}
