//! `kill` and `kill-all`: discovery-driven idempotent teardown.

use vdesk::discover::DiscoveryCorrelator;
use vdesk::error::Result;
use vdesk::gc::{GarbageCollector, KillReport};
use vdesk::types::JobId;

use crate::context::CommandContext;

pub async fn kill_one(ctx: &CommandContext, job_id: &str) -> Result<()> {
	let id = JobId::new(job_id);
	let view = DiscoveryCorrelator::new(&ctx.cfg, &ctx.runner, &ctx.store).discover(&ctx.cfg.job_name).await?;
	let report = GarbageCollector::new(&ctx.cfg, &ctx.runner, &ctx.store).kill_one(&id, &view).await?;
	summarize(&report);
	Ok(())
}

pub async fn kill_all(ctx: &CommandContext) -> Result<()> {
	println!("Killing all sessions with job name {}...", ctx.cfg.job_name);
	let report = GarbageCollector::new(&ctx.cfg, &ctx.runner, &ctx.store).kill_all(&ctx.cfg.job_name).await?;
	summarize(&report);
	Ok(())
}

fn summarize(report: &KillReport) {
	for id in &report.torn_down {
		println!("Killed session and cancelled allocation {id}");
	}
	for id in &report.cancelled_only {
		println!("Cancelled pending allocation {id}");
	}
	if report.torn_down.is_empty() && report.cancelled_only.is_empty() {
		println!("Nothing to kill.");
	}
}
