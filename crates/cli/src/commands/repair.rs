//! `repair`: recreate missing forwards for sessions discovery confirmed
//! alive. Never automatic — only this command creates forwards outside of
//! `create`.

use vdesk::discover::{DiscoveryCorrelator, SessionView};
use vdesk::error::Result;
use vdesk::forward::{PortForwardManager, RepairOutcome};

use crate::context::CommandContext;

pub async fn run(ctx: &CommandContext) -> Result<()> {
	let view = DiscoveryCorrelator::new(&ctx.cfg, &ctx.runner, &ctx.store).discover(&ctx.cfg.job_name).await?;
	let forwards = PortForwardManager::new(&ctx.cfg, &ctx.runner);

	let mut repaired = 0usize;
	for entry in &view.entries {
		if entry.forward.is_some() {
			continue;
		}
		let SessionView::Live(_) = &entry.session else {
			continue;
		};

		match forwards.repair(&entry.node, &entry.job_id).await? {
			RepairOutcome::Created(forward) => {
				repaired += 1;
				println!("Repaired forward for job {}: local port {}", entry.job_id, forward.local);
				println!(
					"\tssh -N -f -L {0}:127.0.0.1:{0} {1}@{2}",
					forward.local, ctx.cfg.user, ctx.cfg.login_host
				);
			}
			RepairOutcome::AlreadyForwarded(forward) => {
				println!("Job {} already forwarded on local port {}", entry.job_id, forward.local);
			}
		}
	}

	for warning in &view.warnings {
		println!("Warning: {warning}");
	}
	if repaired == 0 {
		println!("No forwards needed repair.");
	}
	Ok(())
}
