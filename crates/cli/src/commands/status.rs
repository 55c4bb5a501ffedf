//! `status`: render the reconstructed live view.

use serde_json::json;
use vdesk::discover::{CorrelatedEntry, CorrelatedView, DiscoveryCorrelator, SessionView};
use vdesk::error::Result;
use vdesk::session::SessionController;

use crate::cli::OutputFormat;
use crate::context::CommandContext;

pub async fn run(ctx: &CommandContext, format: OutputFormat) -> Result<()> {
	let view = DiscoveryCorrelator::new(&ctx.cfg, &ctx.runner, &ctx.store).discover(&ctx.cfg.job_name).await?;

	match format {
		OutputFormat::Text => render_text(ctx, &view).await,
		OutputFormat::Json => render_json(ctx, &view),
	}
}

async fn render_text(ctx: &CommandContext, view: &CorrelatedView) -> Result<()> {
	println!("Active {} jobs:", ctx.cfg.job_name);

	if view.entries.is_empty() {
		println!("\t(none)");
	}

	for entry in &view.entries {
		println!("\tJob id: {}", entry.job_id);
		println!("\t\tNode: {}", entry.node);
		println!("\t\tState: {}", entry.state);
		if let Some(time_left) = &entry.time_left {
			println!("\t\tTime left: {time_left}");
		}

		match &entry.session {
			SessionView::Live(session) => {
				println!("\t\tSession: alive at display {} (port {})", session.display, session.port);
			}
			SessionView::Absent => println!("\t\tSession: none found"),
			SessionView::Unknown => println!("\t\tSession: unknown (node could not be probed)"),
		}

		match &entry.forward {
			Some(forward) => {
				println!("\t\tLocal port: {}", forward.local);
				println!(
					"\t\tRun command: ssh -N -f -L {0}:127.0.0.1:{0} {1}@{2}",
					forward.local, ctx.cfg.user, ctx.cfg.login_host
				);
			}
			None => println!("\t\tLocal port: none (run `vdesk repair` if the session is alive)"),
		}

		print_container_hint(ctx, entry).await;
	}

	for warning in &view.warnings {
		println!("Warning: {warning}");
	}

	Ok(())
}

async fn print_container_hint(ctx: &CommandContext, entry: &CorrelatedEntry) {
	let Some(container) = &ctx.cfg.container else {
		return;
	};
	if entry.session.live().is_none() {
		return;
	}

	let sessions = SessionController::new(&ctx.cfg, &ctx.runner, &ctx.store);
	if let Ok(true) = sessions.instance_running(&entry.node, &entry.job_id).await {
		println!(
			"\t\tEnter container: ssh -t {} {} shell instance://{}",
			ctx.cfg.node_host(&entry.node),
			container.runtime_bin,
			entry.job_id
		);
	}
}

fn render_json(ctx: &CommandContext, view: &CorrelatedView) -> Result<()> {
	let jobs: Vec<_> = view
		.entries
		.iter()
		.map(|entry| {
			let session = match &entry.session {
				SessionView::Live(session) => json!({
					"alive": true,
					"display": session.display.0,
					"port": session.port.0,
					"pid": session.pid.map(|pid| pid.0),
				}),
				SessionView::Absent => json!(null),
				SessionView::Unknown => json!("unknown"),
			};
			let forward = entry.forward.as_ref().map(|forward| {
				json!({
					"local_port": forward.local.0,
					"remote_port": forward.remote.0,
					"pid": forward.pid.map(|pid| pid.0),
				})
			});
			json!({
				"job_id": entry.job_id,
				"node": entry.node,
				"state": entry.state,
				"time_left": entry.time_left,
				"session": session,
				"forward": forward,
			})
		})
		.collect();

	let warnings: Vec<String> = view.warnings.iter().map(|warning| warning.to_string()).collect();
	let payload = json!({
		"job_name": ctx.cfg.job_name,
		"jobs": jobs,
		"warnings": warnings,
	});

	println!("{payload}");
	Ok(())
}
