//! `create`: reserve → start session → forward → print instructions.
//!
//! Ordering is the contract: allocation confirmation precedes session
//! start, session start precedes forward creation, forward creation
//! precedes reporting success. A failure at any stage rolls back what the
//! earlier stages created — except an interrupt after the grant, which
//! deliberately leaves the allocation for explicit cleanup.

use std::time::Duration;

use colored::Colorize;
use tracing::warn;
use vdesk::alloc::{AcceleratorSpec, Allocation, AllocationManager, MemSize, ResourceRequest};
use vdesk::error::{Result, VdeskError};
use vdesk::forward::PortForwardManager;
use vdesk::session::{Session, SessionController};
use vdesk::types::Port;
use vdesk_runtime::process::port_available;

use crate::context::CommandContext;

pub struct CreateArgs {
	pub partition: String,
	pub account: String,
	pub time_hours: u32,
	pub cpus: u32,
	pub mem: MemSize,
	pub gpus: Option<AcceleratorSpec>,
	pub timeout_secs: u64,
	pub port: Option<u16>,
	pub force: bool,
}

pub async fn run(ctx: &CommandContext, args: CreateArgs) -> Result<()> {
	let alloc = AllocationManager::new(&ctx.cfg, &ctx.runner);
	let sessions = SessionController::new(&ctx.cfg, &ctx.runner, &ctx.store);
	let forwards = PortForwardManager::new(&ctx.cfg, &ctx.runner);

	if !args.force {
		guard_existing(&alloc, &ctx.cfg.job_name).await?;
	}

	let request = ResourceRequest {
		partition: args.partition,
		account: args.account,
		cpus: args.cpus,
		mem: args.mem,
		walltime_hours: args.time_hours,
		accelerator: args.gpus,
	};

	let allocation = alloc.reserve(&request, Duration::from_secs(args.timeout_secs), &ctx.cancel).await?;
	println!("Node {} reserved with job id {}", allocation.node, allocation.job_id);

	if let Err(err) = sessions.start_instance(&allocation.node, &allocation.job_id).await {
		roll_back(ctx, &allocation, None).await;
		return Err(err);
	}

	println!("Starting desktop session...");
	let session = match sessions
		.start(&allocation.node, &allocation.job_id, None, ctx.cfg.session_start_timeout, &ctx.cancel)
		.await
	{
		Ok(session) => session,
		// An interrupt after the grant leaves the allocation alive for
		// explicit cleanup; anything else rolls it back here.
		Err(err @ VdeskError::Cancelled(_)) => return Err(err),
		Err(err) => {
			roll_back(ctx, &allocation, None).await;
			return Err(err);
		}
	};

	let local = match resolve_local_port(&forwards, args.port) {
		Ok(port) => port,
		Err(err) => {
			roll_back(ctx, &allocation, Some(&session)).await;
			return Err(err);
		}
	};

	if let Err(err) = forwards.create(local, session.port, &allocation.node).await {
		roll_back(ctx, &allocation, Some(&session)).await;
		return Err(err);
	}

	print_instructions(ctx, &allocation, local);
	Ok(())
}

async fn guard_existing(alloc: &AllocationManager<'_>, job_name: &str) -> Result<()> {
	let rows = alloc.query(job_name).await?;
	if rows.is_empty() {
		return Ok(());
	}
	let ids: Vec<String> = rows.iter().map(|row| row.job_id.to_string()).collect();
	Err(VdeskError::Conflict(format!(
		"found existing allocation(s) under job name `{job_name}`: {}; use --force to create another, or `vdesk kill`/`vdesk kill-all` to clean up",
		ids.join(", ")
	)))
}

fn resolve_local_port(forwards: &PortForwardManager<'_>, requested: Option<u16>) -> Result<Port> {
	match requested {
		Some(port) if port_available(port) => Ok(Port(port)),
		Some(port) => Err(VdeskError::Conflict(format!("requested local port {port} is already in use"))),
		None => forwards.find_free_local_port(),
	}
}

/// Best-effort rollback of everything created so far in reverse order.
/// Each step is idempotent; failures are logged and the user can re-run
/// `vdesk kill` to finish.
async fn roll_back(ctx: &CommandContext, allocation: &Allocation, session: Option<&Session>) {
	let sessions = SessionController::new(&ctx.cfg, &ctx.runner, &ctx.store);
	let alloc = AllocationManager::new(&ctx.cfg, &ctx.runner);

	if let Some(session) = session {
		if let Err(err) = sessions.kill(&allocation.node, &allocation.job_id, Some(session.display)).await {
			warn!(target: "vdesk", error = %err, "session rollback failed; re-run `vdesk kill`");
		}
	}
	if let Err(err) = sessions.stop_instance(&allocation.node, &allocation.job_id).await {
		warn!(target: "vdesk", error = %err, "container rollback failed");
	}
	if let Err(err) = alloc.cancel(&allocation.job_id).await {
		warn!(target: "vdesk", id = %allocation.job_id, error = %err, "allocation rollback failed; re-run `vdesk kill`");
	}
}

fn print_instructions(ctx: &CommandContext, allocation: &Allocation, local: Port) {
	let tunnel = format!("ssh -N -f -L {local}:127.0.0.1:{local} {}@{}", ctx.cfg.user, ctx.cfg.login_host);

	println!("=====================");
	println!("Run the following in a new terminal window:");
	println!("\t{}", tunnel.bold());
	println!("then connect to the desktop at {}", format!("localhost:{local}").bold());
	println!("=====================");

	if let Some(container) = &ctx.cfg.container {
		let shell = format!(
			"ssh -t {} {} shell instance://{}",
			ctx.cfg.node_host(&allocation.node),
			container.runtime_bin,
			allocation.job_id
		);
		println!("Run the following to enter the container:");
		println!("\t{shell}");
		println!("=====================");
	}
}
