//! Local SSH tunnel management: probe, create, verify, repair.

use std::time::Duration;

use tracing::{debug, info};
use vdesk_runtime::process::{parse_ps_rows, port_available};
use vdesk_runtime::{Exec, Runner};

use crate::config::Config;
use crate::error::{Result, VdeskError};
use crate::parse::{self, Parsed};
use crate::session;
use crate::types::{JobId, NodeName, Pid, Port};

/// A local tunnel process mapping a local port to a node's session port.
#[derive(Debug, Clone)]
pub struct Forward {
	pub local: Port,
	pub remote: Port,
	pub host: String,
	/// Owning tunnel process; unknown right after creation because the
	/// tunnel daemonizes itself.
	pub pid: Option<Pid>,
}

/// Outcome of a repair pass for one allocation.
#[derive(Debug, Clone)]
pub enum RepairOutcome {
	/// A forward already exists; repair is a no-op.
	AlreadyForwarded(Forward),
	Created(Forward),
}

pub struct PortForwardManager<'a> {
	cfg: &'a Config,
	runner: &'a dyn Runner,
}

impl<'a> PortForwardManager<'a> {
	pub fn new(cfg: &'a Config, runner: &'a dyn Runner) -> Self {
		Self { cfg, runner }
	}

	/// First free local port in the probe window above the base port.
	///
	/// A probe, not a reservation: concurrent invocations by the same user
	/// can race for the same port.
	pub fn find_free_local_port(&self) -> Result<Port> {
		let base = self.cfg.base_port;
		for offset in 1..=self.cfg.port_window {
			let port = base.saturating_add(offset);
			if port_available(port) {
				return Ok(Port(port));
			}
		}
		Err(VdeskError::ResourceExhausted(base.saturating_add(1), base.saturating_add(self.cfg.port_window)))
	}

	/// Spawns a background tunnel and confirms it actually bound the local
	/// port. Spawn success only means the process launched, so the local
	/// listening table is polled up to the configured attempt bound; on
	/// exhaustion the caller must roll back whatever it created upstream.
	pub async fn create(&self, local: Port, remote: Port, node: &NodeName) -> Result<Forward> {
		let host = self.cfg.node_host(node);
		let args = vec!["-N".to_string(), "-f".to_string(), "-L".to_string(), format!("{local}:127.0.0.1:{remote}"), host.clone()];

		info!(target: "vdesk.forward", %local, %remote, %host, "creating tunnel");
		let output = self
			.runner
			.run(
				Exec::Local {
					program: &self.cfg.ssh_bin,
					args,
				},
				Some(Duration::from_secs(30)),
			)
			.await?;
		if !output.success {
			return Err(VdeskError::Remote(format!("tunnel process failed to start: {}", output.text())));
		}

		for attempt in 0..self.cfg.forward_poll_attempts {
			if !port_available(local.0) {
				debug!(target: "vdesk.forward", %local, attempt, "tunnel bound");
				return Ok(Forward {
					local,
					remote,
					host,
					pid: None,
				});
			}
			tokio::time::sleep(self.cfg.forward_poll_interval).await;
		}

		let waited = self.cfg.forward_poll_interval * self.cfg.forward_poll_attempts;
		Err(VdeskError::timeout(waited, format!("local port {local} to bind")))
	}

	/// Enumerates the user's live tunnel processes from the local process
	/// table. Node attribution happens later, by host matching; a node
	/// hosting two allocations for the same user stays ambiguous here.
	pub async fn list_local(&self) -> Result<Vec<Forward>> {
		let args = vec!["-u".to_string(), self.cfg.user.clone(), "-o".to_string(), "pid=,args=".to_string()];
		let output = self.runner.run(Exec::Local { program: "ps", args }, Some(Duration::from_secs(10))).await?;
		if !output.success {
			return Err(VdeskError::Remote(format!("local process listing failed: {}", output.text())));
		}

		let mut forwards = Vec::new();
		for entry in parse_ps_rows(&output.text()) {
			if let Parsed::Matched(tunnel) = parse::parse_tunnel_args(&entry.args) {
				forwards.push(Forward {
					local: tunnel.local,
					remote: tunnel.remote,
					host: tunnel.host,
					pid: Some(Pid(entry.pid)),
				});
			}
		}
		Ok(forwards)
	}

	/// Restores the forward for a live session that lost its tunnel (for
	/// example after a control-host restart).
	///
	/// The session's port is re-derived from the node's process table
	/// scoped to the allocation's pid set — not from the bookkeeping file,
	/// which may itself be stale across a restart. No-op when a forward
	/// for the node already exists.
	pub async fn repair(&self, node: &NodeName, job: &JobId) -> Result<RepairOutcome> {
		let existing = self.list_local().await?;
		if let Some(forward) = existing
			.into_iter()
			.find(|forward| node.matches_host(&forward.host, self.cfg.node_domain.as_deref()))
		{
			info!(target: "vdesk.forward", %node, local = %forward.local, "forward already present; nothing to repair");
			return Ok(RepairOutcome::AlreadyForwarded(forward));
		}

		let pids = session::allocation_pids(self.cfg, self.runner, node, job).await?;
		let host = self.cfg.node_host(node);
		let command = format!("ps -o pid=,args= -U {}", self.cfg.user);
		let output = self.runner.run(Exec::Remote { host: &host, command: &command }, Some(Duration::from_secs(30))).await?;
		if !output.success {
			return Err(VdeskError::Remote(format!("process listing on {node} failed: {}", output.text())));
		}

		let marker = &self.cfg.display_server.process_marker;
		let display = parse_ps_rows(&output.text())
			.into_iter()
			.filter(|entry| pids.contains(&Pid(entry.pid)))
			.find_map(|entry| parse::parse_display_arg(&entry.args, marker).matched());

		let Some(display) = display else {
			return Err(VdeskError::NotFound(format!("no live display-server process for job {job} on {node}")));
		};

		let remote = display.port(self.cfg.base_port);
		let local = self.find_free_local_port()?;
		let forward = self.create(local, remote, node).await?;
		info!(target: "vdesk.forward", %node, local = %forward.local, remote = %forward.remote, "forward repaired");
		Ok(RepairOutcome::Created(forward))
	}
}
