//! Display-server session control on an allocated node.
//!
//! Everything here is a remote round trip: start parses the server's
//! startup confirmation for the display it actually assigned, list
//! classifies the server's own session listing, check confirms a
//! bookkeeping pid against the allocation's own process set, and kill
//! tears down sessions together with their bookkeeping records and
//! leftover socket files.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vdesk_runtime::{Exec, Runner};

use crate::config::Config;
use crate::error::{Result, VdeskError};
use crate::parse::{self, Parsed};
use crate::store::{self, SessionStore};
use crate::types::{DisplayNum, JobId, NodeName, Pid, Port};

/// A display session on a node, as far as we can currently tell.
#[derive(Debug, Clone)]
pub struct Session {
	pub node: NodeName,
	pub display: DisplayNum,
	pub port: Port,
	pub pid: Option<Pid>,
	pub alive: bool,
}

/// The server's own session listing, split by the configured stale marker.
#[derive(Debug, Clone, Default)]
pub struct SessionListing {
	pub active: Vec<DisplayNum>,
	pub stale: Vec<DisplayNum>,
}

pub struct SessionController<'a> {
	cfg: &'a Config,
	runner: &'a dyn Runner,
	store: &'a dyn SessionStore,
}

impl<'a> SessionController<'a> {
	pub fn new(cfg: &'a Config, runner: &'a dyn Runner, store: &'a dyn SessionStore) -> Self {
		Self { cfg, runner, store }
	}

	/// Command prefix that scopes a remote command to this allocation's
	/// container instance, when a container runtime is configured.
	fn exec_prefix(&self, job: &JobId) -> String {
		match &self.cfg.container {
			Some(container) => format!("{} exec -B {} instance://{job} ", container.runtime_bin, container.bind_paths),
			None => String::new(),
		}
	}

	/// Starts the display server and returns the session it confirmed.
	///
	/// The server may assign a different display than `display_hint`; the
	/// confirmation line is authoritative. A missing or reshaped
	/// confirmation is a contract break, reported distinctly from a
	/// timeout.
	pub async fn start(
		&self,
		node: &NodeName,
		job: &JobId,
		display_hint: Option<DisplayNum>,
		timeout: Duration,
		cancel: &CancellationToken,
	) -> Result<Session> {
		let host = self.cfg.node_host(node);
		let mut command = format!("{}{}", self.exec_prefix(job), self.cfg.display_server.server_bin);
		if let Some(hint) = display_hint {
			command.push_str(&format!(" {hint}"));
		}
		if let Some(xstartup) = &self.cfg.display_server.xstartup {
			command.push_str(&format!(" -xstartup {}", xstartup.display()));
		}

		info!(target: "vdesk.session", %node, hint = ?display_hint, "starting display server");
		let mut stream = self.runner.stream(Exec::Remote { host: &host, command: &command }).await?;

		let deadline = Instant::now() + timeout;
		loop {
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				stream.abort();
				return Err(VdeskError::timeout(timeout, "display-server startup confirmation"));
			}

			tokio::select! {
				_ = cancel.cancelled() => {
					stream.abort();
					return Err(VdeskError::Cancelled(format!("display-server startup on {node} interrupted")));
				}
				line = tokio::time::timeout(remaining, stream.next_line()) => match line {
					Err(_) => {
						stream.abort();
						return Err(VdeskError::timeout(timeout, "display-server startup confirmation"));
					}
					Ok(None) => {
						return Err(VdeskError::parse_mismatch("display server", "startup output ended without a confirmation line"));
					}
					Ok(Some(line)) => {
						match parse::parse_session_confirmation(&line) {
							Parsed::Matched(display) => {
								let key = store::session_key(&host, display);
								let pid = self.store.read_pid(&key).ok().flatten();
								let session = Session {
									node: node.clone(),
									display,
									port: display.port(self.cfg.base_port),
									pid,
									alive: true,
								};
								let dnum = display;
								info!(target: "vdesk.session", %node, display = %dnum, port = %session.port, "session started");
								return Ok(session);
							}
							Parsed::Unrecognized if line.contains("desktop") => {
								// The keyword is there but the shape moved:
								// the tool's output contract changed.
								stream.abort();
								return Err(VdeskError::parse_mismatch("display server", format!("unparseable confirmation line: {line}")));
							}
							Parsed::Unrecognized => {
								debug!(target: "vdesk.session", %line, "skipping line");
							}
						}
					}
				}
			}
		}
	}

	/// Lists the node's sessions as `(active, stale)` display sets.
	/// Unmatched lines are ignored rather than mis-classified.
	pub async fn list(&self, node: &NodeName, job: &JobId) -> Result<SessionListing> {
		let host = self.cfg.node_host(node);
		let command = format!("{}{} -list", self.exec_prefix(job), self.cfg.display_server.server_bin);
		let output = self.runner.run(Exec::Remote { host: &host, command: &command }, Some(Duration::from_secs(30))).await?;
		if !output.success {
			return Err(VdeskError::Remote(format!("session listing on {node} failed: {}", output.text())));
		}

		let mut listing = SessionListing::default();
		for line in &output.lines {
			match parse::parse_listing_row(line, &self.cfg.stale_marker) {
				Parsed::Matched(row) if row.stale => listing.stale.push(row.display),
				Parsed::Matched(row) => listing.active.push(row.display),
				Parsed::Unrecognized => {}
			}
		}
		Ok(listing)
	}

	/// Confirms the bookkeeping pid for `display` is scheduled under this
	/// allocation's own process set. "Some vnc-like process exists" is not
	/// liveness: the user's other sessions would produce false positives.
	pub async fn check(&self, node: &NodeName, job: &JobId, display: DisplayNum) -> Result<bool> {
		let host = self.cfg.node_host(node);
		let key = store::session_key(&host, display);
		let Some(pid) = self.store.read_pid(&key)? else {
			return Ok(false);
		};

		let pids = allocation_pids(self.cfg, self.runner, node, job).await?;
		Ok(pids.contains(&pid))
	}

	/// Kills one display, or every active *and* stale entry when `display`
	/// is `None`. Stale entries still need explicit kills: the server's
	/// bookkeeping outlives the backing process. Killing something already
	/// gone is success.
	pub async fn kill(&self, node: &NodeName, job: &JobId, display: Option<DisplayNum>) -> Result<()> {
		match display {
			Some(display) => self.kill_one(node, job, display).await,
			None => self.kill_every(node, job).await,
		}
	}

	async fn kill_every(&self, node: &NodeName, job: &JobId) -> Result<()> {
		let listing = self.list(node, job).await?;
		let mut failures = Vec::new();

		for display in listing.active.iter().chain(listing.stale.iter()) {
			if let Err(err) = self.kill_one(node, job, *display).await {
				failures.push(format!("kill {display}: {err}"));
			}
		}

		// Sweep bookkeeping records left behind for this host.
		let host = self.cfg.node_host(node);
		let prefix = format!("{host}:");
		match self.store.keys() {
			Ok(keys) => {
				for key in keys.iter().filter(|key| key.starts_with(&prefix)) {
					if let Err(err) = self.store.remove(key) {
						failures.push(format!("remove record {key}: {err}"));
					}
				}
			}
			Err(err) => failures.push(format!("list records: {err}")),
		}

		// Sweep user-owned display/IPC socket files on the node.
		for dir in &self.cfg.remote_socket_dirs {
			let command = format!("find {dir} -mindepth 1 -maxdepth 1 -user {} -delete", self.cfg.user);
			match self.runner.run(Exec::Remote { host: &host, command: &command }, Some(Duration::from_secs(30))).await {
				Ok(output) if output.success => {}
				Ok(output) => debug!(target: "vdesk.session", %dir, detail = %output.text(), "socket sweep reported failure"),
				Err(err) => failures.push(format!("socket sweep {dir}: {err}")),
			}
		}

		if failures.is_empty() {
			Ok(())
		} else {
			Err(VdeskError::PartialState(format!("session teardown on {node}: {}", failures.join("; "))))
		}
	}

	async fn kill_one(&self, node: &NodeName, job: &JobId, display: DisplayNum) -> Result<()> {
		let host = self.cfg.node_host(node);
		let command = format!("{}{} -kill {display}", self.exec_prefix(job), self.cfg.display_server.server_bin);
		let output = self.runner.run(Exec::Remote { host: &host, command: &command }, Some(Duration::from_secs(30))).await?;

		let dnum = display;
		if output.lines.iter().any(|line| parse::kill_acknowledged(line)) {
			info!(target: "vdesk.session", %node, display = %dnum, "session killed");
		} else {
			debug!(target: "vdesk.session", %node, display = %dnum, "kill target already gone");
		}

		self.store.remove(&store::session_key(&host, display))?;

		if let Some(socket) = self.display_socket(display) {
			let command = format!("rm -f {socket}");
			let _ = self.runner.run(Exec::Remote { host: &host, command: &command }, Some(Duration::from_secs(30))).await?;
		}

		Ok(())
	}

	/// Kills `display` and starts a fresh server requesting the same
	/// display, so an existing forward keeps working.
	pub async fn restart(&self, node: &NodeName, job: &JobId, display: DisplayNum, timeout: Duration, cancel: &CancellationToken) -> Result<Session> {
		self.kill_one(node, job, display).await?;
		let session = self.start(node, job, Some(display), timeout, cancel).await?;
		if session.display != display {
			let dnum = display;
			warn!(
				target: "vdesk.session",
				requested = %dnum,
				assigned = %session.display,
				"display server assigned a different display; existing forwards will not reach it"
			);
		}
		Ok(session)
	}

	/// Boots the per-allocation container instance, when configured.
	pub async fn start_instance(&self, node: &NodeName, job: &JobId) -> Result<()> {
		let Some(container) = &self.cfg.container else {
			return Ok(());
		};
		let host = self.cfg.node_host(node);
		let command = format!(
			"{} instance start -B {} {} {job}",
			container.runtime_bin,
			container.bind_paths,
			container.image.display()
		);
		let output = self.runner.run(Exec::Remote { host: &host, command: &command }, Some(Duration::from_secs(60))).await?;
		if output.lines.iter().any(|line| line.contains("instance started successfully")) {
			info!(target: "vdesk.session", %node, %job, "container instance started");
			Ok(())
		} else {
			Err(VdeskError::Remote(format!("container instance failed to start on {node}: {}", output.text())))
		}
	}

	/// Stops the per-allocation container instance; already-gone is success.
	pub async fn stop_instance(&self, node: &NodeName, job: &JobId) -> Result<()> {
		let Some(container) = &self.cfg.container else {
			return Ok(());
		};
		let host = self.cfg.node_host(node);
		let command = format!("{} instance stop {job}", container.runtime_bin);
		let output = self.runner.run(Exec::Remote { host: &host, command: &command }, Some(Duration::from_secs(60))).await?;
		if output.lines.iter().any(|line| line.contains("no instance found")) {
			debug!(target: "vdesk.session", %node, %job, "container instance already gone");
		}
		Ok(())
	}

	/// Whether the per-allocation container instance is currently listed.
	pub async fn instance_running(&self, node: &NodeName, job: &JobId) -> Result<bool> {
		let Some(container) = &self.cfg.container else {
			return Ok(false);
		};
		let host = self.cfg.node_host(node);
		let command = format!("{} instance list", container.runtime_bin);
		let output = self.runner.run(Exec::Remote { host: &host, command: &command }, Some(Duration::from_secs(30))).await?;
		Ok(output.lines.iter().any(|line| line.split_whitespace().any(|tok| tok == job.as_str())))
	}

	fn display_socket(&self, display: DisplayNum) -> Option<String> {
		self.cfg.remote_socket_dirs.first().map(|dir| format!("{dir}/X{}", display.0))
	}
}

/// Pids currently scheduled under the allocation's own process set.
///
/// With a container runtime this is the instance's process table; without
/// one the scheduler's per-job pid listing is authoritative. Either way it
/// is the allocation's set, not the node-wide one.
pub(crate) async fn allocation_pids(cfg: &Config, runner: &dyn Runner, node: &NodeName, job: &JobId) -> Result<Vec<Pid>> {
	let host = cfg.node_host(node);
	let command = match &cfg.container {
		Some(container) => format!("{} exec -B {} instance://{job} ps -o pid= -U {}", container.runtime_bin, container.bind_paths, cfg.user),
		None => format!("{} listpids {job}", cfg.scheduler.control_bin),
	};
	let output = runner.run(Exec::Remote { host: &host, command: &command }, Some(Duration::from_secs(30))).await?;
	if !output.success {
		return Err(VdeskError::Remote(format!("pid listing for job {job} on {node} failed: {}", output.text())));
	}
	Ok(output.lines.iter().filter_map(|line| parse::parse_pid_row(line).matched()).collect())
}

/// Interactive password-tool invocation, run by the CLI with inherited
/// stdio (through the container image when one is configured).
pub fn password_command(cfg: &Config) -> String {
	match &cfg.container {
		Some(container) => format!(
			"{} exec -B {} {} {}",
			container.runtime_bin,
			container.bind_paths,
			container.image.display(),
			cfg.display_server.passwd_bin
		),
		None => cfg.display_server.passwd_bin.clone(),
	}
}

#[cfg(test)]
mod tests {
	use std::path::Path;

	use super::*;
	use crate::config::ContainerConfig;

	fn config() -> Config {
		Config::for_user("jane", Path::new("/home/jane"))
	}

	#[test]
	fn password_command_is_bare_without_container() {
		assert_eq!(password_command(&config()), "vncpasswd");
	}

	#[test]
	fn password_command_runs_through_the_container_image() {
		let mut cfg = config();
		cfg.container = Some(ContainerConfig {
			runtime_bin: "apptainer".to_string(),
			image: "/images/xfce.sif".into(),
			bind_paths: "/tmp:/tmp,$HOME".to_string(),
		});
		assert_eq!(password_command(&cfg), "apptainer exec -B /tmp:/tmp,$HOME /images/xfce.sif vncpasswd");
	}
}
