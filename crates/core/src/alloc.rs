//! Allocation lifecycle against the batch scheduler.
//!
//! `reserve` drives the scheduler's streamed progress lines through the
//! structured parsers; when the stream ends before the node-ready line (a
//! known race under cluster load) it falls back to polling the queue for
//! the captured allocation id. `cancel` is idempotent and `Expired` is
//! only ever observed via the queue, never driven from here.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vdesk_runtime::{Exec, Runner};

use crate::config::Config;
use crate::error::{Result, VdeskError};
use crate::parse::{self, Parsed, QueueNode, QueueRow};
use crate::types::{JobId, NodeName};

/// Memory size with a scheduler-accepted unit suffix (`16G`, `512M`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemSize {
	amount: u64,
	unit: char,
}

impl FromStr for MemSize {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		if !s.is_ascii() {
			return Err(format!("invalid memory size `{s}`"));
		}
		let (digits, unit) = s.split_at(s.len().saturating_sub(1));
		let unit = unit.chars().next().ok_or("empty memory size")?;
		if !matches!(unit, 'K' | 'M' | 'G' | 'T') {
			return Err(format!("invalid memory unit in `{s}` (expected K, M, G, or T)"));
		}
		let amount: u64 = digits.parse().map_err(|_| format!("invalid memory amount in `{s}`"))?;
		if amount == 0 {
			return Err("memory amount must be non-zero".to_string());
		}
		Ok(Self { amount, unit })
	}
}

impl fmt::Display for MemSize {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}{}", self.amount, self.unit)
	}
}

/// Optional accelerator request: a bare count (`2`) or type-qualified
/// (`a40:2`), rendered into the scheduler's generic-resource syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorSpec {
	pub kind: Option<String>,
	pub count: u32,
}

impl FromStr for AcceleratorSpec {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		match s.split_once(':') {
			None => {
				let count = s.parse().map_err(|_| format!("invalid accelerator count `{s}`"))?;
				Ok(Self { kind: None, count })
			}
			Some((kind, count)) => {
				if kind.is_empty() {
					return Err(format!("empty accelerator type in `{s}`"));
				}
				let count = count.parse().map_err(|_| format!("invalid accelerator count in `{s}`"))?;
				Ok(Self {
					kind: Some(kind.to_string()),
					count,
				})
			}
		}
	}
}

impl AcceleratorSpec {
	fn gres_arg(&self) -> String {
		match &self.kind {
			Some(kind) => format!("--gres=gpu:{kind}:{}", self.count),
			None => format!("--gres=gpu:{}", self.count),
		}
	}
}

/// Requested resources for one allocation.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
	pub partition: String,
	pub account: String,
	pub cpus: u32,
	pub mem: MemSize,
	pub walltime_hours: u32,
	pub accelerator: Option<AcceleratorSpec>,
}

/// Observable allocation lifecycle.
///
/// `Expired` is reached when the scheduler reclaims the allocation on its
/// own; discovery observes that lazily as the job vanishing from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationState {
	Unsubmitted,
	Pending(JobId),
	Granted { id: JobId, node: NodeName },
	Cancelled,
	Expired,
}

/// A granted allocation with its assigned node.
#[derive(Debug, Clone)]
pub struct Allocation {
	pub job_id: JobId,
	pub node: NodeName,
	pub request: ResourceRequest,
}

/// Outcome of an idempotent cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
	Cancelled,
	/// The scheduler did not know the id; cancelling something already
	/// terminated is a report, not an error.
	AlreadyGone,
}

pub struct AllocationManager<'a> {
	cfg: &'a Config,
	runner: &'a dyn Runner,
}

impl<'a> AllocationManager<'a> {
	pub fn new(cfg: &'a Config, runner: &'a dyn Runner) -> Self {
		Self { cfg, runner }
	}

	/// Submits a resource request and waits for a node assignment.
	///
	/// Cancellation is forwarded into the in-flight request immediately;
	/// the request may have been granted in the meantime, so the error
	/// names the id for manual cleanup rather than pretending rollback.
	pub async fn reserve(&self, request: &ResourceRequest, timeout: Duration, cancel: &CancellationToken) -> Result<Allocation> {
		let args = self.submit_args(request);
		info!(
			target: "vdesk.alloc",
			partition = %request.partition,
			cpus = request.cpus,
			mem = %request.mem,
			hours = request.walltime_hours,
			"requesting allocation"
		);

		let mut stream = self
			.runner
			.stream(Exec::Local {
				program: &self.cfg.scheduler.submit_bin,
				args,
			})
			.await?;

		let deadline = Instant::now() + timeout;
		let mut state = AllocationState::Unsubmitted;

		loop {
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				stream.abort();
				break;
			}

			tokio::select! {
				_ = cancel.cancelled() => {
					stream.abort();
					return Err(self.cancelled_error(&state));
				}
				line = tokio::time::timeout(remaining, stream.next_line()) => match line {
					Err(_) => {
						stream.abort();
						break;
					}
					// Stream ended without the node-ready line: the known
					// race under load. The queue fallback takes over.
					Ok(None) => break,
					Ok(Some(line)) => {
						if let Parsed::Matched(id) = parse::parse_allocation_id(&line) {
							debug!(target: "vdesk.alloc", %id, "allocation id captured");
							state = AllocationState::Pending(id);
						} else if let Parsed::Matched(node) = parse::parse_node_ready(&line) {
							let AllocationState::Pending(id) = &state else {
								stream.abort();
								return Err(VdeskError::parse_mismatch("salloc", format!("node-ready line before allocation id: {line}")));
							};
							let allocation = Allocation {
								job_id: id.clone(),
								node,
								request: request.clone(),
							};
							info!(target: "vdesk.alloc", id = %allocation.job_id, node = %allocation.node, "allocation granted");
							return Ok(allocation);
						} else {
							debug!(target: "vdesk.alloc", %line, "skipping line");
						}
					}
				}
			}
		}

		self.await_via_queue(state, request, timeout, deadline, cancel).await
	}

	/// Queue-polling fallback for when the submit stream went quiet.
	async fn await_via_queue(
		&self,
		state: AllocationState,
		request: &ResourceRequest,
		timeout: Duration,
		deadline: Instant,
		cancel: &CancellationToken,
	) -> Result<Allocation> {
		let AllocationState::Pending(id) = state else {
			return Err(VdeskError::timeout(timeout, "allocation grant"));
		};

		loop {
			match self.query(&self.cfg.job_name).await {
				Ok(rows) => {
					if let Some(row) = rows.iter().find(|row| row.job_id == id) {
						match &row.node {
							QueueNode::Ready(node) => {
								info!(target: "vdesk.alloc", %id, %node, "allocation granted (via queue fallback)");
								return Ok(Allocation {
									job_id: id,
									node: node.clone(),
									request: request.clone(),
								});
							}
							QueueNode::Pending(reason) => {
								debug!(target: "vdesk.alloc", %id, %reason, "allocation still pending");
							}
						}
					}
				}
				Err(err) => warn!(target: "vdesk.alloc", error = %err, "queue fallback query failed"),
			}

			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				warn!(target: "vdesk.alloc", %id, "node assignment timed out; cancelling the pending allocation");
				let _ = self.cancel(&id).await;
				return Err(VdeskError::timeout(timeout, format!("node assignment for allocation {id}")));
			}

			tokio::select! {
				_ = cancel.cancelled() => {
					return Err(self.cancelled_error(&AllocationState::Pending(id)));
				}
				_ = tokio::time::sleep(self.cfg.queue_poll_interval.min(remaining)) => {}
			}
		}
	}

	/// Cancels an allocation. Unknown or already-terminated ids are
	/// reported as [`CancelOutcome::AlreadyGone`], never as errors.
	pub async fn cancel(&self, id: &JobId) -> Result<CancelOutcome> {
		let output = self
			.runner
			.run(
				Exec::Local {
					program: &self.cfg.scheduler.cancel_bin,
					args: vec![id.to_string()],
				},
				Some(Duration::from_secs(30)),
			)
			.await?;

		if output.success {
			info!(target: "vdesk.alloc", %id, "allocation cancelled");
			Ok(CancelOutcome::Cancelled)
		} else {
			info!(target: "vdesk.alloc", %id, detail = %output.text(), "cancel target already gone");
			Ok(CancelOutcome::AlreadyGone)
		}
	}

	/// Read-only queue listing for the invoking user and `job_name`.
	/// Placeholder node columns come back as pending reasons, never nodes.
	pub async fn query(&self, job_name: &str) -> Result<Vec<QueueRow>> {
		let args = vec![
			"-h".to_string(),
			"-u".to_string(),
			self.cfg.user.clone(),
			"-n".to_string(),
			job_name.to_string(),
			"-o".to_string(),
			"%i %T %L %R".to_string(),
		];
		let output = self
			.runner
			.run(
				Exec::Local {
					program: &self.cfg.scheduler.queue_bin,
					args,
				},
				Some(Duration::from_secs(30)),
			)
			.await?;

		if !output.success {
			return Err(VdeskError::Remote(format!("queue query failed: {}", output.text())));
		}

		let mut rows = Vec::new();
		for line in &output.lines {
			match parse::parse_queue_row(line) {
				Parsed::Matched(row) => rows.push(row),
				Parsed::Unrecognized => {
					if !line.trim().is_empty() {
						debug!(target: "vdesk.alloc", %line, "ignoring unrecognized queue line");
					}
				}
			}
		}
		Ok(rows)
	}

	fn submit_args(&self, request: &ResourceRequest) -> Vec<String> {
		let mut args = vec![
			"-J".to_string(),
			self.cfg.job_name.clone(),
			"--no-shell".to_string(),
			"-p".to_string(),
			request.partition.clone(),
			"-A".to_string(),
			request.account.clone(),
			"-t".to_string(),
			format!("{}:00:00", request.walltime_hours),
			format!("--mem={}", request.mem),
			"-c".to_string(),
			request.cpus.to_string(),
		];
		if let Some(accelerator) = &request.accelerator {
			args.push(accelerator.gres_arg());
		}
		args
	}

	fn cancelled_error(&self, state: &AllocationState) -> VdeskError {
		match state {
			AllocationState::Pending(id) | AllocationState::Granted { id, .. } => VdeskError::Cancelled(format!(
				"allocation wait interrupted; job {id} may still exist and require `vdesk kill {id}`"
			)),
			_ => VdeskError::Cancelled("allocation wait interrupted before submission was acknowledged".to_string()),
		}
	}
}
