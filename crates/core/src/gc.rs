//! Idempotent teardown of allocations, sessions, and forwards.

use tracing::{info, warn};
use vdesk_runtime::Runner;

use crate::alloc::AllocationManager;
use crate::config::Config;
use crate::discover::{CorrelatedView, DiscoveryCorrelator, DiscoveryWarning};
use crate::error::{Result, VdeskError};
use crate::session::SessionController;
use crate::store::SessionStore;
use crate::types::{JobId, NodeName};

/// What a kill pass actually tore down.
#[derive(Debug, Clone, Default)]
pub struct KillReport {
	/// Allocations whose node-side session was torn down before cancel.
	pub torn_down: Vec<JobId>,
	/// Pending/blocked allocations that only needed a cancel.
	pub cancelled_only: Vec<JobId>,
}

pub struct GarbageCollector<'a> {
	cfg: &'a Config,
	runner: &'a dyn Runner,
	store: &'a dyn SessionStore,
}

impl<'a> GarbageCollector<'a> {
	pub fn new(cfg: &'a Config, runner: &'a dyn Runner, store: &'a dyn SessionStore) -> Self {
		Self { cfg, runner, store }
	}

	/// Tears down every allocation under `job_name`: session first (the
	/// node is still reachable), then the allocation. Each step is
	/// independently idempotent, so a partial failure is reported and the
	/// user re-runs.
	pub async fn kill_all(&self, job_name: &str) -> Result<KillReport> {
		let view = DiscoveryCorrelator::new(self.cfg, self.runner, self.store).discover(job_name).await?;
		let mut report = KillReport::default();
		let mut failures = Vec::new();

		for entry in &view.entries {
			match self.teardown(&entry.job_id, &entry.node).await {
				Ok(()) => report.torn_down.push(entry.job_id.clone()),
				Err(err) => failures.push(format!("job {}: {err}", entry.job_id)),
			}
		}

		for warning in &view.warnings {
			if let DiscoveryWarning::PendingAllocation { job_id, .. } = warning {
				match AllocationManager::new(self.cfg, self.runner).cancel(job_id).await {
					Ok(_) => report.cancelled_only.push(job_id.clone()),
					Err(err) => failures.push(format!("job {job_id}: {err}")),
				}
			}
		}

		if failures.is_empty() {
			Ok(report)
		} else {
			Err(VdeskError::PartialState(failures.join("; ")))
		}
	}

	/// Tears down the one allocation `id`, resolved through discovery.
	pub async fn kill_one(&self, id: &JobId, view: &CorrelatedView) -> Result<KillReport> {
		let mut report = KillReport::default();

		if let Some(entry) = view.find(id) {
			let node = entry.node.clone();
			self.teardown(id, &node).await?;
			report.torn_down.push(id.clone());
			return Ok(report);
		}

		if view.pending_reason(id).is_some() {
			AllocationManager::new(self.cfg, self.runner).cancel(id).await?;
			report.cancelled_only.push(id.clone());
			return Ok(report);
		}

		Err(VdeskError::NotFound(format!("job {id} is not claimed or already killed")))
	}

	/// Session kill is ordered before allocation cancel so cleanup still
	/// has a reachable node; every step runs even when an earlier one
	/// fails, because each is idempotent on its own.
	async fn teardown(&self, job: &JobId, node: &NodeName) -> Result<()> {
		let sessions = SessionController::new(self.cfg, self.runner, self.store);
		let alloc = AllocationManager::new(self.cfg, self.runner);
		let mut failures = Vec::new();

		if let Err(err) = sessions.stop_instance(node, job).await {
			warn!(target: "vdesk.gc", %job, error = %err, "container instance stop failed");
			failures.push(format!("instance stop: {err}"));
		}

		if let Err(err) = sessions.kill(node, job, None).await {
			warn!(target: "vdesk.gc", %job, error = %err, "session kill failed");
			failures.push(format!("session kill: {err}"));
		}

		if let Err(err) = alloc.cancel(job).await {
			warn!(target: "vdesk.gc", %job, error = %err, "allocation cancel failed");
			failures.push(format!("allocation cancel: {err}"));
		}

		if failures.is_empty() {
			info!(target: "vdesk.gc", %job, %node, "allocation torn down");
			Ok(())
		} else {
			Err(VdeskError::PartialState(failures.join("; ")))
		}
	}
}
