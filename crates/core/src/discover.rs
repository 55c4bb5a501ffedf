//! Live-state reconstruction: the three-source join.
//!
//! Nothing durable records which sessions exist, so this component
//! rebuilds the `(allocation, session, forward)` set from scratch on
//! every invocation, joining sources that were never designed to be
//! joined: the scheduler queue (allocation id + node), the local tunnel
//! process table (port pairs, attributed to nodes by host matching), and
//! per-node liveness probes. A forward is reported active only when its
//! session independently confirms live at the same instant; unconfirmed
//! forwards are dropped from the view — repairing them is an explicit,
//! separately-invoked operation, never automatic.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, warn};
use vdesk_runtime::Runner;
use vdesk_runtime::process::pid_is_alive;

use crate::alloc::AllocationManager;
use crate::config::Config;
use crate::error::Result;
use crate::forward::{Forward, PortForwardManager};
use crate::parse::QueueNode;
use crate::session::{Session, SessionController};
use crate::store::{self, SessionStore};
use crate::types::{JobId, NodeName};

/// What we could establish about a node's session.
///
/// `Unknown` means the liveness source was unreachable: the field
/// degrades instead of failing the whole query.
#[derive(Debug, Clone)]
pub enum SessionView {
	Unknown,
	Absent,
	Live(Session),
}

impl SessionView {
	pub fn live(&self) -> Option<&Session> {
		match self {
			SessionView::Live(session) => Some(session),
			_ => None,
		}
	}
}

/// Non-fatal findings surfaced alongside the correlated entries.
#[derive(Debug, Clone)]
pub enum DiscoveryWarning {
	/// The scheduler reported a placeholder instead of a node: the
	/// allocation is queued or blocked, and must never appear as a host.
	PendingAllocation { job_id: JobId, reason: String },
	/// One of the three sources could not be queried; affected fields
	/// are reported unknown rather than aborting discovery.
	SourceUnavailable { source: &'static str, detail: String },
	/// One node hosts several allocations for this user; tunnel
	/// attribution by host match cannot tell them apart.
	AmbiguousNode { node: NodeName },
}

impl fmt::Display for DiscoveryWarning {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DiscoveryWarning::PendingAllocation { job_id, reason } => {
				if reason.contains("QOS") {
					write!(f, "job {job_id} is blocked ({reason}); run `vdesk kill {job_id}` to clear it")
				} else {
					write!(f, "job {job_id} is still queued ({reason})")
				}
			}
			DiscoveryWarning::SourceUnavailable { source, detail } => write!(f, "{source} unavailable: {detail}"),
			DiscoveryWarning::AmbiguousNode { node } => {
				write!(f, "node {node} hosts multiple allocations for this user; tunnel attribution is ambiguous")
			}
		}
	}
}

/// One allocation's correlated row.
#[derive(Debug, Clone)]
pub struct CorrelatedEntry {
	pub job_id: JobId,
	pub node: NodeName,
	pub state: String,
	pub time_left: Option<String>,
	pub session: SessionView,
	/// Confirmed-active forward only; unconfirmed candidates are dropped.
	pub forward: Option<Forward>,
}

/// The reconstructed live set plus everything worth telling the user.
#[derive(Debug, Clone, Default)]
pub struct CorrelatedView {
	pub entries: Vec<CorrelatedEntry>,
	pub warnings: Vec<DiscoveryWarning>,
}

impl CorrelatedView {
	pub fn find(&self, id: &JobId) -> Option<&CorrelatedEntry> {
		self.entries.iter().find(|entry| &entry.job_id == id)
	}

	/// Pending/blocked reason for `id`, when the scheduler holds it
	/// without a node.
	pub fn pending_reason(&self, id: &JobId) -> Option<&str> {
		self.warnings.iter().find_map(|warning| match warning {
			DiscoveryWarning::PendingAllocation { job_id, reason } if job_id == id => Some(reason.as_str()),
			_ => None,
		})
	}
}

pub struct DiscoveryCorrelator<'a> {
	cfg: &'a Config,
	runner: &'a dyn Runner,
	store: &'a dyn SessionStore,
}

impl<'a> DiscoveryCorrelator<'a> {
	pub fn new(cfg: &'a Config, runner: &'a dyn Runner, store: &'a dyn SessionStore) -> Self {
		Self { cfg, runner, store }
	}

	/// Rebuilds the live `(allocation, session, forward)` set for
	/// `job_name`, read-only. Nodes are handled sequentially; each entry
	/// is independent of the others.
	pub async fn discover(&self, job_name: &str) -> Result<CorrelatedView> {
		let alloc = AllocationManager::new(self.cfg, self.runner);
		let sessions = SessionController::new(self.cfg, self.runner, self.store);
		let forwards = PortForwardManager::new(self.cfg, self.runner);

		let mut view = CorrelatedView::default();

		let rows = match alloc.query(job_name).await {
			Ok(rows) => rows,
			Err(err) => {
				warn!(target: "vdesk.discover", error = %err, "scheduler queue unreachable");
				view.warnings.push(DiscoveryWarning::SourceUnavailable {
					source: "scheduler queue",
					detail: err.to_string(),
				});
				return Ok(view);
			}
		};

		let tunnels = match forwards.list_local().await {
			Ok(tunnels) => tunnels,
			Err(err) => {
				warn!(target: "vdesk.discover", error = %err, "local tunnel table unreachable");
				view.warnings.push(DiscoveryWarning::SourceUnavailable {
					source: "local tunnel table",
					detail: err.to_string(),
				});
				Vec::new()
			}
		};

		let mut node_counts: HashMap<NodeName, u32> = HashMap::new();
		for row in &rows {
			if let QueueNode::Ready(node) = &row.node {
				*node_counts.entry(node.clone()).or_default() += 1;
			}
		}
		for (node, count) in &node_counts {
			if *count > 1 {
				view.warnings.push(DiscoveryWarning::AmbiguousNode { node: node.clone() });
			}
		}

		for row in rows {
			match row.node {
				QueueNode::Pending(reason) => {
					view.warnings.push(DiscoveryWarning::PendingAllocation {
						job_id: row.job_id,
						reason,
					});
				}
				QueueNode::Ready(node) => {
					let entry = self
						.correlate_node(&sessions, &tunnels, row.job_id, node, row.state, row.time_left, &mut view.warnings)
						.await;
					view.entries.push(entry);
				}
			}
		}

		Ok(view)
	}

	#[allow(clippy::too_many_arguments)]
	async fn correlate_node(
		&self,
		sessions: &SessionController<'_>,
		tunnels: &[Forward],
		job_id: JobId,
		node: NodeName,
		state: String,
		time_left: Option<String>,
		warnings: &mut Vec<DiscoveryWarning>,
	) -> CorrelatedEntry {
		let domain = self.cfg.node_domain.as_deref();
		let host = self.cfg.node_host(&node);
		let mut session_view = SessionView::Absent;
		let mut forward = None;

		for candidate in tunnels.iter().filter(|tunnel| node.matches_host(&tunnel.host, domain)) {
			let Some(display) = candidate.remote.display(self.cfg.base_port) else {
				debug!(target: "vdesk.discover", remote = %candidate.remote, "tunnel remote port at or below base; not a session tunnel");
				continue;
			};

			match sessions.check(&node, &job_id, display).await {
				Ok(true) => {
					// Staleness is never assumed away: the tunnel process
					// is re-verified at this instant too.
					if !candidate.pid.is_some_and(|pid| pid_is_alive(pid.0)) {
						debug!(target: "vdesk.discover", local = %candidate.local, "tunnel vanished mid-discovery; dropped");
						continue;
					}
					let pid = self.store.read_pid(&store::session_key(&host, display)).ok().flatten();
					session_view = SessionView::Live(Session {
						node: node.clone(),
						display,
						port: display.port(self.cfg.base_port),
						pid,
						alive: true,
					});
					forward = Some(candidate.clone());
					break;
				}
				Ok(false) => {
					let dnum = display;
					debug!(target: "vdesk.discover", %node, display = %dnum, "forward failed liveness confirmation; dropped from view");
				}
				Err(err) => {
					warnings.push(DiscoveryWarning::SourceUnavailable {
						source: "node liveness probe",
						detail: err.to_string(),
					});
					session_view = SessionView::Unknown;
					break;
				}
			}
		}

		// No confirmed forward: bookkeeping records may still reveal a
		// live session worth reporting (and repairing, if asked).
		if forward.is_none() && !matches!(session_view, SessionView::Unknown) {
			session_view = self.probe_recorded_sessions(sessions, &job_id, &node, &host, warnings).await.unwrap_or(session_view);
		}

		CorrelatedEntry {
			job_id,
			node,
			state,
			time_left,
			session: session_view,
			forward,
		}
	}

	/// Checks each bookkeeping record for `host` until one confirms live.
	async fn probe_recorded_sessions(
		&self,
		sessions: &SessionController<'_>,
		job_id: &JobId,
		node: &NodeName,
		host: &str,
		warnings: &mut Vec<DiscoveryWarning>,
	) -> Option<SessionView> {
		let keys = match self.store.keys() {
			Ok(keys) => keys,
			Err(err) => {
				warnings.push(DiscoveryWarning::SourceUnavailable {
					source: "bookkeeping store",
					detail: err.to_string(),
				});
				return Some(SessionView::Unknown);
			}
		};

		let prefix = format!("{host}:");
		for key in keys.iter().filter(|key| key.starts_with(&prefix)) {
			let Some(display) = key.rsplit_once(':').and_then(|(_, display)| display.parse().ok()) else {
				continue;
			};
			let display = crate::types::DisplayNum(display);

			match sessions.check(node, job_id, display).await {
				Ok(true) => {
					let pid = self.store.read_pid(key).ok().flatten();
					return Some(SessionView::Live(Session {
						node: node.clone(),
						display,
						port: display.port(self.cfg.base_port),
						pid,
						alive: true,
					}));
				}
				Ok(false) => {}
				Err(err) => {
					warnings.push(DiscoveryWarning::SourceUnavailable {
						source: "node liveness probe",
						detail: err.to_string(),
					});
					return Some(SessionView::Unknown);
				}
			}
		}
		None
	}
}
