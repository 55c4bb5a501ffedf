//! Structured parsers for the remote tools' human-readable output.
//!
//! Each external message shape gets one parser returning a tagged
//! [`Parsed`] result, so the components never regex inline and the
//! contracts are testable without a live cluster. A parser never guesses:
//! anything it does not positively recognize comes back [`Parsed::Unrecognized`]
//! and the caller decides whether that is ignorable noise or a broken
//! contract.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::{DisplayNum, JobId, NodeName, Pid, Port};

/// Outcome of matching one line against one expected message shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed<T> {
	Matched(T),
	Unrecognized,
}

impl<T> Parsed<T> {
	pub fn matched(self) -> Option<T> {
		match self {
			Parsed::Matched(value) => Some(value),
			Parsed::Unrecognized => None,
		}
	}
}

static ALLOCATION_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^salloc: (?:Granted|Pending) job allocation (\d+)").unwrap());

/// `salloc: Pending job allocation 864875` / `salloc: Granted job allocation 864875`
pub fn parse_allocation_id(line: &str) -> Parsed<JobId> {
	match ALLOCATION_ID.captures(line.trim()) {
		Some(caps) => Parsed::Matched(JobId::new(&caps[1])),
		None => Parsed::Unrecognized,
	}
}

static NODE_READY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^salloc: Nodes (\S+) are ready for job").unwrap());

/// `salloc: Nodes n3000 are ready for job`
pub fn parse_node_ready(line: &str) -> Parsed<NodeName> {
	match NODE_READY.captures(line.trim()) {
		Some(caps) => Parsed::Matched(NodeName::new(&caps[1])),
		None => Parsed::Unrecognized,
	}
}

/// Node column of a queue row: either a real node or a parenthesized
/// status placeholder such as `(Resources)` or `(QOSGrpCpuLimit)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueNode {
	Ready(NodeName),
	Pending(String),
}

/// One row of `squeue -h -o "%i %T %L %R"` for the invoking user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRow {
	pub job_id: JobId,
	pub state: String,
	pub time_left: Option<String>,
	pub node: QueueNode,
}

/// Parses a queue row. The node column is never trusted to be a node: a
/// leading parenthesis marks a scheduler placeholder that must surface as
/// a pending/blocked reason, not a host.
pub fn parse_queue_row(line: &str) -> Parsed<QueueRow> {
	let mut fields = line.split_whitespace();
	let (Some(job_id), Some(state), Some(time_left)) = (fields.next(), fields.next(), fields.next()) else {
		return Parsed::Unrecognized;
	};
	if !job_id.chars().all(|c| c.is_ascii_digit()) {
		return Parsed::Unrecognized;
	}

	let rest: Vec<&str> = fields.collect();
	if rest.is_empty() {
		return Parsed::Unrecognized;
	}
	let node_column = rest.join(" ");

	let node = if node_column.starts_with('(') {
		QueueNode::Pending(node_column.trim_matches(|c| c == '(' || c == ')').to_string())
	} else if rest.len() == 1 {
		QueueNode::Ready(NodeName::new(rest[0]))
	} else {
		return Parsed::Unrecognized;
	};

	let time_left = match time_left {
		"INVALID" | "NOT_SET" | "UNLIMITED" => None,
		value => Some(value.to_string()),
	};

	Parsed::Matched(QueueRow {
		job_id: JobId::new(job_id),
		state: state.to_string(),
		time_left,
		node,
	})
}

static SESSION_CONFIRMATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^New '[^':]+:(\d+)[^']*' desktop").unwrap());

/// Display-server startup confirmation, both observed shapes:
/// `New 'n3000.hyak.local:1 (jane)' desktop at :1 on machine n3000.hyak.local`
/// `New 'n3000.hyak.local:6 (jane)' desktop is n3000.hyak.local:6`
pub fn parse_session_confirmation(line: &str) -> Parsed<DisplayNum> {
	match SESSION_CONFIRMATION.captures(line.trim()) {
		Some(caps) => match caps[1].parse() {
			Ok(display) => Parsed::Matched(DisplayNum(display)),
			Err(_) => Parsed::Unrecognized,
		},
		None => Parsed::Unrecognized,
	}
}

/// One entry of the display server's session listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedSession {
	pub display: DisplayNum,
	pub stale: bool,
}

static LISTING_ROW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^:(\d+)\s+\S").unwrap());

/// Parses one listing row (`:20    30` / `:1    7280 (stale)`), classifying
/// by `stale_marker`. Header and banner lines come back `Unrecognized` and
/// are ignored by the caller, never mis-classified.
pub fn parse_listing_row(line: &str, stale_marker: &str) -> Parsed<ListedSession> {
	let trimmed = line.trim();
	match LISTING_ROW.captures(trimmed) {
		Some(caps) => match caps[1].parse() {
			Ok(display) => Parsed::Matched(ListedSession {
				display: DisplayNum(display),
				stale: trimmed.contains(stale_marker),
			}),
			Err(_) => Parsed::Unrecognized,
		},
		None => Parsed::Unrecognized,
	}
}

/// Whether a display-server kill invocation acknowledged success.
/// The tool prints a refusal line in the same shape, so the marker is the
/// only signal (`Killing Xtigervnc process ID 29... success!`).
pub fn kill_acknowledged(line: &str) -> bool {
	line.contains("success")
}

/// Local tunnel process detail recovered from its command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelArgs {
	pub local: Port,
	pub remote: Port,
	pub host: String,
}

static TUNNEL_SPEC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"ssh\b.*\s-L\s*(\d+):[^:\s]+:(\d+)\s+(\S+)\s*$").unwrap());

/// `ssh -N -f -L 5900:127.0.0.1:5901 n3000.hyak.local`
pub fn parse_tunnel_args(args: &str) -> Parsed<TunnelArgs> {
	let Some(caps) = TUNNEL_SPEC.captures(args) else {
		return Parsed::Unrecognized;
	};
	let (Ok(local), Ok(remote)) = (caps[1].parse(), caps[2].parse()) else {
		return Parsed::Unrecognized;
	};
	let host = caps[3].to_string();
	if host.starts_with('-') {
		return Parsed::Unrecognized;
	}
	Parsed::Matched(TunnelArgs {
		local: Port(local),
		remote: Port(remote),
		host,
	})
}

static DISPLAY_ARG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":(\d+)(?:\s|$)").unwrap());

/// Recovers the display number from a display-server process command line
/// (`/usr/bin/Xtigervnc :2 -rfbport 5902 ...`). `marker` identifies the
/// server binary; anything else is not our process.
pub fn parse_display_arg(args: &str, marker: &str) -> Parsed<DisplayNum> {
	let Some(start) = args.find(marker) else {
		return Parsed::Unrecognized;
	};
	match DISPLAY_ARG.captures(&args[start..]) {
		Some(caps) => match caps[1].parse() {
			Ok(display) => Parsed::Matched(DisplayNum(display)),
			Err(_) => Parsed::Unrecognized,
		},
		None => Parsed::Unrecognized,
	}
}

/// First column of a pid listing row (`ps -o pid=` or the scheduler's
/// per-job pid listing, whose header row is non-numeric and skipped).
pub fn parse_pid_row(line: &str) -> Parsed<Pid> {
	match line.split_whitespace().next().and_then(|tok| tok.parse().ok()) {
		Some(pid) => Parsed::Matched(Pid(pid)),
		None => Parsed::Unrecognized,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn allocation_id_matches_pending_and_granted() {
		assert_eq!(parse_allocation_id("salloc: Pending job allocation 864875").matched(), Some(JobId::new("864875")));
		assert_eq!(parse_allocation_id("salloc: Granted job allocation 864875").matched(), Some(JobId::new("864875")));
		assert_eq!(parse_allocation_id("salloc: error: Unable to allocate resources").matched(), None);
		assert_eq!(parse_allocation_id("").matched(), None);
	}

	#[test]
	fn node_ready_extracts_node_name() {
		assert_eq!(parse_node_ready("salloc: Nodes n3000 are ready for job").matched(), Some(NodeName::new("n3000")));
		assert_eq!(parse_node_ready("salloc: Waiting for resource configuration").matched(), None);
	}

	#[test]
	fn queue_row_with_real_node() {
		let row = parse_queue_row("864877 RUNNING 3:55 n3000").matched().unwrap();
		assert_eq!(row.job_id, JobId::new("864877"));
		assert_eq!(row.state, "RUNNING");
		assert_eq!(row.time_left.as_deref(), Some("3:55"));
		assert_eq!(row.node, QueueNode::Ready(NodeName::new("n3000")));
	}

	#[test]
	fn queue_row_with_placeholder_is_pending_not_a_node() {
		let row = parse_queue_row("870400 PENDING INVALID (Resources)").matched().unwrap();
		assert_eq!(row.node, QueueNode::Pending("Resources".to_string()));
		assert_eq!(row.time_left, None);

		let row = parse_queue_row("984669 PENDING INVALID (QOSGrpCpuLimit)").matched().unwrap();
		assert_eq!(row.node, QueueNode::Pending("QOSGrpCpuLimit".to_string()));
	}

	#[test]
	fn queue_row_placeholder_may_contain_spaces() {
		let row = parse_queue_row("123456 PENDING INVALID (launch failed requeued held)").matched().unwrap();
		assert_eq!(row.node, QueueNode::Pending("launch failed requeued held".to_string()));
	}

	#[test]
	fn queue_row_garbage_is_unrecognized() {
		assert_eq!(parse_queue_row("JOBID STATE TIME NODELIST").matched(), None);
		assert_eq!(parse_queue_row("864877 RUNNING").matched(), None);
		assert_eq!(parse_queue_row("864877 RUNNING 3:55 n3000 extra").matched(), None);
		assert_eq!(parse_queue_row("").matched(), None);
	}

	#[test]
	fn session_confirmation_both_shapes() {
		let at = "New 'n3000.hyak.local:1 (jane)' desktop at :1 on machine n3000.hyak.local";
		assert_eq!(parse_session_confirmation(at).matched(), Some(DisplayNum(1)));

		let is = "New 'n3000.hyak.local:6 (jane)' desktop is n3000.hyak.local:6";
		assert_eq!(parse_session_confirmation(is).matched(), Some(DisplayNum(6)));
	}

	#[test]
	fn session_confirmation_rejects_other_lines() {
		assert_eq!(parse_session_confirmation("Starting applications specified in xstartup").matched(), None);
		assert_eq!(parse_session_confirmation("New desktop without quoted target").matched(), None);
	}

	#[test]
	fn listing_rows_classify_by_marker() {
		assert_eq!(
			parse_listing_row(":20\t\t30", "stale").matched(),
			Some(ListedSession {
				display: DisplayNum(20),
				stale: false
			})
		);
		assert_eq!(
			parse_listing_row(":1\t\t7280 (stale)", "stale").matched(),
			Some(ListedSession {
				display: DisplayNum(1),
				stale: true
			})
		);
	}

	#[test]
	fn listing_marker_is_configuration() {
		let row = parse_listing_row(":4\t\t90576 (defunct)", "defunct").matched().unwrap();
		assert!(row.stale);
		let row = parse_listing_row(":4\t\t90576 (defunct)", "stale").matched().unwrap();
		assert!(!row.stale);
	}

	#[test]
	fn listing_headers_are_ignored() {
		assert_eq!(parse_listing_row("TigerVNC server sessions:", "stale").matched(), None);
		assert_eq!(parse_listing_row("X DISPLAY #\tPROCESS ID", "stale").matched(), None);
		assert_eq!(parse_listing_row("", "stale").matched(), None);
	}

	#[test]
	fn kill_ack_requires_marker() {
		assert!(kill_acknowledged("Killing Xtigervnc process ID 29... success!"));
		assert!(!kill_acknowledged("Can't kill '29': Operation not permitted"));
	}

	#[test]
	fn tunnel_args_extract_ports_and_host() {
		let tunnel = parse_tunnel_args("ssh -N -f -L 5900:127.0.0.1:5901 n3000.hyak.local").matched().unwrap();
		assert_eq!(tunnel.local, Port(5900));
		assert_eq!(tunnel.remote, Port(5901));
		assert_eq!(tunnel.host, "n3000.hyak.local");
	}

	#[test]
	fn tunnel_args_tolerate_extra_options() {
		let tunnel = parse_tunnel_args("ssh -o BatchMode=yes -N -f -L 5907:localhost:5901 n3042").matched().unwrap();
		assert_eq!(tunnel.local, Port(5907));
		assert_eq!(tunnel.remote, Port(5901));
		assert_eq!(tunnel.host, "n3042");
	}

	#[test]
	fn non_tunnel_ssh_lines_are_unrecognized() {
		assert_eq!(parse_tunnel_args("ssh n3000.hyak.local vncserver -list").matched(), None);
		assert_eq!(parse_tunnel_args("sshd: jane [priv]").matched(), None);
		assert_eq!(parse_tunnel_args("grep ssh").matched(), None);
	}

	#[test]
	fn display_arg_needs_the_marker() {
		let args = "/usr/bin/Xtigervnc :2 -rfbport 5902 -desktop n3000:2";
		assert_eq!(parse_display_arg(args, "Xtigervnc").matched(), Some(DisplayNum(2)));
		assert_eq!(parse_display_arg(args, "Xvnc").matched(), None);
		assert_eq!(parse_display_arg("ssh -N -f -L 5902:127.0.0.1:5902 n3000", "Xtigervnc").matched(), None);
	}

	#[test]
	fn pid_rows_skip_headers() {
		assert_eq!(parse_pid_row("  7280").matched(), Some(Pid(7280)));
		assert_eq!(parse_pid_row("7280 864877 0 0 0").matched(), Some(Pid(7280)));
		assert_eq!(parse_pid_row("PID JOBID STEPID").matched(), None);
		assert_eq!(parse_pid_row("").matched(), None);
	}
}
