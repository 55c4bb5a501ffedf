//! Typed identifiers for the cross-source correlation join.
//!
//! Scheduler queue output, tunnel command lines, and bookkeeping files all
//! describe the same things as free-form text. Keeping node names, ports,
//! displays, and pids as distinct types means the join in
//! [`crate::discover`] can only compare like with like.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque scheduler job/allocation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for JobId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Short compute-node name as reported by the scheduler (e.g. `n3000`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
	pub fn new(name: impl Into<String>) -> Self {
		Self(name.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Fully qualified hostname used for SSH, given the cluster's
	/// intra-node domain suffix (if any).
	pub fn hostname(&self, domain: Option<&str>) -> String {
		match domain {
			Some(domain) => format!("{}.{}", self.0, domain.trim_start_matches('.')),
			None => self.0.clone(),
		}
	}

	/// Whether `host` (from a tunnel command line) refers to this node.
	pub fn matches_host(&self, host: &str, domain: Option<&str>) -> bool {
		host == self.0 || host == self.hostname(domain) || host.strip_prefix(self.0.as_str()).is_some_and(|rest| rest.starts_with('.'))
	}
}

impl fmt::Display for NodeName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// X display number assigned by the display server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayNum(pub u32);

impl DisplayNum {
	/// The display server listens at `base_port + display`.
	pub fn port(&self, base_port: u16) -> Port {
		Port(base_port.saturating_add(self.0 as u16))
	}
}

impl fmt::Display for DisplayNum {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, ":{}", self.0)
	}
}

/// A TCP port, local or remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Port(pub u16);

impl Port {
	/// Inverse of [`DisplayNum::port`]; `None` when the port sits at or
	/// below the base and therefore cannot belong to a session.
	pub fn display(&self, base_port: u16) -> Option<DisplayNum> {
		(self.0 > base_port).then(|| DisplayNum((self.0 - base_port) as u32))
	}
}

impl fmt::Display for Port {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Operating-system process id on some host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn display_and_port_round_trip() {
		let display = DisplayNum(3);
		let port = display.port(5900);
		assert_eq!(port, Port(5903));
		assert_eq!(port.display(5900), Some(display));
	}

	#[test]
	fn ports_at_or_below_base_have_no_display() {
		assert_eq!(Port(5900).display(5900), None);
		assert_eq!(Port(22).display(5900), None);
	}

	#[test]
	fn hostname_respects_domain() {
		let node = NodeName::new("n3000");
		assert_eq!(node.hostname(None), "n3000");
		assert_eq!(node.hostname(Some("hyak.local")), "n3000.hyak.local");
		assert_eq!(node.hostname(Some(".hyak.local")), "n3000.hyak.local");
	}

	#[test]
	fn host_matching_is_prefix_safe() {
		let node = NodeName::new("n3000");
		assert!(node.matches_host("n3000", None));
		assert!(node.matches_host("n3000.hyak.local", Some("hyak.local")));
		assert!(node.matches_host("n3000.hyak.local", None));
		assert!(!node.matches_host("n30001", None));
		assert!(!node.matches_host("n30001.hyak.local", None));
	}
}
