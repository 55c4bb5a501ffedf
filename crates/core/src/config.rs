//! Immutable engine configuration.
//!
//! Everything the components used to reach for as ambient constants —
//! ports, paths, binary names, marker strings — is carried here and passed
//! by reference into each component at construction.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Scheduler command names; overridable for clusters with wrapper scripts.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
	pub submit_bin: String,
	pub queue_bin: String,
	pub cancel_bin: String,
	pub control_bin: String,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			submit_bin: "salloc".to_string(),
			queue_bin: "squeue".to_string(),
			cancel_bin: "scancel".to_string(),
			control_bin: "scontrol".to_string(),
		}
	}
}

/// Display-server tool names and the marker its processes carry in `ps`.
#[derive(Debug, Clone)]
pub struct DisplayServerConfig {
	pub server_bin: String,
	pub passwd_bin: String,
	/// Substring identifying the display-server process in a process
	/// table (used by repair to re-derive a session's port).
	pub process_marker: String,
	pub xstartup: Option<PathBuf>,
}

impl Default for DisplayServerConfig {
	fn default() -> Self {
		Self {
			server_bin: "vncserver".to_string(),
			passwd_bin: "vncpasswd".to_string(),
			process_marker: "Xtigervnc".to_string(),
			xstartup: None,
		}
	}
}

/// Optional container runtime wrapping the display server on the node.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
	pub runtime_bin: String,
	pub image: PathBuf,
	pub bind_paths: String,
}

/// Immutable configuration handed to every engine component.
#[derive(Debug, Clone)]
pub struct Config {
	/// Scheduler job name used to tag and find our allocations.
	pub job_name: String,
	/// Display port base; session port = base + display number.
	pub base_port: u16,
	/// Width of the local port probe window above `base_port`.
	pub port_window: u16,
	/// Host the user tunnels through, printed in connection instructions.
	pub login_host: String,
	/// Intra-cluster domain appended to node names for SSH, if any.
	pub node_domain: Option<String>,
	/// Invoking user's login name, used to filter queues and process tables.
	pub user: String,
	/// ssh binary used for tunnel processes.
	pub ssh_bin: String,
	/// Directory holding per-session bookkeeping files (shared filesystem).
	pub bookkeeping_dir: PathBuf,
	/// Node-local directories that accumulate display/IPC socket files.
	pub remote_socket_dirs: Vec<String>,
	/// Marker string the session listing uses for dead-but-listed entries.
	/// Upstream tool behavior, so configuration rather than a literal.
	pub stale_marker: String,
	/// Tunnel-bind confirmation: attempts and interval.
	pub forward_poll_attempts: u32,
	pub forward_poll_interval: Duration,
	/// Queue re-poll interval while waiting out an allocation.
	pub queue_poll_interval: Duration,
	/// Bound on waiting for the display server's startup confirmation.
	pub session_start_timeout: Duration,
	pub scheduler: SchedulerConfig,
	pub display_server: DisplayServerConfig,
	pub container: Option<ContainerConfig>,
}

impl Config {
	/// Builds defaults for `user`, with bookkeeping under `home/.vnc`.
	pub fn for_user(user: impl Into<String>, home: &Path) -> Self {
		Self {
			job_name: "vnc".to_string(),
			base_port: 5900,
			port_window: 300,
			login_host: "localhost".to_string(),
			node_domain: None,
			user: user.into(),
			ssh_bin: "ssh".to_string(),
			bookkeeping_dir: home.join(".vnc"),
			remote_socket_dirs: vec!["/tmp/.X11-unix".to_string(), "/tmp/.ICE-unix".to_string()],
			stale_marker: "stale".to_string(),
			forward_poll_attempts: 20,
			forward_poll_interval: Duration::from_secs(1),
			queue_poll_interval: Duration::from_secs(2),
			session_start_timeout: Duration::from_secs(60),
			scheduler: SchedulerConfig::default(),
			display_server: DisplayServerConfig::default(),
			container: None,
		}
	}

	/// SSH hostname for a node under this cluster's domain settings.
	pub fn node_host(&self, node: &crate::types::NodeName) -> String {
		node.hostname(self.node_domain.as_deref())
	}
}
