//! Per-invocation wiring: configuration, executors, store, cancellation.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vdesk::config::{Config, ContainerConfig};
use vdesk::error::Result;
use vdesk::store::FileSessionStore;
use vdesk_runtime::SshRunner;

use crate::cli::Cli;

/// Everything a command needs, built once per invocation.
pub struct CommandContext {
	pub cfg: Config,
	pub runner: SshRunner,
	pub store: FileSessionStore,
	pub cancel: CancellationToken,
}

impl CommandContext {
	pub fn new(cli: &Cli) -> Result<Self> {
		let cfg = build_config(cli);
		let runner = SshRunner::new()?;
		let store = FileSessionStore::new(cfg.bookkeeping_dir.clone());

		// Ctrl-C flows into every blocking remote call as a token, not a
		// process-wide handler closing over state.
		let cancel = CancellationToken::new();
		let armed = cancel.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				armed.cancel();
			}
		});

		Ok(Self { cfg, runner, store, cancel })
	}
}

/// Resolves the immutable engine configuration from CLI arguments.
pub fn build_config(cli: &Cli) -> Config {
	let user = vdesk_runtime::process::current_user();
	let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
	let mut cfg = Config::for_user(user, &home);

	cfg.job_name = cli.job_name.clone();
	cfg.login_host = cli
		.login_host
		.clone()
		.or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
		.unwrap_or_else(|| "localhost".to_string());
	cfg.node_domain = cli.node_domain.clone();
	cfg.display_server.xstartup = cli.xstartup.clone();

	if let Some(image) = &cli.container_image {
		cfg.container = Some(ContainerConfig {
			runtime_bin: cli.container_runtime.clone(),
			image: image.clone(),
			bind_paths: cli.container_binds.clone(),
		});
	}

	cfg
}

/// Pre-connection hygiene for commands that reach into the cluster.
///
/// Cluster maintenance can reimage nodes, and a stale cached host identity
/// then breaks both remote execution and tunnels, so the cache is cleared
/// up front. Missing intracluster authorization is only worth a warning;
/// key bootstrap itself is out of scope here.
pub fn preflight(cfg: &Config) {
	let Some(home) = dirs::home_dir() else {
		return;
	};

	let known_hosts = home.join(".ssh").join("known_hosts");
	if known_hosts.exists() {
		match std::fs::remove_file(&known_hosts) {
			Ok(()) => debug!(target: "vdesk", path = %known_hosts.display(), "cleared cached host identities"),
			Err(err) => warn!(target: "vdesk", error = %err, "could not clear cached host identities"),
		}
	}

	let marker = cfg.login_host.split('.').next().unwrap_or(&cfg.login_host);
	let auth_keys = home.join(".ssh").join("authorized_keys");
	let authorized = std::fs::read_to_string(&auth_keys)
		.map(|contents| contents.lines().any(|line| line.contains(marker)))
		.unwrap_or(false);
	if !authorized {
		warn!(
			target: "vdesk",
			"intracluster SSH access may not be authorized; add a key for {} to {}",
			cfg.login_host,
			auth_keys.display()
		);
	}
}
