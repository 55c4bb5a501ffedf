//! Command execution seam shared by every component that talks to the
//! cluster: local scheduler binaries and SSH round trips to compute nodes,
//! with stdout/stderr merged into one line stream the way the upstream
//! tools expect to be scraped.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Error)]
pub enum RemoteError {
	#[error("failed to spawn `{command}`: {source}")]
	Spawn { command: String, source: std::io::Error },
	#[error("command timed out after {0:?}")]
	Timeout(Duration),
	#[error("ssh binary not found: {0}")]
	MissingBinary(#[from] which::Error),
}

/// What to execute and where.
#[derive(Debug, Clone)]
pub enum Exec<'a> {
	/// Run a program on this host with an argument vector.
	Local { program: &'a str, args: Vec<String> },
	/// Run a shell command string on a remote host over SSH.
	Remote { host: &'a str, command: &'a str },
}

impl Exec<'_> {
	/// Stable one-line rendering used for logs and scripted matching.
	pub fn render(&self) -> String {
		match self {
			Exec::Local { program, args } => {
				if args.is_empty() {
					(*program).to_string()
				} else {
					format!("{program} {}", args.join(" "))
				}
			}
			Exec::Remote { host, command } => format!("ssh {host} {command}"),
		}
	}
}

/// Collected output of a finished command.
#[derive(Debug)]
pub struct RunOutput {
	pub success: bool,
	pub lines: Vec<String>,
}

impl RunOutput {
	pub fn text(&self) -> String {
		self.lines.join("\n")
	}
}

enum StreamHandle {
	Child(Child),
	Scripted { success: bool },
}

/// Merged stdout/stderr line stream of a running command.
pub struct LineStream {
	rx: mpsc::Receiver<String>,
	handle: StreamHandle,
}

impl LineStream {
	fn from_child(child: Child, rx: mpsc::Receiver<String>) -> Self {
		Self {
			rx,
			handle: StreamHandle::Child(child),
		}
	}

	pub(crate) fn scripted(rx: mpsc::Receiver<String>, success: bool) -> Self {
		Self {
			rx,
			handle: StreamHandle::Scripted { success },
		}
	}

	/// Next output line, or `None` once the command's streams close.
	pub async fn next_line(&mut self) -> Option<String> {
		self.rx.recv().await
	}

	/// Kills the underlying command, if any is still running.
	pub fn abort(&mut self) {
		if let StreamHandle::Child(child) = &mut self.handle {
			let _ = child.start_kill();
		}
	}

	/// Waits for the command to exit and reports success.
	pub async fn wait(&mut self) -> bool {
		match &mut self.handle {
			StreamHandle::Child(child) => child.wait().await.map(|status| status.success()).unwrap_or(false),
			StreamHandle::Scripted { success } => *success,
		}
	}
}

/// Executes commands on behalf of the reconciliation engine.
///
/// The engine only ever sees this trait; tests substitute
/// [`crate::fake::FakeRunner`] for the SSH-backed implementation.
#[async_trait]
pub trait Runner: Send + Sync {
	/// Starts `exec` and returns its merged output stream.
	async fn stream(&self, exec: Exec<'_>) -> Result<LineStream, RemoteError>;

	/// Runs `exec` to completion, collecting output, within `timeout`.
	async fn run(&self, exec: Exec<'_>, timeout: Option<Duration>) -> Result<RunOutput, RemoteError> {
		let mut stream = self.stream(exec).await?;
		let collect = async {
			let mut lines = Vec::new();
			while let Some(line) = stream.next_line().await {
				lines.push(line);
			}
			let success = stream.wait().await;
			RunOutput { success, lines }
		};

		match timeout {
			None => Ok(collect.await),
			Some(limit) => match tokio::time::timeout(limit, collect).await {
				Ok(output) => Ok(output),
				Err(_) => {
					stream.abort();
					Err(RemoteError::Timeout(limit))
				}
			},
		}
	}
}

/// SSH-backed [`Runner`] used by the real CLI.
pub struct SshRunner {
	ssh_bin: PathBuf,
}

impl SshRunner {
	/// Resolves `ssh` from `PATH`.
	pub fn new() -> Result<Self, RemoteError> {
		Ok(Self { ssh_bin: which::which("ssh")? })
	}

	/// Uses an explicit ssh binary instead of searching `PATH`.
	pub fn with_ssh_binary(path: impl Into<PathBuf>) -> Self {
		Self { ssh_bin: path.into() }
	}

	fn command_for(&self, exec: &Exec<'_>) -> Command {
		match exec {
			Exec::Local { program, args } => {
				let mut cmd = Command::new(program);
				cmd.args(args);
				cmd
			}
			Exec::Remote { host, command } => {
				let mut cmd = Command::new(&self.ssh_bin);
				cmd.args(["-o", "BatchMode=yes"]).arg(host).arg(command);
				cmd
			}
		}
	}
}

#[async_trait]
impl Runner for SshRunner {
	async fn stream(&self, exec: Exec<'_>) -> Result<LineStream, RemoteError> {
		let rendered = exec.render();
		trace!(target: "vdesk.remote", command = %rendered, "spawning");

		let mut cmd = self.command_for(&exec);
		cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);

		let mut child = cmd.spawn().map_err(|source| RemoteError::Spawn { command: rendered, source })?;

		let (tx, rx) = mpsc::channel(64);
		if let Some(stdout) = child.stdout.take() {
			pump_lines(stdout, tx.clone());
		}
		if let Some(stderr) = child.stderr.take() {
			pump_lines(stderr, tx);
		}

		Ok(LineStream::from_child(child, rx))
	}
}

fn pump_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
	R: AsyncRead + Unpin + Send + 'static,
{
	tokio::spawn(async move {
		let mut lines = BufReader::new(reader).lines();
		while let Ok(Some(line)) = lines.next_line().await {
			if tx.send(line).await.is_err() {
				break;
			}
		}
	});
}
