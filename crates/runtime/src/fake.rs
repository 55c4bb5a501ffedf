//! Scripted [`Runner`] used by engine tests in place of real SSH.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::remote::{Exec, LineStream, RemoteError, Runner};

type Hook = Box<dyn Fn(&str) + Send + Sync>;

/// Canned response for commands whose rendering contains `pattern`.
pub struct Script {
	pattern: String,
	lines: Vec<String>,
	success: bool,
	line_delay: Option<Duration>,
}

impl Script {
	pub fn new(pattern: &str, lines: &[&str]) -> Self {
		Self {
			pattern: pattern.to_string(),
			lines: lines.iter().map(|l| l.to_string()).collect(),
			success: true,
			line_delay: None,
		}
	}

	/// Same output, but the command reports a non-zero exit.
	pub fn failing(pattern: &str, lines: &[&str]) -> Self {
		Self {
			success: false,
			..Self::new(pattern, lines)
		}
	}

	/// Sleeps between emitted lines, for timeout-path tests.
	pub fn with_line_delay(mut self, delay: Duration) -> Self {
		self.line_delay = Some(delay);
		self
	}
}

/// In-memory [`Runner`] that replays scripts and records every command.
///
/// First matching script wins; commands with no script succeed silently,
/// which mirrors the many fire-and-forget round trips the engine makes.
#[derive(Default)]
pub struct FakeRunner {
	scripts: Mutex<Vec<Script>>,
	calls: Mutex<Vec<String>>,
	hook: Mutex<Option<Hook>>,
}

impl FakeRunner {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn script(&self, script: Script) {
		self.scripts.lock().unwrap().push(script);
	}

	pub fn clear_scripts(&self) {
		self.scripts.lock().unwrap().clear();
	}

	/// Observes every rendered command before its script is replayed.
	pub fn on_command(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
		*self.hook.lock().unwrap() = Some(Box::new(hook));
	}

	pub fn calls(&self) -> Vec<String> {
		self.calls.lock().unwrap().clone()
	}

	pub fn calls_matching(&self, pattern: &str) -> usize {
		self.calls.lock().unwrap().iter().filter(|call| call.contains(pattern)).count()
	}

	fn lookup(&self, rendered: &str) -> (Vec<String>, bool, Option<Duration>) {
		let scripts = self.scripts.lock().unwrap();
		match scripts.iter().find(|script| rendered.contains(&script.pattern)) {
			Some(script) => (script.lines.clone(), script.success, script.line_delay),
			None => (Vec::new(), true, None),
		}
	}
}

#[async_trait]
impl Runner for FakeRunner {
	async fn stream(&self, exec: Exec<'_>) -> Result<LineStream, RemoteError> {
		let rendered = exec.render();
		self.calls.lock().unwrap().push(rendered.clone());
		let hook = self.hook.lock().unwrap();
		if let Some(hook) = hook.as_ref() {
			hook(&rendered);
		}
		drop(hook);

		let (lines, success, delay) = self.lookup(&rendered);
		let (tx, rx) = mpsc::channel(64);
		tokio::spawn(async move {
			for line in lines {
				if let Some(delay) = delay {
					tokio::time::sleep(delay).await;
				}
				if tx.send(line).await.is_err() {
					return;
				}
			}
		});

		Ok(LineStream::scripted(rx, success))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn scripted_lines_are_replayed_in_order() {
		let fake = FakeRunner::new();
		fake.script(Script::new("squeue", &["row one", "row two"]));

		let exec = Exec::Local {
			program: "squeue",
			args: vec!["-h".into()],
		};
		let output = fake.run(exec, None).await.unwrap();
		assert_eq!(output.lines, vec!["row one", "row two"]);
		assert!(output.success);
		assert_eq!(fake.calls_matching("squeue"), 1);
	}

	#[tokio::test]
	async fn unscripted_commands_succeed_silently() {
		let fake = FakeRunner::new();
		let exec = Exec::Remote {
			host: "n3000",
			command: "rm -f /tmp/.X11-unix/X1",
		};
		let output = fake.run(exec, None).await.unwrap();
		assert!(output.success);
		assert!(output.lines.is_empty());
	}

	#[tokio::test]
	async fn failing_script_reports_failure() {
		let fake = FakeRunner::new();
		fake.script(Script::failing("scancel", &["scancel: error: Invalid job id specified"]));

		let exec = Exec::Local {
			program: "scancel",
			args: vec!["999".into()],
		};
		let output = fake.run(exec, None).await.unwrap();
		assert!(!output.success);
	}
}
