//! Local process-table and port helpers.

use std::path::PathBuf;
use std::process::Command;

/// A row from a process table: pid plus the full command line.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
	pub pid: u32,
	pub args: String,
}

/// Returns `true` when a process with `pid` appears alive on this host.
pub fn pid_is_alive(pid: u32) -> bool {
	if pid == 0 {
		return false;
	}

	if PathBuf::from("/proc").join(pid.to_string()).exists() {
		return true;
	}

	Command::new("kill")
		.arg("-0")
		.arg(pid.to_string())
		.status()
		.map(|status| status.success())
		.unwrap_or(pid == std::process::id())
}

/// Returns `true` when `port` can be bound on localhost.
///
/// This is a probe, not a reservation: two concurrent invocations can both
/// see the same port as free.
pub fn port_available(port: u16) -> bool {
	std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Resolves the invoking user's login name.
pub fn current_user() -> String {
	if let Ok(user) = std::env::var("USER") {
		if !user.is_empty() {
			return user;
		}
	}

	Command::new("id")
		.arg("-un")
		.output()
		.ok()
		.and_then(|out| String::from_utf8(out.stdout).ok())
		.map(|s| s.trim().to_string())
		.unwrap_or_default()
}

/// Parses `ps -o pid=,args=` style output into process rows, dropping
/// anything that does not lead with a numeric pid.
pub fn parse_ps_rows(output: &str) -> Vec<ProcessEntry> {
	output
		.lines()
		.filter_map(|line| {
			let trimmed = line.trim_start();
			let (pid_str, rest) = trimmed.split_once(char::is_whitespace)?;
			let pid = pid_str.parse().ok()?;
			Some(ProcessEntry {
				pid,
				args: rest.trim_start().to_string(),
			})
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn current_process_is_alive() {
		assert!(pid_is_alive(std::process::id()));
	}

	#[test]
	fn pid_zero_is_never_alive() {
		assert!(!pid_is_alive(0));
	}

	#[test]
	fn bound_port_is_reported_unavailable() {
		let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
		let port = listener.local_addr().unwrap().port();
		assert!(!port_available(port));
		drop(listener);
		assert!(port_available(port));
	}

	#[test]
	fn ps_rows_parse_pid_and_args() {
		let output = " 2772462 ssh -N -f -L 5900:127.0.0.1:5901 n3000.hyak.local\n   91 -bash\n";
		let rows = parse_ps_rows(output);
		assert_eq!(rows.len(), 2);
		assert_eq!(rows[0].pid, 2772462);
		assert!(rows[0].args.starts_with("ssh -N"));
		assert_eq!(rows[1].args, "-bash");
	}

	#[test]
	fn ps_rows_skip_garbage_lines() {
		let rows = parse_ps_rows("PID COMMAND\nnot-a-pid something\n");
		assert!(rows.is_empty());
	}
}
