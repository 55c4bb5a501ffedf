//! Error taxonomy shared by every engine component.

use std::time::Duration;

use thiserror::Error;
use vdesk_runtime::RemoteError;

pub type Result<T> = std::result::Result<T, VdeskError>;

#[derive(Debug, Error)]
pub enum VdeskError {
	/// A remote command or allocation wait exceeded its bound. Callers
	/// abort and roll back whatever they created so far.
	#[error("timed out after {limit:?} waiting for {waiting_for}")]
	ExternalTimeout { limit: Duration, waiting_for: String },

	/// Expected confirmation text was absent or changed shape. Hard
	/// failure: the external tool's output contract moved underneath us.
	#[error("unrecognized {tool} output: {detail}")]
	ParseMismatch { tool: &'static str, detail: String },

	/// The local port probe window is exhausted.
	#[error("no free local port in {0}..{1}")]
	ResourceExhausted(u16, u16),

	/// The target job or session does not exist.
	#[error("{0}")]
	NotFound(String),

	/// The requested resource is already taken or already present.
	#[error("{0}")]
	Conflict(String),

	/// A teardown step failed after earlier steps succeeded. Every step
	/// is idempotent, so re-running the command finishes the job.
	#[error("partial teardown, re-run to finish: {0}")]
	PartialState(String),

	#[error("cancelled: {0}")]
	Cancelled(String),

	#[error("remote execution failed: {0}")]
	Remote(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl VdeskError {
	pub fn timeout(limit: Duration, waiting_for: impl Into<String>) -> Self {
		Self::ExternalTimeout {
			limit,
			waiting_for: waiting_for.into(),
		}
	}

	pub fn parse_mismatch(tool: &'static str, detail: impl Into<String>) -> Self {
		Self::ParseMismatch { tool, detail: detail.into() }
	}
}

impl From<RemoteError> for VdeskError {
	fn from(err: RemoteError) -> Self {
		match err {
			RemoteError::Timeout(limit) => Self::ExternalTimeout {
				limit,
				waiting_for: "remote command".to_string(),
			},
			other => Self::Remote(other.to_string()),
		}
	}
}
