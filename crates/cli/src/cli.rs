use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use vdesk::alloc::{AcceleratorSpec, MemSize};

#[derive(Parser, Debug)]
#[command(name = "vdesk")]
#[command(about = "Temporary interactive desktop sessions on a compute cluster")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Scheduler job name used to tag and find sessions
	#[arg(short = 'J', long, global = true, default_value = "vnc")]
	pub job_name: String,

	/// Host the user tunnels through, shown in connection instructions
	#[arg(long, global = true, value_name = "HOST")]
	pub login_host: Option<String>,

	/// Intra-cluster DNS domain appended to node names for SSH
	#[arg(long, global = true, value_name = "DOMAIN")]
	pub node_domain: Option<String>,

	/// Container image wrapping the display server on the node
	#[arg(long, global = true, value_name = "IMAGE")]
	pub container_image: Option<PathBuf>,

	/// Container runtime binary
	#[arg(long, global = true, default_value = "apptainer", value_name = "BIN")]
	pub container_runtime: String,

	/// Bind paths mounted into the container
	#[arg(long, global = true, default_value = "/tmp:/tmp,$HOME", value_name = "PATHS")]
	pub container_binds: String,

	/// Startup script passed to the display server
	#[arg(long, global = true, value_name = "FILE")]
	pub xstartup: Option<PathBuf>,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Reserve a node, start a desktop session, and forward it locally
	Create {
		/// Scheduler partition
		#[arg(short, long)]
		partition: String,

		/// Scheduler account
		#[arg(short = 'A', long)]
		account: String,

		/// Reservation length in hours
		#[arg(short = 't', long = "time", value_name = "HOURS")]
		time_hours: u32,

		/// CPU count for the node
		#[arg(short, long)]
		cpus: u32,

		/// Memory with unit suffix (e.g. 16G)
		#[arg(long)]
		mem: MemSize,

		/// Accelerators, as COUNT or TYPE:COUNT
		#[arg(long, value_name = "SPEC")]
		gpus: Option<AcceleratorSpec>,

		/// Allocation wait bound in seconds
		#[arg(long, default_value_t = 120, value_name = "SECS")]
		timeout: u64,

		/// Explicit local port instead of probing for a free one
		#[arg(long)]
		port: Option<u16>,

		/// Allow a second concurrent session under the same job name
		#[arg(short, long)]
		force: bool,
	},

	/// Show live sessions reconstructed from scheduler, tunnels, and nodes
	Status {
		#[arg(short = 'f', long, value_enum, default_value = "text")]
		format: OutputFormat,
	},

	/// Kill one allocation: session, bookkeeping, sockets, then the job
	Kill {
		/// Scheduler job id to tear down
		job_id: String,
	},

	/// Kill every allocation under the job name
	KillAll,

	/// Recreate missing forwards for sessions that are still alive
	Repair,

	/// Restart the session on an allocation, keeping its display
	Restart {
		/// Scheduler job id whose session should restart
		job_id: String,
	},

	/// Set the desktop session password
	SetPassword,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
	Text,
	Json,
}
