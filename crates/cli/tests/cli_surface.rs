//! Argument-surface behavior: required flags, value validation, and the
//! mapping from CLI arguments into the engine configuration.

use clap::Parser;
use vdesk_cli::cli::{Cli, Commands, OutputFormat};
use vdesk_cli::context::build_config;

fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
	Cli::try_parse_from(args)
}

#[test]
fn create_requires_partition_account_time_cpus_and_mem() {
	let err = parse(&["vdesk", "create"]).unwrap_err();
	let rendered = err.to_string();
	for flag in ["--partition", "--account", "--time", "--cpus", "--mem"] {
		assert!(rendered.contains(flag), "missing `{flag}` in: {rendered}");
	}
}

#[test]
fn create_parses_a_full_request() {
	let cli = parse(&[
		"vdesk", "create", "-p", "compute", "-A", "acct1", "-t", "4", "-c", "8", "--mem", "16G", "--gpus", "a40:2", "--timeout", "90", "--port",
		"5905", "--force",
	])
	.unwrap();

	let Commands::Create {
		partition,
		account,
		time_hours,
		cpus,
		mem,
		gpus,
		timeout,
		port,
		force,
	} = cli.command
	else {
		panic!("expected create");
	};

	assert_eq!(partition, "compute");
	assert_eq!(account, "acct1");
	assert_eq!(time_hours, 4);
	assert_eq!(cpus, 8);
	assert_eq!(mem.to_string(), "16G");
	assert_eq!(gpus.unwrap().count, 2);
	assert_eq!(timeout, 90);
	assert_eq!(port, Some(5905));
	assert!(force);
}

#[test]
fn invalid_memory_suffix_is_rejected_at_parse_time() {
	assert!(parse(&["vdesk", "create", "-p", "a", "-A", "b", "-t", "1", "-c", "1", "--mem", "16Q"]).is_err());
	assert!(parse(&["vdesk", "create", "-p", "a", "-A", "b", "-t", "1", "-c", "1", "--mem", "16"]).is_err());
}

#[test]
fn job_name_defaults_and_overrides() {
	let cli = parse(&["vdesk", "status"]).unwrap();
	assert_eq!(cli.job_name, "vnc");

	let cli = parse(&["vdesk", "-J", "ece_vnc", "status"]).unwrap();
	assert_eq!(cli.job_name, "ece_vnc");
}

#[test]
fn status_format_accepts_json() {
	let cli = parse(&["vdesk", "status", "-f", "json"]).unwrap();
	let Commands::Status { format } = cli.command else {
		panic!("expected status");
	};
	assert_eq!(format, OutputFormat::Json);
}

#[test]
fn kill_takes_a_job_id() {
	let cli = parse(&["vdesk", "kill", "864877"]).unwrap();
	let Commands::Kill { job_id } = cli.command else {
		panic!("expected kill");
	};
	assert_eq!(job_id, "864877");

	assert!(parse(&["vdesk", "kill"]).is_err());
}

#[test]
fn config_reflects_global_flags() {
	let cli = parse(&[
		"vdesk",
		"--node-domain",
		"hyak.local",
		"--login-host",
		"login.example.edu",
		"--container-image",
		"/images/xfce.sif",
		"--container-runtime",
		"singularity",
		"status",
	])
	.unwrap();

	let cfg = build_config(&cli);
	assert_eq!(cfg.node_domain.as_deref(), Some("hyak.local"));
	assert_eq!(cfg.login_host, "login.example.edu");
	let container = cfg.container.as_ref().expect("container configured");
	assert_eq!(container.runtime_bin, "singularity");
	assert_eq!(container.image, std::path::PathBuf::from("/images/xfce.sif"));

	assert_eq!(cfg.node_host(&vdesk::types::NodeName::new("n3000")), "n3000.hyak.local");
}

#[test]
fn config_without_container_flags_has_no_container() {
	let cli = parse(&["vdesk", "status"]).unwrap();
	let cfg = build_config(&cli);
	assert!(cfg.container.is_none());
	assert_eq!(cfg.base_port, 5900);
}
