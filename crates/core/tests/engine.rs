//! Engine behavior against a scripted command runner: allocation
//! lifecycle, session control, discovery correlation, forward repair, and
//! idempotent teardown, all without a live cluster.

use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use vdesk::alloc::{AllocationManager, CancelOutcome, ResourceRequest};
use vdesk::config::Config;
use vdesk::discover::{DiscoveryCorrelator, DiscoveryWarning, SessionView};
use vdesk::error::VdeskError;
use vdesk::forward::{PortForwardManager, RepairOutcome};
use vdesk::gc::GarbageCollector;
use vdesk::session::SessionController;
use vdesk::store::{FileSessionStore, SessionStore};
use vdesk::types::{JobId, NodeName, Port};
use vdesk_runtime::fake::{FakeRunner, Script};

struct Rig {
	cfg: Config,
	runner: FakeRunner,
	store: FileSessionStore,
	_home: TempDir,
}

impl Rig {
	fn new() -> Self {
		let home = TempDir::new().unwrap();
		let mut cfg = Config::for_user("testuser", home.path());
		cfg.queue_poll_interval = Duration::from_millis(50);
		cfg.forward_poll_interval = Duration::from_millis(10);
		std::fs::create_dir_all(&cfg.bookkeeping_dir).unwrap();
		let store = FileSessionStore::new(cfg.bookkeeping_dir.clone());
		Self {
			cfg,
			runner: FakeRunner::new(),
			store,
			_home: home,
		}
	}

	fn write_pid(&self, key: &str, pid: u32) {
		std::fs::write(self.cfg.bookkeeping_dir.join(format!("{key}.pid")), format!("{pid}\n")).unwrap();
	}
}

fn request() -> ResourceRequest {
	ResourceRequest {
		partition: "compute".to_string(),
		account: "acct1".to_string(),
		cpus: 8,
		mem: "16G".parse().unwrap(),
		walltime_hours: 4,
		accelerator: None,
	}
}

fn token() -> CancellationToken {
	CancellationToken::new()
}

#[tokio::test]
async fn reserve_then_start_yields_matching_display_and_port() {
	let rig = Rig::new();
	rig.runner.script(Script::new(
		"salloc",
		&[
			"salloc: Pending job allocation 864875",
			"salloc: Granted job allocation 864875",
			"salloc: Nodes n3000 are ready for job",
		],
	));
	rig.runner
		.script(Script::new("vncserver", &["New 'n3000:1 (testuser)' desktop at :1 on machine n3000"]));

	let alloc = AllocationManager::new(&rig.cfg, &rig.runner);
	let allocation = alloc.reserve(&request(), Duration::from_secs(5), &token()).await.unwrap();
	assert_eq!(allocation.job_id, JobId::new("864875"));
	assert_eq!(allocation.node, NodeName::new("n3000"));

	let sessions = SessionController::new(&rig.cfg, &rig.runner, &rig.store);
	let session = sessions
		.start(&allocation.node, &allocation.job_id, None, Duration::from_secs(5), &token())
		.await
		.unwrap();
	assert!(session.display.0 >= 1);
	assert_eq!(session.port, Port(rig.cfg.base_port + session.display.0 as u16));
}

#[tokio::test]
async fn reserve_falls_back_to_the_queue_when_the_stream_goes_quiet() {
	let rig = Rig::new();
	rig.runner.script(Script::new("salloc", &["salloc: Pending job allocation 864875"]));
	rig.runner.script(Script::new("squeue", &["864875 RUNNING 3:59 n3000"]));

	let alloc = AllocationManager::new(&rig.cfg, &rig.runner);
	let allocation = alloc.reserve(&request(), Duration::from_secs(5), &token()).await.unwrap();
	assert_eq!(allocation.job_id, JobId::new("864875"));
	assert_eq!(allocation.node, NodeName::new("n3000"));
}

#[tokio::test]
async fn reserve_respects_its_timeout_and_cancels_the_pending_job() {
	let rig = Rig::new();
	rig.runner.script(Script::new("salloc", &["salloc: Pending job allocation 864875"]));
	rig.runner.script(Script::new("squeue", &["864875 PENDING INVALID (Resources)"]));

	let alloc = AllocationManager::new(&rig.cfg, &rig.runner);
	let started = Instant::now();
	let err = alloc.reserve(&request(), Duration::from_millis(300), &token()).await.unwrap_err();

	assert!(matches!(err, VdeskError::ExternalTimeout { .. }), "got {err:?}");
	assert!(started.elapsed() < Duration::from_secs(2));
	assert_eq!(rig.runner.calls_matching("scancel 864875"), 1);
}

#[tokio::test]
async fn reserve_without_a_captured_id_times_out_cleanly() {
	let rig = Rig::new();
	rig.runner.script(Script::new("salloc", &[]));

	let alloc = AllocationManager::new(&rig.cfg, &rig.runner);
	let err = alloc.reserve(&request(), Duration::from_millis(200), &token()).await.unwrap_err();

	assert!(matches!(err, VdeskError::ExternalTimeout { .. }), "got {err:?}");
	assert_eq!(rig.runner.calls_matching("scancel"), 0);
}

#[tokio::test]
async fn interrupt_during_reserve_names_the_job_for_manual_cleanup() {
	let rig = Rig::new();
	rig.runner.script(Script::new("salloc", &["salloc: Pending job allocation 864875"]));
	rig.runner.script(Script::new("squeue", &["864875 PENDING INVALID (Resources)"]));

	let cancel = token();
	let trigger = cancel.clone();
	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(100)).await;
		trigger.cancel();
	});

	let alloc = AllocationManager::new(&rig.cfg, &rig.runner);
	let err = alloc.reserve(&request(), Duration::from_secs(10), &cancel).await.unwrap_err();

	assert!(matches!(err, VdeskError::Cancelled(_)), "got {err:?}");
	assert!(err.to_string().contains("864875"));
	// Cancellation never pretends rollback happened.
	assert_eq!(rig.runner.calls_matching("scancel"), 0);
}

#[tokio::test]
async fn slow_session_startup_is_a_timeout() {
	let rig = Rig::new();
	rig.runner
		.script(Script::new("vncserver", &["still warming up"]).with_line_delay(Duration::from_millis(300)));

	let sessions = SessionController::new(&rig.cfg, &rig.runner, &rig.store);
	let err = sessions
		.start(&NodeName::new("n3000"), &JobId::new("1"), None, Duration::from_millis(50), &token())
		.await
		.unwrap_err();
	assert!(matches!(err, VdeskError::ExternalTimeout { .. }), "got {err:?}");
}

#[tokio::test]
async fn reshaped_confirmation_line_is_a_contract_break_not_a_timeout() {
	let rig = Rig::new();
	rig.runner.script(Script::new("vncserver", &["Started desktop environment on n3000"]));

	let sessions = SessionController::new(&rig.cfg, &rig.runner, &rig.store);
	let err = sessions
		.start(&NodeName::new("n3000"), &JobId::new("1"), None, Duration::from_secs(5), &token())
		.await
		.unwrap_err();
	assert!(matches!(err, VdeskError::ParseMismatch { .. }), "got {err:?}");
}

#[tokio::test]
async fn startup_stream_ending_without_confirmation_is_a_contract_break() {
	let rig = Rig::new();
	rig.runner.script(Script::new("vncserver", &["some unrelated noise"]));

	let sessions = SessionController::new(&rig.cfg, &rig.runner, &rig.store);
	let err = sessions
		.start(&NodeName::new("n3000"), &JobId::new("1"), None, Duration::from_secs(5), &token())
		.await
		.unwrap_err();
	assert!(matches!(err, VdeskError::ParseMismatch { .. }), "got {err:?}");
}

#[tokio::test]
async fn listing_splits_active_and_stale_and_ignores_noise() {
	let rig = Rig::new();
	rig.runner.script(Script::new(
		"vncserver -list",
		&[
			"TigerVNC server sessions:",
			"",
			"X DISPLAY #\tPROCESS ID",
			":1\t\t7280 (stale)",
			":20\t\t30",
			":3\t\t84266 (stale)",
		],
	));

	let sessions = SessionController::new(&rig.cfg, &rig.runner, &rig.store);
	let listing = sessions.list(&NodeName::new("n3000"), &JobId::new("1")).await.unwrap();

	assert_eq!(listing.active.iter().map(|d| d.0).collect::<Vec<_>>(), vec![20]);
	assert_eq!(listing.stale.iter().map(|d| d.0).collect::<Vec<_>>(), vec![1, 3]);
}

#[tokio::test]
async fn liveness_requires_the_exact_pid_in_the_allocations_own_set() {
	let rig = Rig::new();
	rig.write_pid("n3000:1", 7280);
	rig.runner.script(Script::new(
		"scontrol listpids 864877",
		&["PID JOBID STEPID LOCALID GLOBALID", "7280 864877 0 0 0"],
	));

	let sessions = SessionController::new(&rig.cfg, &rig.runner, &rig.store);
	let node = NodeName::new("n3000");
	let job = JobId::new("864877");
	assert!(sessions.check(&node, &job, vdesk::types::DisplayNum(1)).await.unwrap());

	// A superstring pid must not count: the comparison is typed, not substring.
	rig.runner.clear_scripts();
	rig.runner.script(Script::new("scontrol listpids 864877", &["72801 864877 0 0 0"]));
	assert!(!sessions.check(&node, &job, vdesk::types::DisplayNum(1)).await.unwrap());

	// No bookkeeping record means not live, full stop.
	rig.store.remove("n3000:1").unwrap();
	assert!(!sessions.check(&node, &job, vdesk::types::DisplayNum(1)).await.unwrap());
}

#[tokio::test]
async fn killing_twice_reaches_the_same_end_state() {
	let rig = Rig::new();
	rig.write_pid("n3000:1", 7280);
	rig.runner.script(Script::new("vncserver -kill", &["Killing Xtigervnc process ID 7280... success!"]));
	rig.runner.script(Script::new("vncserver -list", &[":1\t\t7280"]));

	let sessions = SessionController::new(&rig.cfg, &rig.runner, &rig.store);
	let node = NodeName::new("n3000");
	let job = JobId::new("864877");

	sessions.kill(&node, &job, None).await.unwrap();
	assert!(rig.store.keys().unwrap().is_empty());

	// Second pass: every target is already gone, and that is success.
	sessions.kill(&node, &job, None).await.unwrap();
	assert!(rig.store.keys().unwrap().is_empty());
	assert!(rig.runner.calls_matching("find /tmp/.X11-unix") >= 2);
}

#[tokio::test]
async fn discovery_reports_confirmed_forwards_and_flags_placeholders() {
	let rig = Rig::new();
	let mypid = std::process::id();
	let tunnel_row = format!("{mypid} ssh -N -f -L 5901:127.0.0.1:5901 n3000");

	rig.runner
		.script(Script::new("squeue", &["864877 RUNNING 3:55 n3000", "870400 PENDING INVALID (Resources)"]));
	rig.runner.script(Script::new("ps -u testuser", &[tunnel_row.as_str()]));
	rig.runner.script(Script::new("scontrol listpids 864877", &["7280 864877 0 0 0"]));
	rig.write_pid("n3000:1", 7280);

	let view = DiscoveryCorrelator::new(&rig.cfg, &rig.runner, &rig.store).discover("vnc").await.unwrap();

	assert_eq!(view.entries.len(), 1);
	let entry = &view.entries[0];
	assert_eq!(entry.job_id, JobId::new("864877"));
	assert_eq!(entry.node, NodeName::new("n3000"));
	assert_eq!(entry.time_left.as_deref(), Some("3:55"));

	let forward = entry.forward.as_ref().expect("confirmed forward");
	assert_eq!(forward.local, Port(5901));
	assert_eq!(forward.remote, Port(5901));

	let session = entry.session.live().expect("live session");
	assert!(session.alive);
	assert_eq!(session.port, Port(rig.cfg.base_port + session.display.0 as u16));

	// The queued job surfaces as a pending indicator, never a phantom node.
	assert!(view.entries.iter().all(|entry| entry.job_id != JobId::new("870400")));
	assert!(view.warnings.iter().any(|warning| matches!(
		warning,
		DiscoveryWarning::PendingAllocation { job_id, reason } if *job_id == JobId::new("870400") && reason == "Resources"
	)));
	assert_eq!(view.pending_reason(&JobId::new("870400")), Some("Resources"));
}

#[tokio::test]
async fn discovery_drops_forwards_that_fail_confirmation() {
	let rig = Rig::new();
	let mypid = std::process::id();
	let tunnel_row = format!("{mypid} ssh -N -f -L 5901:127.0.0.1:5901 n3000");

	rig.runner.script(Script::new("squeue", &["864877 RUNNING 3:55 n3000"]));
	rig.runner.script(Script::new("ps -u testuser", &[tunnel_row.as_str()]));
	// Allocation pid set does not contain the recorded pid: session is dead.
	rig.runner.script(Script::new("scontrol listpids 864877", &[]));
	rig.write_pid("n3000:1", 7280);

	let view = DiscoveryCorrelator::new(&rig.cfg, &rig.runner, &rig.store).discover("vnc").await.unwrap();

	assert_eq!(view.entries.len(), 1);
	assert!(view.entries[0].forward.is_none(), "unconfirmed forward must be dropped, not reported");
	assert!(view.entries[0].session.live().is_none());
}

#[tokio::test]
async fn discovery_degrades_to_unknown_when_a_node_is_unreachable() {
	let rig = Rig::new();
	let mypid = std::process::id();
	let tunnel_row = format!("{mypid} ssh -N -f -L 5901:127.0.0.1:5901 n3000");

	rig.runner.script(Script::new("squeue", &["864877 RUNNING 3:55 n3000"]));
	rig.runner.script(Script::new("ps -u testuser", &[tunnel_row.as_str()]));
	rig.runner
		.script(Script::failing("scontrol listpids 864877", &["ssh: connect to host n3000: Connection refused"]));
	rig.write_pid("n3000:1", 7280);

	let view = DiscoveryCorrelator::new(&rig.cfg, &rig.runner, &rig.store).discover("vnc").await.unwrap();

	assert_eq!(view.entries.len(), 1);
	assert!(matches!(view.entries[0].session, SessionView::Unknown));
	assert!(view.entries[0].forward.is_none());
	assert!(view
		.warnings
		.iter()
		.any(|warning| matches!(warning, DiscoveryWarning::SourceUnavailable { .. })));
}

#[tokio::test]
async fn repair_creates_exactly_one_forward_without_touching_the_session() {
	let rig = {
		let mut rig = Rig::new();
		rig.cfg.base_port = 45900;
		rig
	};
	let node = NodeName::new("n3000");
	let job = JobId::new("202");

	rig.runner.script(Script::new("ps -u testuser", &[]));
	rig.runner.script(Script::new("scontrol listpids 202", &["4242 202 0 0 0"]));
	rig.runner.script(Script::new(
		"ps -o pid=,args= -U testuser",
		&[
			"4242 /usr/bin/Xtigervnc :2 -rfbport 45902 -desktop n3000:2",
			"9999 /usr/bin/Xtigervnc :9 -rfbport 45909 -desktop n3000:9",
		],
	));

	// The scripted tunnel spawn binds the requested local port for real,
	// so the bind-confirmation poll observes it.
	let listeners: Arc<Mutex<Vec<TcpListener>>> = Arc::new(Mutex::new(Vec::new()));
	let held = listeners.clone();
	rig.runner.on_command(move |command| {
		if let Some(rest) = command.split("-L ").nth(1) {
			if let Some(port) = rest.split(':').next().and_then(|p| p.parse::<u16>().ok()) {
				if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)) {
					held.lock().unwrap().push(listener);
				}
			}
		}
	});

	let forwards = PortForwardManager::new(&rig.cfg, &rig.runner);
	let outcome = forwards.repair(&node, &job).await.unwrap();
	let RepairOutcome::Created(forward) = outcome else {
		panic!("expected a created forward");
	};

	// Remote port matches the session's real port, derived from the
	// allocation-scoped process table, and the session was not restarted.
	assert_eq!(forward.remote, Port(45902));
	assert_eq!(rig.runner.calls_matching("vncserver"), 0);
	assert_eq!(rig.runner.calls_matching("-N -f -L"), 1);

	// Run two: the tunnel now shows up in the local process table, so
	// repair is a no-op and creates nothing new.
	let mypid = std::process::id();
	let tunnel_row = format!("{mypid} ssh -N -f -L {}:127.0.0.1:45902 n3000", forward.local);
	rig.runner.clear_scripts();
	rig.runner.script(Script::new("ps -u testuser", &[tunnel_row.as_str()]));

	let outcome = forwards.repair(&node, &job).await.unwrap();
	assert!(matches!(outcome, RepairOutcome::AlreadyForwarded(_)));
	assert_eq!(rig.runner.calls_matching("-N -f -L"), 1);
}

#[tokio::test]
async fn tunnel_that_never_binds_is_reported_within_the_attempt_bound() {
	let rig = {
		let mut rig = Rig::new();
		rig.cfg.base_port = 45920;
		rig.cfg.forward_poll_attempts = 3;
		rig
	};

	let forwards = PortForwardManager::new(&rig.cfg, &rig.runner);
	let err = forwards.create(Port(45931), Port(45922), &NodeName::new("n3000")).await.unwrap_err();
	assert!(matches!(err, VdeskError::ExternalTimeout { .. }), "got {err:?}");
}

#[tokio::test]
async fn exhausted_probe_window_is_an_explicit_failure() {
	let rig = {
		let mut rig = Rig::new();
		rig.cfg.port_window = 0;
		rig
	};

	let forwards = PortForwardManager::new(&rig.cfg, &rig.runner);
	let err = forwards.find_free_local_port().unwrap_err();
	assert!(matches!(err, VdeskError::ResourceExhausted(..)), "got {err:?}");
}

#[tokio::test]
async fn kill_all_tears_down_every_allocation_under_the_job_name() {
	let rig = Rig::new();
	rig.runner.script(Script::new("squeue", &["101 RUNNING 3:55 n3000", "102 RUNNING 2:00 n3042"]));
	rig.runner.script(Script::new("ps -u testuser", &[]));
	rig.runner.script(Script::new("ssh n3000 vncserver -list", &[":1\t\t111"]));
	rig.runner.script(Script::new("ssh n3042 vncserver -list", &[":3\t\t333 (stale)"]));
	rig.write_pid("n3000:1", 111);
	rig.write_pid("n3042:3", 333);

	let report = GarbageCollector::new(&rig.cfg, &rig.runner, &rig.store).kill_all("vnc").await.unwrap();

	assert_eq!(report.torn_down, vec![JobId::new("101"), JobId::new("102")]);
	assert!(report.cancelled_only.is_empty());
	assert!(rig.store.keys().unwrap().is_empty(), "no bookkeeping records may survive kill-all");
	assert_eq!(rig.runner.calls_matching("scancel"), 2);
}

#[tokio::test]
async fn killing_an_unknown_job_is_a_user_error_not_a_crash() {
	let rig = Rig::new();
	rig.runner.script(Script::new("squeue", &[]));
	rig.runner.script(Script::new("ps -u testuser", &[]));

	let view = DiscoveryCorrelator::new(&rig.cfg, &rig.runner, &rig.store).discover("vnc").await.unwrap();
	let err = GarbageCollector::new(&rig.cfg, &rig.runner, &rig.store)
		.kill_one(&JobId::new("999"), &view)
		.await
		.unwrap_err();
	assert!(matches!(err, VdeskError::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn killing_a_blocked_job_cancels_without_touching_any_node() {
	let rig = Rig::new();
	rig.runner.script(Script::new("squeue", &["984669 PENDING INVALID (QOSGrpCpuLimit)"]));
	rig.runner.script(Script::new("ps -u testuser", &[]));

	let view = DiscoveryCorrelator::new(&rig.cfg, &rig.runner, &rig.store).discover("vnc").await.unwrap();
	let report = GarbageCollector::new(&rig.cfg, &rig.runner, &rig.store)
		.kill_one(&JobId::new("984669"), &view)
		.await
		.unwrap();

	assert_eq!(report.cancelled_only, vec![JobId::new("984669")]);
	assert_eq!(rig.runner.calls_matching("scancel 984669"), 1);
	assert_eq!(rig.runner.calls_matching("vncserver"), 0);
}

#[tokio::test]
async fn cancel_of_an_already_terminated_job_reports_instead_of_erroring() {
	let rig = Rig::new();
	rig.runner
		.script(Script::failing("scancel", &["scancel: error: Invalid job id specified"]));

	let alloc = AllocationManager::new(&rig.cfg, &rig.runner);
	let outcome = alloc.cancel(&JobId::new("424242")).await.unwrap();
	assert_eq!(outcome, CancelOutcome::AlreadyGone);
}
