use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chaperone_core::{
	Configuration, ConfigSource, InlineSource, InterpreterEngine, LogLevel, PropertiesSource,
	RawAttrs, RestartPolicy, ScriptEngine, ScriptSource,
};
use chaperone_supervisor::{
	ControlError, Supervisor, SupervisorController, SupervisorError, SupervisorSettings,
	SupervisorState,
};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_dir(name: &str) -> std::path::PathBuf {
	let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
	let dir = std::env::temp_dir().join(format!("chaperone-sup-test-{}-{}", n, name));
	let _ = std::fs::create_dir_all(&dir);
	dir
}

fn test_settings(log_dir: &std::path::Path) -> SupervisorSettings {
	SupervisorSettings {
		log_dir: log_dir.to_path_buf(),
		max_log_size: 1024 * 1024,
		grace: Duration::from_secs(5),
		stability: Duration::from_secs(30),
		echo: false,
	}
}

fn test_config(main: &str, restart: RestartPolicy, max_restarts: u32) -> Arc<Configuration> {
	Arc::new(Configuration {
		main: main.to_string(),
		level: LogLevel::Info,
		arguments: Vec::new(),
		working_dir: None,
		env: BTreeMap::new(),
		restart,
		max_restarts,
		backoff_initial: Duration::from_millis(10),
		backoff_max: Duration::from_millis(50),
		extra: BTreeMap::new(),
	})
}

// --- Start / stop lifecycle ---

#[tokio::test]
async fn start_runs_child_and_stop_terminates_it() {
	let dir = temp_dir("start-stop");
	let sup = Supervisor::new("app", test_settings(&dir));

	sup.start(test_config("sleep 60", RestartPolicy::Never, 0)).await.unwrap();
	tokio::time::sleep(Duration::from_millis(200)).await;

	let status = sup.status().await;
	assert!(status.state.is_running());
	assert!(status.pid.is_some());

	sup.stop(None).await.unwrap();
	let status = sup.status().await;
	assert!(matches!(status.state, SupervisorState::Terminated { .. }));

	// Idempotent: stopping a terminated instance is a no-op.
	sup.stop(None).await.unwrap();

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn start_twice_is_rejected() {
	let dir = temp_dir("start-twice");
	let sup = Supervisor::new("app", test_settings(&dir));

	sup.start(test_config("sleep 60", RestartPolicy::Never, 0)).await.unwrap();
	tokio::time::sleep(Duration::from_millis(100)).await;

	let err = sup.start(test_config("sleep 60", RestartPolicy::Never, 0)).await.unwrap_err();
	assert!(matches!(err, SupervisorError::InvalidState { operation: "start", .. }));

	let _ = sup.stop(None).await;
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Restart policy: NEVER ---

#[tokio::test]
async fn never_policy_terminates_on_any_exit() {
	let dir = temp_dir("never");
	let sup = Supervisor::new("app", test_settings(&dir));

	sup.start(test_config("sh -c 'exit 3'", RestartPolicy::Never, 0)).await.unwrap();
	let status = sup.wait().await.unwrap();

	assert_eq!(status.state, SupervisorState::Terminated { exit_code: Some(3) });
	assert_eq!(status.restart_count, 0);
	assert_eq!(status.last_exit_code, Some(3));

	let _ = std::fs::remove_dir_all(&dir);
}

// --- Restart policy: ON_FAILURE ---

#[tokio::test]
async fn on_failure_does_not_restart_clean_exit() {
	let dir = temp_dir("onfail-clean");
	let sup = Supervisor::new("app", test_settings(&dir));

	sup.start(test_config("true", RestartPolicy::OnFailure, 5)).await.unwrap();
	let status = sup.wait().await.unwrap();

	assert_eq!(status.state, SupervisorState::Terminated { exit_code: Some(0) });
	assert_eq!(status.restart_count, 0);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn on_failure_stops_after_restart_limit() {
	let dir = temp_dir("onfail-limit");
	let sup = Supervisor::new("app", test_settings(&dir));

	// Three consecutive failures fit exactly two restart attempts.
	sup.start(test_config("sh -c 'exit 7'", RestartPolicy::OnFailure, 2)).await.unwrap();
	let err = sup.wait().await.unwrap_err();
	assert_eq!(err, SupervisorError::RestartLimitExceeded { attempts: 2 });

	let status = sup.status().await;
	assert_eq!(status.restart_count, 2);
	assert_eq!(status.last_exit_code, Some(7));
	assert!(matches!(status.state, SupervisorState::Terminated { exit_code: Some(7) }));

	let _ = std::fs::remove_dir_all(&dir);
}

// --- Restart policy: ALWAYS ---

#[tokio::test]
async fn always_policy_restarts_clean_exits_until_limit() {
	let dir = temp_dir("always-clean");
	let sup = Supervisor::new("app", test_settings(&dir));

	sup.start(test_config("true", RestartPolicy::Always, 1)).await.unwrap();
	let err = sup.wait().await.unwrap_err();
	assert_eq!(err, SupervisorError::RestartLimitExceeded { attempts: 1 });
	assert_eq!(sup.status().await.restart_count, 1);

	let _ = std::fs::remove_dir_all(&dir);
}

// --- Launch failures ---

#[tokio::test]
async fn launch_failure_is_fatal_without_always() {
	let dir = temp_dir("launch-fail");
	let sup = Supervisor::new("app", test_settings(&dir));

	let err = sup
		.start(test_config("/nonexistent/chaperone-test-binary", RestartPolicy::OnFailure, 5))
		.await
		.unwrap_err();
	assert!(matches!(err, SupervisorError::LaunchFailure { .. }));

	let status = sup.status().await;
	assert!(matches!(status.state, SupervisorState::Terminated { .. }));
	assert_eq!(status.restart_count, 0);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn launch_failure_retries_under_always_policy() {
	let dir = temp_dir("launch-fail-always");
	let sup = Supervisor::new("app", test_settings(&dir));

	sup.start(test_config("/nonexistent/chaperone-test-binary", RestartPolicy::Always, 2))
		.await
		.unwrap();
	let err = sup.wait().await.unwrap_err();
	assert_eq!(err, SupervisorError::RestartLimitExceeded { attempts: 2 });

	let _ = std::fs::remove_dir_all(&dir);
}

// --- Cancellable restart timer ---

#[tokio::test]
async fn stop_during_restart_pending_cancels_the_restart() {
	let dir = temp_dir("cancel-pending");
	let sup = Supervisor::new("app", test_settings(&dir));

	let config = Arc::new(Configuration {
		backoff_initial: Duration::from_secs(60),
		backoff_max: Duration::from_secs(60),
		..(*test_config("sh -c 'exit 1'", RestartPolicy::OnFailure, 0)).clone()
	});
	sup.start(config).await.unwrap();
	tokio::time::sleep(Duration::from_millis(300)).await;

	assert!(matches!(sup.status().await.state, SupervisorState::RestartPending { attempt: 1 }));

	let started = std::time::Instant::now();
	sup.stop(None).await.unwrap();
	assert!(started.elapsed() < Duration::from_secs(5));

	let status = sup.status().await;
	assert!(matches!(status.state, SupervisorState::Terminated { .. }));
	assert_eq!(status.restart_count, 0);

	let _ = std::fs::remove_dir_all(&dir);
}

// --- Stability window ---

#[tokio::test]
async fn stable_runs_reset_the_attempt_counter() {
	let dir = temp_dir("stability");
	let mut settings = test_settings(&dir);
	settings.stability = Duration::from_millis(100);
	let sup = Supervisor::new("app", settings);

	// Each run outlives the stability window, so the single-attempt
	// budget never fills and restarts keep happening.
	sup.start(test_config("sh -c 'sleep 0.4; exit 1'", RestartPolicy::OnFailure, 1))
		.await
		.unwrap();
	tokio::time::sleep(Duration::from_millis(1800)).await;

	let status = sup.status().await;
	assert!(
		status.restart_count >= 2,
		"expected repeated restarts, got {}",
		status.restart_count
	);

	let _ = sup.stop(None).await;
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Graceful stop and force kill ---

#[tokio::test]
async fn stop_force_kills_after_grace_period() {
	let dir = temp_dir("force-kill");
	let mut settings = test_settings(&dir);
	settings.grace = Duration::from_millis(300);
	let sup = Supervisor::new("app", settings);

	sup.start(test_config(
		"sh -c 'trap \"\" TERM; sleep 60'",
		RestartPolicy::Never,
		0,
	))
	.await
	.unwrap();
	tokio::time::sleep(Duration::from_millis(300)).await;

	let err = sup.stop(None).await.unwrap_err();
	assert_eq!(err, SupervisorError::GraceTimeoutForceKilled);
	assert!(matches!(sup.status().await.state, SupervisorState::Terminated { .. }));

	let _ = std::fs::remove_dir_all(&dir);
}

// --- Reload ---

#[tokio::test]
async fn reload_without_launch_changes_keeps_the_child() {
	let dir = temp_dir("reload-inplace");
	let sup = Supervisor::new("app", test_settings(&dir));

	sup.start(test_config("sleep 60", RestartPolicy::Never, 0)).await.unwrap();
	tokio::time::sleep(Duration::from_millis(200)).await;
	let pid_before = sup.status().await.pid;

	let updated = Arc::new(Configuration {
		level: LogLevel::Fine,
		..(*test_config("sleep 60", RestartPolicy::Never, 0)).clone()
	});
	sup.reload(updated).await.unwrap();

	let status = sup.status().await;
	assert!(status.state.is_running());
	assert_eq!(status.pid, pid_before);

	let _ = sup.stop(None).await;
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn reload_with_new_entry_point_restarts_the_child() {
	let dir = temp_dir("reload-restart");
	let sup = Supervisor::new("app", test_settings(&dir));

	sup.start(test_config("sleep 60", RestartPolicy::Never, 0)).await.unwrap();
	tokio::time::sleep(Duration::from_millis(200)).await;
	let pid_before = sup.status().await.pid;

	sup.reload(test_config("sleep 61", RestartPolicy::Never, 0)).await.unwrap();
	tokio::time::sleep(Duration::from_millis(200)).await;

	let status = sup.status().await;
	assert!(status.state.is_running());
	assert_ne!(status.pid, pid_before);

	let _ = sup.stop(None).await;
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn reload_is_only_legal_while_running() {
	let dir = temp_dir("reload-idle");
	let sup = Supervisor::new("app", test_settings(&dir));

	let err = sup.reload(test_config("sleep 60", RestartPolicy::Never, 0)).await.unwrap_err();
	assert!(matches!(err, SupervisorError::InvalidState { operation: "reload", .. }));

	let _ = std::fs::remove_dir_all(&dir);
}

// --- Child environment and output ---

#[tokio::test]
async fn child_sees_env_overrides_and_level() {
	let dir = temp_dir("env");
	let sup = Supervisor::new("app", test_settings(&dir));

	let mut env = BTreeMap::new();
	env.insert("CHAP_TEST_VAR".to_string(), "injected123".to_string());
	let config = Arc::new(Configuration {
		level: LogLevel::Warning,
		env,
		..(*test_config(
			"sh -c 'echo var=$CHAP_TEST_VAR level=$CHAPERONE_LEVEL'",
			RestartPolicy::Never,
			0,
		))
		.clone()
	});
	sup.start(config).await.unwrap();
	let _ = sup.wait().await.unwrap();
	tokio::time::sleep(Duration::from_millis(300)).await;

	let output = sup.output().await.unwrap();
	let text = String::from_utf8_lossy(&output.snapshot().await).to_string();
	assert!(text.contains("var=injected123"), "output was: {}", text);
	assert!(text.contains("level=WARNING"), "output was: {}", text);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn child_runs_in_configured_working_directory() {
	let dir = temp_dir("cwd");
	let workdir = temp_dir("cwd-target");
	let sup = Supervisor::new("app", test_settings(&dir));

	let config = Arc::new(Configuration {
		working_dir: Some(workdir.clone()),
		..(*test_config("pwd", RestartPolicy::Never, 0)).clone()
	});
	sup.start(config).await.unwrap();
	let _ = sup.wait().await.unwrap();
	tokio::time::sleep(Duration::from_millis(300)).await;

	let output = sup.output().await.unwrap();
	let text = String::from_utf8_lossy(&output.snapshot().await).to_string();
	assert!(
		text.contains(workdir.file_name().unwrap().to_str().unwrap()),
		"output was: {}",
		text
	);

	let _ = std::fs::remove_dir_all(&dir);
	let _ = std::fs::remove_dir_all(&workdir);
}

// --- Controller ---

#[tokio::test]
async fn controller_config_error_forks_nothing() {
	let dir = temp_dir("ctl-bad-config");
	let mut attrs = RawAttrs::new();
	attrs.set_str("level", "INFO");
	let sources: Vec<Arc<dyn ConfigSource>> =
		vec![Arc::new(InlineSource::new("overrides", attrs))];

	let controller = SupervisorController::new("app", sources, test_settings(&dir));
	let err = controller.start().await.unwrap_err();
	assert!(matches!(
		err,
		ControlError::Config(chaperone_core::ConfigError::MissingRequiredField { field: "main" })
	));
	assert_eq!(controller.status().await.state, SupervisorState::Idle);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn controller_reload_with_bad_config_keeps_child_running() {
	let dir = temp_dir("ctl-reload");
	let cfg_path = dir.join("wrapper.cfg");
	std::fs::write(&cfg_path, "main sleep 60\n").unwrap();

	let sources: Vec<Arc<dyn ConfigSource>> =
		vec![Arc::new(PropertiesSource::new(&cfg_path))];
	let controller = SupervisorController::new("app", sources, test_settings(&dir));
	controller.start().await.unwrap();
	tokio::time::sleep(Duration::from_millis(200)).await;
	let pid_before = controller.status().await.pid;

	// Break the config: the running child must not be disturbed.
	std::fs::write(&cfg_path, "level FINE\n").unwrap();
	let err = controller.reload().await.unwrap_err();
	assert!(matches!(err, ControlError::Config(_)));

	let status = controller.status().await;
	assert!(status.state.is_running());
	assert_eq!(status.pid, pid_before);

	// Fix it with a different entry point: reload restarts.
	std::fs::write(&cfg_path, "main sleep 61\n").unwrap();
	controller.reload().await.unwrap();
	tokio::time::sleep(Duration::from_millis(200)).await;
	let status = controller.status().await;
	assert!(status.state.is_running());
	assert_ne!(status.pid, pid_before);

	let _ = controller.stop(None).await;
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn controller_launches_from_script_configuration() {
	let dir = temp_dir("ctl-script");
	let engine: Arc<dyn ScriptEngine> = Arc::new(InterpreterEngine::new(vec![
		"sh".to_string(),
		"-c".to_string(),
		r#"cat > /dev/null; echo '{"main": "sleep 60", "restart": "NEVER"}'"#.to_string(),
	]));
	let source = ScriptSource::from_text("launch.cfg.js", "({main: 'sleep 60'})", engine);
	let sources: Vec<Arc<dyn ConfigSource>> = vec![Arc::new(source)];

	let controller = SupervisorController::new("app", sources, test_settings(&dir));
	let config = controller.start().await.unwrap();
	assert_eq!(config.main, "sleep 60");
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert!(controller.status().await.state.is_running());

	let _ = controller.stop(None).await;
	let _ = std::fs::remove_dir_all(&dir);
}
