use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};

use chaperone_core::cmdline::split_command;
use chaperone_core::{Configuration, RestartPolicy};

use crate::output::OutputLog;
use crate::state::{Status, SupervisorError, SupervisorState};

/// Environment variable telling the child the resolved verbosity.
pub const LEVEL_ENV_VAR: &str = "CHAPERONE_LEVEL";

pub struct SupervisorSettings {
	pub log_dir: PathBuf,
	pub max_log_size: u64,
	/// Default wait between SIGTERM and SIGKILL on stop.
	pub grace: Duration,
	/// Continuous uptime after which the restart-attempt counter resets.
	pub stability: Duration,
	/// Mirror child output onto the wrapper's own stdout/stderr.
	pub echo: bool,
}

impl Default for SupervisorSettings {
	fn default() -> Self {
		Self {
			log_dir: std::env::temp_dir().join("chaperone"),
			max_log_size: 10 * 1024 * 1024,
			grace: Duration::from_secs(10),
			stability: Duration::from_secs(30),
			echo: false,
		}
	}
}

/// Supervises one child process through its whole lifecycle.
///
/// All state lives behind one mutex, so a user-initiated `stop` can
/// never race an automatic restart. The blocking wait on the child runs
/// in a dedicated monitor task; control calls stay responsive.
pub struct Supervisor {
	name: String,
	settings: SupervisorSettings,
	inner: Mutex<Inner>,
	done: watch::Sender<bool>,
}

struct Inner {
	state: SupervisorState,
	config: Option<Arc<Configuration>>,
	/// Backoff attempt counter; resets after a stable run.
	attempt: u32,
	/// Total restarts performed since `start`.
	restart_count: u32,
	last_exit_code: Option<i32>,
	child_pid: Option<u32>,
	cancel: Option<watch::Sender<bool>>,
	grace: Duration,
	force_killed: bool,
	error: Option<SupervisorError>,
	output: Option<OutputLog>,
}

impl Supervisor {
	pub fn new(name: impl Into<String>, settings: SupervisorSettings) -> Arc<Self> {
		let grace = settings.grace;
		let (done, _) = watch::channel(false);
		Arc::new(Self {
			name: name.into(),
			settings,
			inner: Mutex::new(Inner {
				state: SupervisorState::Idle,
				config: None,
				attempt: 0,
				restart_count: 0,
				last_exit_code: None,
				child_pid: None,
				cancel: None,
				grace,
				force_killed: false,
				error: None,
				output: None,
			}),
			done,
		})
	}

	/// Launches the child under `config`.
	///
	/// Legal from `Idle` or `Terminated`. A fork/exec failure surfaces
	/// synchronously as `LaunchFailure` and is fatal, except under the
	/// ALWAYS policy where it enters the same backoff path as a crash.
	pub async fn start(
		self: &Arc<Self>,
		config: Arc<Configuration>,
	) -> Result<(), SupervisorError> {
		let mut inner = self.inner.lock().await;
		if !inner.state.is_terminal() {
			return Err(SupervisorError::InvalidState {
				operation: "start",
				state: inner.state.name(),
			});
		}
		inner.state = SupervisorState::Starting;
		inner.config = Some(Arc::clone(&config));
		inner.attempt = 0;
		inner.restart_count = 0;
		inner.last_exit_code = None;
		inner.force_killed = false;
		inner.error = None;
		inner.grace = self.settings.grace;
		let _ = self.done.send_replace(false);

		let output = OutputLog::new(&self.settings.log_dir, &self.name, self.settings.max_log_size);
		inner.output = Some(output.clone());
		let (cancel_tx, cancel_rx) = watch::channel(false);
		inner.cancel = Some(cancel_tx);

		match spawn_child(&config) {
			Ok(child) => {
				let pid = child.id().unwrap_or(0);
				tracing::info!("started {} (pid {})", self.name, pid);
				inner.child_pid = Some(pid);
				inner.state = SupervisorState::Running { pid };
				drop(inner);
				let supervisor = Arc::clone(self);
				tokio::spawn(async move {
					supervisor.monitor(Some(child), output, cancel_rx).await;
				});
				Ok(())
			}
			Err(e) if config.restart == RestartPolicy::Always => {
				tracing::warn!("launch of {} failed, retrying per policy: {}", self.name, e);
				inner.state = SupervisorState::RestartPending { attempt: inner.attempt };
				drop(inner);
				let supervisor = Arc::clone(self);
				tokio::spawn(async move {
					supervisor.monitor(None, output, cancel_rx).await;
				});
				Ok(())
			}
			Err(e) => {
				let error = SupervisorError::LaunchFailure { message: e.to_string() };
				inner.state = SupervisorState::Terminated { exit_code: None };
				inner.cancel = None;
				inner.error = Some(error.clone());
				let _ = self.done.send_replace(true);
				Err(error)
			}
		}
	}

	/// Stops the child, waiting up to `grace` (defaulting to the
	/// configured grace period) between SIGTERM and SIGKILL.
	///
	/// Idempotent: a no-op when nothing is running. Issued during
	/// `RestartPending` it cancels the scheduled restart without
	/// forking again.
	pub async fn stop(&self, grace: Option<Duration>) -> Result<(), SupervisorError> {
		let mut done_rx = self.done.subscribe();
		{
			let mut inner = self.inner.lock().await;
			match inner.state {
				SupervisorState::Idle | SupervisorState::Terminated { .. } => return Ok(()),
				// No live child in these states; cancelling the monitor
				// and moving straight to Terminated is enough.
				SupervisorState::RestartPending { .. } | SupervisorState::Crashed { .. } => {
					if let Some(cancel) = inner.cancel.take() {
						let _ = cancel.send(true);
					}
					tracing::info!("cancelled pending restart of {}", self.name);
					inner.state = SupervisorState::Terminated { exit_code: inner.last_exit_code };
					let _ = self.done.send_replace(true);
					return Ok(());
				}
				_ => {
					inner.grace = grace.unwrap_or(self.settings.grace);
					inner.state = SupervisorState::Stopping;
					if let Some(cancel) = inner.cancel.take() {
						let _ = cancel.send(true);
					}
				}
			}
		}

		let _ = done_rx.wait_for(|finished| *finished).await;
		let inner = self.inner.lock().await;
		if inner.force_killed {
			Err(SupervisorError::GraceTimeoutForceKilled)
		} else {
			Ok(())
		}
	}

	/// Applies a new configuration to a running instance.
	///
	/// A change to launch-affecting fields restarts the child under the
	/// new configuration; anything else is swapped in place and takes
	/// effect from the next start.
	pub async fn reload(
		self: &Arc<Self>,
		config: Arc<Configuration>,
	) -> Result<(), SupervisorError> {
		{
			let mut inner = self.inner.lock().await;
			if !inner.state.is_running() {
				return Err(SupervisorError::InvalidState {
					operation: "reload",
					state: inner.state.name(),
				});
			}
			let current = inner.config.as_ref().expect("running without a configuration");
			if !current.launch_fields_differ(&config) {
				inner.config = Some(config);
				tracing::info!("configuration of {} updated in place", self.name);
				return Ok(());
			}
		}

		tracing::info!("configuration change requires restart of {}", self.name);
		if let Err(e) = self.stop(None).await {
			tracing::warn!("stopping {} for reload: {}", self.name, e);
		}
		self.start(config).await
	}

	pub async fn status(&self) -> Status {
		let inner = self.inner.lock().await;
		Status {
			state: inner.state.clone(),
			pid: if inner.state.is_running() { inner.child_pid } else { None },
			restart_count: inner.restart_count,
			last_exit_code: inner.last_exit_code,
		}
	}

	pub async fn output(&self) -> Option<OutputLog> {
		self.inner.lock().await.output.clone()
	}

	/// Blocks until the instance reaches `Terminated`, yielding the
	/// final status or the terminal error.
	pub async fn wait(&self) -> Result<Status, SupervisorError> {
		let mut done_rx = self.done.subscribe();
		let _ = done_rx.wait_for(|finished| *finished).await;
		let inner = self.inner.lock().await;
		match &inner.error {
			Some(error) => Err(error.clone()),
			None => Ok(Status {
				state: inner.state.clone(),
				pid: None,
				restart_count: inner.restart_count,
				last_exit_code: inner.last_exit_code,
			}),
		}
	}

	/// Monitor task: owns the child, observes termination, applies the
	/// restart policy. `current` is `None` when entering via the
	/// launch-failure retry path.
	async fn monitor(
		self: Arc<Self>,
		mut current: Option<Child>,
		output: OutputLog,
		mut cancel_rx: watch::Receiver<bool>,
	) {
		loop {
			let mut child = match current.take() {
				Some(child) => child,
				None => match self.backoff_and_respawn(&mut cancel_rx).await {
					Some(child) => child,
					None => return,
				},
			};

			if let Some(stdout) = child.stdout.take() {
				let log = output.clone();
				let echo = self.settings.echo;
				tokio::spawn(async move {
					pipe_output(stdout, log, echo, false).await;
				});
			}
			if let Some(stderr) = child.stderr.take() {
				let log = output.clone();
				let echo = self.settings.echo;
				tokio::spawn(async move {
					pipe_output(stderr, log, echo, true).await;
				});
			}

			let started = Instant::now();
			let wait_result = tokio::select! {
				biased;
				_ = cancel_rx.changed() => {
					self.shutdown_child(&mut child).await;
					return;
				}
				status = child.wait() => status,
			};

			let code = match wait_result {
				Ok(status) => exit_code_of(status),
				Err(e) => {
					tracing::error!("waiting on {}: {}", self.name, e);
					None
				}
			};

			let mut inner = self.inner.lock().await;
			inner.child_pid = None;
			inner.last_exit_code = code;

			if inner.state == SupervisorState::Stopping {
				// stop() raced the natural exit; nothing left to kill.
				inner.state = SupervisorState::Terminated { exit_code: code };
				let _ = self.done.send_replace(true);
				return;
			}

			if started.elapsed() >= self.settings.stability {
				inner.attempt = 0;
			}

			let config = inner.config.clone().expect("monitoring without a configuration");
			let clean = code == Some(0);
			let restart = match config.restart {
				RestartPolicy::Never => false,
				RestartPolicy::OnFailure => !clean,
				RestartPolicy::Always => true,
			};

			if !restart {
				tracing::info!("{} exited with {:?}, not restarting", self.name, code);
				inner.state = SupervisorState::Terminated { exit_code: code };
				let _ = self.done.send_replace(true);
				return;
			}

			if !clean {
				tracing::warn!("{} crashed with {:?}", self.name, code);
				inner.state = SupervisorState::Crashed { exit_code: code.unwrap_or(-1) };
			}
			drop(inner);
			// Falls through to the backoff branch on the next turn.
		}
	}

	/// Consumes one restart attempt: budget check, cancellable backoff
	/// sleep, respawn. Returns `None` when the monitor should exit.
	async fn backoff_and_respawn(
		self: &Arc<Self>,
		cancel_rx: &mut watch::Receiver<bool>,
	) -> Option<Child> {
		loop {
			let delay = {
				let mut inner = self.inner.lock().await;
				if inner.state.is_terminal() {
					return None;
				}
				let config = inner.config.clone().expect("restarting without a configuration");
				if config.max_restarts != 0 && inner.attempt >= config.max_restarts {
					let error =
						SupervisorError::RestartLimitExceeded { attempts: inner.attempt };
					tracing::error!("{}: {}", self.name, error);
					inner.error = Some(error);
					inner.state =
						SupervisorState::Terminated { exit_code: inner.last_exit_code };
					let _ = self.done.send_replace(true);
					return None;
				}
				let delay =
					backoff_delay(inner.attempt, config.backoff_initial, config.backoff_max);
				inner.attempt += 1;
				inner.state = SupervisorState::RestartPending { attempt: inner.attempt };
				tracing::info!(
					"restarting {} in {}ms (attempt {})",
					self.name,
					delay.as_millis(),
					inner.attempt
				);
				delay
			};

			tokio::select! {
				biased;
				// stop() already moved the state to Terminated.
				_ = cancel_rx.changed() => return None,
				_ = tokio::time::sleep(delay) => {}
			}

			let mut inner = self.inner.lock().await;
			if inner.state.is_terminal() {
				return None;
			}
			let config = inner.config.clone().expect("restarting without a configuration");
			match spawn_child(&config) {
				Ok(child) => {
					let pid = child.id().unwrap_or(0);
					inner.child_pid = Some(pid);
					inner.restart_count += 1;
					inner.state = SupervisorState::Running { pid };
					tracing::info!("restarted {} (pid {})", self.name, pid);
					return Some(child);
				}
				Err(e) if config.restart == RestartPolicy::Always => {
					tracing::warn!("relaunch of {} failed, retrying: {}", self.name, e);
					// Consumes further attempts from the same budget.
				}
				Err(e) => {
					let error = SupervisorError::LaunchFailure { message: e.to_string() };
					tracing::error!("{}: {}", self.name, error);
					inner.error = Some(error);
					inner.state =
						SupervisorState::Terminated { exit_code: inner.last_exit_code };
					let _ = self.done.send_replace(true);
					return None;
				}
			}
		}
	}

	/// Graceful teardown on cancellation: SIGTERM the process group,
	/// wait out the grace period, then SIGKILL.
	async fn shutdown_child(self: &Arc<Self>, child: &mut Child) {
		let grace = self.inner.lock().await.grace;
		let pid = child.id();
		if let Some(pid) = pid {
			signal_group(pid, nix::sys::signal::Signal::SIGTERM);
		}

		let mut forced = false;
		let code = tokio::select! {
			status = child.wait() => status.ok().and_then(exit_code_of),
			_ = tokio::time::sleep(grace) => {
				tracing::warn!("{} ignored SIGTERM, force-killing", self.name);
				if let Some(pid) = pid {
					signal_group(pid, nix::sys::signal::Signal::SIGKILL);
				}
				forced = true;
				child.wait().await.ok().and_then(exit_code_of)
			}
		};

		let mut inner = self.inner.lock().await;
		inner.force_killed = forced;
		inner.child_pid = None;
		inner.last_exit_code = code.or(inner.last_exit_code);
		inner.state = SupervisorState::Terminated { exit_code: code };
		let _ = self.done.send_replace(true);
		tracing::info!("stopped {}", self.name);
	}
}

/// Exponential backoff with a cap: `initial * 2^attempt`, at most `max`.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
	let factor = 1u32 << attempt.min(20);
	initial.saturating_mul(factor).min(max)
}

fn spawn_child(config: &Configuration) -> std::io::Result<Child> {
	let tokens = split_command(&config.main);
	let (program, rest) = tokens.split_first().ok_or_else(|| {
		std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty entry point")
	})?;

	let mut cmd = Command::new(program);
	cmd.args(rest)
		.args(&config.arguments)
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.process_group(0);
	if let Some(dir) = &config.working_dir {
		cmd.current_dir(dir);
	}
	cmd.env(LEVEL_ENV_VAR, config.level.as_str());
	for (name, value) in &config.env {
		cmd.env(name, value);
	}
	cmd.spawn()
}

fn exit_code_of(status: std::process::ExitStatus) -> Option<i32> {
	use std::os::unix::process::ExitStatusExt;
	status.code().or_else(|| status.signal().map(|sig| 128 + sig))
}

fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
	use nix::sys::signal::killpg;
	use nix::unistd::Pid;
	let _ = killpg(Pid::from_raw(pid as i32), signal);
}

async fn pipe_output<R: tokio::io::AsyncRead + Unpin>(
	mut reader: R,
	log: OutputLog,
	echo: bool,
	is_stderr: bool,
) {
	let mut buf = [0u8; 4096];
	loop {
		match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => {
				log.write(&buf[..n]).await;
				if echo {
					if is_stderr {
						let _ = tokio::io::stderr().write_all(&buf[..n]).await;
					} else {
						let _ = tokio::io::stdout().write_all(&buf[..n]).await;
					}
				}
			}
			Err(_) => break,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_doubles_and_caps() {
		let initial = Duration::from_millis(100);
		let max = Duration::from_millis(800);
		let delays: Vec<u128> = (0..6)
			.map(|attempt| backoff_delay(attempt, initial, max).as_millis())
			.collect();
		assert_eq!(delays, vec![100, 200, 400, 800, 800, 800]);
	}

	#[test]
	fn backoff_survives_large_attempts() {
		let delay = backoff_delay(1000, Duration::from_millis(100), Duration::from_secs(60));
		assert_eq!(delay, Duration::from_secs(60));
	}

	#[test]
	fn backoff_with_zero_initial_stays_zero() {
		let delay = backoff_delay(5, Duration::ZERO, Duration::from_secs(1));
		assert_eq!(delay, Duration::ZERO);
	}
}
