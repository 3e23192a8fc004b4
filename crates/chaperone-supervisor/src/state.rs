use serde::{Deserialize, Serialize};

/// Lifecycle of one supervised child.
///
/// Transitions are serialized behind the supervisor's mutex; only one
/// can be in flight at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorState {
	Idle,
	Starting,
	Running { pid: u32 },
	Stopping,
	Crashed { exit_code: i32 },
	RestartPending { attempt: u32 },
	Terminated { exit_code: Option<i32> },
}

impl SupervisorState {
	pub fn is_running(&self) -> bool {
		matches!(self, SupervisorState::Running { .. })
	}

	pub fn is_terminal(&self) -> bool {
		matches!(self, SupervisorState::Idle | SupervisorState::Terminated { .. })
	}

	pub fn name(&self) -> &'static str {
		match self {
			SupervisorState::Idle => "idle",
			SupervisorState::Starting => "starting",
			SupervisorState::Running { .. } => "running",
			SupervisorState::Stopping => "stopping",
			SupervisorState::Crashed { .. } => "crashed",
			SupervisorState::RestartPending { .. } => "restart-pending",
			SupervisorState::Terminated { .. } => "terminated",
		}
	}
}

/// Snapshot answered to status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
	pub state: SupervisorState,
	pub pid: Option<u32>,
	pub restart_count: u32,
	pub last_exit_code: Option<i32>,
}

/// Errors from supervision.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorError {
	/// The OS could not fork/exec the child at all. Distinct from a
	/// post-launch crash; never retried unless the policy is ALWAYS.
	LaunchFailure { message: String },
	/// The restart budget ran out.
	RestartLimitExceeded { attempts: u32 },
	/// The child ignored the graceful signal and was force-killed
	/// after the grace period.
	GraceTimeoutForceKilled,
	/// The requested operation is not legal in the current state.
	InvalidState { operation: &'static str, state: &'static str },
}

impl std::fmt::Display for SupervisorError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			SupervisorError::LaunchFailure { message } => {
				write!(f, "failed to launch child process: {}", message)
			}
			SupervisorError::RestartLimitExceeded { attempts } => {
				write!(f, "restart limit exceeded after {} attempt(s)", attempts)
			}
			SupervisorError::GraceTimeoutForceKilled => {
				write!(f, "child did not exit within the grace period and was force-killed")
			}
			SupervisorError::InvalidState { operation, state } => {
				write!(f, "cannot {} while {}", operation, state)
			}
		}
	}
}

impl std::error::Error for SupervisorError {}
