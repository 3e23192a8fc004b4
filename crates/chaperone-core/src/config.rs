use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Logging verbosity for the wrapped application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
	Off,
	Severe,
	Warning,
	Info,
	Fine,
	All,
}

impl LogLevel {
	pub fn parse(s: &str) -> Option<LogLevel> {
		for level in [
			LogLevel::Off,
			LogLevel::Severe,
			LogLevel::Warning,
			LogLevel::Info,
			LogLevel::Fine,
			LogLevel::All,
		] {
			if s.eq_ignore_ascii_case(level.as_str()) {
				return Some(level);
			}
		}
		None
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			LogLevel::Off => "OFF",
			LogLevel::Severe => "SEVERE",
			LogLevel::Warning => "WARNING",
			LogLevel::Info => "INFO",
			LogLevel::Fine => "FINE",
			LogLevel::All => "ALL",
		}
	}
}

/// When the supervisor re-launches an exited child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
	Never,
	OnFailure,
	Always,
}

impl RestartPolicy {
	pub fn parse(s: &str) -> Option<RestartPolicy> {
		match s.to_ascii_uppercase().replace('-', "_").as_str() {
			"NEVER" => Some(RestartPolicy::Never),
			"ON_FAILURE" => Some(RestartPolicy::OnFailure),
			"ALWAYS" => Some(RestartPolicy::Always),
			_ => None,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			RestartPolicy::Never => "NEVER",
			RestartPolicy::OnFailure => "ON_FAILURE",
			RestartPolicy::Always => "ALWAYS",
		}
	}
}

/// The canonical launch configuration, validated and immutable.
///
/// Produced only by [`resolver::merge`]; the supervisor never sees
/// untyped attribute data. Re-resolving unchanged sources yields an
/// equal value, so `PartialEq` is the reload no-op check.
///
/// [`resolver::merge`]: crate::resolver::merge
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
	/// Command line for the child's entry point, split on launch.
	pub main: String,
	pub level: LogLevel,
	/// Appended to `main`'s own tokens, insertion order preserved.
	pub arguments: Vec<String>,
	pub working_dir: Option<PathBuf>,
	/// Overrides applied on top of the host environment.
	pub env: BTreeMap<String, String>,
	pub restart: RestartPolicy,
	/// 0 means unlimited.
	pub max_restarts: u32,
	pub backoff_initial: Duration,
	pub backoff_max: Duration,
	/// Unrecognized attributes, preserved for forward compatibility.
	pub extra: BTreeMap<String, Value>,
}

impl Configuration {
	/// True when a change between `self` and `next` cannot be applied
	/// to an already-running child.
	pub fn launch_fields_differ(&self, next: &Configuration) -> bool {
		self.main != next.main
			|| self.arguments != next.arguments
			|| self.working_dir != next.working_dir
			|| self.env != next.env
	}
}
