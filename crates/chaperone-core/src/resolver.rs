use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::attrs::{keys, ArgMode, RawAttrs};
use crate::config::{Configuration, LogLevel, RestartPolicy};
use crate::error::ConfigError;
use crate::source::ConfigSource;

const DEFAULT_MAX_RESTARTS: u32 = 3;
const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(1000);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Extra time granted to the blocking worker beyond the source's own
/// deadline, so an engine-enforced timeout surfaces first and gets to
/// clean up its interpreter.
const WORKER_GRACE: Duration = Duration::from_secs(2);

/// Resolves every source in precedence order (lowest first) and merges
/// the results into one validated [`Configuration`].
///
/// Each resolution runs on a blocking worker with a hard timeout; a
/// worker that outlives its deadline is abandoned, not silently killed.
pub async fn merge(sources: &[Arc<dyn ConfigSource>]) -> Result<Configuration, ConfigError> {
	let mut resolved = Vec::with_capacity(sources.len());
	for source in sources {
		let description = source.describe();
		let limit = source.timeout();
		let worker = {
			let source = Arc::clone(source);
			tokio::task::spawn_blocking(move || source.resolve())
		};
		let attrs = match tokio::time::timeout(limit + WORKER_GRACE, worker).await {
			Ok(Ok(result)) => result?,
			Ok(Err(join_error)) => {
				return Err(ConfigError::ParseFailure {
					source: description,
					message: format!("resolution worker panicked: {}", join_error),
				})
			}
			Err(_) => {
				tracing::warn!(
					"abandoning resolution worker for {} after {}ms",
					description,
					limit.as_millis()
				);
				return Err(ConfigError::Timeout { source: description, limit });
			}
		};
		tracing::debug!("resolved {} attribute(s) from {}", attrs.values.len(), description);
		resolved.push((description, attrs));
	}
	merge_resolved(resolved)
}

/// Pure merge over already-resolved attribute sets, exposed separately
/// so precedence rules can be tested without spinning up sources.
pub fn merge_resolved(
	resolved: Vec<(String, RawAttrs)>,
) -> Result<Configuration, ConfigError> {
	let mut merged: BTreeMap<String, Value> = BTreeMap::new();
	let mut arguments: Vec<String> = Vec::new();
	let mut env: BTreeMap<String, String> = BTreeMap::new();

	for (source, mut attrs) in resolved {
		let mode = match attrs.values.remove(keys::ARGMODE) {
			None => ArgMode::Append,
			Some(value) => {
				let text = coerce_string(keys::ARGMODE, &source, &value)?;
				ArgMode::parse(&text).ok_or_else(|| ConfigError::InvalidValue {
					field: keys::ARGMODE.to_string(),
					message: format!("'{}' is not append or replace (from {})", text, source),
				})?
			}
		};
		match attrs.values.remove(keys::ARG) {
			Some(value) => {
				let list = string_list(keys::ARG, &source, value)?;
				match mode {
					ArgMode::Append => arguments.extend(list),
					ArgMode::Replace => arguments = list,
				}
			}
			None => {
				if mode == ArgMode::Replace {
					arguments.clear();
				}
			}
		}
		if let Some(value) = attrs.values.remove(keys::ENV) {
			for (name, entry) in string_map(keys::ENV, &source, value)? {
				env.insert(name, entry);
			}
		}
		for (key, value) in attrs.values {
			merged.insert(key, value);
		}
	}

	validate(merged, arguments, env)
}

/// The single boundary where dynamically typed attributes become the
/// strongly typed Configuration.
fn validate(
	mut merged: BTreeMap<String, Value>,
	arguments: Vec<String>,
	env: BTreeMap<String, String>,
) -> Result<Configuration, ConfigError> {
	let main = match take_string(&mut merged, keys::MAIN)? {
		Some(main) if !main.trim().is_empty() => main,
		_ => return Err(ConfigError::MissingRequiredField { field: keys::MAIN }),
	};

	let level = match take_string(&mut merged, keys::LEVEL)? {
		Some(text) => LogLevel::parse(&text).ok_or_else(|| ConfigError::InvalidValue {
			field: keys::LEVEL.to_string(),
			message: format!("unrecognized level '{}'", text),
		})?,
		None => LogLevel::Info,
	};

	let restart = match take_string(&mut merged, keys::RESTART)? {
		Some(text) => RestartPolicy::parse(&text).ok_or_else(|| ConfigError::InvalidValue {
			field: keys::RESTART.to_string(),
			message: format!("unrecognized restart policy '{}'", text),
		})?,
		None => RestartPolicy::OnFailure,
	};

	let max_restarts = match take_integer(&mut merged, keys::MAX_RESTARTS)? {
		Some(n) => u32::try_from(n).map_err(|_| ConfigError::InvalidValue {
			field: keys::MAX_RESTARTS.to_string(),
			message: format!("{} is out of range", n),
		})?,
		None => DEFAULT_MAX_RESTARTS,
	};

	let backoff_initial = take_integer(&mut merged, keys::BACKOFF_INITIAL_MS)?
		.map(Duration::from_millis)
		.unwrap_or(DEFAULT_BACKOFF_INITIAL);
	let backoff_max = take_integer(&mut merged, keys::BACKOFF_MAX_MS)?
		.map(Duration::from_millis)
		.unwrap_or(DEFAULT_BACKOFF_MAX);

	let working_dir = take_string(&mut merged, keys::DIR)?.map(PathBuf::from);

	Ok(Configuration {
		main,
		level,
		arguments,
		working_dir,
		env,
		restart,
		max_restarts,
		backoff_initial,
		backoff_max,
		extra: merged,
	})
}

fn coerce_string(field: &str, source: &str, value: &Value) -> Result<String, ConfigError> {
	match value {
		Value::String(s) => Ok(s.clone()),
		Value::Number(n) => Ok(n.to_string()),
		Value::Bool(b) => Ok(b.to_string()),
		other => Err(ConfigError::InvalidValue {
			field: field.to_string(),
			message: format!("expected a scalar, got {} (from {})", kind(other), source),
		}),
	}
}

fn string_list(field: &str, source: &str, value: Value) -> Result<Vec<String>, ConfigError> {
	match value {
		Value::Array(items) => items
			.iter()
			.map(|item| coerce_string(field, source, item))
			.collect(),
		// A lone scalar is a one-element list.
		scalar @ (Value::String(_) | Value::Number(_) | Value::Bool(_)) => {
			Ok(vec![coerce_string(field, source, &scalar)?])
		}
		other => Err(ConfigError::InvalidValue {
			field: field.to_string(),
			message: format!("expected a list, got {} (from {})", kind(&other), source),
		}),
	}
}

fn string_map(
	field: &str,
	source: &str,
	value: Value,
) -> Result<BTreeMap<String, String>, ConfigError> {
	match value {
		Value::Object(map) => {
			let mut out = BTreeMap::new();
			for (name, entry) in map {
				let text = coerce_string(field, source, &entry)?;
				out.insert(name, text);
			}
			Ok(out)
		}
		other => Err(ConfigError::InvalidValue {
			field: field.to_string(),
			message: format!("expected a mapping, got {} (from {})", kind(&other), source),
		}),
	}
}

fn take_string(
	merged: &mut BTreeMap<String, Value>,
	field: &'static str,
) -> Result<Option<String>, ConfigError> {
	match merged.remove(field) {
		None => Ok(None),
		Some(value) => coerce_string(field, "merged configuration", &value).map(Some),
	}
}

fn take_integer(
	merged: &mut BTreeMap<String, Value>,
	field: &'static str,
) -> Result<Option<u64>, ConfigError> {
	let invalid = |detail: String| ConfigError::InvalidValue {
		field: field.to_string(),
		message: detail,
	};
	match merged.remove(field) {
		None => Ok(None),
		Some(Value::Number(n)) => n
			.as_u64()
			.ok_or_else(|| invalid(format!("{} is not a non-negative integer", n)))
			.map(Some),
		Some(Value::String(s)) => s
			.trim()
			.parse::<u64>()
			.map_err(|_| invalid(format!("'{}' is not a non-negative integer", s)))
			.map(Some),
		Some(other) => Err(invalid(format!("expected an integer, got {}", kind(&other)))),
	}
}

fn kind(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "a boolean",
		Value::Number(_) => "a number",
		Value::String(_) => "a string",
		Value::Array(_) => "a list",
		Value::Object(_) => "a mapping",
	}
}
