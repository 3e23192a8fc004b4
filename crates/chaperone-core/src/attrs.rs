use serde_json::Value;
use std::collections::BTreeMap;

/// Well-known attribute names shared by every configuration source.
pub mod keys {
	pub const MAIN: &str = "main";
	pub const LEVEL: &str = "level";
	pub const ARG: &str = "arg";
	pub const ARGMODE: &str = "argmode";
	pub const DIR: &str = "dir";
	pub const ENV: &str = "env";
	pub const RESTART: &str = "restart";
	pub const MAX_RESTARTS: &str = "maxRestarts";
	pub const BACKOFF_INITIAL_MS: &str = "backoffInitialMs";
	pub const BACKOFF_MAX_MS: &str = "backoffMaxMs";
}

/// How a source's `arg` list combines with arguments accumulated from
/// lower-precedence sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArgMode {
	#[default]
	Append,
	Replace,
}

impl ArgMode {
	pub fn parse(s: &str) -> Option<ArgMode> {
		if s.eq_ignore_ascii_case("append") {
			Some(ArgMode::Append)
		} else if s.eq_ignore_ascii_case("replace") {
			Some(ArgMode::Replace)
		} else {
			None
		}
	}
}

/// Untyped attribute mapping produced by a single [`ConfigSource`].
///
/// Values stay dynamically typed until the resolver converts the merged
/// result into a [`Configuration`] at one validation boundary.
///
/// [`ConfigSource`]: crate::source::ConfigSource
/// [`Configuration`]: crate::config::Configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawAttrs {
	pub values: BTreeMap<String, Value>,
}

impl RawAttrs {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}

	pub fn set(&mut self, key: impl Into<String>, value: Value) {
		self.values.insert(key.into(), value);
	}

	pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
		self.values.insert(key.into(), Value::String(value.into()));
	}

	pub fn set_u64(&mut self, key: impl Into<String>, value: u64) {
		self.values.insert(key.into(), Value::from(value));
	}

	/// Appends one argument to the `arg` list, creating it if absent.
	pub fn push_arg(&mut self, arg: impl Into<String>) {
		let entry = self
			.values
			.entry(keys::ARG.to_string())
			.or_insert_with(|| Value::Array(Vec::new()));
		if let Value::Array(list) = entry {
			list.push(Value::String(arg.into()));
		}
	}

	/// Inserts one variable into the `env` mapping, creating it if absent.
	pub fn set_env(&mut self, name: impl Into<String>, value: impl Into<String>) {
		let entry = self
			.values
			.entry(keys::ENV.to_string())
			.or_insert_with(|| Value::Object(serde_json::Map::new()));
		if let Value::Object(map) = entry {
			map.insert(name.into(), Value::String(value.into()));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn push_arg_accumulates_in_order() {
		let mut attrs = RawAttrs::new();
		attrs.push_arg("one");
		attrs.push_arg("two");
		assert_eq!(
			attrs.values[keys::ARG],
			serde_json::json!(["one", "two"])
		);
	}

	#[test]
	fn set_env_builds_object() {
		let mut attrs = RawAttrs::new();
		attrs.set_env("A", "1");
		attrs.set_env("B", "2");
		assert_eq!(attrs.values[keys::ENV], serde_json::json!({"A": "1", "B": "2"}));
	}

	#[test]
	fn argmode_parse_is_case_insensitive() {
		assert_eq!(ArgMode::parse("REPLACE"), Some(ArgMode::Replace));
		assert_eq!(ArgMode::parse("append"), Some(ArgMode::Append));
		assert_eq!(ArgMode::parse("merge"), None);
	}
}
