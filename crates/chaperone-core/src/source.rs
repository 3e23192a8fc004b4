use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::attrs::{keys, RawAttrs};
use crate::error::ConfigError;
use crate::script::{ScriptEngine, ScriptSource};

/// Hard limit applied to a single source resolution.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);

/// One provider of raw configuration attributes.
///
/// Resolution is synchronous; the resolver runs it on a blocking worker
/// guarded by [`timeout`](ConfigSource::timeout). Implementations must
/// not cache: resolution is re-run on every (re)load.
pub trait ConfigSource: Send + Sync {
	/// Human-readable identity used in error messages and logs,
	/// typically the file path.
	fn describe(&self) -> String;

	fn resolve(&self) -> Result<RawAttrs, ConfigError>;

	fn timeout(&self) -> Duration {
		DEFAULT_RESOLVE_TIMEOUT
	}
}

/// Flat `key value` / `key=value` file, one attribute per line.
///
/// `#` starts a comment, a bare key is a boolean switch, repeated `arg`
/// lines accumulate in file order, and `env NAME=value` lines build the
/// environment mapping one variable at a time.
pub struct PropertiesSource {
	path: PathBuf,
}

impl PropertiesSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

impl ConfigSource for PropertiesSource {
	fn describe(&self) -> String {
		self.path.display().to_string()
	}

	fn resolve(&self) -> Result<RawAttrs, ConfigError> {
		let text = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::ParseFailure {
			source: self.describe(),
			message: e.to_string(),
		})?;
		parse_properties(&text, &self.describe())
	}
}

fn parse_properties(text: &str, source: &str) -> Result<RawAttrs, ConfigError> {
	let mut attrs = RawAttrs::new();
	for (number, raw_line) in text.lines().enumerate() {
		let line = raw_line.trim();
		if line.is_empty() || line.starts_with('#') {
			continue;
		}
		let (key, value) = split_key_value(line);
		match (key, value) {
			(keys::ARG, Some(v)) => attrs.push_arg(v),
			(keys::ENV, Some(v)) => {
				let (name, value) = v.split_once('=').ok_or_else(|| ConfigError::ParseFailure {
					source: source.to_string(),
					message: format!("line {}: env entries take the form NAME=value", number + 1),
				})?;
				attrs.set_env(name.trim(), value);
			}
			(key, Some(v)) => attrs.set_str(key, v),
			(key, None) => attrs.set(key, Value::Bool(true)),
		}
	}
	Ok(attrs)
}

/// The earliest of `=` or space separates key from value; a line with
/// neither is a bare boolean switch.
fn split_key_value(line: &str) -> (&str, Option<&str>) {
	let idx = match (line.find('='), line.find(' ')) {
		(Some(eq), Some(sp)) => Some(eq.min(sp)),
		(Some(eq), None) => Some(eq),
		(None, Some(sp)) => Some(sp),
		(None, None) => None,
	};
	match idx {
		Some(i) => (&line[..i], Some(line[i + 1..].trim())),
		None => (line, None),
	}
}

/// TOML file mapped onto the same attribute names: `arg` is an array,
/// `env` a table, everything else a scalar.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

impl ConfigSource for TomlSource {
	fn describe(&self) -> String {
		self.path.display().to_string()
	}

	fn resolve(&self) -> Result<RawAttrs, ConfigError> {
		let text = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::ParseFailure {
			source: self.describe(),
			message: e.to_string(),
		})?;
		let table: toml::Table = toml::from_str(&text).map_err(|e| ConfigError::ParseFailure {
			source: self.describe(),
			message: e.to_string(),
		})?;
		let mut attrs = RawAttrs::new();
		for (key, value) in table {
			attrs.set(key, toml_to_json(value));
		}
		Ok(attrs)
	}
}

fn toml_to_json(value: toml::Value) -> Value {
	match value {
		toml::Value::String(s) => Value::String(s),
		toml::Value::Integer(i) => Value::from(i),
		toml::Value::Float(f) => serde_json::Number::from_f64(f)
			.map(Value::Number)
			.unwrap_or_else(|| Value::String(f.to_string())),
		toml::Value::Boolean(b) => Value::Bool(b),
		toml::Value::Datetime(d) => Value::String(d.to_string()),
		toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
		toml::Value::Table(table) => Value::Object(
			table.into_iter().map(|(k, v)| (k, toml_to_json(v))).collect(),
		),
	}
}

/// In-memory source, used for command-line overrides and tests.
pub struct InlineSource {
	label: String,
	attrs: RawAttrs,
}

impl InlineSource {
	pub fn new(label: impl Into<String>, attrs: RawAttrs) -> Self {
		Self { label: label.into(), attrs }
	}
}

impl ConfigSource for InlineSource {
	fn describe(&self) -> String {
		self.label.clone()
	}

	fn resolve(&self) -> Result<RawAttrs, ConfigError> {
		Ok(self.attrs.clone())
	}
}

/// Picks a source implementation from the file extension.
///
/// `.cfg`/`.conf`/`.properties` parse as flat properties, `.toml` as
/// TOML, `.js` as a script handed to `engine`.
pub fn source_for_path(
	path: &Path,
	engine: Option<&Arc<dyn ScriptEngine>>,
	script_timeout: Duration,
	script_env: &BTreeMap<String, String>,
) -> Result<Arc<dyn ConfigSource>, ConfigError> {
	let ext = path
		.extension()
		.and_then(|e| e.to_str())
		.unwrap_or("")
		.to_ascii_lowercase();
	match ext.as_str() {
		"cfg" | "conf" | "properties" => Ok(Arc::new(PropertiesSource::new(path))),
		"toml" => Ok(Arc::new(TomlSource::new(path))),
		"js" => {
			let engine = engine.ok_or_else(|| ConfigError::InvalidValue {
				field: "configuration".to_string(),
				message: format!(
					"{}: script configuration requires an interpreter",
					path.display()
				),
			})?;
			Ok(Arc::new(
				ScriptSource::from_file(path, Arc::clone(engine))
					.with_timeout(script_timeout)
					.with_env(script_env.clone()),
			))
		}
		_ => Err(ConfigError::InvalidValue {
			field: "configuration".to_string(),
			message: format!("{}: unrecognized configuration format", path.display()),
		}),
	}
}
