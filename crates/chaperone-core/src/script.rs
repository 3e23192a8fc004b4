use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::attrs::RawAttrs;
use crate::error::ConfigError;
use crate::source::{ConfigSource, DEFAULT_RESOLVE_TIMEOUT};

/// Execution context handed to the evaluator alongside the script text.
///
/// `env` is injected on top of the host environment; `timeout` is the
/// hard deadline the engine must enforce on the evaluation.
#[derive(Debug, Clone, Default)]
pub struct ScriptContext {
	pub env: BTreeMap<String, String>,
	pub timeout: Duration,
}

/// Why an evaluation produced no value.
#[derive(Debug)]
pub enum ScriptFailure {
	/// The script raised, the interpreter exited non-zero, or its
	/// result could not be decoded.
	Failed(String),
	/// The deadline passed and the evaluation was killed.
	TimedOut,
}

impl std::fmt::Display for ScriptFailure {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ScriptFailure::Failed(msg) => write!(f, "{}", msg),
			ScriptFailure::TimedOut => write!(f, "evaluation timed out"),
		}
	}
}

impl std::error::Error for ScriptFailure {}

/// Opaque script evaluator: text in, one structured value out.
///
/// The supervisor core never sees interpreter internals; anything that
/// can turn script text into a JSON value can sit behind this trait.
pub trait ScriptEngine: Send + Sync {
	fn eval(&self, script: &str, ctx: &ScriptContext) -> Result<Value, ScriptFailure>;
}

/// Engine that runs an external interpreter process.
///
/// The script is written to the interpreter's stdin; stdout must carry
/// the returned value as a single JSON document; stderr is the script's
/// log sink and is forwarded line by line to tracing, never parsed.
pub struct InterpreterEngine {
	argv: Vec<String>,
}

impl InterpreterEngine {
	pub fn new(argv: Vec<String>) -> Self {
		Self { argv }
	}
}

impl ScriptEngine for InterpreterEngine {
	fn eval(&self, script: &str, ctx: &ScriptContext) -> Result<Value, ScriptFailure> {
		let program = self
			.argv
			.first()
			.ok_or_else(|| ScriptFailure::Failed("empty interpreter command".to_string()))?;

		let mut cmd = Command::new(program);
		cmd.args(&self.argv[1..])
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped());
		for (name, value) in &ctx.env {
			cmd.env(name, value);
		}
		{
			use std::os::unix::process::CommandExt;
			cmd.process_group(0);
		}

		let mut child = cmd.spawn().map_err(|e| {
			ScriptFailure::Failed(format!("failed to launch interpreter {}: {}", program, e))
		})?;

		if let Some(mut stdin) = child.stdin.take() {
			let _ = stdin.write_all(script.as_bytes());
		}

		// The interpreter runs in its own process group so a stuck
		// evaluation can be killed wholesale at the deadline.
		let pid = child.id();
		let deadline = ctx.timeout;
		let done = Arc::new(AtomicBool::new(false));
		let killed = Arc::new(AtomicBool::new(false));
		{
			let done = Arc::clone(&done);
			let killed = Arc::clone(&killed);
			std::thread::spawn(move || {
				std::thread::sleep(deadline);
				if !done.load(Ordering::SeqCst) {
					killed.store(true, Ordering::SeqCst);
					kill_group(pid);
				}
			});
		}

		let output = child.wait_with_output();
		done.store(true, Ordering::SeqCst);
		let output = output
			.map_err(|e| ScriptFailure::Failed(format!("failed to reap interpreter: {}", e)))?;

		let stderr = String::from_utf8_lossy(&output.stderr);
		for line in stderr.lines() {
			tracing::info!(target: "script", "{}", line);
		}

		if killed.load(Ordering::SeqCst) {
			return Err(ScriptFailure::TimedOut);
		}
		if !output.status.success() {
			let code = output.status.code().unwrap_or(-1);
			let tail = stderr.lines().last().unwrap_or("").to_string();
			return Err(ScriptFailure::Failed(format!(
				"interpreter exited with status {}: {}",
				code, tail
			)));
		}

		let stdout = String::from_utf8_lossy(&output.stdout);
		let text = stdout.trim();
		if text.is_empty() {
			return Err(ScriptFailure::Failed("script produced no result".to_string()));
		}
		serde_json::from_str(text)
			.map_err(|e| ScriptFailure::Failed(format!("malformed script result: {}", e)))
	}
}

fn kill_group(pid: u32) {
	use nix::sys::signal::{killpg, Signal};
	use nix::unistd::Pid;
	let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

enum ScriptBody {
	File(PathBuf),
	Text { label: String, text: String },
}

/// Configuration source backed by a script evaluated through a
/// [`ScriptEngine`].
///
/// The script must yield a single object with string keys; scalar and
/// list values map straight into the raw attribute mapping. Side
/// effects the script performs are permitted and ignored.
pub struct ScriptSource {
	body: ScriptBody,
	engine: Arc<dyn ScriptEngine>,
	env: BTreeMap<String, String>,
	timeout: Duration,
}

impl ScriptSource {
	pub fn from_file(path: impl AsRef<Path>, engine: Arc<dyn ScriptEngine>) -> Self {
		Self {
			body: ScriptBody::File(path.as_ref().to_path_buf()),
			engine,
			env: BTreeMap::new(),
			timeout: DEFAULT_RESOLVE_TIMEOUT,
		}
	}

	pub fn from_text(
		label: impl Into<String>,
		text: impl Into<String>,
		engine: Arc<dyn ScriptEngine>,
	) -> Self {
		Self {
			body: ScriptBody::Text { label: label.into(), text: text.into() },
			engine,
			env: BTreeMap::new(),
			timeout: DEFAULT_RESOLVE_TIMEOUT,
		}
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
		self.env = env;
		self
	}
}

impl ConfigSource for ScriptSource {
	fn describe(&self) -> String {
		match &self.body {
			ScriptBody::File(path) => path.display().to_string(),
			ScriptBody::Text { label, .. } => label.clone(),
		}
	}

	fn resolve(&self) -> Result<RawAttrs, ConfigError> {
		let script = match &self.body {
			ScriptBody::File(path) => {
				std::fs::read_to_string(path).map_err(|e| ConfigError::ParseFailure {
					source: self.describe(),
					message: e.to_string(),
				})?
			}
			ScriptBody::Text { text, .. } => text.clone(),
		};

		let ctx = ScriptContext { env: self.env.clone(), timeout: self.timeout };
		match self.engine.eval(&script, &ctx) {
			Ok(Value::Object(map)) => {
				let mut attrs = RawAttrs::new();
				for (key, value) in map {
					attrs.set(key, value);
				}
				Ok(attrs)
			}
			Ok(other) => Err(ConfigError::ScriptError {
				source: self.describe(),
				message: format!("script returned a non-object value: {}", type_name(&other)),
			}),
			Err(ScriptFailure::TimedOut) => Err(ConfigError::Timeout {
				source: self.describe(),
				limit: self.timeout,
			}),
			Err(failure) => Err(ConfigError::ScriptError {
				source: self.describe(),
				message: failure.to_string(),
			}),
		}
	}

	fn timeout(&self) -> Duration {
		self.timeout
	}
}

fn type_name(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "boolean",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}
