use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chaperone_core::cmdline::split_command;

#[derive(Debug, Default, PartialEq)]
pub struct Options {
	pub configs: Vec<PathBuf>,
	pub config_dir: Option<PathBuf>,
	pub main: Option<String>,
	pub level: Option<String>,
	pub cwd: Option<PathBuf>,
	pub setenv: Vec<(String, String)>,
	pub restart: Option<String>,
	pub max_restarts: Option<u64>,
	pub backoff_initial_ms: Option<u64>,
	pub backoff_max_ms: Option<u64>,
	pub interpreter: Vec<String>,
	pub script_timeout: Option<Duration>,
	pub log_dir: Option<PathBuf>,
	pub grace: Option<Duration>,
	pub stability: Option<Duration>,
	pub quiet: bool,
	pub app_args: Vec<String>,
	pub help: bool,
	pub version: bool,
}

pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Options, String> {
	let mut opts = Options::default();
	let mut it = args.into_iter();

	while let Some(arg) = it.next() {
		match arg.as_str() {
			"-h" | "--help" => opts.help = true,
			"-V" | "--version" => opts.version = true,
			"-c" | "--configuration" => {
				opts.configs.push(PathBuf::from(value(&arg, &mut it)?));
			}
			"-C" | "--configuration-directory" => {
				opts.config_dir = Some(PathBuf::from(value(&arg, &mut it)?));
			}
			"-m" | "--main" => opts.main = Some(value(&arg, &mut it)?),
			"-L" | "--level" => opts.level = Some(value(&arg, &mut it)?),
			"--cwd" => opts.cwd = Some(PathBuf::from(value(&arg, &mut it)?)),
			"-E" | "--setenv" => {
				let entry = value(&arg, &mut it)?;
				let (name, val) = entry
					.split_once('=')
					.ok_or_else(|| format!("{}: expected NAME=value, got '{}'", arg, entry))?;
				opts.setenv.push((name.to_string(), val.to_string()));
			}
			"--restart" => opts.restart = Some(value(&arg, &mut it)?),
			"--max-restarts" => opts.max_restarts = Some(number(&arg, &mut it)?),
			"--backoff-initial" => opts.backoff_initial_ms = Some(number(&arg, &mut it)?),
			"--backoff-max" => opts.backoff_max_ms = Some(number(&arg, &mut it)?),
			"--interpreter" => {
				let command = value(&arg, &mut it)?;
				opts.interpreter = split_command(&command);
				if opts.interpreter.is_empty() {
					return Err(format!("{}: interpreter command is empty", arg));
				}
			}
			"--script-timeout" => {
				opts.script_timeout = Some(Duration::from_secs(number(&arg, &mut it)?));
			}
			"--log-dir" => opts.log_dir = Some(PathBuf::from(value(&arg, &mut it)?)),
			"--grace" => opts.grace = Some(Duration::from_secs(number(&arg, &mut it)?)),
			"--stability" => opts.stability = Some(Duration::from_secs(number(&arg, &mut it)?)),
			"-q" | "--quiet" => opts.quiet = true,
			"--" => {
				opts.app_args.extend(it.by_ref());
			}
			other if other.starts_with('-') => {
				return Err(format!("unknown option: {}", other));
			}
			other => opts.app_args.push(other.to_string()),
		}
	}
	Ok(opts)
}

fn value(flag: &str, it: &mut impl Iterator<Item = String>) -> Result<String, String> {
	it.next().ok_or_else(|| format!("{}: missing value", flag))
}

fn number(flag: &str, it: &mut impl Iterator<Item = String>) -> Result<u64, String> {
	let raw = value(flag, it)?;
	raw.trim()
		.parse()
		.map_err(|_| format!("{}: '{}' is not a non-negative integer", flag, raw))
}

/// Environment overrides as a map, later `-E` entries winning.
pub fn env_overrides(opts: &Options) -> BTreeMap<String, String> {
	let mut env = BTreeMap::new();
	for (name, val) in &opts.setenv {
		env.insert(name.clone(), val.clone());
	}
	env
}
